use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the label service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration for upload notifications
    pub kafka: KafkaConfig,
    /// Image analysis configuration
    #[serde(default)]
    pub analysis: AnalysisConfig,
    /// Result store configuration
    pub store: StoreConfig,
    /// Ingestion handler configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,
    /// Retrieval API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka configuration for the upload notification topic
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying object-created notifications
    #[serde(default = "default_upload_topic")]
    pub upload_topic: String,
    /// Topic that retry-pending events are republished to (defaults to the upload topic)
    pub retry_topic: Option<String>,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// Delivery timeout for republished events in milliseconds
    #[serde(default = "default_producer_timeout_ms")]
    pub producer_timeout_ms: u64,
    /// Delay before the first redelivery, doubled on every further attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Upper bound on the redelivery delay
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// Redeliveries of one event before it is given up
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

/// Image analysis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack and similar)
    pub endpoint_url: Option<String>,
    /// Labels below this confidence (0-100) are discarded
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Maximum number of labels kept per object
    #[serde(default = "default_max_labels")]
    pub max_labels: usize,
    /// Check the object with a HEAD request before analysis
    #[serde(default = "default_true")]
    pub verify_object: bool,
    /// Force path-style S3 access for the object check
    #[serde(default)]
    pub force_path_style: bool,
}

/// Result store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Table holding result records
    #[serde(default = "default_table")]
    pub table: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup. The bundled migration creates the default
    /// table only, so this requires `table` to be left at its default.
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Ingestion handler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Upper bound on a single analysis call
    #[serde(default = "default_analysis_timeout_secs")]
    pub analysis_timeout_secs: u64,
    /// Upper bound on a single store write
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
    /// Events of one batch processed at the same time
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

/// Retrieval API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Upper bound on a single store read
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Configuration values that load fine but cannot be used
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("analysis.min_confidence must be within 0..=100, got {0}")]
    MinConfidenceOutOfRange(f32),

    #[error("analysis.max_labels must be at least 1")]
    ZeroMaxLabels,

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("store.table is not a valid table name: {0:?}")]
    InvalidTableName(String),

    #[error("store.run_migrations only creates the default table, but store.table is {0:?}")]
    MigrationsNeedDefaultTable(String),

    #[error("kafka.retry_backoff_max_ms ({backoff_ms}) must be below kafka.max_poll_interval_ms ({poll_ms})")]
    RetryBackoffTooLong { backoff_ms: u64, poll_ms: u32 },
}

// Default value functions
fn default_service_name() -> String {
    "label-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "label-service".to_string()
}

fn default_upload_topic() -> String {
    "uploads.object-created".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_producer_timeout_ms() -> u64 {
    5000
}

fn default_retry_backoff_ms() -> u64 {
    5000
}

fn default_retry_backoff_max_ms() -> u64 {
    60000
}

fn default_max_redeliveries() -> u32 {
    5
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_min_confidence() -> f32 {
    70.0
}

fn default_max_labels() -> usize {
    10
}

fn default_table() -> String {
    "label_results".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_analysis_timeout_secs() -> u64 {
    15
}

fn default_store_timeout_secs() -> u64 {
    10
}

fn default_max_concurrency() -> usize {
    8
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_read_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/labels").required(false))
            .add_source(config::File::with_name("/etc/labels/labels").required(false))
            // Override with environment variables
            // LABELS__STORE__URL -> store.url
            .add_source(
                config::Environment::with_prefix("LABELS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the handlers cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min_confidence = self.analysis.min_confidence;
        if !(0.0..=100.0).contains(&min_confidence) {
            return Err(ConfigError::MinConfidenceOutOfRange(min_confidence));
        }
        if self.analysis.max_labels == 0 {
            return Err(ConfigError::ZeroMaxLabels);
        }
        if self.ingestion.analysis_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("ingestion.analysis_timeout_secs"));
        }
        if self.ingestion.store_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("ingestion.store_timeout_secs"));
        }
        if self.ingestion.max_concurrency == 0 {
            return Err(ConfigError::ZeroValue("ingestion.max_concurrency"));
        }
        if self.api.read_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("api.read_timeout_secs"));
        }
        if !is_valid_table_name(&self.store.table) {
            return Err(ConfigError::InvalidTableName(self.store.table.clone()));
        }
        if self.store.run_migrations && self.store.table != default_table() {
            return Err(ConfigError::MigrationsNeedDefaultTable(
                self.store.table.clone(),
            ));
        }
        if self.kafka.retry_backoff_ms == 0 {
            return Err(ConfigError::ZeroValue("kafka.retry_backoff_ms"));
        }
        // The consumer sleeps out redelivery delays between polls
        let backoff_ms = self.kafka.retry_backoff_max_ms.max(self.kafka.retry_backoff_ms);
        if backoff_ms >= u64::from(self.kafka.max_poll_interval_ms) {
            return Err(ConfigError::RetryBackoffTooLong {
                backoff_ms,
                poll_ms: self.kafka.max_poll_interval_ms,
            });
        }
        Ok(())
    }

    /// Topic that retry-pending events are republished to
    pub fn retry_topic(&self) -> &str {
        self.kafka
            .retry_topic
            .as_deref()
            .unwrap_or(&self.kafka.upload_topic)
    }

    /// Get API read timeout as Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.api.read_timeout_secs)
    }

    /// Get producer delivery timeout as Duration
    pub fn producer_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka.producer_timeout_ms)
    }
}

impl IngestionConfig {
    /// Get analysis timeout as Duration
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    /// Get store write timeout as Duration
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

/// Table names are interpolated into SQL, so only plain identifiers
/// (optionally schema-qualified) are accepted.
pub fn is_valid_table_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return false;
    }

    parts.iter().all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    })
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            min_confidence: default_min_confidence(),
            max_labels: default_max_labels(),
            verify_object: true,
            force_path_style: false,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            analysis_timeout_secs: default_analysis_timeout_secs(),
            store_timeout_secs: default_store_timeout_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            read_timeout_secs: default_read_timeout_secs(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
