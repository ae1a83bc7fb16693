use crate::config::{is_valid_table_name, StoreConfig};
use crate::record::{LabelScore, ResultRecord};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Failures of the result store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("result store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Durable key-value storage of result records, keyed by object key.
///
/// `put` always replaces the whole record; there is no merge.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert or replace the record for `record.object_key`
    async fn put(&self, record: ResultRecord) -> Result<(), StoreError>;

    /// Fetch the current record, `None` when the key was never stored
    async fn get(&self, object_key: &str) -> Result<Option<ResultRecord>, StoreError>;
}

fn ensure_key(record: &ResultRecord) -> Result<(), StoreError> {
    if record.object_key.is_empty() {
        return Err(StoreError::InvalidRecord(
            "object key must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Row layout of the results table
#[derive(Debug, FromRow)]
struct ResultRow {
    object_key: String,
    bucket: String,
    labels: Json<Vec<LabelScore>>,
}

impl From<ResultRow> for ResultRecord {
    fn from(row: ResultRow) -> Self {
        Self {
            object_key: row.object_key,
            bucket: row.bucket,
            labels: row.labels.0,
        }
    }
}

/// Result store backed by a PostgreSQL table
pub struct PgResultStore {
    pool: PgPool,
    upsert_sql: String,
    select_sql: String,
}

impl PgResultStore {
    /// Create a new store with connection pool
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        if !is_valid_table_name(&config.table) {
            bail!("Invalid result table name: {:?}", config.table);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!(table = %config.table, "Connected to PostgreSQL result store");

        Ok(Self::with_pool(pool, &config.table))
    }

    fn with_pool(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            upsert_sql: upsert_statement(table),
            select_sql: select_statement(table),
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

fn upsert_statement(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} (object_key, bucket, labels, updated_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (object_key) DO UPDATE
        SET bucket = EXCLUDED.bucket,
            labels = EXCLUDED.labels,
            updated_at = EXCLUDED.updated_at
        "#
    )
}

fn select_statement(table: &str) -> String {
    format!(
        r#"
        SELECT object_key, bucket, labels
        FROM {table}
        WHERE object_key = $1
        "#
    )
}

#[async_trait]
impl ResultStore for PgResultStore {
    #[instrument(skip(self, record), fields(object_key = %record.object_key))]
    async fn put(&self, record: ResultRecord) -> Result<(), StoreError> {
        ensure_key(&record)?;

        sqlx::query(&self.upsert_sql)
            .bind(&record.object_key)
            .bind(&record.bucket)
            .bind(Json(&record.labels))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        debug!(label_count = record.labels.len(), "Result record written");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, object_key: &str) -> Result<Option<ResultRecord>, StoreError> {
        let row = sqlx::query_as::<_, ResultRow>(&self.select_sql)
            .bind(object_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(row.map(ResultRecord::from))
    }
}

/// In-process result store for local runs and tests
#[derive(Default)]
pub struct MemoryResultStore {
    records: RwLock<HashMap<String, ResultRecord>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, record: ResultRecord) -> Result<(), StoreError> {
        ensure_key(&record)?;
        self.records
            .write()
            .insert(record.object_key.clone(), record);
        Ok(())
    }

    async fn get(&self, object_key: &str) -> Result<Option<ResultRecord>, StoreError> {
        Ok(self.records.read().get(object_key).cloned())
    }
}
