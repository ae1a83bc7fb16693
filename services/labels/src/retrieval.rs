use crate::config::ApiConfig;
use crate::record::ResultRecord;
use crate::result_store::{ResultStore, StoreError};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

/// Key read by the readiness check; it only has to be readable, not present
const READINESS_CHECK_KEY: &str = "__readiness_check__";

/// Serves stored result records by object key
#[derive(Clone)]
pub struct RetrievalHandler {
    store: Arc<dyn ResultStore>,
    read_timeout: Duration,
}

/// Outcome of a retrieval, rendered as an HTTP response
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalResponse {
    Found(ResultRecord),
    MissingKey,
    NotFound,
    Unavailable,
}

impl RetrievalHandler {
    pub fn new(store: Arc<dyn ResultStore>, read_timeout: Duration) -> Self {
        Self {
            store,
            read_timeout,
        }
    }

    /// Look up the record for `key`. A missing or empty key never reaches the store.
    #[instrument(skip(self))]
    pub async fn handle(&self, key: Option<&str>) -> RetrievalResponse {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            debug!("Rejecting request without key");
            metrics::counter!("labels.requests.bad_request").increment(1);
            return RetrievalResponse::MissingKey;
        };

        match self.read(key).await {
            Ok(Some(record)) => {
                metrics::counter!("labels.requests.ok").increment(1);
                RetrievalResponse::Found(record)
            }
            Ok(None) => {
                debug!(object_key = %key, "No result record");
                metrics::counter!("labels.requests.not_found").increment(1);
                RetrievalResponse::NotFound
            }
            Err(e) => {
                error!(error = %e, object_key = %key, "Failed to read result record");
                metrics::counter!("labels.requests.error").increment(1);
                RetrievalResponse::Unavailable
            }
        }
    }

    async fn read(&self, key: &str) -> Result<Option<ResultRecord>, StoreError> {
        tokio::time::timeout(self.read_timeout, self.store.get(key))
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Unavailable(format!(
                    "store read timed out after {:?}",
                    self.read_timeout
                )))
            })
    }

    /// Whether the store answers reads at all
    pub async fn is_ready(&self) -> bool {
        match self.read(READINESS_CHECK_KEY).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Result store not ready");
                false
            }
        }
    }
}

impl IntoResponse for RetrievalResponse {
    fn into_response(self) -> Response {
        match self {
            RetrievalResponse::Found(record) => (StatusCode::OK, Json(record)).into_response(),
            RetrievalResponse::MissingKey => (
                StatusCode::BAD_REQUEST,
                "Missing required query parameter: key",
            )
                .into_response(),
            RetrievalResponse::NotFound => {
                (StatusCode::NOT_FOUND, "No results for the given key").into_response()
            }
            RetrievalResponse::Unavailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to retrieve results",
            )
                .into_response(),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub retrieval: RetrievalHandler,
}

/// Query parameters for result lookup
#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    pub key: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/results", get(get_result))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "label-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.retrieval.is_ready().await {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "disconnected"
            })),
        )
    }
}

/// Get the result record for an object key
async fn get_result(
    State(state): State<AppState>,
    Query(params): Query<ResultQuery>,
) -> RetrievalResponse {
    state.retrieval.handle(params.key.as_deref()).await
}

/// Start the retrieval API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting result retrieval API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
