//! JSON HTTP API.
//!
//! - POST /v1/execute
//! - POST /v1/records
//! - GET /v1/records/{key}
//! - DELETE /v1/records/{key}
//! - GET /v1/cas/stats
//! - GET /health
//! - GET /metrics

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::cache::entry::unix_millis;
use crate::cache::promoter::CasWriter;
use crate::cache::store::{CasError, CasStats, ContentStore};
use crate::config::Config;
use crate::ingest::{IngestError, IngestReceipt, Ingestor};
use crate::keys::{KeyContext, KeyParseError, TrivariateKey};
use crate::metrics::Metrics;
use crate::router::{ExecutionOutcome, ExecutionRequest, RouterError};
use crate::service::Service;
use crate::staging::{Record, StagingError};

/// Application state shared across handlers.
pub struct AppState {
    pub router: Arc<crate::router::Router>,
    pub ingestor: Arc<Ingestor>,
    pub store: Arc<ContentStore>,
    pub writer: CasWriter,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: &Service) -> Self {
        Self {
            router: Arc::clone(&service.router),
            ingestor: Arc::clone(&service.ingestor),
            store: Arc::clone(&service.store),
            writer: service.writer.clone(),
            metrics: Arc::clone(&service.metrics),
            config: Arc::clone(&service.config),
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let server = &state.config.server;
    let max_concurrent = server.max_concurrent_requests.max(1);
    let request_timeout = Duration::from_secs(server.request_timeout_secs.max(1));

    Router::new()
        .route("/v1/execute", post(execute))
        .route("/v1/records", post(ingest))
        .route("/v1/records/{key}", get(expand).delete(invalidate))
        .route("/v1/cas/stats", get(cas_stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(ConcurrencyLimitLayer::new(max_concurrent))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Logical context of a request or record.
#[derive(Debug, Deserialize)]
pub struct ContextBody {
    pub source: String,
    /// Unix seconds; defaults to now.
    #[serde(default)]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub query: Record,
    pub context: ContextBody,
    pub identity: String,
}

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    pub record: Record,
    pub context: ContextBody,
    pub identity: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub cas: CasStats,
    pub in_flight: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub entries: usize,
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// Error returned by handlers, mapped to a status code.
#[derive(Debug)]
pub enum ApiError {
    Router(RouterError),
    Ingest(IngestError),
    Cas(CasError),
    BadKey(KeyParseError),
}

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        ApiError::Router(e)
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        ApiError::Ingest(e)
    }
}

impl From<CasError> for ApiError {
    fn from(e: CasError) -> Self {
        ApiError::Cas(e)
    }
}

impl From<KeyParseError> for ApiError {
    fn from(e: KeyParseError) -> Self {
        ApiError::BadKey(e)
    }
}

fn cas_status(e: &CasError) -> StatusCode {
    match e {
        CasError::NotFound(_) => StatusCode::NOT_FOUND,
        CasError::ExpansionFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CasError::KeyCollision { .. } => StatusCode::CONFLICT,
        CasError::WriterClosed => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn staging_status(_: &StagingError) -> StatusCode {
    StatusCode::BAD_REQUEST
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Router(RouterError::Staging(e)) => (staging_status(e), e.to_string()),
            ApiError::Router(RouterError::Cas(e)) => (cas_status(e), e.to_string()),
            ApiError::Router(e @ RouterError::TierCFailed { .. }) => {
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            ApiError::Ingest(IngestError::Staging(e)) => (staging_status(e), e.to_string()),
            ApiError::Ingest(IngestError::Cas(e)) | ApiError::Cas(e) => {
                (cas_status(e), e.to_string())
            }
            ApiError::BadKey(e) => (StatusCode::BAD_REQUEST, e.to_string()),
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %message, "Request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ─── Handlers ──────────────────────────────────────────────────────────────

fn key_context(state: &AppState, body: ContextBody) -> KeyContext {
    let timestamp = body.timestamp.unwrap_or_else(|| unix_millis() / 1000);
    KeyContext::at(body.source, timestamp, state.config.keys.time_bucket_secs)
}

async fn execute(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecuteBody>,
) -> Result<Json<ExecutionOutcome>, ApiError> {
    let context = key_context(&state, body.context);
    let request = ExecutionRequest::new(body.query, context, body.identity);
    let outcome = state.router.execute(request).await?;
    Ok(Json(outcome))
}

async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestBody>,
) -> Result<(StatusCode, Json<IngestReceipt>), ApiError> {
    let context = key_context(&state, body.context);
    let receipt = state
        .ingestor
        .ingest(&body.record, &context, &body.identity)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn expand(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Record>, ApiError> {
    let key: TrivariateKey = key.parse()?;
    Ok(Json(state.store.expand(&key)?))
}

async fn invalidate(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key: TrivariateKey = key.parse()?;
    if state.writer.invalidate(key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CasError::NotFound(key).into())
    }
}

async fn cas_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        cas: state.store.stats(),
        in_flight: state.router.in_flight(),
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        entries: state.store.len(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
