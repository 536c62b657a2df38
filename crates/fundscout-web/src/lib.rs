//! Axum JSON API over the discovery engine.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use fundscout_core::{CrawlSettings, CrawlTarget};
use fundscout_crawl::{DiscoveryEngine, EngineError, RegistryError};
use fundscout_storage::{ArtifactError, ArtifactStore, PersistenceError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "fundscout-web";

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DiscoveryEngine>,
}

impl AppState {
    pub fn new(engine: Arc<DiscoveryEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
struct VerifyBody {
    #[serde(default = "default_verified")]
    verified: bool,
}

fn default_verified() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PriorityBody {
    priority: i32,
}

#[derive(Debug, Deserialize)]
struct RescheduleBody {
    not_before: DateTime<Utc>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/crawl/start", post(start_handler))
        .route("/crawl/stop", post(stop_handler))
        .route("/queue/status", get(queue_status_handler))
        .route("/queue/depth", get(queue_depth_handler))
        .route("/queue/review", get(review_handler))
        .route("/queue/review/{id}/clear", post(clear_review_handler))
        .route("/stats", get(stats_handler))
        .route("/rewards", get(rewards_handler))
        .route("/targets", get(targets_handler).post(add_target_handler))
        .route("/targets/{id}/deactivate", post(deactivate_handler))
        .route("/targets/{id}/priority", post(priority_handler))
        .route("/targets/{id}/reschedule", post(reschedule_handler))
        .route("/targets/{id}/history", get(history_handler))
        .route("/opportunities", get(opportunities_handler))
        .route("/opportunities/{fingerprint}/verify", post(verify_handler))
        .route("/settings", get(settings_handler).put(update_settings_handler))
        .route("/artifacts/{*path}", get(artifact_handler))
        .with_state(Arc::new(state))
}

/// Serves the API for an assembled engine until the listener fails.
pub async fn serve(engine: Arc<DiscoveryEngine>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn start_handler(State(state): State<Arc<AppState>>) -> Response {
    let started = state.engine.start_crawl().await;
    Json(json!({ "started": started, "running": true })).into_response()
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.stop().await {
        Ok(stopped) => Json(json!({ "stopped": stopped, "running": false })).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn queue_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.status().queue_status()).into_response()
}

async fn queue_depth_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "depth": state.engine.status().queue_depth() })).into_response()
}

async fn review_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "targets": state.engine.review_queue().await })).into_response()
}

async fn clear_review_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    if state.engine.clear_review(&id).await {
        Json(json!({ "target_id": id, "requeued": true })).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, format!("target {id} is not under review"))
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.status().aggregate_stats().await).into_response()
}

async fn rewards_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    Json(state.engine.reward_history(query.limit()).await).into_response()
}

async fn targets_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.targets().await).into_response()
}

async fn add_target_handler(
    State(state): State<Arc<AppState>>,
    Json(target): Json<CrawlTarget>,
) -> Response {
    match state.engine.add_target(target).await {
        Ok(added) => (StatusCode::CREATED, Json(added)).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn deactivate_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.engine.deactivate_target(&id).await {
        Ok(target) => Json(target).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn priority_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PriorityBody>,
) -> Response {
    match state.engine.set_priority(&id, body.priority).await {
        Ok(target) => Json(target).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn reschedule_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RescheduleBody>,
) -> Response {
    match state.engine.reschedule_target(&id, body.not_before).await {
        Ok(true) => Json(json!({ "target_id": id, "not_before": body.not_before })).into_response(),
        Ok(false) => api_error(StatusCode::CONFLICT, format!("target {id} is not queued")),
        Err(err) => engine_error(err),
    }
}

async fn history_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.target_history(&id).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.engine.opportunities(query.limit()).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
    body: Bytes,
) -> Response {
    let verified = if body.is_empty() {
        true
    } else {
        match serde_json::from_slice::<VerifyBody>(&body) {
            Ok(parsed) => parsed.verified,
            Err(err) => return api_error(StatusCode::BAD_REQUEST, err.to_string()),
        }
    };
    match state.engine.verify(&fingerprint, verified).await {
        Ok(()) => Json(json!({ "fingerprint": fingerprint, "verified": verified })).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn settings_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.settings().as_ref().clone()).into_response()
}

async fn update_settings_handler(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<CrawlSettings>,
) -> Response {
    match state.engine.update_settings(settings) {
        Ok(current) => Json(current.as_ref().clone()).into_response(),
        Err(err) => api_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
    }
}

async fn artifact_handler(State(state): State<Arc<AppState>>, Path(path): Path<String>) -> Response {
    match state.engine.artifacts().read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type_for(&path))], bytes).into_response(),
        Err(ArtifactError::InvalidPath(p)) => {
            api_error(StatusCode::BAD_REQUEST, format!("invalid artifact path {p}"))
        }
        Err(ArtifactError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            api_error(StatusCode::NOT_FOUND, format!("no artifact at {path}"))
        }
        Err(err) => {
            error!(error = %err, "artifact read failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "artifact unavailable".to_string())
        }
    }
}

/// Inverse of the store's extension mapping.
fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or_default();
    for candidate in ["text/html", "image/png", "image/jpeg", "application/json", "text/plain"] {
        if ArtifactStore::extension_for(candidate) == ext {
            return candidate;
        }
    }
    "application/octet-stream"
}

fn engine_error(err: EngineError) -> Response {
    let status = match &err {
        EngineError::Registry(RegistryError::Unknown(_)) => StatusCode::NOT_FOUND,
        EngineError::Registry(RegistryError::Duplicate(_)) => StatusCode::CONFLICT,
        EngineError::Registry(RegistryError::InvalidUrl { .. }) => StatusCode::BAD_REQUEST,
        EngineError::Persistence(PersistenceError::NotFound { .. }) => StatusCode::NOT_FOUND,
        EngineError::Settings(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => {
            error!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, err.to_string())
}

fn api_error(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
