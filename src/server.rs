//! HTTP surface: sync control and cached issue reads.

use axum::{
  extract::{Path, Query, State},
  http::{HeaderMap, StatusCode},
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cache::{Pagination, ReadCache};
use crate::db::RunLog;
use crate::error::UpstreamError;
use crate::sync::{SyncOrchestrator, SyncStatus, SyncTrigger, TransformFailure, TriggerType};

pub const SECRET_HEADER: &str = "x-sync-secret";
pub const ACTOR_HEADER: &str = "x-sync-actor";

const DEFAULT_RUNS: usize = 20;
const MAX_RUNS: usize = 200;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
  #[error("IO error: {0}")]
  IoError(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
  pub orchestrator: Arc<SyncOrchestrator>,
  pub reader: ReadCache,
  pub run_log: Arc<dyn RunLog>,
  /// SHA-256 of the shared trigger secret, if one is configured
  trigger_secret: Option<[u8; 32]>,
}

impl AppState {
  pub fn new(
    orchestrator: Arc<SyncOrchestrator>,
    reader: ReadCache,
    run_log: Arc<dyn RunLog>,
    trigger_secret: Option<&str>,
  ) -> Self {
    Self {
      orchestrator,
      reader,
      run_log,
      trigger_secret: trigger_secret
        .filter(|s| !s.is_empty())
        .map(|s| Sha256::digest(s.as_bytes()).into()),
    }
  }

  fn secret_matches(&self, headers: &HeaderMap) -> bool {
    let Some(expected) = self.trigger_secret else {
      return true;
    };
    headers
      .get(SECRET_HEADER)
      .map(|value| {
        let provided: [u8; 32] = Sha256::digest(value.as_bytes()).into();
        provided == expected
      })
      .unwrap_or(false)
  }
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/sync/status", get(sync_status))
    .route("/sync/trigger", post(sync_trigger))
    .route("/sync/runs", get(sync_runs))
    .route("/issues", get(list_issues))
    .route("/issues/{id}", get(get_issue))
    .with_state(state)
}

pub async fn serve(bind: &str, state: AppState) -> Result<(), ServerError> {
  let listener = TcpListener::bind(bind).await?;
  info!(addr = %listener.local_addr()?, "HTTP server listening");
  axum::serve(listener, router(state)).await?;
  Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorResponse {
  error_code: &'static str,
  error_message: String,
}

enum ApiError {
  Forbidden,
  NotFound(String),
  Upstream(UpstreamError),
  Internal(String),
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, error_code, error_message) = match self {
      ApiError::Forbidden => (
        StatusCode::FORBIDDEN,
        "FORBIDDEN",
        "missing or invalid sync secret".to_string(),
      ),
      ApiError::NotFound(id) => (
        StatusCode::NOT_FOUND,
        "NOT_FOUND",
        format!("issue {} not found", id),
      ),
      ApiError::Upstream(e) => (
        StatusCode::SERVICE_UNAVAILABLE,
        e.code(),
        crate::error::scrub_message(&e.to_string()),
      ),
      ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message),
    };

    let body = Json(ApiErrorResponse {
      error_code,
      error_message,
    });
    (status, body).into_response()
  }
}

async fn health() -> Json<serde_json::Value> {
  Json(json!({ "status": "ok" }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
  #[serde(flatten)]
  status: SyncStatus,
  recent_failures: Vec<TransformFailure>,
}

async fn sync_status(State(state): State<AppState>) -> Json<StatusResponse> {
  Json(StatusResponse {
    status: state.orchestrator.status(),
    recent_failures: state.orchestrator.recent_failures(),
  })
}

async fn sync_trigger(
  State(state): State<AppState>,
  headers: HeaderMap,
) -> Result<Response, ApiError> {
  if !state.secret_matches(&headers) {
    warn!("Rejected sync trigger with bad secret");
    return Err(ApiError::Forbidden);
  }

  let mut trigger = SyncTrigger::new(TriggerType::Manual);
  if let Some(actor) = headers.get(ACTOR_HEADER).and_then(|v| v.to_str().ok()) {
    trigger = trigger.with_actor(actor);
  }

  if state.orchestrator.spawn_sync(trigger) {
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response())
  } else {
    Ok((StatusCode::CONFLICT, Json(state.orchestrator.status())).into_response())
  }
}

#[derive(Deserialize, Debug)]
struct RunsParams {
  limit: Option<usize>,
}

async fn sync_runs(
  State(state): State<AppState>,
  Query(params): Query<RunsParams>,
) -> Result<Response, ApiError> {
  let limit = params.limit.unwrap_or(DEFAULT_RUNS).clamp(1, MAX_RUNS);
  let run_log = Arc::clone(&state.run_log);
  let runs = tokio::task::spawn_blocking(move || run_log.recent_runs(limit))
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?
    .map_err(|e| ApiError::Internal(e.to_string()))?;
  Ok(Json(runs).into_response())
}

#[derive(Deserialize, Debug)]
struct IssuesParams {
  first: Option<usize>,
  after: Option<String>,
}

async fn list_issues(
  State(state): State<AppState>,
  Query(params): Query<IssuesParams>,
) -> Response {
  let pagination = Pagination::new(params.first, params.after);
  Json(state.reader.get_items(&pagination).await).into_response()
}

async fn get_issue(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> Result<Response, ApiError> {
  match state.reader.get_item_by_id(&id).await {
    Ok(Some(result)) => Ok(Json(result).into_response()),
    Ok(None) => Err(ApiError::NotFound(id)),
    Err(e) => Err(ApiError::Upstream(e)),
  }
}
