//! # REST Query Surface
//!
//! Thin adapters over the cache, the store and the orchestrator. The full
//! HTTP/UI surface is an external collaborator; these endpoints exist so
//! dashboards and tooling can query state and drive jobs.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::error::ServerError;
use crate::jobs::JobRequest;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/machines", get(list_machines))
        .route("/api/machines/{id}", get(get_machine).delete(delete_machine))
        .route("/api/jobs", get(list_jobs).post(submit_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/abort", post(abort_job))
        .route("/api/audit", get(recent_audit))
        .route("/api/security-events", get(security_events))
        .route(
            "/api/machines/{id}/security-events/resolve",
            post(resolve_security_events),
        )
}

struct ApiError(ServerError);

impl From<ServerError> for ApiError {
    fn from(e: ServerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServerError::Protocol(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ServerError::Crypto(_) => StatusCode::FORBIDDEN,
            ServerError::Dispatch(_) => StatusCode::CONFLICT,
            ServerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// `GET /api/machines` — every machine with its cached observables.
async fn list_machines(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.views())
}

async fn get_machine(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    match state.cache.view(&id) {
        Some(view) => Ok(Json(view).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

/// `DELETE /api/machines/{id}` — administrative removal; drops the row,
/// the cached projection, and the machine's replay history.
async fn delete_machine(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_machine(&id).await.map_err(ServerError::from)?;
    state.cache.delete_machine(&id);
    state.terminal.clear_nonce_history(&id);
    Ok(StatusCode::NO_CONTENT)
}

async fn list_jobs(State(state): State<AppState>) -> Result<Response, ApiError> {
    let jobs = state.store.all_jobs().await.map_err(ServerError::from)?;
    Ok(Json(jobs).into_response())
}

async fn get_job(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let Some(job) = state.store.job_by_id(&id).await.map_err(ServerError::from)? else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let executions = state
        .store
        .executions_for_job(&id)
        .await
        .map_err(ServerError::from)?;
    Ok(Json(json!({ "job": job, "executions": executions })).into_response())
}

/// `POST /api/jobs` — submits a bulk command for orchestration.
async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<Response, ApiError> {
    let job = state.orchestrator.submit(request).await?;
    Ok((StatusCode::CREATED, Json(job)).into_response())
}

#[derive(Deserialize, Default)]
struct AbortBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn abort_job(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<AbortBody>>,
) -> StatusCode {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "Aborted by operator".to_string());
    if state.orchestrator.abort_job(&id, &reason).await {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn recent_audit(State(state): State<AppState>) -> Result<Response, ApiError> {
    let rows = state
        .store
        .recent_audit(100)
        .await
        .map_err(ServerError::from)?;
    Ok(Json(rows).into_response())
}

async fn security_events(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.security_events())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveBody {
    event_ids: Vec<String>,
}

/// `POST /api/machines/{id}/security-events/resolve` — flips the named
/// events to resolved, refreshes the cached projection, and notifies
/// subscribers.
async fn resolve_security_events(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<ResolveBody>,
) -> Result<Response, ApiError> {
    let resolved = state
        .store
        .resolve_security_events(&id, &body.event_ids)
        .await
        .map_err(ServerError::from)?;
    let recent = state
        .store
        .recent_security_events(100)
        .await
        .map_err(ServerError::from)?;
    state.cache.refresh_security_events(recent);
    state
        .bus
        .publish(fleet_protocol::ServerEvent::SecurityEventsResolved {
            machine_id: id,
            event_ids: resolved.clone(),
        });
    Ok(Json(json!({ "resolved": resolved })).into_response())
}
