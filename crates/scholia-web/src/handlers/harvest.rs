//! Harvest-source management, triggering, run logs, and metrics.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use scholia_common::ApiError;
use scholia_db::NewHarvestSource;
use scholia_harvest::{RunnerError, Schedule};

use crate::state::SharedState;

use super::internal;

/// POST /harvest/sources — register a repository to harvest.
pub async fn create_source(
    State(state): State<SharedState>,
    Json(new): Json<NewHarvestSource>,
) -> Result<impl IntoResponse, ApiError> {
    if new.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    if new.endpoint_url.trim().is_empty() {
        return Err(ApiError::BadRequest("endpoint_url must not be empty".to_string()));
    }
    if let Some(expr) = new.schedule.as_deref() {
        if Schedule::parse(expr).is_none() {
            return Err(ApiError::BadRequest(format!(
                "invalid schedule expression: {expr}"
            )));
        }
    }

    let source = state.sources.insert(&new).await.map_err(internal)?;
    Ok((StatusCode::CREATED, Json(source)))
}

/// GET /harvest/sources
pub async fn list_sources(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let sources = state.sources.list().await.map_err(internal)?;
    Ok(Json(sources))
}

/// GET /harvest/sources/{id}
pub async fn get_source(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let source = state
        .sources
        .get(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("harvest source not found: {id}")))?;
    Ok(Json(source))
}

/// DELETE /harvest/sources/{id} — logs cascade with the source.
pub async fn delete_source(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.sources.delete(id).await.map_err(internal)? {
        return Err(ApiError::NotFound(format!("harvest source not found: {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// POST /harvest/sources/{id}/harvest — start a run.
///
/// Admission is synchronous: on 202 the run exists (a `running` log) and
/// proceeds in the background; a source already mid-run answers 409.
pub async fn trigger_harvest(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    match state.scheduler.trigger(id).await {
        Ok(log) => Ok((StatusCode::ACCEPTED, Json(log))),
        Err(RunnerError::NotFound(_)) => {
            Err(ApiError::NotFound(format!("harvest source not found: {id}")))
        }
        Err(e @ RunnerError::AlreadyRunning(_)) => Err(ApiError::Conflict(e.to_string())),
        Err(RunnerError::Db(e)) => Err(internal(e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogParams {
    pub source_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// GET /harvest/logs — recent runs, newest first.
pub async fn list_logs(
    State(state): State<SharedState>,
    Query(params): Query<LogParams>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = match params.source_id {
        Some(source_id) => state.logs.list_for_source(source_id).await,
        None => state.logs.list(params.limit.unwrap_or(50).clamp(1, 500)).await,
    }
    .map_err(internal)?;
    Ok(Json(logs))
}

/// GET /harvest/metrics — aggregate counters across all runs.
pub async fn metrics(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let metrics = state.logs.metrics().await.map_err(internal)?;
    Ok(Json(metrics))
}
