//! Run inspection and control endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::domain::{ImageSet, PipelineRun, StageName};

/// A run as shown to operators
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: PipelineRun,

    /// The exact stage at which the run stopped, if it did
    pub stopped_at: Option<StageName>,
}

impl From<PipelineRun> for RunView {
    fn from(run: PipelineRun) -> Self {
        Self {
            stopped_at: run.stopped_at(),
            run,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunQuery {
    pub commit: Option<String>,
    pub limit: Option<usize>,
}

const DEFAULT_LIMIT: usize = 20;

/// GET /runs/{id}
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunView>> {
    tracing::debug!("Getting run: {}", id);

    let run = state.store.get(id).await?;
    Ok(Json(run.into()))
}

/// GET /runs?commit=&limit=
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunQuery>,
) -> ApiResult<Json<Vec<RunView>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);

    let runs = match query.commit {
        Some(commit) => {
            if commit.trim().len() < crate::core::run_store::MIN_COMMIT_PREFIX {
                return Err(ApiError::BadRequest(format!(
                    "commit prefix must be at least {} characters",
                    crate::core::run_store::MIN_COMMIT_PREFIX
                )));
            }
            let mut runs = state.store.find_by_commit(&commit).await;
            runs.truncate(limit);
            runs
        }
        None => state.store.list(limit).await,
    };

    Ok(Json(runs.into_iter().map(RunView::from).collect()))
}

/// POST /runs/{id}/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    if !state.dispatcher.cancel(id) {
        return Err(ApiError::NotFound(format!("Run {} is not queued or running", id)));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "cancelling", "run_id": id })),
    ))
}

#[derive(Debug, Serialize)]
pub struct TargetView {
    pub name: String,
    pub images: ImageSet,
}

/// GET /target
pub async fn get_target(State(state): State<AppState>) -> Json<TargetView> {
    Json(TargetView {
        name: state.dispatcher.target_name().to_string(),
        images: state.dispatcher.current_images(),
    })
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
