//! `GET /api/download/{task_id}`: fetch a task's result.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use w2x_core::{FetchResult, TaskStatus};

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/download/{task_id}", get(download))
}

/// * 200 with the image bytes once completed;
/// * 202 `{taskId, status}` while queued or processing;
/// * 500 `{taskId, status: "failed", error}` for a failed task;
/// * 404 for unknown tasks and for results whose file has disappeared.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Response, ServerError> {
    let response = match state.coordinator.fetch_result(&task_id).await? {
        FetchResult::NotFound => return Err(ServerError::NotFound(format!("task {task_id}"))),
        FetchResult::StillWorking(status) => (
            StatusCode::ACCEPTED,
            Json(json!({ "taskId": task_id, "status": status })),
        )
            .into_response(),
        FetchResult::Failed(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "taskId": task_id,
                "status": TaskStatus::Failed,
                "error": error,
            })),
        )
            .into_response(),
        FetchResult::Ready { bytes, format } => {
            ([(header::CONTENT_TYPE, format.mime())], bytes).into_response()
        }
    };
    Ok(response)
}
