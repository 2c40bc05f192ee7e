//! Health / heartbeat endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use w2x_core::{CoreError, TaskStatus, TaskStore};

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Returns `{"status": "ok", "version", "pending", "active", "tasks"}` with
/// HTTP 200. `tasks` counts stored rows per status.
pub async fn get_health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ServerError> {
    let stats = state.coordinator.stats();

    let mut tasks = Map::new();
    for status in [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ] {
        let count = state
            .coordinator
            .store()
            .count_by_status(status)
            .await
            .map_err(CoreError::from)?;
        tasks.insert(status.to_string(), count.into());
    }

    Ok(Json(json!({
        "status":  "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "pending": stats.pending,
        "active":  stats.active,
        "tasks":   tasks,
    })))
}
