//! `POST /api/upscale`: submit raw image bytes for upscaling.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use w2x_core::{ParamOverrides, SubmitOutcome, TaskStatus};

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/upscale", post(submit))
}

/// Query string of a submission.
///
/// Numeric and boolean overrides arrive as text and are parsed leniently: a
/// value that does not parse is treated as absent and falls back to the
/// configured default.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpscaleQuery {
    pub source_key: String,
    pub cid: String,
    pub scale: Option<String>,
    pub noise: Option<String>,
    pub tile: Option<String>,
    pub model: Option<String>,
    pub gpu: Option<String>,
    pub threads: Option<String>,
    pub format: Option<String>,
    pub tta: Option<String>,
}

impl UpscaleQuery {
    fn overrides(&self) -> ParamOverrides {
        ParamOverrides {
            scale: self.scale.as_deref().and_then(|v| v.trim().parse().ok()),
            noise: self.noise.as_deref().and_then(|v| v.trim().parse().ok()),
            tile: self.tile.clone(),
            model: self.model.clone(),
            gpu: self.gpu.clone(),
            threads: self.threads.clone(),
            format: self.format.clone(),
            tta: self.tta.as_deref().and_then(parse_flag),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub task_id: String,
    pub file_uid: String,
    pub status: TaskStatus,
    pub cached: bool,
    pub download_url: String,
}

impl From<SubmitOutcome> for SubmitResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        Self {
            task_id: outcome.task_id,
            file_uid: outcome.file_uid,
            status: outcome.status,
            cached: outcome.cached,
            download_url: outcome.download_url,
        }
    }
}

/// 200 on a cache hit, 202 when the result is still being produced.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UpscaleQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), ServerError> {
    let outcome = state
        .coordinator
        .submit(body, &query.source_key, &query.cid, &query.overrides())
        .await?;

    let status = if outcome.status == TaskStatus::Completed {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(outcome.into())))
}
