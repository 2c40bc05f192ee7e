//! HTTP error mapping.
//!
//! Client-correctable errors carry their message in the body. Internal errors
//! are logged with full detail and answered with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use w2x_core::CoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Core(CoreError::QueueFull { .. }) => StatusCode::TOO_MANY_REQUESTS,
            ServerError::Core(CoreError::InputTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::Core(CoreError::Validation(_)) => StatusCode::BAD_REQUEST,
            ServerError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let internal = match &self {
            ServerError::Core(e) => !e.is_client_error(),
            ServerError::NotFound(_) => false,
        };
        let message = if internal {
            error!(error = %self, "request failed");
            "internal server error".to_owned()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
