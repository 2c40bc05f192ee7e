use thiserror::Error;

use crate::runner::RunnerError;

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Pending plus active work already meets `scheduler.max_queue_size`.
    /// Nothing was persisted; the caller should retry later.
    #[error("task queue is full (capacity {capacity}), please retry later")]
    QueueFull { capacity: usize },

    /// The submission was rejected before any task was created.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The input is larger than `api.max_input_size_mb`.
    #[error("input of {size} bytes exceeds the limit of {limit_mb} MB")]
    InputTooLarge { size: usize, limit_mb: u64 },

    /// Propagated from the task store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Temp-file or cache-file I/O.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The external upscaler failed for a task.
    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// The job body panicked before recording an outcome.
    #[error("upscale job panicked")]
    JobPanicked,
}

impl CoreError {
    /// Whether the caller can fix the request (as opposed to a server fault).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::QueueFull { .. } | CoreError::Validation(_) | CoreError::InputTooLarge { .. }
        )
    }
}
