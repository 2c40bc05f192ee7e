use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::params::{OutputFormat, UpscaleParams};

/// Lifecycle state of a persisted task.
///
/// `queued → processing → completed | failed`. The two terminal states never
/// transition again; a failed key is simply free for a fresh submission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Queued or processing: the task owns its cache key's in-flight slot.
    pub fn is_in_flight(self) -> bool {
        !self.is_terminal()
    }
}

/// A row in the `upscale_tasks` table.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: String,
    pub file_uid: String,
    pub cache_key: String,
    pub source_key: String,
    pub cid: String,
    pub image_hash: String,
    pub params: UpscaleParams,
    pub status: TaskStatus,
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub format: OutputFormat,
    pub file_size: Option<u64>,
    /// Present only when `status` is [`TaskStatus::Failed`].
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Short prefix of the task id for log lines.
    pub fn short_id(&self) -> &str {
        short_id(&self.task_id)
    }
}

/// Everything needed to insert a freshly queued task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub file_uid: String,
    pub cache_key: String,
    pub source_key: String,
    pub cid: String,
    pub image_hash: String,
    pub params: UpscaleParams,
    pub input_path: PathBuf,
}

pub(crate) fn short_id(task_id: &str) -> &str {
    task_id.get(..8).unwrap_or(task_id)
}
