//! Orchestration core for image upscaling: deduplicated, cached tasks run
//! against an external upscaler under a bounded-concurrency scheduler.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod layout;
pub mod params;
pub mod runner;
pub mod runtime;
pub mod store;
pub mod task;

pub use config::{ConfigProvider, QueueStrategy, Settings, SharedConfig};
pub use coordinator::{download_url, Coordinator, DownloadPayload, FetchResult, SubmitOutcome};
pub use error::CoreError;
pub use layout::CacheLayout;
pub use params::{OutputFormat, ParamOverrides, UpscaleParams};
pub use runner::{ProcessExecutor, RunnerError, TokioProcessExecutor, Upscaler};
pub use runtime::{Scheduler, SchedulerStats};
pub use store::{SqliteStore, TaskStore};
pub use task::{TaskRecord, TaskStatus};
