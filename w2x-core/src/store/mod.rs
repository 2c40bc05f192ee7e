//! Durable task records.
//!
//! [`TaskStore`] is the single source of truth for task state. The default
//! implementation is [`sqlite::SqliteStore`]. Every mutation is a single-row
//! update keyed by `task_id`, so concurrent jobs never need cross-task locks.
//!
//! Methods return `impl Future` (stable since Rust 1.75), so implementors do
//! not need `async-trait`.

pub mod sqlite;

use std::future::Future;
use std::path::Path;

use crate::task::{NewTask, TaskRecord, TaskStatus};

pub use sqlite::SqliteStore;

pub trait TaskStore: Send + Sync + 'static {
    /// Insert a new `queued` row and return it.
    ///
    /// Fails with a unique-violation database error when another in-flight
    /// row already owns `task.cache_key`; see [`is_unique_violation`].
    fn insert_task(
        &self,
        task: NewTask,
    ) -> impl Future<Output = Result<TaskRecord, sqlx::Error>> + Send;

    fn get_task(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<Option<TaskRecord>, sqlx::Error>> + Send;

    /// Most recently updated `completed` row for `cache_key`.
    fn find_completed(
        &self,
        cache_key: &str,
    ) -> impl Future<Output = Result<Option<TaskRecord>, sqlx::Error>> + Send;

    /// The `queued` or `processing` row for `cache_key`, if any.
    fn find_in_flight(
        &self,
        cache_key: &str,
    ) -> impl Future<Output = Result<Option<TaskRecord>, sqlx::Error>> + Send;

    /// All `queued` / `processing` rows, oldest first.
    fn list_in_flight(&self) -> impl Future<Output = Result<Vec<TaskRecord>, sqlx::Error>> + Send;

    fn mark_processing(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Demote a row back to `queued` and clear `started_at`.
    fn requeue(&self, task_id: &str) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn mark_completed(
        &self,
        task_id: &str,
        output_path: &Path,
        file_size: u64,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn mark_failed(
        &self,
        task_id: &str,
        error: &str,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn delete_task(&self, task_id: &str) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn count_by_status(
        &self,
        status: TaskStatus,
    ) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;
}

/// Whether `err` is a uniqueness-constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}
