//! SQLite implementation of [`TaskStore`].
//!
//! Migrations under `w2x-core/migrations` are embedded at compile time and run
//! by [`SqliteStore::connect`]. Queries use the runtime-checked `sqlx::query`
//! form so no `DATABASE_URL` is needed to build.
//!
//! Timestamps are stored as RFC 3339 UTC text with a fixed microsecond
//! precision, which keeps `ORDER BY updated_at` equal to time order.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};

use super::TaskStore;
use crate::params::{OutputFormat, UpscaleParams};
use crate::task::{NewTask, TaskRecord, TaskStatus};

const TASK_COLUMNS: &str = "task_id, file_uid, cache_key, source_key, cid, image_hash, params, \
     status, input_path, output_path, format, file_size, error, started_at, finished_at, \
     created_at, updated_at";

/// SQLite-backed task store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `"sqlite://w2x.db"`.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations on it.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        binds: &[&str],
    ) -> Result<Option<TaskRecord>, sqlx::Error> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM upscale_tasks WHERE {clause}");
        let mut query = sqlx::query_as::<Sqlite, TaskRow>(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        query
            .fetch_optional(&self.pool)
            .await?
            .map(TaskRecord::try_from)
            .transpose()
    }
}

impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: NewTask) -> Result<TaskRecord, sqlx::Error> {
        let now = Utc::now();
        let params = serde_json::to_string(&task.params)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let sql = format!(
            "INSERT INTO upscale_tasks ({TASK_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10, NULL, NULL, NULL, NULL, ?11, ?11)"
        );
        sqlx::query(&sql)
            .bind(&task.task_id)
            .bind(&task.file_uid)
            .bind(&task.cache_key)
            .bind(&task.source_key)
            .bind(&task.cid)
            .bind(&task.image_hash)
            .bind(&params)
            .bind(TaskStatus::Queued.as_ref())
            .bind(task.input_path.to_string_lossy().as_ref())
            .bind(task.params.format.extension())
            .bind(timestamp(now))
            .execute(&self.pool)
            .await?;

        Ok(TaskRecord {
            format: task.params.format,
            task_id: task.task_id,
            file_uid: task.file_uid,
            cache_key: task.cache_key,
            source_key: task.source_key,
            cid: task.cid,
            image_hash: task.image_hash,
            params: task.params,
            status: TaskStatus::Queued,
            input_path: task.input_path,
            output_path: None,
            file_size: None,
            error: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, sqlx::Error> {
        self.fetch_one_where("task_id = ?1", &[task_id]).await
    }

    async fn find_completed(&self, cache_key: &str) -> Result<Option<TaskRecord>, sqlx::Error> {
        self.fetch_one_where(
            "cache_key = ?1 AND status = ?2 ORDER BY updated_at DESC LIMIT 1",
            &[cache_key, TaskStatus::Completed.as_ref()],
        )
        .await
    }

    async fn find_in_flight(&self, cache_key: &str) -> Result<Option<TaskRecord>, sqlx::Error> {
        self.fetch_one_where(
            "cache_key = ?1 AND status IN (?2, ?3) ORDER BY updated_at DESC LIMIT 1",
            &[
                cache_key,
                TaskStatus::Queued.as_ref(),
                TaskStatus::Processing.as_ref(),
            ],
        )
        .await
    }

    async fn list_in_flight(&self) -> Result<Vec<TaskRecord>, sqlx::Error> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM upscale_tasks \
             WHERE status IN (?1, ?2) ORDER BY created_at ASC"
        );
        sqlx::query_as::<Sqlite, TaskRow>(&sql)
            .bind(TaskStatus::Queued.as_ref())
            .bind(TaskStatus::Processing.as_ref())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TaskRecord::try_from)
            .collect()
    }

    async fn mark_processing(&self, task_id: &str) -> Result<(), sqlx::Error> {
        let now = timestamp(Utc::now());
        sqlx::query(
            "UPDATE upscale_tasks SET status = ?1, started_at = ?2, updated_at = ?2 \
             WHERE task_id = ?3",
        )
        .bind(TaskStatus::Processing.as_ref())
        .bind(&now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue(&self, task_id: &str) -> Result<(), sqlx::Error> {
        let now = timestamp(Utc::now());
        sqlx::query(
            "UPDATE upscale_tasks SET status = ?1, started_at = NULL, updated_at = ?2 \
             WHERE task_id = ?3",
        )
        .bind(TaskStatus::Queued.as_ref())
        .bind(&now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        task_id: &str,
        output_path: &Path,
        file_size: u64,
    ) -> Result<(), sqlx::Error> {
        let now = timestamp(Utc::now());
        let size = i64::try_from(file_size).unwrap_or(i64::MAX);
        sqlx::query(
            "UPDATE upscale_tasks SET status = ?1, output_path = ?2, file_size = ?3, error = NULL, \
             finished_at = ?4, updated_at = ?4 WHERE task_id = ?5",
        )
        .bind(TaskStatus::Completed.as_ref())
        .bind(output_path.to_string_lossy().as_ref())
        .bind(size)
        .bind(&now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, task_id: &str, error: &str) -> Result<(), sqlx::Error> {
        let now = timestamp(Utc::now());
        sqlx::query(
            "UPDATE upscale_tasks SET status = ?1, error = ?2, finished_at = ?3, updated_at = ?3 \
             WHERE task_id = ?4",
        )
        .bind(TaskStatus::Failed.as_ref())
        .bind(error)
        .bind(&now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM upscale_tasks WHERE task_id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM upscale_tasks WHERE status = ?1")
                .bind(status.as_ref())
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

// ── row mapping ──────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    file_uid: String,
    cache_key: String,
    source_key: String,
    cid: String,
    image_hash: String,
    params: String,
    status: String,
    input_path: String,
    output_path: Option<String>,
    format: String,
    file_size: Option<i64>,
    error: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = sqlx::Error;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let params: UpscaleParams =
            serde_json::from_str(&row.params).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let status: TaskStatus = row
            .status
            .parse()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let format = row.format.parse::<OutputFormat>().unwrap_or(params.format);

        Ok(TaskRecord {
            status,
            format,
            input_path: PathBuf::from(row.input_path),
            output_path: row.output_path.map(PathBuf::from),
            file_size: row.file_size.and_then(|s| u64::try_from(s).ok()),
            started_at: row.started_at.as_deref().map(|raw| parse_timestamp(raw, "started_at")),
            finished_at: row.finished_at.as_deref().map(|raw| parse_timestamp(raw, "finished_at")),
            created_at: parse_timestamp(&row.created_at, "created_at"),
            updated_at: parse_timestamp(&row.updated_at, "updated_at"),
            params,
            task_id: row.task_id,
            file_uid: row.file_uid,
            cache_key: row.cache_key,
            source_key: row.source_key,
            cid: row.cid,
            image_hash: row.image_hash,
            error: row.error,
        })
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str, column: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            tracing::warn!(raw = %raw, column, error = %e, "failed to parse task timestamp; using now");
            Utc::now()
        })
}
