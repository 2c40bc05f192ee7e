//! Submission, deduplication, caching, execution and recovery of upscale tasks.
//!
//! A submission resolves in this order:
//!
//! 1. admission: reject when `pending + active >= max_queue_size`;
//! 2. validation of the input and its grouping identifiers;
//! 3. a fresh `completed` row for the cache key is a cache hit;
//! 4. a `queued`/`processing` row for the cache key is a dedup hit;
//! 5. otherwise a new task is persisted and handed to the [`Scheduler`].
//!
//! Steps 3 to 5 are not atomic. The store's partial unique index on in-flight
//! cache keys turns a lost race in step 5 into a unique violation, which is
//! answered by repeating the lookups.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigProvider, Settings};
use crate::error::CoreError;
use crate::layout::{is_safe_segment, CacheLayout};
use crate::params::{cache_key, content_hash, OutputFormat, ParamOverrides, UpscaleParams};
use crate::runner::{ProcessExecutor, Upscaler};
use crate::runtime::{Scheduler, SchedulerStats};
use crate::store::{is_unique_violation, TaskStore};
use crate::task::{NewTask, TaskRecord, TaskStatus};

const FILE_UID_LEN: usize = 16;
const MAX_CREATE_ATTEMPTS: usize = 3;
const MISSING_INPUT_ERROR: &str = "input file missing after restart";

/// Reply to a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub task_id: String,
    pub file_uid: String,
    pub status: TaskStatus,
    /// `true` for cache hits and dedup hits; `false` when new work was queued.
    pub cached: bool,
    pub download_url: String,
    /// Set on cache hits only.
    pub file_path: Option<PathBuf>,
    /// Set on cache hits only.
    pub format: Option<OutputFormat>,
}

/// A task row plus, when completed, its output bytes.
#[derive(Debug, Clone)]
pub struct DownloadPayload {
    pub task: TaskRecord,
    pub bytes: Option<Bytes>,
    pub file_path: Option<PathBuf>,
}

/// Outcome of [`Coordinator::fetch_result`].
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    NotFound,
    StillWorking(TaskStatus),
    Failed(String),
    Ready { bytes: Bytes, format: OutputFormat },
}

/// Locator clients use to retrieve a task's result.
pub fn download_url(task_id: &str) -> String {
    format!("/api/download/{task_id}")
}

pub struct Coordinator<S: TaskStore> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    store: S,
    scheduler: Scheduler,
    upscaler: Upscaler,
    config: Arc<dyn ConfigProvider>,
    layout: CacheLayout,
}

impl<S: TaskStore> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: TaskStore> std::fmt::Debug for Coordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("scheduler", &self.inner.scheduler)
            .field("layout", &self.inner.layout)
            .finish_non_exhaustive()
    }
}

/// Where an execution attempt left its task row.
enum Attempt {
    /// The row reached `completed` or `failed`.
    Settled(Result<(), CoreError>),
    /// The row is still in flight with no execution behind it.
    Stranded(CoreError),
}

enum CreateOutcome {
    Created(SubmitOutcome),
    /// Another submission claimed the cache key first.
    Duplicate(sqlx::Error),
}

impl<S: TaskStore> Coordinator<S> {
    pub fn new(
        store: S,
        config: Arc<dyn ConfigProvider>,
        executor: Arc<dyn ProcessExecutor>,
        layout: CacheLayout,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                scheduler: Scheduler::new(Arc::clone(&config)),
                upscaler: Upscaler::new(Arc::clone(&config), executor),
                config,
                layout,
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.inner.layout
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    // ── submission ───────────────────────────────────────────────────────────

    pub async fn submit(
        &self,
        buffer: Bytes,
        source_key: &str,
        cid: &str,
        overrides: &ParamOverrides,
    ) -> Result<SubmitOutcome, CoreError> {
        let settings = self.inner.config.settings();

        let stats = self.inner.scheduler.stats();
        let capacity = settings.scheduler.effective_max_queue_size();
        if stats.total() >= capacity {
            warn!(
                pending = stats.pending,
                active = stats.active,
                capacity,
                "submission rejected: queue full"
            );
            return Err(CoreError::QueueFull { capacity });
        }

        validate(&settings, &buffer, source_key, cid)?;

        let params = UpscaleParams::resolve(&settings.upscaler, overrides);
        let image_hash = content_hash(&buffer);
        let key = cache_key(&image_hash, &params);

        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(hit) = self.lookup_completed(&key, &settings).await? {
                return Ok(hit);
            }
            if let Some(hit) = self.lookup_in_flight(&key).await? {
                return Ok(hit);
            }

            let task = NewTask {
                task_id: Uuid::new_v4().to_string(),
                file_uid: new_file_uid(),
                cache_key: key.clone(),
                source_key: source_key.to_owned(),
                cid: cid.to_owned(),
                image_hash: image_hash.clone(),
                params: params.clone(),
                input_path: PathBuf::new(),
            };
            match self.create(task, &buffer).await? {
                CreateOutcome::Created(outcome) => return Ok(outcome),
                CreateOutcome::Duplicate(e) if attempt >= MAX_CREATE_ATTEMPTS => {
                    return Err(e.into());
                }
                CreateOutcome::Duplicate(_) => {
                    debug!(cache_key = %key, attempt, "lost creation race, repeating lookup");
                }
            }
        }
    }

    /// Cache hit for `key`, if a fresh completed row with an existing output
    /// file is on record. Stale file references are purged.
    async fn lookup_completed(
        &self,
        key: &str,
        settings: &Settings,
    ) -> Result<Option<SubmitOutcome>, CoreError> {
        let Some(task) = self.inner.store.find_completed(key).await? else {
            return Ok(None);
        };

        let ttl = settings.cache.ttl_seconds;
        if ttl > 0 {
            let age = (Utc::now() - task.updated_at).to_std().unwrap_or_default();
            if age > Duration::from_secs(ttl) {
                debug!(
                    task_id = %task.short_id(),
                    age_secs = age.as_secs(),
                    ttl,
                    "cached result expired"
                );
                return Ok(None);
            }
        }

        let Some(output) = task.output_path.clone() else {
            warn!(task_id = %task.short_id(), "completed task has no output path; purging");
            self.inner.store.delete_task(&task.task_id).await?;
            return Ok(None);
        };
        if !file_exists(&output).await {
            warn!(
                task_id = %task.short_id(),
                path = %output.display(),
                "cached output missing; purging record"
            );
            self.inner.store.delete_task(&task.task_id).await?;
            return Ok(None);
        }

        debug!(task_id = %task.short_id(), cache_key = %key, "cache hit");
        Ok(Some(SubmitOutcome {
            download_url: download_url(&task.task_id),
            task_id: task.task_id,
            file_uid: task.file_uid,
            status: TaskStatus::Completed,
            cached: true,
            file_path: Some(output),
            format: Some(task.format),
        }))
    }

    async fn lookup_in_flight(&self, key: &str) -> Result<Option<SubmitOutcome>, CoreError> {
        let Some(task) = self.inner.store.find_in_flight(key).await? else {
            return Ok(None);
        };
        debug!(task_id = %task.short_id(), cache_key = %key, "joined in-flight task");
        Ok(Some(SubmitOutcome {
            download_url: download_url(&task.task_id),
            task_id: task.task_id,
            file_uid: task.file_uid,
            status: TaskStatus::Queued,
            cached: true,
            file_path: None,
            format: None,
        }))
    }

    async fn create(&self, mut task: NewTask, buffer: &[u8]) -> Result<CreateOutcome, CoreError> {
        let input_path = self.inner.layout.input_path(&task.task_id);
        if let Some(parent) = input_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&input_path, buffer).await?;
        task.input_path = input_path.clone();

        let record = match self.inner.store.insert_task(task).await {
            Ok(record) => record,
            Err(e) => {
                remove_file_logged(&input_path).await;
                if is_unique_violation(&e) {
                    return Ok(CreateOutcome::Duplicate(e));
                }
                return Err(e.into());
            }
        };

        info!(
            task_id = %record.short_id(),
            source_key = %record.source_key,
            cid = %record.cid,
            size = buffer.len(),
            "task queued"
        );
        let outcome = SubmitOutcome {
            download_url: download_url(&record.task_id),
            task_id: record.task_id.clone(),
            file_uid: record.file_uid.clone(),
            status: TaskStatus::Queued,
            cached: false,
            file_path: None,
            format: None,
        };
        self.schedule(record);
        Ok(CreateOutcome::Created(outcome))
    }

    // ── execution ────────────────────────────────────────────────────────────

    fn schedule(&self, task: TaskRecord) {
        let this = self.clone();
        let label = format!("upscale:{}", task.short_id());
        self.inner
            .scheduler
            .add(label, async move { this.execute(task).await });
    }

    /// Job body.
    ///
    /// The attempt runs in its own task so a panic is observed here rather
    /// than unwinding through the scheduler. The temp input is removed only
    /// once the row is terminal. An attempt that is cancelled (runtime
    /// shutdown) or cannot record its outcome keeps the input, and
    /// [`Coordinator::resume_pending_tasks`] re-runs it on the next start.
    async fn execute(&self, task: TaskRecord) -> Result<(), CoreError> {
        let this = self.clone();
        let attempt = task.clone();
        let joined = tokio::spawn(async move { this.process(&attempt).await }).await;

        let settled = match joined {
            Ok(settled) => settled,
            Err(e) if e.is_panic() => {
                let output = self.output_path(&task);
                self.fail(&task, Some(&output), CoreError::JobPanicked).await
            }
            Err(_) => {
                debug!(task_id = %task.short_id(), "task attempt cancelled; input kept");
                return Ok(());
            }
        };

        match settled {
            Attempt::Settled(result) => {
                remove_file_logged(&task.input_path).await;
                debug!(path = %task.input_path.display(), "temp input removed");
                result
            }
            Attempt::Stranded(e) => {
                warn!(
                    task_id = %task.short_id(),
                    path = %task.input_path.display(),
                    "task outcome not recorded; input kept for recovery"
                );
                Err(e)
            }
        }
    }

    async fn process(&self, task: &TaskRecord) -> Attempt {
        if let Err(e) = self.inner.store.mark_processing(&task.task_id).await {
            return self.fail(task, None, e.into()).await;
        }
        debug!(task_id = %task.short_id(), "task processing");

        let timeout_ms = self.inner.config.settings().scheduler.task_timeout_ms;
        let output = self.output_path(task);

        match self
            .inner
            .upscaler
            .run(&task.task_id, &task.input_path, &output, &task.params, timeout_ms)
            .await
        {
            Ok(done) => match self
                .inner
                .store
                .mark_completed(&task.task_id, &output, done.file_size)
                .await
            {
                Ok(()) => {
                    debug!(task_id = %task.short_id(), file_size = done.file_size, "task completed");
                    Attempt::Settled(Ok(()))
                }
                Err(e) => self.fail(task, Some(&output), e.into()).await,
            },
            Err(e) => {
                if e.is_timeout() {
                    warn!(task_id = %task.short_id(), timeout_ms, "task timed out");
                }
                self.fail(task, Some(&output), e.into()).await
            }
        }
    }

    /// Record `err` on the row and discard any output of the attempt.
    async fn fail(&self, task: &TaskRecord, output: Option<&Path>, err: CoreError) -> Attempt {
        // Output of a failed attempt is never served.
        if let Some(output) = output {
            if file_exists(output).await {
                remove_file_logged(output).await;
            }
        }
        match self.inner.store.mark_failed(&task.task_id, &err.to_string()).await {
            Ok(()) => Attempt::Settled(Err(err)),
            Err(db_err) => {
                error!(task_id = %task.short_id(), error = %db_err, "failed to record task failure");
                Attempt::Stranded(err)
            }
        }
    }

    fn output_path(&self, task: &TaskRecord) -> PathBuf {
        self.inner.layout.output_path(
            &task.source_key,
            &task.cid,
            &task.file_uid,
            task.params.format,
        )
    }

    // ── recovery ─────────────────────────────────────────────────────────────

    /// Re-queue every unfinished task found in the store. Call once at
    /// startup, before accepting submissions. Returns the number re-queued.
    pub async fn resume_pending_tasks(&self) -> Result<usize, CoreError> {
        let pending = self.inner.store.list_in_flight().await?;
        let mut resumed = 0;

        for mut task in pending {
            if task.status == TaskStatus::Processing {
                self.inner.store.requeue(&task.task_id).await?;
                task.status = TaskStatus::Queued;
                task.started_at = None;
            }

            if !file_exists(&task.input_path).await {
                warn!(
                    task_id = %task.short_id(),
                    path = %task.input_path.display(),
                    "input missing for unfinished task; marking failed"
                );
                self.inner
                    .store
                    .mark_failed(&task.task_id, MISSING_INPUT_ERROR)
                    .await?;
                continue;
            }

            self.schedule(task);
            resumed += 1;
        }

        if resumed > 0 {
            info!(resumed, "resumed unfinished tasks");
        }
        Ok(resumed)
    }

    // ── retrieval ────────────────────────────────────────────────────────────

    /// `None` when the task is unknown, or was completed but its output has
    /// since disappeared (the record is purged in that case).
    pub async fn get_download_payload(
        &self,
        task_id: &str,
    ) -> Result<Option<DownloadPayload>, CoreError> {
        let Some(task) = self.inner.store.get_task(task_id).await? else {
            return Ok(None);
        };

        if task.status != TaskStatus::Completed {
            return Ok(Some(DownloadPayload {
                task,
                bytes: None,
                file_path: None,
            }));
        }

        let Some(path) = task.output_path.clone() else {
            self.purge(&task, "completed task has no output path").await?;
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(DownloadPayload {
                task,
                bytes: Some(Bytes::from(bytes)),
                file_path: Some(path),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.purge(&task, "cached output missing").await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn fetch_result(&self, task_id: &str) -> Result<FetchResult, CoreError> {
        let Some(payload) = self.get_download_payload(task_id).await? else {
            return Ok(FetchResult::NotFound);
        };
        Ok(match (payload.task.status, payload.bytes) {
            (TaskStatus::Completed, Some(bytes)) => FetchResult::Ready {
                bytes,
                format: payload.task.format,
            },
            (TaskStatus::Failed, _) => FetchResult::Failed(payload.task.error.unwrap_or_default()),
            (status, _) => FetchResult::StillWorking(status),
        })
    }

    async fn purge(&self, task: &TaskRecord, reason: &str) -> Result<(), CoreError> {
        warn!(task_id = %task.short_id(), reason, "purging stale task record");
        self.inner.store.delete_task(&task.task_id).await?;
        Ok(())
    }
}

fn validate(settings: &Settings, buffer: &[u8], source_key: &str, cid: &str) -> Result<(), CoreError> {
    if buffer.is_empty() {
        return Err(CoreError::Validation("input image is empty".into()));
    }
    let limit_mb = settings.api.max_input_size_mb;
    if limit_mb > 0 {
        let limit = limit_mb.saturating_mul(1024 * 1024);
        if u64::try_from(buffer.len()).unwrap_or(u64::MAX) > limit {
            return Err(CoreError::InputTooLarge {
                size: buffer.len(),
                limit_mb,
            });
        }
    }
    for (name, value) in [("sourceKey", source_key), ("cid", cid)] {
        if !is_safe_segment(value) {
            return Err(CoreError::Validation(format!(
                "{name} must be non-empty and contain only [A-Za-z0-9._-]"
            )));
        }
    }
    Ok(())
}

fn new_file_uid() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(FILE_UID_LEN)
        .map(char::from)
        .collect()
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn remove_file_logged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}
