//! Runtime tunables and the provider the core reads them through.
//!
//! The scheduler and coordinator never cache a [`Settings`] value: they call
//! [`ConfigProvider::settings`] at every decision point, so a reload through
//! [`SharedConfig::replace`] takes effect on the next submission. Only the
//! cache and temp roots are fixed when a [`crate::layout::CacheLayout`] is built.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio::sync::watch;

use crate::params::OutputFormat;

// ── Settings ─────────────────────────────────────────────────────────────────

/// Every tunable the core consumes. Every field has a default so an empty
/// (or missing) config file yields a working setup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scheduler: SchedulerSettings,
    pub cache: CacheSettings,
    pub upscaler: UpscalerSettings,
    pub api: ApiSettings,
}

/// Ordering policy for jobs waiting in the scheduler.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum QueueStrategy {
    #[default]
    Fifo,
    Lifo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Maximum number of jobs executing at once.
    pub concurrency: usize,
    pub strategy: QueueStrategy,
    /// Admission ceiling for `pending + active`.
    pub max_queue_size: usize,
    /// Hard limit for one upscaler run. `0` disables the timeout.
    pub task_timeout_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            strategy: QueueStrategy::Fifo,
            max_queue_size: 200,
            task_timeout_ms: 600_000,
        }
    }
}

impl SchedulerSettings {
    /// Concurrency clamped to at least one worker.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Queue ceiling; a zero value falls back to the default.
    pub fn effective_max_queue_size(&self) -> usize {
        if self.max_queue_size == 0 {
            SchedulerSettings::default().max_queue_size
        } else {
            self.max_queue_size
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Age (from `updated_at`) after which a completed result no longer
    /// satisfies new submissions. `0` means results never expire.
    pub ttl_seconds: u64,
    pub cache_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 0,
            cache_dir: PathBuf::from("cache"),
            temp_dir: PathBuf::from("uploads/runtime"),
        }
    }
}

/// Executable location plus the default parameter values merged under every
/// submission's overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscalerSettings {
    pub path: Option<PathBuf>,
    pub scale: u32,
    pub noise: i32,
    pub tile: String,
    pub model: String,
    pub gpu: String,
    pub threads: String,
    pub format: OutputFormat,
    pub tta: bool,
}

impl Default for UpscalerSettings {
    fn default() -> Self {
        Self {
            path: None,
            scale: 2,
            noise: 1,
            tile: "256".to_owned(),
            model: "models-cunet".to_owned(),
            gpu: "0".to_owned(),
            threads: "2:2:2".to_owned(),
            format: OutputFormat::Jpg,
            tta: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Largest accepted input. `0` disables the check.
    pub max_input_size_mb: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self { max_input_size_mb: 100 }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Settings {
    /// Parse settings from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ── Provider ─────────────────────────────────────────────────────────────────

/// Source of the current configuration snapshot.
pub trait ConfigProvider: Send + Sync + 'static {
    /// The snapshot in effect right now.
    fn settings(&self) -> Arc<Settings>;
}

/// Hot-swappable configuration backed by a `watch` channel.
///
/// Readers get the latest snapshot without blocking writers; subscribers
/// are woken on every [`Self::replace`].
#[derive(Debug)]
pub struct SharedConfig {
    tx: watch::Sender<Arc<Settings>>,
}

impl SharedConfig {
    pub fn new(settings: Settings) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(settings));
        Self { tx }
    }

    /// Swap in a new snapshot and notify subscribers.
    pub fn replace(&self, settings: Settings) {
        self.tx.send_replace(Arc::new(settings));
    }

    /// Apply an in-place edit to a copy of the current snapshot.
    pub fn update(&self, edit: impl FnOnce(&mut Settings)) {
        let mut next = (**self.tx.borrow()).clone();
        edit(&mut next);
        self.replace(next);
    }

    /// Receiver that observes every reload.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl ConfigProvider for SharedConfig {
    fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.tx.borrow())
    }
}
