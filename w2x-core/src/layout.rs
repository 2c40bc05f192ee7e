use std::path::{Path, PathBuf};

use crate::config::CacheSettings;
use crate::params::OutputFormat;

/// Filesystem layout for cached outputs and temporary inputs.
///
/// Outputs: `<cache_dir>/<source_key>/<cid>/<file_uid>.<format>`.
/// Inputs:  `<temp_dir>/<task_id>.bin`.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    cache_root: PathBuf,
    temp_root: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_root: impl Into<PathBuf>, temp_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            temp_root: temp_root.into(),
        }
    }

    pub fn from_settings(cache: &CacheSettings) -> Self {
        Self::new(&cache.cache_dir, &cache.temp_dir)
    }

    /// Create both roots if they do not exist yet.
    pub async fn init(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.cache_root).await?;
        tokio::fs::create_dir_all(&self.temp_root).await
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn input_path(&self, task_id: &str) -> PathBuf {
        self.temp_root.join(format!("{task_id}.bin"))
    }

    pub fn output_path(
        &self,
        source_key: &str,
        cid: &str,
        file_uid: &str,
        format: OutputFormat,
    ) -> PathBuf {
        self.cache_root
            .join(source_key)
            .join(cid)
            .join(format!("{file_uid}.{}", format.extension()))
    }
}

/// Whether `segment` is safe to use as a single path component.
pub fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
