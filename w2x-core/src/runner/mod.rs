//! Invocation of the external upscaler.
//!
//! [`ProcessExecutor`] is the narrow process-spawning seam: it runs one
//! [`ProcessSpec`] to completion (or kills it on timeout) and reports what
//! happened. [`Upscaler`] sits on top and owns everything specific to the
//! upscaler binary: argument order, exit-code interpretation, and output
//! verification.

mod process;
mod upscaler;

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use process::TokioProcessExecutor;
pub use upscaler::{UpscaleOutput, Upscaler};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upscaler timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Non-zero exit. `code` is `None` when the process was killed by a signal.
    #[error("upscaler exited with {}: {stderr}", exit_label(.code))]
    Exit { code: Option<i32>, stderr: String },

    #[error("upscaler exited successfully but produced no output at {}", .path.display())]
    MissingOutput { path: PathBuf },

    #[error("upscaler executable path is not configured")]
    NotConfigured,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunnerError::Timeout { .. })
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "signal".to_owned(),
    }
}

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// What a finished process left behind.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Spawns external processes.
///
/// Implementations must kill the process and return
/// [`RunnerError::Timeout`] once `spec.timeout` elapses, and return
/// [`RunnerError::Spawn`] when the program cannot be started.
#[async_trait]
pub trait ProcessExecutor: Send + Sync + 'static {
    async fn execute(&self, spec: ProcessSpec) -> Result<ProcessOutput, RunnerError>;
}
