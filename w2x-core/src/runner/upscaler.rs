use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{ProcessExecutor, ProcessSpec, RunnerError};
use crate::config::ConfigProvider;
use crate::params::UpscaleParams;
use crate::task::short_id;

/// Stderr is logged up to this many characters; the error keeps all of it.
const STDERR_LOG_CHARS: usize = 512;

/// Result of a successful upscaler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpscaleOutput {
    pub file_size: u64,
    pub duration_ms: u64,
}

/// Runs the configured upscaler executable for one task.
#[derive(Clone)]
pub struct Upscaler {
    config: Arc<dyn ConfigProvider>,
    executor: Arc<dyn ProcessExecutor>,
}

impl std::fmt::Debug for Upscaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upscaler").finish_non_exhaustive()
    }
}

impl Upscaler {
    pub fn new(config: Arc<dyn ConfigProvider>, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { config, executor }
    }

    /// Argument list in the fixed order the upscaler expects.
    pub fn build_args(input: &Path, output: &Path, params: &UpscaleParams) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-i".into(),
            input.into(),
            "-o".into(),
            output.into(),
            "-n".into(),
            params.noise.to_string().into(),
            "-s".into(),
            params.scale.to_string().into(),
            "-t".into(),
            params.tile.clone().into(),
            "-m".into(),
            params.model.clone().into(),
            "-g".into(),
            params.gpu.clone().into(),
            "-j".into(),
            params.threads.clone().into(),
            "-f".into(),
            params.format.extension().into(),
        ];
        if params.tta {
            args.push("-x".into());
        }
        args
    }

    /// Upscale `input` into `output`.
    ///
    /// A `timeout_ms` of `0` disables the timeout. Success requires exit code
    /// `0` and a file at `output`; after a timeout `output` is never inspected.
    pub async fn run(
        &self,
        task_id: &str,
        input: &Path,
        output: &Path,
        params: &UpscaleParams,
        timeout_ms: u64,
    ) -> Result<UpscaleOutput, RunnerError> {
        let program = self
            .config
            .settings()
            .upscaler
            .path
            .clone()
            .ok_or(RunnerError::NotConfigured)?;

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let spec = ProcessSpec {
            program,
            args: Self::build_args(input, output, params),
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        };

        info!(
            task_id = %short_id(task_id),
            scale = params.scale,
            noise = params.noise,
            format = %params.format,
            model = %params.model,
            "upscaler started"
        );

        let out = match self.executor.execute(spec).await {
            Ok(out) => out,
            Err(e) => {
                warn!(task_id = %short_id(task_id), error = %e, "upscaler did not complete");
                return Err(e);
            }
        };

        if !out.stdout.trim().is_empty() {
            debug!(task_id = %short_id(task_id), stdout = %out.stdout.trim(), "upscaler stdout");
        }

        if !out.success() {
            let excerpt: String = out.stderr.chars().take(STDERR_LOG_CHARS).collect();
            warn!(
                task_id = %short_id(task_id),
                code = ?out.exit_code,
                stderr = %excerpt,
                "upscaler exited with failure"
            );
            return Err(RunnerError::Exit {
                code: out.exit_code,
                stderr: out.stderr,
            });
        }

        let file_size = match tokio::fs::metadata(output).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(RunnerError::MissingOutput {
                    path: output.to_path_buf(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RunnerError::MissingOutput {
                    path: output.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            task_id = %short_id(task_id),
            duration_ms = out.duration_ms,
            file_size,
            "upscaler finished"
        );
        Ok(UpscaleOutput {
            file_size,
            duration_ms: out.duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tracing_test::traced_test;

    use super::*;
    use crate::config::{SharedConfig, UpscalerSettings};
    use crate::params::{OutputFormat, ParamOverrides};
    use crate::runner::ProcessOutput;

    /// Records the `ProcessSpec` and replays a canned result, optionally writing the
    /// `-o` target first.
    struct ScriptedExecutor {
        seen: Mutex<Vec<ProcessSpec>>,
        exit_code: Option<i32>,
        stderr: String,
        write_output: bool,
    }

    impl ScriptedExecutor {
        fn new(exit_code: Option<i32>, stderr: &str, write_output: bool) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                exit_code,
                stderr: stderr.to_owned(),
                write_output,
            })
        }
    }

    #[async_trait]
    impl ProcessExecutor for ScriptedExecutor {
        async fn execute(&self, spec: ProcessSpec) -> Result<ProcessOutput, RunnerError> {
            if self.write_output {
                let pos = spec.args.iter().position(|a| a == "-o").expect("-o flag");
                tokio::fs::write(PathBuf::from(&spec.args[pos + 1]), b"upscaled").await?;
            }
            self.seen.lock().unwrap().push(spec);
            Ok(ProcessOutput {
                exit_code: self.exit_code,
                stderr: self.stderr.clone(),
                ..Default::default()
            })
        }
    }

    fn params(tta: bool) -> UpscaleParams {
        UpscaleParams::resolve(
            &UpscalerSettings::default(),
            &ParamOverrides {
                tta: Some(tta),
                format: Some("png".into()),
                ..Default::default()
            },
        )
    }

    fn configured() -> Arc<SharedConfig> {
        let config = SharedConfig::default();
        config.update(|s| s.upscaler.path = Some(PathBuf::from("/opt/waifu2x")));
        Arc::new(config)
    }

    #[test]
    fn args_follow_fixed_order() {
        let args = Upscaler::build_args(Path::new("in.bin"), Path::new("out.png"), &params(false));
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "-i", "in.bin", "-o", "out.png", "-n", "1", "-s", "2", "-t", "256", "-m",
                "models-cunet", "-g", "0", "-j", "2:2:2", "-f", "png",
            ]
        );
    }

    #[test]
    fn tta_flag_is_appended_last() {
        let args = Upscaler::build_args(Path::new("a"), Path::new("b"), &params(true));
        assert_eq!(args.last().map(|a| a.to_string_lossy().into_owned()).as_deref(), Some("-x"));
    }

    #[tokio::test]
    async fn success_reports_output_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(Some(0), "", true);
        let upscaler = Upscaler::new(configured(), executor.clone());
        let output = dir.path().join("src/1/uid.png");

        let result = upscaler
            .run("task-1", Path::new("in.bin"), &output, &params(false), 1000)
            .await
            .expect("run succeeds");
        assert_eq!(result.file_size, b"upscaled".len() as u64);

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].program, PathBuf::from("/opt/waifu2x"));
        assert_eq!(seen[0].timeout, Some(Duration::from_millis(1000)));
    }

    #[tokio::test]
    async fn zero_timeout_disables_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(Some(0), "", true);
        let upscaler = Upscaler::new(configured(), executor.clone());

        upscaler
            .run("t", Path::new("in"), &dir.path().join("o.png"), &params(false), 0)
            .await
            .expect("run succeeds");
        assert_eq!(executor.seen.lock().unwrap()[0].timeout, None);
    }

    #[tokio::test]
    #[traced_test]
    async fn non_zero_exit_keeps_full_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let long_stderr = "e".repeat(2000);
        let upscaler = Upscaler::new(configured(), ScriptedExecutor::new(Some(1), &long_stderr, false));

        let err = upscaler
            .run("t", Path::new("in"), &dir.path().join("o.png"), &params(false), 0)
            .await
            .unwrap_err();
        match err {
            RunnerError::Exit { code, stderr } => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr.len(), 2000);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(logs_contain("upscaler exited with failure"));
    }

    #[tokio::test]
    async fn exit_zero_without_output_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let upscaler = Upscaler::new(configured(), ScriptedExecutor::new(Some(0), "", false));

        let err = upscaler
            .run("t", Path::new("in"), &dir.path().join("o.png"), &params(false), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::MissingOutput { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn unconfigured_path_is_rejected_before_spawn() {
        let executor = ScriptedExecutor::new(Some(0), "", true);
        let upscaler = Upscaler::new(Arc::new(SharedConfig::default()), executor.clone());

        let err = upscaler
            .run("t", Path::new("in"), Path::new("out.png"), &params(false), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotConfigured));
        assert!(executor.seen.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_executable_receives_arguments() {
        use std::os::unix::fs::PermissionsExt;

        use crate::runner::TokioProcessExecutor;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-upscaler.sh");
        // Copies the -i file to the -o path.
        std::fs::write(
            &script,
            "#!/bin/sh\nwhile [ $# -gt 0 ]; do case \"$1\" in -i) in=\"$2\"; shift;; -o) out=\"$2\"; shift;; esac; shift; done\ncp \"$in\" \"$out\"\n",
        )
        .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let input = dir.path().join("in.bin");
        std::fs::write(&input, b"pixels").expect("write input");
        let output = dir.path().join("out/result.png");

        let config = SharedConfig::default();
        config.update(|s| {
            s.upscaler.path = Some(script.clone());
            s.upscaler.format = OutputFormat::Png;
        });
        let upscaler = Upscaler::new(Arc::new(config), Arc::new(TokioProcessExecutor));

        let result = upscaler
            .run("t", &input, &output, &params(false), 5000)
            .await
            .expect("fake upscaler succeeds");
        assert_eq!(result.file_size, 6);
        assert_eq!(std::fs::read(&output).expect("output"), b"pixels");
    }
}
