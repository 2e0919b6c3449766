//! Runs the DevContainer CLI against the shared build daemon.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::BuildError;
use crate::build_log::BuildLog;
use crate::config::OrchestratorConfig;

/// Lines of tool output quoted in a failure message.
const ERROR_TAIL_LINES: usize = 5;

/// How long output pipes may stay open after the tool exits. Background
/// processes the tool left behind can hold them open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything an executor needs to build one instance image.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub instance_id: String,
    pub workspace_folder: PathBuf,
    pub config_path: PathBuf,
    /// Tag to build and push, e.g. `localhost:32000/vscode-devcontainer-<id>:latest`.
    pub image_name: String,
}

/// Builds and pushes an image. Implementations stream output into `log`
/// and must stop promptly once `cancel` fires.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Returns the pushed image reference.
    async fn run(
        &self,
        context: &BuildContext,
        log: &BuildLog,
        cancel: CancellationToken,
    ) -> Result<String, BuildError>;
}

#[derive(Debug, Clone)]
pub struct DevcontainerCliExecutor {
    devcontainer_bin: String,
    docker_bin: String,
    build_daemon: String,
    build_timeout: Duration,
    push_timeout: Duration,
    kill_grace: Duration,
}

struct ToolOutput {
    stdout: Vec<String>,
}

#[derive(Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

impl DevcontainerCliExecutor {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            devcontainer_bin: config.devcontainer_bin.clone(),
            docker_bin: config.docker_bin.clone(),
            build_daemon: config.build_daemon.clone(),
            build_timeout: config.build_timeout(),
            push_timeout: config.push_timeout(),
            kill_grace: config.build_kill_grace(),
        }
    }

    fn build_args(&self, context: &BuildContext) -> Vec<String> {
        vec![
            "build".to_string(),
            "--workspace-folder".to_string(),
            context.workspace_folder.display().to_string(),
            "--config".to_string(),
            context.config_path.display().to_string(),
            "--image-name".to_string(),
            context.image_name.clone(),
            "--no-cache".to_string(),
        ]
    }

    /// Run one tool to completion, streaming both output pipes into `log`.
    async fn run_tool(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        log: &BuildLog,
        cancel: &CancellationToken,
        limit: Duration,
    ) -> Result<ToolOutput, BuildError> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .env("DOCKER_HOST", &self.build_daemon)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so cancellation reaches every descendant
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(program, ?args, "spawning build tool");
        let mut child = cmd.spawn().map_err(|source| BuildError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let stdout_pump = OutputPump::spawn(child.stdout.take(), log.clone());
        let stderr_pump = OutputPump::spawn(child.stderr.take(), log.clone());

        let status = tokio::select! {
            () = cancel.cancelled() => {
                warn!(program, "cancelling build tool");
                self.terminate(&mut child).await;
                stdout_pump.abort();
                stderr_pump.abort();
                log.append(format!("{program} cancelled")).await;
                return Err(BuildError::Cancelled);
            }
            result = timeout(limit, child.wait()) => {
                match result {
                    Ok(Ok(status)) => status,
                    Ok(Err(e)) => return Err(BuildError::Io(e)),
                    Err(_) => {
                        warn!(program, limit_secs = limit.as_secs(), "build tool timed out");
                        self.terminate(&mut child).await;
                        stdout_pump.abort();
                        stderr_pump.abort();
                        log.append(format!("{program} timed out after {}s", limit.as_secs())).await;
                        return Err(BuildError::Timeout(limit));
                    }
                }
            }
        };

        let stdout = stdout_pump.finish(program).await;
        let stderr = stderr_pump.finish(program).await;

        if !status.success() {
            let source = if stderr.is_empty() { &stdout } else { &stderr };
            let tail_start = source.len().saturating_sub(ERROR_TAIL_LINES);
            return Err(BuildError::ToolFailed {
                program: program.to_string(),
                code: status.code().unwrap_or(-1),
                message: source[tail_start..].join("\n"),
            });
        }

        Ok(ToolOutput { stdout })
    }

    /// SIGTERM the process group, then SIGKILL once the grace period is up.
    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            // Already reaped
            return;
        };

        signal_group(pid, GroupSignal::Terminate);
        match timeout(self.kill_grace, child.wait()).await {
            Ok(_) => debug!(pid, "build tool exited after SIGTERM"),
            Err(_) => warn!(
                pid,
                grace_secs = self.kill_grace.as_secs(),
                "build tool ignored SIGTERM, sending SIGKILL"
            ),
        }
        // Leftover group members (daemon clients, shells) go too
        signal_group(pid, GroupSignal::Kill);
        child.kill().await.ok();
    }
}

#[async_trait]
impl BuildExecutor for DevcontainerCliExecutor {
    #[instrument(skip(self, context, log, cancel), fields(instance_id = %context.instance_id))]
    async fn run(
        &self,
        context: &BuildContext,
        log: &BuildLog,
        cancel: CancellationToken,
    ) -> Result<String, BuildError> {
        info!(image = %context.image_name, "starting devcontainer build");
        let start = Instant::now();

        let args = self.build_args(context);
        log.append(format!("$ {} {}", self.devcontainer_bin, args.join(" ")))
            .await;
        let output = self
            .run_tool(
                &self.devcontainer_bin,
                &args,
                &context.workspace_folder,
                log,
                &cancel,
                self.build_timeout,
            )
            .await?;

        let image =
            parse_built_image(&output.stdout).unwrap_or_else(|| context.image_name.clone());

        let push_args = vec!["push".to_string(), image.clone()];
        log.append(format!("$ {} push {image}", self.docker_bin)).await;
        self.run_tool(
            &self.docker_bin,
            &push_args,
            &context.workspace_folder,
            log,
            &cancel,
            self.push_timeout,
        )
        .await
        .map_err(|e| match e {
            BuildError::ToolFailed { message, .. } => BuildError::PushFailed {
                image: image.clone(),
                message,
            },
            other => other,
        })?;

        log.append(format!("pushed {image}")).await;
        info!(
            image = %image,
            duration_secs = start.elapsed().as_secs_f32(),
            "devcontainer build complete"
        );
        Ok(image)
    }
}

/// Copies one output pipe into the build log, keeping the lines it read.
struct OutputPump {
    lines: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl OutputPump {
    fn spawn<R>(reader: Option<R>, log: BuildLog) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let collected = lines.clone();
        let task = tokio::spawn(async move {
            let Some(reader) = reader else {
                return;
            };
            let mut reader_lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = reader_lines.next_line().await {
                log.append(&line).await;
                collected
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(line);
            }
        });
        Self { lines, task }
    }

    fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the pipe to close, up to [`OUTPUT_DRAIN_TIMEOUT`], and
    /// return everything read.
    async fn finish(mut self, program: &str) -> Vec<String> {
        if timeout(OUTPUT_DRAIN_TIMEOUT, &mut self.task).await.is_err() {
            warn!(program, "output pipe still open after exit, no longer reading it");
            self.task.abort();
        }
        let mut lines = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *lines)
    }
}

/// The devcontainer CLI ends with a JSON outcome line such as
/// `{"outcome":"success","imageName":["registry/image:tag"]}`.
pub fn parse_built_image(stdout: &[String]) -> Option<String> {
    stdout.iter().rev().find_map(|line| {
        let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
        if value.get("outcome")?.as_str()? != "success" {
            return None;
        }
        match value.get("imageName")? {
            serde_json::Value::String(name) => Some(name.clone()),
            serde_json::Value::Array(names) => names.first()?.as_str().map(str::to_string),
            _ => None,
        }
    })
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        debug!(pid, ?signal, error = %e, "killpg failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_image_from_outcome_line() {
        let stdout = lines(&[
            "[1 ms] @devcontainers/cli 0.71.0",
            r#"{"outcome":"success","imageName":["localhost:32000/vscode-devcontainer-a-1:latest"]}"#,
        ]);
        assert_eq!(
            parse_built_image(&stdout).as_deref(),
            Some("localhost:32000/vscode-devcontainer-a-1:latest")
        );
    }

    #[test]
    fn test_parse_image_accepts_plain_string() {
        let stdout = lines(&[r#"{"outcome":"success","imageName":"img:1"}"#]);
        assert_eq!(parse_built_image(&stdout).as_deref(), Some("img:1"));
    }

    #[test]
    fn test_parse_image_ignores_errors_and_noise() {
        let stdout = lines(&[
            "Step 1/4 : FROM ubuntu",
            r#"{"outcome":"error","message":"boom"}"#,
        ]);
        assert_eq!(parse_built_image(&stdout), None);
        assert_eq!(parse_built_image(&[]), None);
    }

    #[test]
    fn test_build_args() {
        let executor = DevcontainerCliExecutor::new(&OrchestratorConfig::default());
        let context = BuildContext {
            instance_id: "a-1".to_string(),
            workspace_folder: PathBuf::from("/tmp/ctx"),
            config_path: PathBuf::from("/tmp/ctx/.devcontainer/devcontainer.json"),
            image_name: "localhost:32000/vscode-devcontainer-a-1:latest".to_string(),
        };
        let args = executor.build_args(&context);
        assert_eq!(args[0], "build");
        assert!(args.windows(2).any(|w| w == ["--workspace-folder", "/tmp/ctx"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--image-name", "localhost:32000/vscode-devcontainer-a-1:latest"]));
        assert_eq!(args.last().map(String::as_str), Some("--no-cache"));
    }
}
