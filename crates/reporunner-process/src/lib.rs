//! Async process execution for the pipeline's command-execution interfaces:
//! the version-control CLI, the image-build CLI, and the cluster CLI (§6).
//!
//! All spawn helpers are async and carry the caller's cancellation signal
//! via `tokio::time::timeout`. Streaming helpers read stdout and stderr on
//! two parallel reader tasks, matching the design note that both must drain
//! before the exit code is trusted.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Result of a captured (non-streaming) command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn ok(&self) -> Result<&Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(
                "command failed with exit code {:?}: {}",
                self.exit_code,
                self.stderr
            ))
        }
    }
}

/// Result of a streamed command execution. Output lines were delivered to
/// the caller's callback as they arrived; this only carries the exit
/// bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

fn build_command(program: &str, args: &[&str], dir: &Path, env: &[(String, String)]) -> Command {
    let mut command = Command::new(program);
    command.args(args).current_dir(dir);
    for (k, v) in env {
        command.env(k, v);
    }
    command
}

/// Run a command to completion, capturing its full output. Used for
/// one-shot commands (namespace create, endpoint create, image-load) whose
/// output doesn't need real-time streaming.
pub async fn run_captured(
    program: &str,
    args: &[&str],
    dir: &Path,
    env: &[(String, String)],
    timeout: Option<Duration>,
) -> Result<CommandResult> {
    let start = Instant::now();
    let mut command = build_command(program, args, dir, env);
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {program}"))?;

    let output_fut = child.wait_with_output();
    let output = match timeout {
        Some(dur) => tokio::time::timeout(dur, output_fut)
            .await
            .with_context(|| format!("command timed out: {program} {args:?}"))??,
        None => output_fut.await?,
    };

    Ok(CommandResult {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Run a command, streaming stdout and stderr line-by-line to `on_line` from
/// two parallel reader tasks as the process runs. Both readers drain fully
/// before the exit status (or timeout) is resolved.
pub async fn run_streaming<F>(
    program: &str,
    args: &[&str],
    dir: &Path,
    env: &[(String, String)],
    timeout: Option<Duration>,
    on_line: F,
) -> Result<CommandOutput>
where
    F: Fn(StreamKind, &str) + Send + Sync + 'static,
{
    let start = Instant::now();
    let mut command = build_command(program, args, dir, env);
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child: Child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {program}"))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let on_line = Arc::new(on_line);

    let stdout_cb = on_line.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            stdout_cb(StreamKind::Stdout, &line);
        }
    });

    let stderr_cb = on_line.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            stderr_cb(StreamKind::Stderr, &line);
        }
    });

    let drain_and_wait = async {
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        child.wait().await
    };

    let (status, timed_out) = match timeout {
        Some(dur) => match tokio::time::timeout(dur, drain_and_wait).await {
            Ok(status) => (status.context("waiting for child process")?, false),
            Err(_) => {
                let _ = child.start_kill();
                let status = child.wait().await.context("waiting for killed child")?;
                (status, true)
            }
        },
        None => (drain_and_wait.await.context("waiting for child process")?, false),
    };

    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        timed_out,
        duration: start.elapsed(),
    })
}

/// Spawn a long-running child without waiting for it — used for port-forward
/// handles, which live for the duration of a tenant's exposure.
pub fn spawn_long_running(
    program: &str,
    args: &[&str],
    dir: &Path,
    env: &[(String, String)],
) -> Result<Child> {
    let mut command = build_command(program, args, dir, env);
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn long-running command: {program}"))
}

/// Check if a command exists in PATH.
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Get the full path to a command.
pub fn which(program: &str) -> Option<std::path::PathBuf> {
    which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captured_success() {
        let result = run_captured("echo", &["hello"], Path::new("."), &[], None)
            .await
            .expect("run");
        assert!(result.success);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn run_captured_failure() {
        let result = run_captured("sh", &["-c", "exit 1"], Path::new("."), &[], None)
            .await
            .expect("run");
        assert!(!result.success);
        assert!(result.ok().is_err());
    }

    #[tokio::test]
    async fn run_streaming_collects_lines_from_both_streams() {
        let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
        let collector = lines.clone();
        let output = run_streaming(
            "sh",
            &["-c", "echo out1; echo err1 1>&2; echo out2"],
            Path::new("."),
            &[],
            None,
            move |kind, line| {
                collector.lock().unwrap().push((kind, line.to_string()));
            },
        )
        .await
        .expect("run");

        assert!(output.success());
        let collected = lines.lock().unwrap();
        assert_eq!(collected.len(), 3);
        assert!(collected.iter().any(|(k, l)| *k == StreamKind::Stdout && l == "out1"));
        assert!(collected.iter().any(|(k, l)| *k == StreamKind::Stderr && l == "err1"));
    }

    #[tokio::test]
    async fn run_streaming_times_out_long_process() {
        let output = run_streaming(
            "sleep",
            &["5"],
            Path::new("."),
            &[],
            Some(Duration::from_millis(50)),
            |_, _| {},
        )
        .await
        .expect("run");
        assert!(output.timed_out);
    }

    #[test]
    fn command_exists_finds_sh() {
        assert!(command_exists("sh"));
    }

    #[test]
    fn command_exists_rejects_bogus() {
        assert!(!command_exists("this-command-does-not-exist-xyz123"));
    }
}
