//! Shell-based step execution on the host.

use crate::cancel::CancellationSignal;
use crate::runner::{
    OutputLine, OutputStream, StepContext, StepResult, StepRunner, Termination, expire,
};
use async_trait::async_trait;
use stagehand_core::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long output readers may keep going once the step has ended.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Shell runner for executing commands on the host.
///
/// Each step runs as the leader of its own process group, so cancellation
/// and timeouts reach every process the step started.
#[derive(Debug, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

fn stream_lines<R>(
    reader: R,
    job: String,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_num = 0u32;

        while let Ok(Some(line)) = lines.next_line().await {
            line_num += 1;
            let output = OutputLine {
                job: job.clone(),
                stream,
                content: line,
                line_number: line_num,
                timestamp: chrono::Utc::now(),
            };
            if tx.send(output).await.is_err() {
                break;
            }
        }
    })
}

/// SIGKILL every process left in the step's group.
#[cfg(unix)]
fn kill_group(job: &str, pgid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = pgid.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(job = %job, pgid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_job: &str, _pgid: Option<u32>) {}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
        mut cancel: CancellationSignal,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();

        info!(job = %ctx.job, command = %ctx.command, workspace = %ctx.workspace.display(), "Executing shell command");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&ctx.command)
            .current_dir(&ctx.workspace)
            .envs(&ctx.variables)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn process: {}", e)))?;
        let pgid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("Child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("Child stderr not captured".to_string()))?;

        let mut stdout_handle = stream_lines(stdout, ctx.job.clone(), OutputStream::Stdout, output_tx.clone());
        let mut stderr_handle = stream_lines(stderr, ctx.job.clone(), OutputStream::Stderr, output_tx);

        let mut terminated = None;
        let wait_result = tokio::select! {
            status = child.wait() => Some(status),
            _ = expire(ctx.timeout) => {
                warn!(job = %ctx.job, "Command timed out, killing process");
                terminated = Some(Termination::TimedOut);
                None
            }
            _ = cancel.cancelled() => {
                info!(job = %ctx.job, "Cancellation requested, killing process");
                terminated = Some(Termination::Cancelled);
                None
            }
        };

        if wait_result.is_none() {
            kill_group(&ctx.job, pgid);
            if let Err(e) = child.kill().await {
                warn!(job = %ctx.job, error = %e, "Failed to kill process");
            }
        }

        // Background processes may hold the pipes open after the shell exits
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            let _ = (&mut stdout_handle).await;
            let _ = (&mut stderr_handle).await;
        })
        .await
        .is_ok();
        if !drained {
            debug!(job = %ctx.job, "Output still open after the step ended, stopping its processes");
            kill_group(&ctx.job, pgid);
            stdout_handle.abort();
            stderr_handle.abort();
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        if let Some(reason) = terminated {
            return Ok(StepResult::terminated(reason, duration_ms));
        }

        let status = wait_result
            .ok_or_else(|| Error::Internal("Process neither exited nor was terminated".to_string()))?
            .map_err(|e| Error::Internal(format!("Failed to wait for process: {}", e)))?;
        let exit_code = status.code().unwrap_or(-1);

        debug!(job = %ctx.job, exit_code, duration_ms, "Command completed");
        Ok(StepResult::exited(exit_code, duration_ms))
    }

    fn name(&self) -> &'static str {
        "shell"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationHandle;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn make_ctx(cmd: &str, dir: &std::path::Path) -> StepContext {
        StepContext {
            job: "test".to_string(),
            workspace: dir.to_path_buf(),
            image: None,
            variables: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            command: cmd.to_string(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_shell_runner_success() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(100);

        let result = ShellRunner::new()
            .execute(&make_ctx("echo $GREETING", dir.path()), tx, CancellationSignal::never())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);

        let line = rx.recv().await.unwrap();
        assert_eq!(line.content, "hello");
        assert_eq!(line.job, "test");
    }

    #[tokio::test]
    async fn test_shell_runner_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(100);

        let result = ShellRunner::new()
            .execute(&make_ctx("exit 3", dir.path()), tx, CancellationSignal::never())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.terminated, None);
    }

    #[tokio::test]
    async fn test_shell_runner_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(100);
        let mut ctx = make_ctx("sleep 30", dir.path());
        ctx.timeout = Some(Duration::from_millis(100));

        let result = ShellRunner::new()
            .execute(&ctx, tx, CancellationSignal::never())
            .await
            .unwrap();
        assert_eq!(result.terminated, Some(Termination::TimedOut));
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_shell_runner_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(100);
        let handle = CancellationHandle::new();
        let signal = handle.signal();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });

        let start = std::time::Instant::now();
        let result = ShellRunner::new()
            .execute(&make_ctx("sleep 30", dir.path()), tx, signal)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(result.terminated, Some(Termination::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_stops_subshell_children() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(100);
        let handle = CancellationHandle::new();
        let signal = handle.signal();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.cancel();
        });

        let result = ShellRunner::new()
            .execute(&make_ctx("(sleep 1; touch late); true", dir.path()), tx, signal)
            .await
            .unwrap();
        canceller.await.unwrap();
        assert_eq!(result.terminated, Some(Termination::Cancelled));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late").exists());
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_step_open() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(100);
        let mut ctx = make_ctx("echo started; sleep 4 &", dir.path());
        ctx.timeout = Some(Duration::from_secs(1));

        let start = std::time::Instant::now();
        let result = ShellRunner::new()
            .execute(&ctx, tx, CancellationSignal::never())
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(result.success);
        assert_eq!(rx.recv().await.unwrap().content, "started");
    }
}
