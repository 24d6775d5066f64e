//! Helpers for running child processes with timeouts, bounded output and
//! cooperative cancellation.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Sentinel error for work abandoned because the job's token fired.
///
/// Carried inside `anyhow::Error`; use [`is_cancelled`] to detect it through
/// any number of context layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// True when `err` (or anything in its chain) is [`Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Turn timeouts and non-zero exits into errors labelled with `label`.
    pub fn ensure_success(self, label: &str) -> Result<Self> {
        if self.timed_out {
            return Err(anyhow!("{label} timed out"));
        }
        if !self.status.success() {
            return Err(anyhow!(
                "{label} failed ({}): {}",
                describe_status(&self.status),
                self.stderr_text().trim()
            ));
        }
        Ok(self)
    }
}

/// Bounds applied to one child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// Time between `SIGTERM` and `SIGKILL` when the child must be stopped.
    pub kill_grace: Duration,
}

/// Run a command to completion, honoring a timeout and a cancellation token.
///
/// Output is read concurrently while the child runs. A timeout stops the child
/// and returns the output with `timed_out = true`; cancellation stops the child
/// and returns [`Cancelled`].
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub async fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: RunLimits,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    if cancel.is_cancelled() {
        return Err(Cancelled.into());
    }
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).await.context("write stdin")?;
        drop(child_stdin);
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_capture = SharedCapture::default();
    let stderr_capture = SharedCapture::default();
    let mut stdout_handle =
        tokio::spawn(read_stream_limited(stdout, limit, stdout_capture.clone()));
    let mut stderr_handle =
        tokio::spawn(read_stream_limited(stderr, limit, stderr_capture.clone()));

    let mut timed_out = false;
    let status = tokio::select! {
        status = child.wait() => status.context("wait for command")?,
        _ = tokio::time::sleep(limits.timeout) => {
            warn!(timeout_secs = limits.timeout.as_secs(), "command timed out, stopping");
            timed_out = true;
            terminate(&mut child, limits.kill_grace).await?
        }
        _ = cancel.cancelled() => {
            debug!("command cancelled, stopping");
            terminate(&mut child, limits.kill_grace).await?;
            stdout_handle.abort();
            stderr_handle.abort();
            return Err(Cancelled.into());
        }
    };

    // The child is gone; anything still holding the pipes is a descendant it
    // left running. Give the readers `kill_grace` to see EOF, then keep what
    // they captured.
    tokio::select! {
        joined = async {
            join_output(&mut stdout_handle).await.context("join stdout")?;
            join_output(&mut stderr_handle).await.context("join stderr")
        } => joined?,
        _ = tokio::time::sleep(limits.kill_grace) => {
            warn!(
                grace_ms = limits.kill_grace.as_millis() as u64,
                "output pipes still open after exit, abandoning readers"
            );
            stdout_handle.abort();
            stderr_handle.abort();
        }
        _ = cancel.cancelled() => {
            stdout_handle.abort();
            stderr_handle.abort();
            return Err(Cancelled.into());
        }
    }
    let (stdout, stdout_truncated) = stdout_capture.take();
    let (stderr, stderr_truncated) = stderr_capture.take();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Stop a child: `SIGTERM`, wait up to `grace`, then `SIGKILL`.
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                    return status.context("wait after SIGTERM");
                }
                warn!(pid, grace_ms = grace.as_millis() as u64, "child ignored SIGTERM, killing");
            }
            Err(err) => debug!(pid, err = %err, "SIGTERM failed, killing"),
        }
    }
    child.kill().await.context("kill command")?;
    child.wait().await.context("wait after kill")
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Bytes read from one pipe, shared with its reader task so a reader that is
/// abandoned still leaves its output behind.
#[derive(Debug, Clone, Default)]
struct SharedCapture(Arc<Mutex<Captured>>);

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

impl SharedCapture {
    fn take(&self) -> (Vec<u8>, usize) {
        let mut captured = self.0.lock();
        (std::mem::take(&mut captured.bytes), captured.truncated)
    }
}

async fn join_output(handle: &mut JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader task panicked")),
    }
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    sink: SharedCapture,
) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            break;
        }
        let mut captured = sink.0.lock();
        let remaining = limit.saturating_sub(captured.bytes.len());
        let keep = n.min(remaining);
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(timeout_ms: u64) -> RunLimits {
        RunLimits {
            timeout: Duration::from_millis(timeout_ms),
            output_limit_bytes: 16,
            kill_grace: Duration::from_millis(200),
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_output_and_truncates_beyond_limit() {
        let token = CancellationToken::new();
        let out = run_command(sh("printf 'abcdefghijklmnopqrstuvwxyz'"), None, limits(5_000), &token)
            .await
            .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout, b"abcdefghijklmnop");
        assert_eq!(out.stdout_truncated, 10);
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let token = CancellationToken::new();
        let out = run_command(sh("cat"), Some(b"hello"), limits(5_000), &token)
            .await
            .expect("run");
        assert_eq!(out.stdout_text(), "hello");
    }

    #[tokio::test]
    async fn timeout_stops_child_and_marks_output() {
        let token = CancellationToken::new();
        let out = run_command(sh("exec sleep 5"), None, limits(100), &token)
            .await
            .expect("run");
        assert!(out.timed_out);
        let err = out.ensure_success("sleep").unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_returns_sentinel() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = run_command(sh("exec sleep 5"), None, limits(10_000), &token)
            .await
            .unwrap_err();
        assert!(is_cancelled(&err));
    }

    #[tokio::test]
    async fn already_cancelled_token_never_spawns() {
        let token = CancellationToken::new();
        token.cancel();
        let err = run_command(sh("exit 0"), None, limits(1_000), &token)
            .await
            .unwrap_err();
        assert!(is_cancelled(&err.context("outer layer")));
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let token = CancellationToken::new();
        let out = run_command(sh("echo boom >&2; exit 3"), None, limits(5_000), &token)
            .await
            .expect("run");
        let err = out.ensure_success("script").unwrap_err().to_string();
        assert!(err.contains("exit code 3"), "{err}");
        assert!(err.contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn lingering_descendant_does_not_hold_the_command() {
        let token = CancellationToken::new();
        let started = std::time::Instant::now();
        let out = run_command(sh("(sleep 4 &) ; echo hi"), None, limits(10_000), &token)
            .await
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert!(out.success());
        assert_eq!(out.stdout_text(), "hi\n");
    }

    #[tokio::test]
    async fn timeout_with_lingering_descendant_returns_promptly() {
        let token = CancellationToken::new();
        let started = std::time::Instant::now();
        let out = run_command(sh("(sleep 4 &) ; exec sleep 5"), None, limits(100), &token)
            .await
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert!(out.timed_out);
    }
}
