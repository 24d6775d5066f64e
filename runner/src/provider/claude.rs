//! `claude-code` provider: the Claude Code CLI in headless stream-json mode.

use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::stream::{LineBuffer, StreamDecoder};
use crate::io::config::RunnerConfig;
use crate::io::process::{RunLimits, run_command, terminate};
use crate::provider::{
    AgentCallbacks, AgentHandle, AgentProvider, AgentRequest, ConnectionCheck, ConnectionKind,
    ProviderError,
};

/// Flags for an unattended run that may edit files without asking.
const RUN_FLAGS: [&str; 4] = [
    "--output-format",
    "stream-json",
    "--verbose",
    "--dangerously-skip-permissions",
];

/// Bytes of stderr kept for the error message of a failed run.
const STDERR_TAIL: usize = 4_096;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ClaudeCodeProvider {
    bin: String,
    kill_grace: Duration,
}

impl ClaudeCodeProvider {
    pub fn new(bin: impl Into<String>, kill_grace: Duration) -> Self {
        Self {
            bin: bin.into(),
            kill_grace,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.agent.claude_bin.clone(), config.kill_grace())
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-p").arg(&request.prompt).args(RUN_FLAGS);
        cmd.current_dir(&request.workdir);
        cmd
    }
}

#[async_trait]
impl AgentProvider for ClaudeCodeProvider {
    fn name(&self) -> &str {
        "claude-code"
    }

    #[instrument(skip_all, fields(bin = %self.bin))]
    async fn test_connection(&self) -> ConnectionCheck {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("--version");
        let limits = RunLimits {
            timeout: PROBE_TIMEOUT,
            output_limit_bytes: 4_096,
            kill_grace: self.kill_grace,
        };
        let output = match run_command(cmd, None, limits, &CancellationToken::new()).await {
            Ok(output) => output,
            Err(err) => {
                let missing = err
                    .chain()
                    .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
                    .any(|io| io.kind() == ErrorKind::NotFound);
                return if missing {
                    ConnectionCheck::failed(
                        ConnectionKind::NotInstalled,
                        format!("'{}' not found on PATH", self.bin),
                    )
                } else {
                    ConnectionCheck::failed(ConnectionKind::UnexpectedOutput, format!("{err:#}"))
                };
            }
        };
        let version = output.stdout_text().trim().to_string();
        if output.success() && !version.is_empty() {
            info!(version = %version, "claude available");
            ConnectionCheck::ready(version)
        } else {
            let detail = if output.timed_out {
                "timed out".to_string()
            } else {
                output.stderr_text().trim().to_string()
            };
            ConnectionCheck::failed(
                ConnectionKind::UnexpectedOutput,
                format!("'{} --version' gave no usable answer: {detail}", self.bin),
            )
        }
    }

    #[instrument(skip_all, fields(workdir = %request.workdir.display()))]
    async fn run_agent(
        &self,
        request: AgentRequest,
        callbacks: Arc<dyn AgentCallbacks>,
    ) -> Result<AgentHandle, ProviderError> {
        let cmd = self.command(&request);
        spawn_stream(cmd, &self.bin, &request, self.kill_grace, callbacks)
    }
}

/// Spawn `cmd` and drive its stream-json stdout on a background task.
pub(crate) fn spawn_stream(
    mut cmd: Command,
    bin: &str,
    request: &AgentRequest,
    kill_grace: Duration,
    callbacks: Arc<dyn AgentCallbacks>,
) -> Result<AgentHandle, ProviderError> {
    if request.cancel.is_cancelled() {
        return Err(ProviderError::Cancelled);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|source| ProviderError::Spawn {
        bin: bin.to_string(),
        source,
    })?;
    debug!(pid = ?child.id(), "agent started");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("agent stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("agent stderr was not piped"))?;

    let kill = request.cancel.child_token();
    let task = tokio::spawn(drive(
        child,
        stdout,
        stderr,
        callbacks,
        kill.clone(),
        request.timeout,
        kill_grace,
    ));
    Ok(AgentHandle::new(kill, task))
}

async fn drive(
    mut child: Child,
    mut stdout: impl AsyncRead + Unpin,
    stderr: impl AsyncRead + Unpin + Send + 'static,
    callbacks: Arc<dyn AgentCallbacks>,
    kill: CancellationToken,
    timeout: Duration,
    grace: Duration,
) -> Result<String, ProviderError> {
    let tail = Arc::new(Mutex::new(String::new()));
    let mut stderr_task = tokio::spawn(forward_stderr(
        stderr,
        Arc::clone(&callbacks),
        Arc::clone(&tail),
    ));
    let mut decoder = StreamDecoder::new();
    let mut chunk = [0u8; 8192];
    let mut stdout_open = true;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let status = loop {
        tokio::select! {
            read = stdout.read(&mut chunk), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => decoder.feed(&chunk[..n], callbacks.as_ref()),
                Err(err) => {
                    warn!(err = %err, "agent stdout read failed");
                    stdout_open = false;
                }
            },
            status = child.wait(), if !stdout_open => {
                break status.context("wait for agent")?;
            }
            _ = &mut deadline => {
                warn!(timeout_secs = timeout.as_secs(), "agent timed out, stopping");
                terminate(&mut child, grace).await?;
                stderr_task.abort();
                return Err(ProviderError::TimedOut(timeout));
            }
            _ = kill.cancelled() => {
                debug!("agent kill requested");
                terminate(&mut child, grace).await?;
                stderr_task.abort();
                return Err(ProviderError::Cancelled);
            }
        }
    };

    // A process the agent left running may still hold stderr.
    tokio::select! {
        _ = &mut stderr_task => {}
        _ = tokio::time::sleep(grace) => {
            warn!(grace_ms = grace.as_millis() as u64, "agent stderr still open after exit");
            stderr_task.abort();
        }
        _ = &mut deadline => {
            warn!(timeout_secs = timeout.as_secs(), "agent timed out waiting for stderr");
            stderr_task.abort();
            return Err(ProviderError::TimedOut(timeout));
        }
        _ = kill.cancelled() => {
            stderr_task.abort();
            return Err(ProviderError::Cancelled);
        }
    }
    let stderr_tail = std::mem::take(&mut *tail.lock());
    let decoded = decoder.finish(callbacks.as_ref());
    if decoded.skipped_lines > 0 {
        debug!(skipped = decoded.skipped_lines, "ignored malformed agent lines");
    }
    if !status.success() {
        return Err(ProviderError::Exit {
            code: status.code(),
            stderr: stderr_tail.trim().to_string(),
        });
    }
    debug!(result_len = decoded.result.len(), "agent finished");
    Ok(decoded.result)
}

/// Forward stderr lines to `on_text`, keeping the last [`STDERR_TAIL`] bytes
/// in `tail` for error reports.
async fn forward_stderr(
    mut stderr: impl AsyncRead + Unpin,
    callbacks: Arc<dyn AgentCallbacks>,
    tail: Arc<Mutex<String>>,
) {
    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; 4096];
    let emit = |line: String| {
        callbacks.on_text(&line);
        let mut tail = tail.lock();
        tail.push_str(&line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL {
            let mut cut = tail.len() - STDERR_TAIL;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    };
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    emit(line);
                }
            }
            Err(err) => {
                warn!(err = %err, "agent stderr read failed");
                break;
            }
        }
    }
    if let Some(line) = lines.finish() {
        emit(line);
    }
}
