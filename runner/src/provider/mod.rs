//! Agent provider capability.
//!
//! A provider starts exactly one external coding-agent process per call and
//! reports its activity through [`AgentCallbacks`]. The set of providers is
//! closed ([`ProviderKind`]) and resolved when a project is configured; an
//! unknown name is a [`ProviderError::NotFound`] rather than a late surprise.

pub mod claude;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use crate::core::stream::AgentCallbacks;
use crate::io::config::RunnerConfig;

pub use claude::ClaudeCodeProvider;

/// Errors from provider resolution and agent runs.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider not found: {0}")]
    NotFound(String),
    #[error("provider '{0}' is not supported by this build")]
    Unsupported(String),
    #[error("failed to start {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent exited with {}: {stderr}", describe_code(.code))]
    Exit { code: Option<i32>, stderr: String },
    #[error("agent timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("agent cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

/// Closed set of provider names a project may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProviderKind {
    ClaudeCode,
    Codex,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::ClaudeCode,
        ProviderKind::Codex,
        ProviderKind::Gemini,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::ClaudeCode => "claude-code",
            ProviderKind::Codex => "codex",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = ProviderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProviderKind> for String {
    fn from(kind: ProviderKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Result category of [`AgentProvider::test_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// The binary ran and answered as expected.
    Ready,
    NotInstalled,
    /// The binary exists but its answer was not recognized.
    UnexpectedOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionCheck {
    pub ok: bool,
    pub kind: ConnectionKind,
    pub message: String,
}

impl ConnectionCheck {
    pub fn ready(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            kind: ConnectionKind::Ready,
            message: message.into(),
        }
    }

    pub fn failed(kind: ConnectionKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            kind,
            message: message.into(),
        }
    }
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// The job's token; firing it stops the agent like [`AgentHandle::kill`].
    pub cancel: CancellationToken,
}

/// Running agent process.
#[derive(Debug)]
pub struct AgentHandle {
    kill: CancellationToken,
    task: JoinHandle<Result<String, ProviderError>>,
}

impl AgentHandle {
    /// `kill` must be the token the driving task stops the process on.
    pub fn new(kill: CancellationToken, task: JoinHandle<Result<String, ProviderError>>) -> Self {
        Self { kill, task }
    }

    /// Request termination (`SIGTERM`, then `SIGKILL` after the grace period).
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Final textual result, or the reason the run failed.
    pub async fn wait(self) -> Result<String, ProviderError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(ProviderError::Cancelled),
            Err(err) => Err(ProviderError::Other(anyhow::anyhow!(
                "agent task failed: {err}"
            ))),
        }
    }
}

#[async_trait]
pub trait AgentProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Probe the provider without doing any work.
    async fn test_connection(&self) -> ConnectionCheck;

    /// Start one agent process in `request.workdir` and return immediately.
    async fn run_agent(
        &self,
        request: AgentRequest,
        callbacks: Arc<dyn AgentCallbacks>,
    ) -> Result<AgentHandle, ProviderError>;
}

/// Placeholder for providers named in the closed set but not built here.
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedProvider {
    kind: ProviderKind,
}

impl UnsupportedProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl AgentProvider for UnsupportedProvider {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn test_connection(&self) -> ConnectionCheck {
        ConnectionCheck::failed(
            ConnectionKind::NotInstalled,
            format!("provider '{}' is not supported by this build", self.kind),
        )
    }

    async fn run_agent(
        &self,
        _request: AgentRequest,
        _callbacks: Arc<dyn AgentCallbacks>,
    ) -> Result<AgentHandle, ProviderError> {
        Err(ProviderError::Unsupported(self.kind.to_string()))
    }
}

/// Providers available to the engine, keyed by kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn AgentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `claude-code` backed by the configured binary; the rest unsupported.
    pub fn builtin(config: &RunnerConfig) -> Self {
        let mut registry = Self::new();
        registry.register(
            ProviderKind::ClaudeCode,
            Arc::new(ClaudeCodeProvider::from_config(config)),
        );
        for kind in [ProviderKind::Codex, ProviderKind::Gemini] {
            registry.register(kind, Arc::new(UnsupportedProvider::new(kind)));
        }
        registry
    }

    pub fn register(&mut self, kind: ProviderKind, provider: Arc<dyn AgentProvider>) {
        self.providers.insert(kind, provider);
    }

    pub fn resolve(&self, kind: ProviderKind) -> Result<Arc<dyn AgentProvider>, ProviderError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(kind.to_string()))
    }

    /// Parse a provider name and resolve it.
    pub fn resolve_name(&self, name: &str) -> Result<Arc<dyn AgentProvider>, ProviderError> {
        self.resolve(name.parse()?)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.providers.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("ProviderRegistry")
            .field("providers", &kinds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_closed_set_and_rejects_unknown() {
        assert_eq!(
            "claude-code".parse::<ProviderKind>().expect("parse"),
            ProviderKind::ClaudeCode
        );
        let err = "copilot".parse::<ProviderKind>().unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(ref name) if name == "copilot"));
    }

    #[test]
    fn provider_kind_serde_uses_names() {
        let json = serde_json::to_string(&ProviderKind::Gemini).expect("serialize");
        assert_eq!(json, "\"gemini\"");
        assert!(serde_json::from_str::<ProviderKind>("\"cursor\"").is_err());
    }

    #[tokio::test]
    async fn registry_resolves_builtin_and_reports_missing() {
        let registry = ProviderRegistry::builtin(&RunnerConfig::default());
        let claude = registry.resolve(ProviderKind::ClaudeCode).expect("claude");
        assert_eq!(claude.name(), "claude-code");

        let codex = registry.resolve_name("codex").expect("codex");
        let check = codex.test_connection().await;
        assert!(!check.ok);

        let empty = ProviderRegistry::new();
        assert!(matches!(
            empty.resolve(ProviderKind::Gemini),
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unsupported_provider_refuses_to_run() {
        let provider = UnsupportedProvider::new(ProviderKind::Gemini);
        let request = AgentRequest {
            prompt: "p".to_string(),
            workdir: PathBuf::from("."),
            timeout: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        };
        let callbacks: Arc<dyn AgentCallbacks> =
            Arc::new(crate::test_support::RecordingCallbacks::default());
        let err = provider.run_agent(request, callbacks).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }
}
