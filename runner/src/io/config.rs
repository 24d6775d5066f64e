//! Engine configuration loaded from a TOML file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::process::RunLimits;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    pub timeouts: TimeoutConfig,
    pub log: LogConfig,
    pub agent: AgentConfig,
    /// Parent directory for job workspaces. Defaults to the system temp dir.
    pub workspace_root: Option<PathBuf>,
    /// Truncate captured stdout/stderr of git and tracker calls beyond this.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Clone, fetch, checkout, commit, push.
    pub git_secs: u64,
    /// Short lookups: remote URL, branch probes, issue reads, comments.
    pub metadata_secs: u64,
    /// One agent invocation.
    pub agent_secs: u64,
    /// Delay between `SIGTERM` and `SIGKILL` when stopping a child.
    pub kill_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            git_secs: 120,
            metadata_secs: 30,
            agent_secs: 30 * 60,
            kill_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum spacing between two log flushes of the same job.
    pub flush_interval_ms: u64,
    /// Per-job broadcast buffer; slow subscribers beyond this lag and skip.
    pub bus_capacity: usize,
    pub max_subscribers: usize,
    /// Lines kept per job and replayed to late subscribers. 0 disables replay.
    pub replay_lines: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 2_000,
            bus_capacity: 1_024,
            max_subscribers: 32,
            replay_lines: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Binary for the `claude-code` provider.
    pub claude_bin: String,
    /// `Co-authored-by` trailer value on every commit.
    pub co_author: String,
    pub committer_name: String,
    pub committer_email: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            claude_bin: "claude".to_string(),
            co_author: "Claude <noreply@anthropic.com>".to_string(),
            committer_name: "patchrunner".to_string(),
            committer_email: "patchrunner@users.noreply.github.com".to_string(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            log: LogConfig::default(),
            agent: AgentConfig::default(),
            workspace_root: None,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        let t = &self.timeouts;
        if t.git_secs == 0 || t.metadata_secs == 0 || t.agent_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.log.flush_interval_ms == 0 {
            return Err(anyhow!("log.flush_interval_ms must be > 0"));
        }
        if self.log.bus_capacity == 0 {
            return Err(anyhow!("log.bus_capacity must be > 0"));
        }
        if self.log.max_subscribers == 0 {
            return Err(anyhow!("log.max_subscribers must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.agent.claude_bin.trim().is_empty() {
            return Err(anyhow!("agent.claude_bin must be non-empty"));
        }
        if self.agent.committer_name.trim().is_empty()
            || self.agent.committer_email.trim().is_empty()
        {
            return Err(anyhow!("agent.committer_name/committer_email must be non-empty"));
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.kill_grace_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.log.flush_interval_ms)
    }

    pub fn git_limits(&self) -> RunLimits {
        self.limits(self.timeouts.git_secs)
    }

    pub fn metadata_limits(&self) -> RunLimits {
        self.limits(self.timeouts.metadata_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.agent_secs)
    }

    fn limits(&self, secs: u64) -> RunLimits {
        RunLimits {
            timeout: Duration::from_secs(secs),
            output_limit_bytes: self.output_limit_bytes,
            kill_grace: self.kill_grace(),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RunnerConfig::default();
        cfg.workspace_root = Some(temp.path().join("ws"));
        cfg.log.replay_lines = 200;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[timeouts]\nagent_secs = 60\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.timeouts.agent_secs, 60);
        assert_eq!(cfg.timeouts.git_secs, 120);
        assert_eq!(cfg.log.flush_interval_ms, 2_000);
    }

    #[test]
    fn rejects_zero_flush_interval() {
        let mut cfg = RunnerConfig::default();
        cfg.log.flush_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }
}
