//! Issue-tracker collaborator.
//!
//! The engine only needs to read issues and post diagnostic comments; issue
//! and pull-request creation are exposed for the API layer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::io::process::{RunLimits, run_command};

/// Title and body of a tracked issue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Issue {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub base: String,
    pub head: String,
}

/// Issue tracker operations, scoped to the repository at `repo`.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn read_issue(&self, repo: &Path, number: u64) -> Result<Issue>;
    async fn create_issue(&self, repo: &Path, issue: &NewIssue) -> Result<u64>;
    async fn comment(&self, repo: &Path, number: u64, body: &str) -> Result<()>;
    async fn create_pull_request(&self, repo: &Path, pr: &NewPullRequest) -> Result<String>;
}

/// [`IssueTracker`] backed by the GitHub CLI (`gh`).
#[derive(Debug, Clone)]
pub struct GhCli {
    bin: PathBuf,
    limits: RunLimits,
}

impl GhCli {
    pub fn new(limits: RunLimits) -> Self {
        Self {
            bin: PathBuf::from("gh"),
            limits,
        }
    }

    pub fn with_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.bin = bin.into();
        self
    }

    async fn gh(&self, repo: &Path, args: &[&str]) -> Result<String> {
        let label = format!("gh {}", args.first().copied().unwrap_or_default());
        let mut cmd = Command::new(&self.bin);
        cmd.args(args).current_dir(repo).env("GH_PROMPT_DISABLED", "1");
        // Tracker calls are short and never tied to a job's cancellation.
        let output = run_command(cmd, None, self.limits, &CancellationToken::new())
            .await
            .with_context(|| format!("run {label}"))?
            .ensure_success(&label)?;
        Ok(output.stdout_text())
    }
}

#[async_trait]
impl IssueTracker for GhCli {
    #[instrument(skip_all, fields(number))]
    async fn read_issue(&self, repo: &Path, number: u64) -> Result<Issue> {
        let number_arg = number.to_string();
        let out = self
            .gh(repo, &["issue", "view", &number_arg, "--json", "title,body"])
            .await?;
        let issue: Issue =
            serde_json::from_str(&out).with_context(|| format!("parse issue #{number}"))?;
        debug!(title = %issue.title, "read issue");
        Ok(issue)
    }

    async fn create_issue(&self, repo: &Path, issue: &NewIssue) -> Result<u64> {
        let out = self
            .gh(
                repo,
                &["issue", "create", "--title", &issue.title, "--body", &issue.body],
            )
            .await?;
        parse_issue_url(&out)
    }

    #[instrument(skip_all, fields(number))]
    async fn comment(&self, repo: &Path, number: u64, body: &str) -> Result<()> {
        let number_arg = number.to_string();
        self.gh(repo, &["issue", "comment", &number_arg, "--body", body])
            .await?;
        Ok(())
    }

    async fn create_pull_request(&self, repo: &Path, pr: &NewPullRequest) -> Result<String> {
        let out = self
            .gh(
                repo,
                &[
                    "pr", "create", "--title", &pr.title, "--body", &pr.body, "--base", &pr.base,
                    "--head", &pr.head,
                ],
            )
            .await?;
        last_line(&out).ok_or_else(|| anyhow!("gh pr create printed no URL"))
    }
}

fn last_line(out: &str) -> Option<String> {
    out.lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(str::to_string)
}

/// `gh issue create` prints the new issue's URL; its last segment is the number.
fn parse_issue_url(out: &str) -> Result<u64> {
    let url = last_line(out).ok_or_else(|| anyhow!("gh issue create printed no URL"))?;
    url.rsplit('/')
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow!("unexpected issue URL '{url}'"))
}
