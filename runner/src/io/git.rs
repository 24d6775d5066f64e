//! Git adapter for the job engine.
//!
//! Every call is a `git` subprocess bounded by a timeout and bound to the
//! job's cancellation token, so a cancel request stops whichever git command
//! happens to be running.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, RunLimits, is_cancelled, run_command};

/// Author/committer identity used for job commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    limits: RunLimits,
    metadata_limits: RunLimits,
    cancel: CancellationToken,
}

impl Git {
    pub fn new(
        workdir: impl Into<PathBuf>,
        limits: RunLimits,
        metadata_limits: RunLimits,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            limits,
            metadata_limits,
            cancel,
        }
    }

    /// Same limits and token, different working directory.
    pub fn at(&self, workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            ..self.clone()
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Fetch the given branches from `origin`, updating their remote-tracking refs.
    #[instrument(skip_all, fields(branches = ?branches))]
    pub async fn fetch(&self, branches: &[&str]) -> Result<()> {
        let refspecs: Vec<String> = branches
            .iter()
            .map(|b| format!("+refs/heads/{b}:refs/remotes/origin/{b}"))
            .collect();
        let mut args = vec!["fetch", "--no-tags", "origin"];
        args.extend(refspecs.iter().map(String::as_str));
        self.run_checked(&args, self.limits).await?;
        Ok(())
    }

    /// Fetch one branch so the lease for a later push matches its remote tip.
    pub async fn fetch_remote_branch(&self, branch: &str) -> Result<()> {
        self.fetch(&[branch]).await
    }

    /// Clone this repository into `dest` with `branch` checked out.
    #[instrument(skip_all, fields(dest = %dest.display(), branch))]
    pub async fn clone_pinned(&self, dest: &Path, branch: &str) -> Result<Git> {
        let source = self.workdir.display().to_string();
        let target = dest.display().to_string();
        debug!(source = %source, "cloning workspace");
        self.run_checked(
            &["clone", "--no-tags", "--branch", branch, &source, &target],
            self.limits,
        )
        .await?;
        Ok(self.at(dest))
    }

    /// URL of the `origin` remote.
    pub async fn remote_url(&self) -> Result<String> {
        let out = self
            .run_capture(&["remote", "get-url", "origin"], self.metadata_limits)
            .await?;
        let url = out.trim().to_string();
        if url.is_empty() {
            return Err(anyhow!("origin has no URL"));
        }
        Ok(url)
    }

    pub async fn set_remote_url(&self, url: &str) -> Result<()> {
        self.run_checked(&["remote", "set-url", "origin", url], self.metadata_limits)
            .await?;
        Ok(())
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub async fn current_branch(&self) -> Result<String> {
        let out = self
            .run_capture(&["rev-parse", "--abbrev-ref", "HEAD"], self.metadata_limits)
            .await?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Create and checkout a new branch at `origin/<start>` without tracking.
    #[instrument(skip_all, fields(branch, start))]
    pub async fn checkout_new_branch(&self, branch: &str, start: &str) -> Result<()> {
        debug!(branch, start, "creating and checking out new branch");
        let start_point = format!("origin/{start}");
        self.run_checked(
            &["checkout", "--no-track", "-B", branch, &start_point],
            self.limits,
        )
        .await?;
        Ok(())
    }

    /// Checkout `branch` tracking `origin/<branch>`.
    #[instrument(skip_all, fields(branch))]
    pub async fn checkout_tracking(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out tracking branch");
        let upstream = format!("origin/{branch}");
        self.run_checked(&["checkout", "--track", "-B", branch, &upstream], self.limits)
            .await?;
        Ok(())
    }

    /// Advisory probe: does `origin` have `branch`?
    ///
    /// A failing probe is logged and reported as "absent"; only cancellation
    /// propagates.
    pub async fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let pattern = format!("refs/heads/{branch}");
        match self
            .run_capture(
                &["ls-remote", "--heads", "origin", &pattern],
                self.metadata_limits,
            )
            .await
        {
            Ok(out) => Ok(parse_ls_remote_heads(&out).iter().any(|b| b == branch)),
            Err(err) if is_cancelled(&err) => Err(err),
            Err(err) => {
                warn!(branch, err = %err, "remote branch probe failed");
                Ok(false)
            }
        }
    }

    /// True if the worktree has unstaged, staged or untracked changes.
    ///
    /// When an inspection command fails (other than by cancellation) the
    /// worktree is reported as changed.
    #[instrument(skip_all)]
    pub async fn has_changes(&self) -> Result<bool> {
        let probes: [&[&str]; 3] = [
            &["diff", "--name-only"],
            &["diff", "--cached", "--name-only"],
            &["ls-files", "--others", "--exclude-standard"],
        ];
        for args in probes {
            match self.run_capture(args, self.metadata_limits).await {
                Ok(out) if !out.trim().is_empty() => return Ok(true),
                Ok(_) => {}
                Err(err) if is_cancelled(&err) => return Err(err),
                Err(err) => {
                    warn!(err = %err, "change inspection failed, assuming changes");
                    return Ok(true);
                }
            }
        }
        debug!("worktree has no changes");
        Ok(false)
    }

    /// Stage all changes (respects .gitignore).
    pub async fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"], self.limits).await?;
        Ok(())
    }

    /// Commit staged changes with a message as `identity`.
    #[instrument(skip_all)]
    pub async fn commit(&self, message: &str, identity: &CommitIdentity) -> Result<()> {
        let name = format!("user.name={}", identity.name);
        let email = format!("user.email={}", identity.email);
        self.run_checked(
            &["-c", &name, "-c", &email, "commit", "-m", message],
            self.limits,
        )
        .await?;
        Ok(())
    }

    /// Push `HEAD` to `origin/<branch>`, refusing if the remote moved since
    /// the last fetch of that branch.
    #[instrument(skip_all, fields(branch))]
    pub async fn push_with_lease(&self, branch: &str) -> Result<()> {
        let lease = format!("--force-with-lease=refs/heads/{branch}");
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run_checked(&["push", &lease, "origin", &refspec], self.limits)
            .await?;
        Ok(())
    }

    /// Diff of `HEAD` against its parent.
    pub async fn diff_previous_commit(&self) -> Result<String> {
        self.run_capture(&["diff", "HEAD~1", "HEAD"], self.limits)
            .await
    }

    async fn run_capture(&self, args: &[&str], limits: RunLimits) -> Result<String> {
        let output = self.run_checked(args, limits).await?;
        Ok(output.stdout_text())
    }

    async fn run_checked(&self, args: &[&str], limits: RunLimits) -> Result<CommandOutput> {
        let label = format!("git {}", args.join(" "));
        self.run(args, limits)
            .await
            .with_context(|| format!("run {label}"))?
            .ensure_success(&label)
    }

    async fn run(&self, args: &[&str], limits: RunLimits) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .env("GIT_TERMINAL_PROMPT", "0");
        run_command(cmd, None, limits, &self.cancel).await
    }
}

fn parse_ls_remote_heads(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|r| r.strip_prefix("refs/heads/"))
        .map(str::to_string)
        .collect()
}
