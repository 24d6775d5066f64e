//! Commit and push the agent's work, then describe it.

use tracing::{info, instrument};

use crate::core::description::change_description;
use crate::core::types::ChangeDescription;
use crate::engine::error::JobError;
use crate::engine::joblog::JobLog;
use crate::io::git::{CommitIdentity, Git};

/// Everything needed to publish one job's changes.
#[derive(Debug)]
pub struct PublishRequest<'a> {
    pub base_branch: &'a str,
    pub branch: &'a str,
    pub task_type: &'a str,
    pub title: &'a str,
    pub issue_number: Option<u64>,
    pub identity: &'a CommitIdentity,
    pub co_author: &'a str,
    /// The branch already exists remotely and was checked out tracking it.
    pub follow_up: bool,
    pub agent_result: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub diff: String,
    pub description: ChangeDescription,
}

/// Commit message: subject, optional issue reference, co-author trailer.
pub fn commit_message(
    task_type: &str,
    title: &str,
    issue_number: Option<u64>,
    co_author: &str,
) -> String {
    let mut message = format!("{}: {}\n\n", task_type.trim(), title.trim());
    if let Some(number) = issue_number {
        message.push_str(&format!("Closes #{number}\n\n"));
    }
    message.push_str(&format!("Co-authored-by: {co_author}\n"));
    message
}

#[instrument(skip_all, fields(branch = req.branch))]
pub async fn commit_and_push(
    git: &Git,
    req: &PublishRequest<'_>,
    log: &JobLog,
) -> Result<Published, JobError> {
    let current = git.current_branch().await?;
    if current == req.base_branch {
        return Err(JobError::OnBaseBranch { branch: current });
    }

    git.add_all().await?;
    let message = commit_message(req.task_type, req.title, req.issue_number, req.co_author);
    git.commit(&message, req.identity).await?;
    log.line(format!("Committed changes on {current}"));

    if !req.follow_up && git.remote_branch_exists(req.branch).await? {
        log.line(format!(
            "Remote branch {} already exists; fetching it so the push can replace it safely",
            req.branch
        ));
        git.fetch_remote_branch(req.branch).await?;
    }
    git.push_with_lease(req.branch).await?;
    log.line(format!("Pushed {} to origin", req.branch));
    info!(branch = req.branch, "pushed");

    let diff = git.diff_previous_commit().await?;
    let description = change_description(
        req.task_type,
        req.title,
        req.issue_number,
        req.agent_result,
    );
    Ok(Published { diff, description })
}
