//! Shared deterministic types for the job engine.
//!
//! These types define stable contracts between the engine, its collaborators
//! (store, tracker, API layer) and observers. They carry no I/O.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::provider::ProviderKind;

/// Identifier of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a project record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a job.
///
/// `Running` is the only non-terminal status; see [`crate::core::status`] for
/// the transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work mapping a task to a proposed code change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub project_id: ProjectId,
    /// Absent means direct mode (freeform description).
    pub issue_number: Option<u64>,
    /// Free-form classification such as `feature` or `fix`.
    pub task_type: String,
    pub title: String,
    pub body: String,
    pub status: JobStatus,
    /// Set once when context is resolved, never mutated afterwards.
    pub branch: Option<String>,
    pub diff: Option<String>,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub log: String,
}

impl Job {
    /// Build a fresh `running` job record.
    pub fn new(
        id: JobId,
        project_id: ProjectId,
        task_type: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        issue_number: Option<u64>,
    ) -> Self {
        Self {
            id,
            project_id,
            issue_number,
            task_type: task_type.into(),
            title: title.into(),
            body: body.into(),
            status: JobStatus::Running,
            branch: None,
            diff: None,
            pr_title: None,
            pr_body: None,
            log: String::new(),
        }
    }
}

/// Read-only project descriptor handed to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    /// Local checkout whose `origin` is the real remote.
    pub repo_path: PathBuf,
    pub base_branch: String,
    pub provider: ProviderKind,
    /// Appended to every prompt when present.
    #[serde(default)]
    pub extra_instructions: Option<String>,
}

/// Continuation of work on an existing branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUp {
    /// Must already exist on the remote.
    pub branch: String,
    pub feedback: String,
    #[serde(default)]
    pub previous_diff: Option<String>,
}

/// How a job's context is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Direct,
    Issue(u64),
    FollowUp,
}

impl TaskMode {
    pub fn of(job: &Job, follow_up: Option<&FollowUp>) -> Self {
        match (follow_up, job.issue_number) {
            (Some(_), _) => TaskMode::FollowUp,
            (None, Some(number)) => TaskMode::Issue(number),
            (None, None) => TaskMode::Direct,
        }
    }
}

/// Generated pull-request style description of the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDescription {
    pub title: String,
    pub body: String,
}

/// Terminal fields written once when a job settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub log: String,
    pub branch: Option<String>,
    pub diff: Option<String>,
    pub description: Option<ChangeDescription>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(issue: Option<u64>) -> Job {
        Job::new(JobId(7), ProjectId(1), "feature", "t", "b", issue)
    }

    #[test]
    fn task_mode_prefers_follow_up() {
        let follow_up = FollowUp {
            branch: "feat/42".to_string(),
            feedback: "rename it".to_string(),
            previous_diff: None,
        };
        assert_eq!(TaskMode::of(&job(Some(42)), Some(&follow_up)), TaskMode::FollowUp);
        assert_eq!(TaskMode::of(&job(Some(42)), None), TaskMode::Issue(42));
        assert_eq!(TaskMode::of(&job(None), None), TaskMode::Direct);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Cancelled).expect("serialize");
        assert_eq!(json, "\"cancelled\"");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
