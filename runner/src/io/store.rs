//! Persistence contract for job and project records.
//!
//! The engine writes through [`JobStore`] in small independent updates: the
//! issue title early, the branch once, the log periodically and the terminal
//! fields exactly once. [`MemoryStore`] is the in-process implementation used
//! by the CLI, the HTTP surface and tests.

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::status::transition;
use crate::core::types::{Job, JobId, JobOutcome, JobStatus, Project, ProjectId};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new project and return it with its assigned id.
    async fn insert_project(&self, project: Project) -> Result<Project>;
    async fn project(&self, id: ProjectId) -> Result<Option<Project>>;
    /// Persist a new job and return it with its assigned id.
    async fn insert_job(&self, job: Job) -> Result<Job>;
    async fn job(&self, id: JobId) -> Result<Option<Job>>;
    async fn status(&self, id: JobId) -> Result<Option<JobStatus>>;
    async fn update_title(&self, id: JobId, title: &str) -> Result<()>;
    /// Record the job's branch. Setting a different branch later is an error.
    async fn update_branch(&self, id: JobId, branch: &str) -> Result<()>;
    /// Replace the running log. Ignored once the job settled, so a late
    /// periodic flush never overwrites the final log.
    async fn update_log(&self, id: JobId, log: &str) -> Result<()>;
    /// Mark a still-running job cancelled. Returns false if it already settled.
    async fn request_cancel(&self, id: JobId) -> Result<bool>;
    /// Write the terminal fields and return the status actually stored.
    ///
    /// If the job was already moved to a terminal status (an external
    /// cancel), that status is kept and returned.
    async fn finish(&self, id: JobId, outcome: &JobOutcome) -> Result<JobStatus>;
}

#[derive(Debug, Default)]
struct Tables {
    next_job: u64,
    next_project: u64,
    jobs: HashMap<JobId, Job>,
    projects: HashMap<ProjectId, Project>,
}

/// Mutex-guarded in-memory [`JobStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_job<T>(&self, id: JobId, f: impl FnOnce(&mut Job) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.lock();
        let job = tables
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job {id} not found"))?;
        f(job)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_project(&self, mut project: Project) -> Result<Project> {
        let mut tables = self.tables.lock();
        tables.next_project += 1;
        project.id = ProjectId(tables.next_project);
        tables.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn project(&self, id: ProjectId) -> Result<Option<Project>> {
        Ok(self.tables.lock().projects.get(&id).cloned())
    }

    async fn insert_job(&self, mut job: Job) -> Result<Job> {
        let mut tables = self.tables.lock();
        if !tables.projects.contains_key(&job.project_id) {
            return Err(anyhow!("project {} not found", job.project_id));
        }
        tables.next_job += 1;
        job.id = JobId(tables.next_job);
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.tables.lock().jobs.get(&id).cloned())
    }

    async fn status(&self, id: JobId) -> Result<Option<JobStatus>> {
        Ok(self.tables.lock().jobs.get(&id).map(|job| job.status))
    }

    async fn update_title(&self, id: JobId, title: &str) -> Result<()> {
        self.with_job(id, |job| {
            job.title = title.to_string();
            Ok(())
        })
    }

    async fn update_branch(&self, id: JobId, branch: &str) -> Result<()> {
        self.with_job(id, |job| match &job.branch {
            Some(existing) if existing != branch => Err(anyhow!(
                "job {id} already has branch '{existing}', refusing '{branch}'"
            )),
            _ => {
                job.branch = Some(branch.to_string());
                Ok(())
            }
        })
    }

    async fn update_log(&self, id: JobId, log: &str) -> Result<()> {
        self.with_job(id, |job| {
            if !job.status.is_terminal() {
                job.log = log.to_string();
            }
            Ok(())
        })
    }

    async fn request_cancel(&self, id: JobId) -> Result<bool> {
        self.with_job(id, |job| {
            if job.status.is_terminal() {
                return Ok(false);
            }
            job.status = transition(job.status, JobStatus::Cancelled)?;
            Ok(true)
        })
    }

    async fn finish(&self, id: JobId, outcome: &JobOutcome) -> Result<JobStatus> {
        self.with_job(id, |job| {
            let status = if job.status.is_terminal() {
                job.status
            } else {
                transition(job.status, outcome.status)?
            };
            job.status = status;
            job.log = outcome.log.clone();
            if job.branch.is_none() {
                job.branch = outcome.branch.clone();
            }
            job.diff = outcome.diff.clone();
            if let Some(desc) = &outcome.description {
                job.pr_title = Some(desc.title.clone());
                job.pr_body = Some(desc.body.clone());
            }
            Ok(status)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ChangeDescription;
    use crate::provider::ProviderKind;

    async fn seeded() -> (MemoryStore, Job) {
        let store = MemoryStore::new();
        let project = store
            .insert_project(Project {
                id: ProjectId(0),
                repo_path: "/tmp/repo".into(),
                base_branch: "main".to_string(),
                provider: ProviderKind::ClaudeCode,
                extra_instructions: None,
            })
            .await
            .expect("project");
        let job = store
            .insert_job(Job::new(JobId(0), project.id, "fix", "t", "b", None))
            .await
            .expect("job");
        (store, job)
    }

    fn outcome(status: JobStatus) -> JobOutcome {
        JobOutcome {
            status,
            log: "log".to_string(),
            branch: Some("fix/job-1".to_string()),
            diff: Some("diff".to_string()),
            description: Some(ChangeDescription {
                title: "fix: t".to_string(),
                body: "body".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn assigns_ids_and_rejects_unknown_project() {
        let (store, job) = seeded().await;
        assert_eq!(job.id, JobId(1));
        let orphan = Job::new(JobId(0), ProjectId(99), "fix", "t", "b", None);
        assert!(store.insert_job(orphan).await.is_err());
    }

    #[tokio::test]
    async fn finish_sets_terminal_fields_once() {
        let (store, job) = seeded().await;
        let status = store
            .finish(job.id, &outcome(JobStatus::Completed))
            .await
            .expect("finish");
        assert_eq!(status, JobStatus::Completed);
        let stored = store.job(job.id).await.expect("read").expect("job");
        assert_eq!(stored.pr_body.as_deref(), Some("body"));
        assert_eq!(stored.branch.as_deref(), Some("fix/job-1"));

        assert!(
            store
                .finish(job.id, &outcome(JobStatus::Failed))
                .await
                .is_ok()
        );
        assert_eq!(
            store.status(job.id).await.expect("status"),
            Some(JobStatus::Completed)
        );
    }

    #[tokio::test]
    async fn external_cancel_wins_over_late_outcome() {
        let (store, job) = seeded().await;
        assert!(store.request_cancel(job.id).await.expect("cancel"));
        assert!(!store.request_cancel(job.id).await.expect("second cancel"));
        let status = store
            .finish(job.id, &outcome(JobStatus::Completed))
            .await
            .expect("finish");
        assert_eq!(status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn late_log_flush_does_not_overwrite_final_log() {
        let (store, job) = seeded().await;
        store.update_log(job.id, "partial").await.expect("flush");
        store
            .finish(job.id, &outcome(JobStatus::Failed))
            .await
            .expect("finish");
        store.update_log(job.id, "stale").await.expect("late flush");
        let stored = store.job(job.id).await.expect("read").expect("job");
        assert_eq!(stored.log, "log");
    }

    #[tokio::test]
    async fn branch_is_set_once() {
        let (store, job) = seeded().await;
        store.update_branch(job.id, "fix/job-1").await.expect("set");
        store.update_branch(job.id, "fix/job-1").await.expect("same again");
        assert!(store.update_branch(job.id, "fix/other").await.is_err());
    }
}
