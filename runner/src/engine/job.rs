//! Per-job state machine.
//!
//! `ContextResolution → Fetch → WorkspacePrepare → AgentRun → CommitPush`,
//! then `Finalize` on every exit path. A cancellation checkpoint precedes each
//! stage; every error unwinds to [`JobRun::finalize`], which removes the
//! workspace before the terminal fields are persisted.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::Registration;
use crate::core::branch::{direct_branch, issue_branch};
use crate::core::stage::{Stage, StageCursor};
use crate::core::types::{FollowUp, Job, JobOutcome, JobStatus, Project, TaskMode};
use crate::engine::EngineInner;
use crate::engine::error::JobError;
use crate::engine::joblog::JobLog;
use crate::engine::publish::{PublishRequest, Published, commit_and_push};
use crate::engine::retry::{RetryController, report_exhaustion};
use crate::io::git::{CommitIdentity, Git};
use crate::io::prompt::{PromptInputs, PromptTask, find_pr_template};
use crate::io::workspace::Workspace;

/// Context fixed during resolution.
#[derive(Debug, Clone)]
struct Resolved {
    branch: String,
    title: String,
    task: PromptTask,
}

pub(crate) struct JobRun {
    engine: Arc<EngineInner>,
    job: Job,
    project: Project,
    follow_up: Option<FollowUp>,
    registration: Registration,
    log: JobLog,
    cursor: StageCursor,
    workspace: Option<Workspace>,
    branch: Option<String>,
}

impl JobRun {
    pub(crate) fn new(
        engine: Arc<EngineInner>,
        job: Job,
        project: Project,
        follow_up: Option<FollowUp>,
        registration: Registration,
        log: JobLog,
    ) -> Self {
        Self {
            engine,
            job,
            project,
            follow_up,
            registration,
            log,
            cursor: StageCursor::new(),
            workspace: None,
            branch: None,
        }
    }

    #[instrument(skip_all, fields(job = %self.job.id))]
    pub(crate) async fn run(mut self) -> JobStatus {
        let result = self.execute().await;
        self.finalize(result).await
    }

    async fn execute(&mut self) -> Result<Published, JobError> {
        self.enter(Stage::ContextResolution).await?;
        let resolved = self.resolve_context().await?;

        self.enter(Stage::Fetch).await?;
        let project_git = self.git(self.project.repo_path.clone());
        let branches = self.fetch_branches();
        let branch_refs: Vec<&str> = branches.iter().map(String::as_str).collect();
        self.log.line(format!("Fetching {} from origin", branches.join(", ")));
        project_git.fetch(&branch_refs).await?;
        let remote_url = project_git.remote_url().await?;

        self.enter(Stage::WorkspacePrepare).await?;
        let workspace = Workspace::create(
            self.engine.config.workspace_root.as_deref(),
            self.job.id,
        )?;
        let workdir = workspace.path().to_path_buf();
        self.workspace = Some(workspace);
        self.log.line(format!(
            "Cloning {} into a fresh workspace",
            self.project.base_branch
        ));
        let git = project_git
            .clone_pinned(&workdir, &self.project.base_branch)
            .await?;
        git.set_remote_url(&remote_url).await?;
        git.fetch(&branch_refs).await?;
        if self.follow_up.is_some() {
            self.log
                .line(format!("Checking out {} from origin", resolved.branch));
            git.checkout_tracking(&resolved.branch).await?;
        } else {
            self.log.line(format!(
                "Creating {} from origin/{}",
                resolved.branch, self.project.base_branch
            ));
            git.checkout_new_branch(&resolved.branch, &self.project.base_branch)
                .await?;
        }

        self.enter(Stage::AgentRun).await?;
        let pr_template = find_pr_template(&workdir)?;
        let prompt = self.engine.prompts.task_prompt(&PromptInputs {
            task: resolved.task.clone(),
            extra_instructions: self.project.extra_instructions.clone(),
            pr_template,
        })?;
        let provider = self.engine.providers.resolve(self.project.provider)?;
        self.log.line(format!("Starting agent ({})", provider.name()));
        let controller = RetryController {
            provider,
            prompts: &self.engine.prompts,
            git: &git,
            log: &self.log,
            cancel: self.registration.token(),
            agent_timeout: self.engine.config.agent_timeout(),
        };
        let agent_result = match controller.run(&prompt).await {
            Ok(result) => result,
            Err(err @ JobError::NoChanges { .. }) => {
                if let TaskMode::Issue(number) = self.mode() {
                    report_exhaustion(
                        self.engine.tracker.as_ref(),
                        &self.project.repo_path,
                        number,
                        &self.log,
                    )
                    .await;
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        self.enter(Stage::CommitPush).await?;
        let agent = &self.engine.config.agent;
        let identity = CommitIdentity {
            name: agent.committer_name.clone(),
            email: agent.committer_email.clone(),
        };
        let request = PublishRequest {
            base_branch: &self.project.base_branch,
            branch: &resolved.branch,
            task_type: &self.job.task_type,
            title: &resolved.title,
            issue_number: self.job.issue_number,
            identity: &identity,
            co_author: &agent.co_author,
            follow_up: self.follow_up.is_some(),
            agent_result: &agent_result,
        };
        commit_and_push(&git, &request, &self.log).await
    }

    fn mode(&self) -> TaskMode {
        TaskMode::of(&self.job, self.follow_up.as_ref())
    }

    /// Cancellation checkpoint, then the stage banner.
    async fn enter(&mut self, stage: Stage) -> Result<(), JobError> {
        self.checkpoint().await?;
        self.cursor
            .advance(stage)
            .map_err(|msg| JobError::Fatal(anyhow!(msg)))?;
        self.log.stage(stage);
        debug!(stage = ?stage, "stage entered");
        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), JobError> {
        if self.registration.token().is_cancelled() {
            return Err(JobError::Cancelled);
        }
        match self.engine.store.status(self.job.id).await {
            Ok(Some(JobStatus::Cancelled)) => Err(JobError::Cancelled),
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(err = %err, "status read failed at checkpoint");
                Ok(())
            }
        }
    }

    async fn resolve_context(&mut self) -> Result<Resolved, JobError> {
        let job = &self.job;
        let resolved = match (self.mode(), &self.follow_up) {
            (TaskMode::FollowUp, Some(follow_up)) => {
                self.log
                    .line(format!("Follow-up on existing branch {}", follow_up.branch));
                Resolved {
                    branch: follow_up.branch.clone(),
                    title: job.title.clone(),
                    task: PromptTask::FollowUp {
                        branch: follow_up.branch.clone(),
                        title: job.title.clone(),
                        feedback: follow_up.feedback.clone(),
                        previous_diff: follow_up.previous_diff.clone(),
                    },
                }
            }
            (TaskMode::Issue(number), _) => {
                self.log.line(format!("Reading issue #{number}"));
                let issue = self
                    .engine
                    .tracker
                    .read_issue(&self.project.repo_path, number)
                    .await?;
                self.engine.store.update_title(job.id, &issue.title).await?;
                Resolved {
                    branch: issue_branch(&job.task_type, number),
                    title: issue.title.clone(),
                    task: PromptTask::Issue {
                        number,
                        title: issue.title,
                        body: issue.body,
                    },
                }
            }
            _ => Resolved {
                branch: direct_branch(&job.task_type, job.id),
                title: job.title.clone(),
                task: PromptTask::Direct {
                    title: job.title.clone(),
                    body: job.body.clone(),
                },
            },
        };
        self.engine
            .store
            .update_branch(job.id, &resolved.branch)
            .await?;
        self.branch = Some(resolved.branch.clone());
        self.log.line(format!("Branch: {}", resolved.branch));
        Ok(resolved)
    }

    fn fetch_branches(&self) -> Vec<String> {
        let mut branches = vec![self.project.base_branch.clone()];
        if let Some(follow_up) = &self.follow_up
            && follow_up.branch != self.project.base_branch
        {
            branches.push(follow_up.branch.clone());
        }
        branches
    }

    fn git(&self, workdir: std::path::PathBuf) -> Git {
        let config = &self.engine.config;
        Git::new(
            workdir,
            config.git_limits(),
            config.metadata_limits(),
            self.registration.token().clone(),
        )
    }

    /// Single exit point: remove the workspace, persist, announce, unregister.
    async fn finalize(mut self, result: Result<Published, JobError>) -> JobStatus {
        self.cursor.finalize();
        self.log.stage(Stage::Finalize);

        let (status, published) = match result {
            Ok(published) => {
                self.log.line("Job completed.");
                (JobStatus::Completed, Some(published))
            }
            Err(err)
                if err.status() == JobStatus::Cancelled
                    || self.registration.token().is_cancelled() =>
            {
                info!("job cancelled");
                self.log.line("Job cancelled.");
                (JobStatus::Cancelled, None)
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "job failed");
                self.log.line(format!("Error: {err:#}"));
                (err.status(), None)
            }
        };

        if let Some(workspace) = self.workspace.take() {
            let path = workspace.path().display().to_string();
            match workspace.remove().await {
                Ok(()) => self.log.line("Workspace removed."),
                Err(err) => {
                    warn!(path = %path, err = %err, "workspace removal failed");
                    self.log
                        .line(format!("Failed to remove workspace {path}: {err:#}"));
                }
            }
        }

        let engine = Arc::clone(&self.engine);
        let id = self.job.id;
        engine.flusher.cancel(id);
        let (diff, description) = match published {
            Some(p) => (Some(p.diff), Some(p.description)),
            None => (None, None),
        };
        let outcome = JobOutcome {
            status,
            log: self.log.snapshot(),
            branch: self.branch.clone(),
            diff,
            description,
        };
        let stored = match engine.store.finish(id, &outcome).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(err = %err, "final persistence failed");
                status
            }
        };
        engine.bus.finish(id, stored);
        engine.registry.remove(&self.registration);
        info!(status = %stored, "job settled");
        stored
    }
}
