//! Job execution engine.
//!
//! [`Engine::start`] registers a job's cancellation token, opens its log
//! topic and spawns the state machine ([`job`]), returning a [`Worker`]
//! immediately. The engine owns the only cross-job shared state: the
//! cancellation registry, the log bus and the flush timers.

pub mod error;
mod job;
pub mod joblog;
pub mod publish;
pub mod retry;

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::LogBus;
use crate::cancel::{CancellationRegistry, Registration};
use crate::core::types::{FollowUp, Job, JobId, JobOutcome, JobStatus, Project};
use crate::io::config::RunnerConfig;
use crate::io::prompt::PromptBuilder;
use crate::io::store::JobStore;
use crate::io::tracker::IssueTracker;
use crate::provider::ProviderRegistry;

pub use error::JobError;
pub use joblog::{FlushScheduler, JobLog};

pub(crate) struct EngineInner {
    pub(crate) config: RunnerConfig,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) tracker: Arc<dyn IssueTracker>,
    pub(crate) providers: ProviderRegistry,
    pub(crate) prompts: PromptBuilder,
    pub(crate) bus: Arc<LogBus>,
    pub(crate) registry: CancellationRegistry,
    pub(crate) flusher: Arc<FlushScheduler>,
}

/// Cheap to clone; clones share the same registries.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        config: RunnerConfig,
        store: Arc<dyn JobStore>,
        tracker: Arc<dyn IssueTracker>,
        providers: ProviderRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let bus = Arc::new(LogBus::from_config(&config.log));
        let flusher = Arc::new(FlushScheduler::new(config.flush_interval()));
        Ok(Self {
            inner: Arc::new(EngineInner {
                prompts: PromptBuilder::new()?,
                config,
                store,
                tracker,
                providers,
                bus,
                registry: CancellationRegistry::new(),
                flusher,
            }),
        })
    }

    /// Start a job and return without waiting for it.
    ///
    /// `job` must already be persisted with status `running`. Must be called
    /// from within a tokio runtime.
    pub fn start(&self, job: Job, project: Project, follow_up: Option<FollowUp>) -> Worker {
        let inner = Arc::clone(&self.inner);
        let id = job.id;
        let registration = inner.registry.register(id);
        inner.bus.open(id);
        let log = JobLog::new(
            id,
            Arc::clone(&inner.bus),
            Arc::clone(&inner.store),
            Arc::clone(&inner.flusher),
        );
        info!(job = %id, project = %project.id, "starting job");
        let run = job::JobRun::new(
            Arc::clone(&inner),
            job,
            project,
            follow_up,
            registration.clone(),
            log.clone(),
        );
        let token = registration.token().clone();
        let task = tokio::spawn(supervise(inner, registration, log, run));
        Worker {
            job_id: id,
            token,
            task,
        }
    }

    /// Cancel a job: mark it cancelled and stop whatever it is running.
    ///
    /// Returns false when the job was neither running in this engine nor
    /// still `running` in the store.
    pub async fn cancel(&self, job: JobId) -> Result<bool> {
        let marked = self.inner.store.request_cancel(job).await?;
        let fired = self.inner.registry.cancel(job);
        if fired || marked {
            info!(job = %job, fired, marked, "cancel requested");
        }
        Ok(fired || marked)
    }

    pub fn is_running(&self, job: JobId) -> bool {
        self.inner.registry.is_active(job)
    }

    pub fn bus(&self) -> &Arc<LogBus> {
        &self.inner.bus
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn tracker(&self) -> &Arc<dyn IssueTracker> {
        &self.inner.tracker
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }
}

/// Run the state machine on its own task so a panic still settles the job.
async fn supervise(
    inner: Arc<EngineInner>,
    registration: Registration,
    log: JobLog,
    run: job::JobRun,
) -> JobStatus {
    let id = registration.job();
    match tokio::spawn(run.run()).await {
        Ok(status) => status,
        Err(err) => {
            error!(job = %id, err = %err, "job task aborted");
            log.line(format!("Error: job task aborted: {err}"));
            inner.flusher.cancel(id);
            let outcome = JobOutcome {
                status: JobStatus::Failed,
                log: log.snapshot(),
                branch: None,
                diff: None,
                description: None,
            };
            let stored = match inner.store.finish(id, &outcome).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(job = %id, err = %err, "final persistence failed");
                    JobStatus::Failed
                }
            };
            inner.bus.finish(id, stored);
            inner.registry.remove(&registration);
            stored
        }
    }
}

/// Handle to a started job.
#[derive(Debug)]
pub struct Worker {
    job_id: JobId,
    token: CancellationToken,
    task: JoinHandle<JobStatus>,
}

impl Worker {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Stop the job; it unwinds through cleanup and settles as `cancelled`.
    pub fn kill(&self) {
        self.token.cancel();
    }

    /// Wait for the job to settle and return the persisted status.
    pub async fn wait(self) -> JobStatus {
        match self.task.await {
            Ok(status) => status,
            Err(err) => {
                error!(job = %self.job_id, err = %err, "job supervisor failed");
                JobStatus::Failed
            }
        }
    }
}
