//! Repeat agent runs until the workspace changes or the budget runs out.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::engine::error::JobError;
use crate::engine::joblog::JobLog;
use crate::io::git::Git;
use crate::io::prompt::PromptBuilder;
use crate::io::tracker::IssueTracker;
use crate::provider::{AgentProvider, AgentRequest};

/// Extra attempts after the first one.
pub const MAX_RETRY: usize = 2;

pub struct RetryController<'a> {
    pub provider: Arc<dyn AgentProvider>,
    pub prompts: &'a PromptBuilder,
    pub git: &'a Git,
    pub log: &'a JobLog,
    pub cancel: &'a CancellationToken,
    pub agent_timeout: Duration,
}

impl RetryController<'_> {
    /// Run the agent up to `MAX_RETRY + 1` times and return the final output
    /// of the first run that left changes behind.
    #[instrument(skip_all, fields(provider = self.provider.name()))]
    pub async fn run(&self, base_prompt: &str) -> Result<String, JobError> {
        let mut prompt = base_prompt.to_string();
        for attempt in 0..=MAX_RETRY {
            if self.cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            if attempt > 0 {
                self.log
                    .line(format!("Retry {attempt}/{MAX_RETRY}: asking the agent to try again"));
            }
            let request = AgentRequest {
                prompt: prompt.clone(),
                workdir: self.git.workdir().to_path_buf(),
                timeout: self.agent_timeout,
                cancel: self.cancel.clone(),
            };
            let handle = self
                .provider
                .run_agent(request, Arc::new(self.log.clone()))
                .await?;
            let output = handle.wait().await?;

            if self.git.has_changes().await? {
                info!(attempt, "agent produced changes");
                return Ok(output);
            }
            self.log.line(format!(
                "Attempt {} finished without modifying any file.",
                attempt + 1
            ));
            if attempt < MAX_RETRY {
                prompt = self
                    .prompts
                    .retry_prompt(base_prompt, attempt + 1, &output)?;
            }
        }
        Err(JobError::NoChanges { retries: MAX_RETRY })
    }
}

/// Best-effort diagnostic comment on the issue after the budget ran out.
pub async fn report_exhaustion(
    tracker: &dyn IssueTracker,
    repo: &Path,
    issue_number: u64,
    log: &JobLog,
) {
    let body = format!(
        "The automated agent made {} attempts on this issue without changing any file. \
         The task may need more detail or a human look.",
        MAX_RETRY + 1
    );
    match tracker.comment(repo, issue_number, &body).await {
        Ok(()) => log.line(format!("Posted a diagnostic comment on issue #{issue_number}.")),
        Err(err) => {
            warn!(issue_number, err = %err, "diagnostic comment failed");
            log.line(format!("Could not comment on issue #{issue_number}: {err:#}"));
        }
    }
}
