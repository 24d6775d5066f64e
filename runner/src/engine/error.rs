//! Job-level error kinds.

use thiserror::Error;

use crate::core::types::JobStatus;
use crate::io::process::is_cancelled;
use crate::provider::ProviderError;

/// Why a job stopped short of completing.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job's token fired or the job was marked cancelled. Not a failure.
    #[error("job cancelled")]
    Cancelled,
    #[error("No changes detected after {retries} retries.")]
    NoChanges { retries: usize },
    #[error("refusing to commit on base branch '{branch}'")]
    OnBaseBranch { branch: String },
    #[error(transparent)]
    Fatal(anyhow::Error),
}

impl JobError {
    /// Terminal status this error settles the job with.
    pub fn status(&self) -> JobStatus {
        match self {
            JobError::Cancelled => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        if is_cancelled(&err) {
            JobError::Cancelled
        } else {
            JobError::Fatal(err)
        }
    }
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => JobError::Cancelled,
            ProviderError::Other(err) => err.into(),
            other => JobError::Fatal(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::process::Cancelled;
    use anyhow::Context;

    #[test]
    fn cancelled_sentinel_survives_context_layers() {
        let err: anyhow::Result<()> = Err(Cancelled.into());
        let err = err.context("run git fetch").unwrap_err();
        assert!(matches!(JobError::from(err), JobError::Cancelled));
    }

    #[test]
    fn provider_errors_map_to_statuses() {
        assert_eq!(
            JobError::from(ProviderError::Cancelled).status(),
            JobStatus::Cancelled
        );
        let exit = JobError::from(ProviderError::Exit {
            code: Some(1),
            stderr: "boom".to_string(),
        });
        assert_eq!(exit.status(), JobStatus::Failed);
        assert!(exit.to_string().contains("boom"));
    }

    #[test]
    fn exhaustion_message_is_stable() {
        let err = JobError::NoChanges { retries: 2 };
        assert_eq!(err.to_string(), "No changes detected after 2 retries.");
    }
}
