//! Stable exit codes for `patchrunner` CLI commands.

use crate::core::types::JobStatus;

/// Job completed, or the provider check passed.
pub const OK: i32 = 0;
/// Job failed, the provider check failed, or the invocation was invalid.
pub const FAILED: i32 = 1;
/// Job was cancelled (Ctrl-C).
pub const CANCELLED: i32 = 2;

/// Exit code for a settled job.
pub fn for_status(status: JobStatus) -> i32 {
    match status {
        JobStatus::Completed => OK,
        JobStatus::Cancelled => CANCELLED,
        JobStatus::Running | JobStatus::Failed => FAILED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_map_to_distinct_codes() {
        assert_eq!(for_status(JobStatus::Completed), OK);
        assert_eq!(for_status(JobStatus::Failed), FAILED);
        assert_eq!(for_status(JobStatus::Cancelled), CANCELLED);
    }
}
