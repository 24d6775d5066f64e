//! Deterministic branch naming.
//!
//! Branch names are a pure function of the task type and either the issue
//! number or the job id, so a crashed job retried later lands on the same
//! branch.

use crate::core::types::JobId;

/// Map a free-form task type onto a branch prefix.
pub fn branch_prefix(task_type: &str) -> String {
    let slug = slugify(task_type);
    match slug.as_str() {
        "feature" | "feat" | "enhancement" => "feat".to_string(),
        "fix" | "bug" | "bugfix" => "fix".to_string(),
        "" => "task".to_string(),
        _ => slug,
    }
}

/// Branch for issue mode, e.g. `feat/42`.
pub fn issue_branch(task_type: &str, issue_number: u64) -> String {
    format!("{}/{issue_number}", branch_prefix(task_type))
}

/// Branch for direct mode, e.g. `fix/job-17`.
pub fn direct_branch(task_type: &str, job_id: JobId) -> String {
    format!("{}/job-{job_id}", branch_prefix(task_type))
}

fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true;
    for ch in input.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}
