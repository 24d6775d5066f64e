//! Change-description extraction from the agent's final output.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::branch::branch_prefix;
use crate::core::types::ChangeDescription;

pub const DESCRIPTION_START: &str = "---PR_DESCRIPTION_START---";
pub const DESCRIPTION_END: &str = "---PR_DESCRIPTION_END---";

static DESCRIPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(
        r"(?s){}(.*?){}",
        regex::escape(DESCRIPTION_START),
        regex::escape(DESCRIPTION_END)
    );
    Regex::new(&pattern).expect("description marker pattern is a valid regex")
});

/// Return the text between the sentinel markers, trimmed.
///
/// When the markers appear more than once (for example the agent quoted the
/// instructions before answering), the last complete pair wins. An empty block
/// counts as absent.
pub fn extract_description(text: &str) -> Option<String> {
    DESCRIPTION_RE
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|body| !body.is_empty())
}

/// Description used when the agent did not emit one.
pub fn default_description(title: &str, issue_number: Option<u64>) -> String {
    match issue_number {
        Some(number) => format!(
            "## Summary\n\nAutomated change for #{number}: {title}\n\nCloses #{number}"
        ),
        None => format!("## Summary\n\nAutomated change: {title}"),
    }
}

/// Pull-request title for a job.
pub fn change_title(task_type: &str, title: &str, issue_number: Option<u64>) -> String {
    let prefix = branch_prefix(task_type);
    match issue_number {
        Some(number) => format!("{prefix}: {title} (#{number})"),
        None => format!("{prefix}: {title}"),
    }
}

/// Build the persisted change description from the agent's result text.
pub fn change_description(
    task_type: &str,
    title: &str,
    issue_number: Option<u64>,
    agent_result: &str,
) -> ChangeDescription {
    let body = extract_description(agent_result)
        .unwrap_or_else(|| default_description(title, issue_number));
    ChangeDescription {
        title: change_title(task_type, title, issue_number),
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_body_between_markers_verbatim() {
        let body = "## Summary\n\n- renamed `foo` to `bar`\n  * nested";
        let text = format!("I changed things.\n{DESCRIPTION_START}\n\n{body}\n\n{DESCRIPTION_END}\nDone.");
        assert_eq!(extract_description(&text).as_deref(), Some(body));
    }

    #[test]
    fn last_marker_pair_wins() {
        let text = format!(
            "{DESCRIPTION_START}template{DESCRIPTION_END} then {DESCRIPTION_START} real {DESCRIPTION_END}"
        );
        assert_eq!(extract_description(&text).as_deref(), Some("real"));
    }

    #[test]
    fn missing_or_unterminated_markers_yield_none() {
        assert_eq!(extract_description("no markers here"), None);
        assert_eq!(extract_description(&format!("{DESCRIPTION_START} open")), None);
        assert_eq!(
            extract_description(&format!("{DESCRIPTION_START}  \n {DESCRIPTION_END}")),
            None
        );
    }

    #[test]
    fn default_description_references_issue() {
        let desc = change_description("feature", "Add login", Some(42), "nothing");
        assert_eq!(desc.title, "feat: Add login (#42)");
        assert!(desc.body.contains("Closes #42"));

        let direct = change_description("fix", "Typo", None, "");
        assert_eq!(direct.title, "fix: Typo");
        assert!(!direct.body.contains("Closes"));
    }
}
