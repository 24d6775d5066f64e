//! One-line summaries of agent tool invocations for the job log.

use serde_json::Value;

const MAX_DETAIL: usize = 120;

/// Summarize a tool call as `[tool] Name detail`.
pub fn summarize_tool_use(tool: &str, input: &Value) -> String {
    match detail(input) {
        Some(detail) => format!("[tool] {tool} {}", truncate(&detail, MAX_DETAIL)),
        None => format!("[tool] {tool}"),
    }
}

fn detail(input: &Value) -> Option<String> {
    for key in ["file_path", "notebook_path", "path"] {
        if let Some(path) = input.get(key).and_then(Value::as_str) {
            return Some(path.to_string());
        }
    }
    if let Some(command) = input.get("command").and_then(Value::as_str) {
        return Some(format!("$ {}", first_line(command)));
    }
    if let Some(pattern) = input.get("pattern").and_then(Value::as_str) {
        return Some(format!("/{pattern}/"));
    }
    if let Some(url) = input.get("url").and_then(Value::as_str) {
        return Some(url.to_string());
    }
    None
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summarizes_file_tools_by_path() {
        assert_eq!(
            summarize_tool_use("Write", &json!({"file_path": "a.ts", "content": "x"})),
            "[tool] Write a.ts"
        );
    }

    #[test]
    fn summarizes_commands_by_first_line() {
        assert_eq!(
            summarize_tool_use("Bash", &json!({"command": "cargo test\necho done"})),
            "[tool] Bash $ cargo test"
        );
    }

    #[test]
    fn falls_back_to_tool_name() {
        assert_eq!(summarize_tool_use("TodoWrite", &json!({"todos": []})), "[tool] TodoWrite");
        assert_eq!(summarize_tool_use("Task", &Value::Null), "[tool] Task");
    }

    #[test]
    fn long_details_are_truncated() {
        let long = "x".repeat(500);
        let summary = summarize_tool_use("Read", &json!({ "file_path": long }));
        assert!(summary.ends_with('…'));
        assert!(summary.chars().count() < 140);
    }
}
