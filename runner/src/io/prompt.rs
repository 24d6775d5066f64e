//! Prompt builder for agent runs.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::description::{DESCRIPTION_END, DESCRIPTION_START};

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const RETRY_TEMPLATE: &str = include_str!("prompts/retry.md");
/// Used when the workspace carries no pull-request template of its own.
pub const DEFAULT_PR_TEMPLATE: &str = include_str!("prompts/default_pr_template.md");

/// Checked in order; the first existing file wins.
const PR_TEMPLATE_PATHS: [&str; 4] = [
    ".github/pull_request_template.md",
    ".github/PULL_REQUEST_TEMPLATE.md",
    "PULL_REQUEST_TEMPLATE.md",
    "docs/pull_request_template.md",
];

/// Bytes of previous diff or previous output quoted back to the agent.
const QUOTE_LIMIT: usize = 20_000;

/// What the agent is asked to do.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptTask {
    Issue {
        number: u64,
        title: String,
        body: String,
    },
    Direct {
        title: String,
        body: String,
    },
    FollowUp {
        branch: String,
        title: String,
        feedback: String,
        previous_diff: Option<String>,
    },
}

/// All inputs needed to render the task prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub task: PromptTask,
    pub extra_instructions: Option<String>,
    /// Pull-request template the description block is filled from.
    pub pr_template: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptBuilder {
    env: Environment<'static>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .context("load task template")?;
        env.add_template("retry", RETRY_TEMPLATE)
            .context("load retry template")?;
        Ok(Self { env })
    }

    /// Render the initial prompt for a job.
    pub fn task_prompt(&self, input: &PromptInputs) -> Result<String> {
        let task = match &input.task {
            PromptTask::FollowUp {
                branch,
                title,
                feedback,
                previous_diff,
            } => PromptTask::FollowUp {
                branch: branch.clone(),
                title: title.clone(),
                feedback: feedback.trim().to_string(),
                previous_diff: previous_diff
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(|d| clip(d, QUOTE_LIMIT)),
            },
            other => other.clone(),
        };
        let template = self.env.get_template("task")?;
        let rendered = template
            .render(context! {
                task => task,
                extra_instructions => input
                    .extra_instructions
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty()),
                start_marker => DESCRIPTION_START,
                end_marker => DESCRIPTION_END,
                pr_template => input.pr_template.trim(),
            })
            .context("render task prompt")?;
        Ok(rendered)
    }

    /// Render the prompt for attempt `attempt` after a run left no changes.
    pub fn retry_prompt(
        &self,
        base_prompt: &str,
        attempt: usize,
        previous_output: &str,
    ) -> Result<String> {
        let template = self.env.get_template("retry")?;
        let rendered = template
            .render(context! {
                base_prompt => base_prompt.trim_end(),
                attempt => attempt,
                previous_output => clip(previous_output.trim(), QUOTE_LIMIT),
            })
            .context("render retry prompt")?;
        Ok(rendered)
    }
}

/// Read the workspace's pull-request template, or fall back to the default.
pub fn find_pr_template(workspace: &Path) -> Result<String> {
    for rel in PR_TEMPLATE_PATHS {
        let path = workspace.join(rel);
        if path.is_file() {
            debug!(path = %path.display(), "using repository PR template");
            return std::fs::read_to_string(&path)
                .with_context(|| format!("read PR template {}", path.display()));
        }
    }
    Ok(DEFAULT_PR_TEMPLATE.to_string())
}

/// Keep at most `limit` bytes, cut on a char boundary.
fn clip(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated]", &text[..end])
}
