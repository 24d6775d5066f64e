//! Fixed stage order of the job state machine.

use std::fmt;

/// Stages in execution order. Each stage is reachable only from its
/// predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    ContextResolution,
    Fetch,
    WorkspacePrepare,
    AgentRun,
    CommitPush,
    Finalize,
}

impl Stage {
    pub const ORDER: [Stage; 6] = [
        Stage::ContextResolution,
        Stage::Fetch,
        Stage::WorkspacePrepare,
        Stage::AgentRun,
        Stage::CommitPush,
        Stage::Finalize,
    ];

    pub fn next(self) -> Option<Stage> {
        let idx = Self::ORDER.iter().position(|s| *s == self)?;
        Self::ORDER.get(idx + 1).copied()
    }

    /// Banner line written to the job log when the stage begins.
    pub fn banner(self) -> String {
        format!("=== {} ===", self.label())
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::ContextResolution => "Resolving task context",
            Stage::Fetch => "Fetching from origin",
            Stage::WorkspacePrepare => "Preparing workspace",
            Stage::AgentRun => "Running agent",
            Stage::CommitPush => "Committing and pushing",
            Stage::Finalize => "Finalizing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Tracks the current stage and rejects out-of-order advances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCursor {
    current: Option<Stage>,
}

impl StageCursor {
    pub fn new() -> Self {
        Self { current: None }
    }

    pub fn current(&self) -> Option<Stage> {
        self.current
    }

    /// Advance to `stage`; only the successor of the current stage is allowed.
    pub fn advance(&mut self, stage: Stage) -> Result<Stage, String> {
        let expected = match self.current {
            None => Some(Stage::ContextResolution),
            Some(cur) => cur.next(),
        };
        if expected != Some(stage) {
            return Err(format!(
                "stage {stage:?} cannot follow {:?}",
                self.current
            ));
        }
        self.current = Some(stage);
        Ok(stage)
    }

    /// Jump to `Finalize`, which every exit path reaches from any stage.
    pub fn finalize(&mut self) {
        self.current = Some(Stage::Finalize);
    }
}

impl Default for StageCursor {
    fn default() -> Self {
        Self::new()
    }
}
