//! Test-only helpers: scratch git repositories, a scripted agent provider and
//! an in-memory issue tracker.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::core::stream::AgentCallbacks;
use crate::core::types::{Job, JobId, Project, ProjectId};
use crate::engine::Engine;
use crate::io::config::RunnerConfig;
use crate::io::git::Git;
use crate::io::process::RunLimits;
use crate::io::store::{JobStore, MemoryStore};
use crate::io::tracker::{Issue, IssueTracker, NewIssue, NewPullRequest};
use crate::provider::{
    AgentHandle, AgentProvider, AgentRequest, ConnectionCheck, ProviderError, ProviderKind,
    ProviderRegistry,
};

/// Run git synchronously in `dir` with a fixed identity.
pub fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .env_remove("GIT_DIR")
        .env_remove("GIT_WORK_TREE")
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Initialize a repository on `main` with one committed README.
pub fn init_repo(dir: &Path) {
    git(dir, &["init", "-q"]).expect("git init");
    git(dir, &["checkout", "-q", "-b", "main"]).expect("checkout main");
    std::fs::write(dir.join("README.md"), "# scratch\n").expect("write README");
    git(dir, &["add", "-A"]).expect("git add");
    git(dir, &["commit", "-q", "-m", "init"]).expect("git commit");
}

/// Async [`Git`] bound to `dir` with generous limits.
pub fn git_for(dir: &Path, cancel: CancellationToken) -> Git {
    let limits = RunLimits {
        timeout: Duration::from_secs(60),
        output_limit_bytes: 1_000_000,
        kill_grace: Duration::from_millis(200),
    };
    Git::new(dir, limits, limits, cancel)
}

/// Commit `file` on top of `branch` in `origin` from a throwaway clone, the
/// way another client pushing to the same remote would.
pub fn commit_to_remote_branch(
    origin: &Path,
    branch: &str,
    file: &str,
    contents: &str,
    message: &str,
) -> Result<()> {
    let scratch = tempfile::tempdir().context("tempdir")?;
    let clone = scratch.path().join("clone");
    let origin_url = origin.display().to_string();
    let clone_str = clone.display().to_string();
    git(
        scratch.path(),
        &["clone", "-q", "--branch", branch, &origin_url, &clone_str],
    )?;
    std::fs::write(clone.join(file), contents)?;
    git(&clone, &["add", "-A"])?;
    git(&clone, &["commit", "-q", "-m", message])?;
    git(&clone, &["push", "-q", "origin", &format!("HEAD:refs/heads/{branch}")])?;
    Ok(())
}

/// A bare `origin` plus a local project checkout of `main` pushed to it.
pub struct TestRepo {
    root: TempDir,
    origin: PathBuf,
    project: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let root = tempfile::tempdir().context("tempdir")?;
        let origin = root.path().join("origin.git");
        let project = root.path().join("project");
        std::fs::create_dir_all(&origin)?;
        std::fs::create_dir_all(&project)?;

        git(&origin, &["init", "-q", "--bare"])?;
        git(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"])?;

        init_repo(&project);
        let origin_url = origin.display().to_string();
        git(&project, &["remote", "add", "origin", &origin_url])?;
        git(&project, &["push", "-q", "-u", "origin", "main"])?;
        Ok(Self {
            root,
            origin,
            project,
        })
    }

    pub fn project_path(&self) -> &Path {
        &self.project
    }

    pub fn origin_path(&self) -> &Path {
        &self.origin
    }

    /// Directory for job workspaces, inside the scratch root.
    pub fn workspace_root(&self) -> PathBuf {
        self.root.path().join("workspaces")
    }

    /// Push a branch with one extra commit straight to `origin`.
    pub fn push_remote_branch(&self, branch: &str, file: &str, contents: &str) -> Result<()> {
        let scratch = self.root.path().join(format!("scratch-{}", branch.replace('/', "-")));
        let origin_url = self.origin.display().to_string();
        let scratch_str = scratch.display().to_string();
        git(
            self.root.path(),
            &["clone", "-q", "--branch", "main", &origin_url, &scratch_str],
        )?;
        git(&scratch, &["checkout", "-q", "-b", branch])?;
        let path = scratch.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        git(&scratch, &["add", "-A"])?;
        git(&scratch, &["commit", "-q", "-m", &format!("seed {branch}")])?;
        let refspec = format!("HEAD:refs/heads/{branch}");
        git(&scratch, &["push", "-q", "origin", &refspec])?;
        Ok(())
    }

    /// Branch names present on `origin`.
    pub fn remote_branches(&self) -> Result<Vec<String>> {
        let out = git(
            &self.origin,
            &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
        )?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// File contents at the tip of `branch` on `origin`, if present.
    pub fn remote_file(&self, branch: &str, file: &str) -> Option<String> {
        git(&self.origin, &["show", &format!("{branch}:{file}")]).ok()
    }

    /// Full message of the tip commit of `branch` on `origin`.
    pub fn remote_commit_message(&self, branch: &str) -> Result<String> {
        git(&self.origin, &["log", "-1", "--format=%B", branch])
    }

    pub fn project(&self) -> Project {
        Project {
            id: ProjectId(0),
            repo_path: self.project.clone(),
            base_branch: "main".to_string(),
            provider: ProviderKind::ClaudeCode,
            extra_instructions: None,
        }
    }

    /// Config with workspaces under the scratch root and short timeouts.
    pub fn config(&self) -> RunnerConfig {
        let mut config = RunnerConfig::default();
        config.workspace_root = Some(self.workspace_root());
        config.timeouts.git_secs = 60;
        config.timeouts.metadata_secs = 30;
        config.timeouts.agent_secs = 30;
        config.timeouts.kill_grace_secs = 1;
        config.log.flush_interval_ms = 50;
        config
    }

    /// Entries left under the workspace root.
    pub fn leftover_workspaces(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.workspace_root()) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Engine over a fresh [`MemoryStore`] with `provider` as `claude-code`.
pub fn engine_with(
    config: RunnerConfig,
    provider: Arc<dyn AgentProvider>,
    tracker: Arc<dyn IssueTracker>,
) -> (Engine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let mut providers = ProviderRegistry::new();
    providers.register(ProviderKind::ClaudeCode, provider);
    let engine = Engine::new(config, store.clone(), tracker, providers).expect("engine");
    (engine, store)
}

/// Persist `project` and a running job for it.
pub async fn seed_job(
    store: &MemoryStore,
    project: Project,
    task_type: &str,
    title: &str,
    body: &str,
    issue_number: Option<u64>,
) -> (Job, Project) {
    let project = store.insert_project(project).await.expect("project");
    let job = store
        .insert_job(Job::new(
            JobId(0),
            project.id,
            task_type,
            title,
            body,
            issue_number,
        ))
        .await
        .expect("job");
    (job, project)
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Write `contents` to `path` (relative to the workdir), then finish.
    Write {
        path: String,
        contents: String,
        output: String,
    },
    NoChange {
        output: String,
    },
    Fail {
        code: i32,
        stderr: String,
    },
    /// Run until killed.
    Hang,
    /// Call `hook` on a blocking thread mid-run, then behave like `then`.
    Hooked { hook: RunHook, then: Box<ScriptedRun> },
}

/// Side effect a [`ScriptedRun::Hooked`] run performs while the agent "works".
#[derive(Clone)]
pub struct RunHook(Arc<dyn Fn() -> Result<()> + Send + Sync>);

impl RunHook {
    pub fn new(hook: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }

    async fn call(&self) -> Result<(), ProviderError> {
        let hook = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || hook())
            .await
            .map_err(|e| ProviderError::Other(e.into()))?
            .map_err(ProviderError::Other)
    }
}

impl std::fmt::Debug for RunHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RunHook")
    }
}

impl ScriptedRun {
    pub fn write(path: &str, contents: &str, output: &str) -> Self {
        ScriptedRun::Write {
            path: path.to_string(),
            contents: contents.to_string(),
            output: output.to_string(),
        }
    }

    pub fn no_change(output: &str) -> Self {
        ScriptedRun::NoChange {
            output: output.to_string(),
        }
    }

    /// `self`, preceded by `hook`.
    pub fn after(self, hook: RunHook) -> Self {
        ScriptedRun::Hooked {
            hook,
            then: Box::new(self),
        }
    }
}

/// [`AgentProvider`] that replays [`ScriptedRun`]s in order.
///
/// Once the script is exhausted every further run is a no-change run.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptedRun>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ScriptedRun>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn runs(&self) -> usize {
        self.prompts.lock().len()
    }

    /// Poll until at least `n` runs started (or five seconds pass).
    pub async fn wait_for_runs(&self, n: usize) {
        for _ in 0..500 {
            if self.runs() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn test_connection(&self) -> ConnectionCheck {
        ConnectionCheck::ready("scripted 1.0")
    }

    async fn run_agent(
        &self,
        request: AgentRequest,
        callbacks: Arc<dyn AgentCallbacks>,
    ) -> Result<AgentHandle, ProviderError> {
        if request.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        self.prompts.lock().push(request.prompt.clone());
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedRun::no_change(""));
        let kill = request.cancel.child_token();
        let token = kill.clone();
        let workdir = request.workdir.clone();
        let task = tokio::spawn(async move {
            let mut step = step;
            while let ScriptedRun::Hooked { hook, then } = step {
                hook.call().await?;
                step = *then;
            }
            match step {
                ScriptedRun::Hooked { .. } => unreachable!("hooks unwrapped above"),
                ScriptedRun::Write {
                    path,
                    contents,
                    output,
                } => {
                    callbacks.on_tool_use("Write", &json!({ "file_path": path }));
                    let target = workdir.join(&path);
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| ProviderError::Other(e.into()))?;
                    }
                    tokio::fs::write(&target, contents)
                        .await
                        .map_err(|e| ProviderError::Other(e.into()))?;
                    callbacks.on_text(&output);
                    Ok(output)
                }
                ScriptedRun::NoChange { output } => {
                    callbacks.on_text(&output);
                    Ok(output)
                }
                ScriptedRun::Fail { code, stderr } => {
                    callbacks.on_text(&stderr);
                    Err(ProviderError::Exit {
                        code: Some(code),
                        stderr,
                    })
                }
                ScriptedRun::Hang => {
                    token.cancelled().await;
                    Err(ProviderError::Cancelled)
                }
            }
        });
        Ok(AgentHandle::new(kill, task))
    }
}

/// In-memory [`IssueTracker`].
#[derive(Debug, Default)]
pub struct FakeTracker {
    issues: Mutex<HashMap<u64, Issue>>,
    comments: Mutex<Vec<(u64, String)>>,
    comment_attempts: Mutex<usize>,
    fail_comments: bool,
    pull_requests: Mutex<Vec<NewPullRequest>>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issue(self, number: u64, title: &str, body: &str) -> Self {
        self.issues.lock().insert(
            number,
            Issue {
                title: title.to_string(),
                body: body.to_string(),
            },
        );
        self
    }

    pub fn failing_comments(mut self) -> Self {
        self.fail_comments = true;
        self
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.comments.lock().clone()
    }

    pub fn comment_attempts(&self) -> usize {
        *self.comment_attempts.lock()
    }

    pub fn pull_requests(&self) -> Vec<NewPullRequest> {
        self.pull_requests.lock().clone()
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn read_issue(&self, _repo: &Path, number: u64) -> Result<Issue> {
        self.issues
            .lock()
            .get(&number)
            .cloned()
            .ok_or_else(|| anyhow!("issue #{number} not found"))
    }

    async fn create_issue(&self, _repo: &Path, issue: &NewIssue) -> Result<u64> {
        let mut issues = self.issues.lock();
        let number = issues.keys().max().copied().unwrap_or(0) + 1;
        issues.insert(
            number,
            Issue {
                title: issue.title.clone(),
                body: issue.body.clone(),
            },
        );
        Ok(number)
    }

    async fn comment(&self, _repo: &Path, number: u64, body: &str) -> Result<()> {
        *self.comment_attempts.lock() += 1;
        if self.fail_comments {
            return Err(anyhow!("comment rejected"));
        }
        self.comments.lock().push((number, body.to_string()));
        Ok(())
    }

    async fn create_pull_request(&self, _repo: &Path, pr: &NewPullRequest) -> Result<String> {
        let mut prs = self.pull_requests.lock();
        prs.push(pr.clone());
        Ok(format!("https://example.test/pull/{}", prs.len()))
    }
}

/// [`AgentCallbacks`] that records everything it sees.
#[derive(Debug, Default)]
pub struct RecordingCallbacks {
    tools: Mutex<Vec<(String, Value)>>,
    texts: Mutex<Vec<String>>,
}

impl RecordingCallbacks {
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }
}

impl AgentCallbacks for RecordingCallbacks {
    fn on_tool_use(&self, tool: &str, input: &Value) {
        self.tools.lock().push((tool.to_string(), input.clone()));
    }

    fn on_text(&self, text: &str) {
        self.texts.lock().push(text.to_string());
    }
}
