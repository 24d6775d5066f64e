//! `patchrunner` command line.
//!
//! `check` probes an agent provider; `run` executes one job against a local
//! repository and streams its log to stdout until the job settles.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use patchrunner::bus::LogEvent;
use patchrunner::core::types::{FollowUp, Job, JobId, JobStatus, Project, ProjectId};
use patchrunner::engine::Engine;
use patchrunner::exit_codes;
use patchrunner::io::config::{RunnerConfig, load_config};
use patchrunner::io::store::{JobStore, MemoryStore};
use patchrunner::io::tracker::GhCli;
use patchrunner::logging;
use patchrunner::provider::{ProviderKind, ProviderRegistry};

#[derive(Parser)]
#[command(
    name = "patchrunner",
    version,
    about = "Run coding agents against a repository and push the result"
)]
struct Cli {
    /// Config file (TOML). Missing file means defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that an agent provider is installed and answers.
    Check {
        #[arg(long, default_value = "claude-code")]
        provider: String,
    },
    /// Run one job and stream its log.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Local checkout whose `origin` receives the branch.
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    #[arg(long, default_value = "main")]
    base: String,
    #[arg(long, default_value = "claude-code")]
    provider: String,
    #[arg(long, default_value = "feature")]
    task_type: String,
    #[arg(long, default_value = "")]
    title: String,
    #[arg(long, default_value = "")]
    body: String,
    /// Work on this issue (title and body are read from the tracker).
    #[arg(long, conflicts_with = "follow_up_branch")]
    issue: Option<u64>,
    /// Continue work on an existing remote branch.
    #[arg(long, requires = "feedback")]
    follow_up_branch: Option<String>,
    #[arg(long)]
    feedback: Option<String>,
    /// Appended to the agent prompt.
    #[arg(long)]
    instructions: Option<String>,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RunnerConfig::default(),
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Command::Check { provider } => cmd_check(&config, &provider).await,
            Command::Run(args) => cmd_run(config, args).await,
        }
    })
}

async fn cmd_check(config: &RunnerConfig, provider: &str) -> Result<i32> {
    let registry = ProviderRegistry::builtin(config);
    let provider = match registry.resolve_name(provider) {
        Ok(provider) => provider,
        Err(err) => {
            println!("{provider}: {err}");
            return Ok(exit_codes::FAILED);
        }
    };
    let check = provider.test_connection().await;
    println!("{}: {:?}: {}", provider.name(), check.kind, check.message);
    Ok(if check.ok {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

async fn cmd_run(config: RunnerConfig, args: RunArgs) -> Result<i32> {
    let kind: ProviderKind = args.provider.parse()?;
    let repo_path = std::fs::canonicalize(&args.repo)
        .with_context(|| format!("resolve repository {}", args.repo.display()))?;

    let store = Arc::new(MemoryStore::new());
    let project = store
        .insert_project(Project {
            id: ProjectId(0),
            repo_path,
            base_branch: args.base.clone(),
            provider: kind,
            extra_instructions: args.instructions.clone(),
        })
        .await?;
    let job = store
        .insert_job(Job::new(
            JobId(0),
            project.id,
            args.task_type.clone(),
            args.title.clone(),
            args.body.clone(),
            args.issue,
        ))
        .await?;
    let follow_up = args.follow_up_branch.clone().map(|branch| FollowUp {
        branch,
        feedback: args.feedback.clone().unwrap_or_default(),
        previous_diff: None,
    });

    let tracker = Arc::new(GhCli::new(config.metadata_limits()));
    let providers = ProviderRegistry::builtin(&config);
    let engine = Engine::new(config, store, tracker, providers)?;

    // Subscribe before the job starts so no line is missed.
    engine.bus().open(job.id);
    let mut subscription = engine.bus().subscribe(job.id)?;
    let worker = engine.start(job, project, follow_up);
    info!(job = %worker.job_id(), "job started");

    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            match event {
                LogEvent::Line(line) => println!("{line}"),
                LogEvent::Done(status) => return Some(status),
            }
        }
        None
    });

    let ctrl_c_engine = engine.clone();
    let job_id = worker.job_id();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, cancelling job {job_id}");
            if let Err(err) = ctrl_c_engine.cancel(job_id).await {
                warn!(err = %err, "cancel failed");
            }
        }
    });

    let status = worker.wait().await;
    interrupt.abort();
    match printer.await {
        Ok(Some(done)) if done != status => {
            warn!(bus = %done, worker = %status, "status mismatch");
        }
        Ok(_) => {}
        Err(err) => warn!(err = %err, "log printer failed"),
    }
    if status == JobStatus::Completed
        && let Ok(Some(stored)) = engine.store().job(job_id).await
        && let Some(branch) = stored.branch
    {
        println!("branch: {branch}");
    }
    Ok(exit_codes::for_status(status))
}
