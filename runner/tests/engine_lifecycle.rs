//! End-to-end job lifecycle tests.
//!
//! Each test drives the real engine against a scratch bare `origin` and a
//! local project clone, with a scripted agent and an in-memory tracker.

use std::sync::Arc;

use patchrunner::bus::LogEvent;
use patchrunner::core::types::{FollowUp, JobStatus};
use patchrunner::io::store::JobStore;
use patchrunner::test_support::{
    FakeTracker, RunHook, ScriptedProvider, ScriptedRun, TestRepo, commit_to_remote_branch,
    engine_with, seed_job,
};

#[tokio::test]
async fn direct_job_completes_and_pushes_branch() {
    let repo = TestRepo::new().expect("repo");
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedRun::write(
        "src/greeting.txt",
        "hello\n",
        "Added a greeting.\n---PR_DESCRIPTION_START---\nAdds greeting.txt\n---PR_DESCRIPTION_END---",
    )]));
    let (engine, store) = engine_with(repo.config(), provider.clone(), Arc::new(FakeTracker::new()));
    let (job, project) = seed_job(&store, repo.project(), "feature", "Add greeting", "Say hi", None).await;

    engine.bus().open(job.id);
    let mut events = engine.bus().subscribe(job.id).expect("subscribe");
    let status = engine.start(job.clone(), project, None).wait().await;
    assert_eq!(status, JobStatus::Completed);

    let stored = store.job(job.id).await.expect("read").expect("job");
    assert_eq!(stored.status, JobStatus::Completed);
    let branch = stored.branch.expect("branch");
    assert_eq!(branch, format!("feat/job-{}", job.id));
    assert!(stored.diff.as_deref().unwrap_or_default().contains("greeting.txt"));
    assert_eq!(stored.pr_body.as_deref(), Some("Adds greeting.txt"));
    assert!(stored.log.contains("Job completed."));

    assert_eq!(repo.remote_file(&branch, "src/greeting.txt").as_deref(), Some("hello\n"));
    let message = repo.remote_commit_message(&branch).expect("commit message");
    assert!(message.starts_with("feature: Add greeting"));
    assert!(message.contains("Co-authored-by:"));
    assert!(repo.leftover_workspaces().is_empty());
    assert!(provider.prompts()[0].contains("Say hi"));

    let mut saw_done = None;
    while let Some(event) = events.recv().await {
        if let LogEvent::Done(status) = event {
            saw_done = Some(status);
        }
    }
    assert_eq!(saw_done, Some(JobStatus::Completed));
    assert!(!engine.is_running(job.id));
}

#[tokio::test]
async fn issue_without_changes_fails_after_retries_and_comments_once() {
    let repo = TestRepo::new().expect("repo");
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedRun::no_change("looked around"),
        ScriptedRun::no_change("still nothing"),
        ScriptedRun::no_change("gave up"),
    ]));
    let tracker = Arc::new(FakeTracker::new().with_issue(42, "Add login", "Users need to log in"));
    let (engine, store) = engine_with(repo.config(), provider.clone(), tracker.clone());
    let (job, project) = seed_job(&store, repo.project(), "feature", "", "", Some(42)).await;

    let status = engine.start(job.clone(), project, None).wait().await;
    assert_eq!(status, JobStatus::Failed);

    let stored = store.job(job.id).await.expect("read").expect("job");
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.title, "Add login");
    assert_eq!(stored.branch.as_deref(), Some("feat/42"));
    assert!(stored.log.contains("No changes detected after 2 retries."));
    assert_eq!(provider.runs(), 3);
    assert!(provider.prompts()[0].contains("Users need to log in"));

    let comments = tracker.comments();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].0, 42);
    assert!(!repo.remote_branches().expect("branches").contains(&"feat/42".to_string()));
    assert!(repo.leftover_workspaces().is_empty());
}

#[tokio::test]
async fn failing_diagnostic_comment_does_not_change_outcome() {
    let repo = TestRepo::new().expect("repo");
    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let tracker = Arc::new(
        FakeTracker::new()
            .with_issue(7, "Flaky", "")
            .failing_comments(),
    );
    let (engine, store) = engine_with(repo.config(), provider, tracker.clone());
    let (job, project) = seed_job(&store, repo.project(), "bug", "", "", Some(7)).await;

    let status = engine.start(job.clone(), project, None).wait().await;
    assert_eq!(status, JobStatus::Failed);
    assert_eq!(tracker.comment_attempts(), 1);
    let stored = store.job(job.id).await.expect("read").expect("job");
    assert!(stored.log.contains("No changes detected after 2 retries."));
    assert!(stored.log.contains("Could not comment on issue #7"));
}

#[tokio::test]
async fn follow_up_checks_out_existing_remote_branch() {
    let repo = TestRepo::new().expect("repo");
    repo.push_remote_branch("feat/42", "login.txt", "v1\n").expect("seed branch");
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedRun::write(
        "login.txt",
        "v2\n",
        "Applied the feedback.",
    )]));
    let (engine, store) = engine_with(repo.config(), provider.clone(), Arc::new(FakeTracker::new()));
    let (job, project) = seed_job(&store, repo.project(), "feature", "Add login", "", Some(42)).await;
    let follow_up = FollowUp {
        branch: "feat/42".to_string(),
        feedback: "Use v2 please".to_string(),
        previous_diff: None,
    };

    let status = engine.start(job.clone(), project, Some(follow_up)).wait().await;
    assert_eq!(status, JobStatus::Completed);

    let stored = store.job(job.id).await.expect("read").expect("job");
    assert_eq!(stored.branch.as_deref(), Some("feat/42"));
    assert!(stored.log.contains("Checking out feat/42 from origin"));
    assert_eq!(repo.remote_file("feat/42", "login.txt").as_deref(), Some("v2\n"));
    // The seed commit is still the parent: the follow-up built on the branch.
    let log = patchrunner::test_support::git(repo.origin_path(), &["log", "--format=%s", "feat/42"])
        .expect("git log");
    assert!(log.lines().any(|subject| subject == "seed feat/42"));
    assert!(provider.prompts()[0].contains("Use v2 please"));
}

#[tokio::test]
async fn follow_up_push_rejected_when_remote_moved() {
    let repo = TestRepo::new().expect("repo");
    repo.push_remote_branch("feat/42", "login.txt", "v1\n").expect("seed branch");
    let origin = repo.origin_path().to_path_buf();
    // Someone else pushes to the branch while the agent is working.
    let external_push = RunHook::new(move || {
        commit_to_remote_branch(&origin, "feat/42", "login.txt", "theirs\n", "external edit")
    });
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedRun::write("login.txt", "ours\n", "Applied the feedback.").after(external_push),
    ]));
    let (engine, store) = engine_with(repo.config(), provider, Arc::new(FakeTracker::new()));
    let (job, project) = seed_job(&store, repo.project(), "feature", "Add login", "", Some(42)).await;
    let follow_up = FollowUp {
        branch: "feat/42".to_string(),
        feedback: "Use ours".to_string(),
        previous_diff: None,
    };

    let status = engine.start(job.clone(), project, Some(follow_up)).wait().await;
    assert_eq!(status, JobStatus::Failed);

    assert_eq!(repo.remote_file("feat/42", "login.txt").as_deref(), Some("theirs\n"));
    assert_eq!(
        repo.remote_commit_message("feat/42").expect("message").trim(),
        "external edit"
    );
    let stored = store.job(job.id).await.expect("read").expect("job");
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.log.contains("Error: "), "{}", stored.log);
    assert!(stored.log.contains("--force-with-lease"), "{}", stored.log);
    assert!(repo.leftover_workspaces().is_empty());
}

#[tokio::test]
async fn follow_up_on_base_branch_fails_without_push() {
    let repo = TestRepo::new().expect("repo");
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedRun::write(
        "oops.txt",
        "x\n",
        "done",
    )]));
    let (engine, store) = engine_with(repo.config(), provider, Arc::new(FakeTracker::new()));
    let (job, project) = seed_job(&store, repo.project(), "fix", "Touch main", "", None).await;
    let follow_up = FollowUp {
        branch: "main".to_string(),
        feedback: "again".to_string(),
        previous_diff: None,
    };

    let status = engine.start(job.clone(), project, Some(follow_up)).wait().await;
    assert_eq!(status, JobStatus::Failed);
    let stored = store.job(job.id).await.expect("read").expect("job");
    assert!(stored.log.contains("refusing to commit on base branch 'main'"));
    assert!(repo.remote_file("main", "oops.txt").is_none());
    assert!(repo.leftover_workspaces().is_empty());
}

#[tokio::test]
async fn cancel_before_start_settles_cancelled_without_agent() {
    let repo = TestRepo::new().expect("repo");
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedRun::write("a.txt", "a", "ok")]));
    let (engine, store) = engine_with(repo.config(), provider.clone(), Arc::new(FakeTracker::new()));
    let (job, project) = seed_job(&store, repo.project(), "feature", "Never", "", None).await;

    assert!(store.request_cancel(job.id).await.expect("cancel"));
    let status = engine.start(job.clone(), project, None).wait().await;
    assert_eq!(status, JobStatus::Cancelled);

    let stored = store.job(job.id).await.expect("read").expect("job");
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert!(stored.log.contains("Job cancelled."));
    assert!(!stored.log.contains("Error:"));
    assert_eq!(provider.runs(), 0);
    assert_eq!(repo.remote_branches().expect("branches"), vec!["main".to_string()]);
}

#[tokio::test]
async fn cancel_right_after_start_stops_before_any_subprocess() {
    let repo = TestRepo::new().expect("repo");
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedRun::write("a.txt", "a", "ok")]));
    let (engine, store) = engine_with(repo.config(), provider.clone(), Arc::new(FakeTracker::new()));
    let (job, project) = seed_job(&store, repo.project(), "feature", "Never", "", None).await;

    let worker = engine.start(job.clone(), project, None);
    assert!(engine.cancel(job.id).await.expect("cancel"));
    assert_eq!(worker.wait().await, JobStatus::Cancelled);
    assert_eq!(provider.runs(), 0);
    assert!(repo.leftover_workspaces().is_empty());
}

#[tokio::test]
async fn cancel_during_agent_run_removes_workspace() {
    let repo = TestRepo::new().expect("repo");
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedRun::Hang]));
    let (engine, store) = engine_with(repo.config(), provider.clone(), Arc::new(FakeTracker::new()));
    let (job, project) = seed_job(&store, repo.project(), "feature", "Slow", "", None).await;

    let worker = engine.start(job.clone(), project, None);
    provider.wait_for_runs(1).await;
    assert_eq!(provider.runs(), 1);
    assert_eq!(repo.leftover_workspaces().len(), 1);

    assert!(engine.cancel(job.id).await.expect("cancel"));
    assert_eq!(worker.wait().await, JobStatus::Cancelled);

    let stored = store.job(job.id).await.expect("read").expect("job");
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert!(stored.log.contains("Workspace removed."));
    assert!(repo.leftover_workspaces().is_empty());
    assert_eq!(repo.remote_branches().expect("branches"), vec!["main".to_string()]);
}

#[tokio::test]
async fn agent_failure_marks_job_failed() {
    let repo = TestRepo::new().expect("repo");
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedRun::Fail {
        code: 3,
        stderr: "rate limited".to_string(),
    }]));
    let (engine, store) = engine_with(repo.config(), provider.clone(), Arc::new(FakeTracker::new()));
    let (job, project) = seed_job(&store, repo.project(), "feature", "Boom", "", None).await;

    let status = engine.start(job.clone(), project, None).wait().await;
    assert_eq!(status, JobStatus::Failed);
    let stored = store.job(job.id).await.expect("read").expect("job");
    assert!(stored.log.contains("Error:"));
    assert!(stored.log.contains("rate limited"));
    assert_eq!(provider.runs(), 1);
    assert!(repo.leftover_workspaces().is_empty());
}

#[tokio::test]
async fn stale_remote_branch_is_replaced() {
    let repo = TestRepo::new().expect("repo");
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedRun::write(
        "fresh.txt",
        "new\n",
        "done",
    )]));
    let (engine, store) = engine_with(repo.config(), provider, Arc::new(FakeTracker::new()));
    let (job, project) = seed_job(&store, repo.project(), "feature", "Redo", "", None).await;
    let branch = format!("feat/job-{}", job.id);
    repo.push_remote_branch(&branch, "stale.txt", "old\n").expect("seed stale branch");

    let status = engine.start(job.clone(), project, None).wait().await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(repo.remote_file(&branch, "fresh.txt").as_deref(), Some("new\n"));
    assert!(repo.remote_file(&branch, "stale.txt").is_none());
    let stored = store.job(job.id).await.expect("read").expect("job");
    assert!(stored.log.contains("already exists"));
}

#[tokio::test]
async fn subscriber_after_settle_gets_done_immediately() {
    let repo = TestRepo::new().expect("repo");
    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let (engine, store) = engine_with(repo.config(), provider, Arc::new(FakeTracker::new()));
    let (job, project) = seed_job(&store, repo.project(), "feature", "Nothing", "", None).await;

    let status = engine.start(job.clone(), project, None).wait().await;
    assert_eq!(status, JobStatus::Failed);

    let mut late = engine.bus().subscribe(job.id).expect("subscribe");
    assert_eq!(late.recv().await, Some(LogEvent::Done(JobStatus::Failed)));
    assert_eq!(late.recv().await, None);
}
