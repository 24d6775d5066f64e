//! HTTP route handlers for the job API.

use std::path::PathBuf;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use patchrunner::core::types::{FollowUp, Job, JobId, Project, ProjectId};
use patchrunner::io::store::JobStore;
use patchrunner::provider::ProviderKind;

use crate::sse;
use crate::state::AppState;

type ApiError = (StatusCode, String);

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/projects", post(create_project))
        .route("/jobs", post(create_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/events", get(sse::job_events))
}

async fn health() -> &'static str {
    "ok"
}

fn default_base() -> String {
    "main".to_string()
}

fn default_provider() -> String {
    ProviderKind::ClaudeCode.as_str().to_string()
}

fn default_task_type() -> String {
    "feature".to_string()
}

#[derive(Debug, Deserialize)]
struct CreateProject {
    repo_path: PathBuf,
    #[serde(default = "default_base")]
    base_branch: String,
    #[serde(default = "default_provider")]
    provider: String,
    #[serde(default)]
    extra_instructions: Option<String>,
}

/// POST /api/projects
async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProject>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let provider: ProviderKind = req
        .provider
        .parse()
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("{err}")))?;
    let project = state
        .engine
        .store()
        .insert_project(Project {
            id: ProjectId(0),
            repo_path: req.repo_path,
            base_branch: req.base_branch,
            provider,
            extra_instructions: req.extra_instructions,
        })
        .await
        .map_err(internal)?;
    info!(project = %project.id, "project created");
    Ok((StatusCode::CREATED, Json(project)))
}

#[derive(Debug, Deserialize)]
struct CreateJob {
    project_id: ProjectId,
    #[serde(default = "default_task_type")]
    task_type: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    issue_number: Option<u64>,
    #[serde(default)]
    follow_up: Option<FollowUp>,
}

/// POST /api/jobs - persist a running job and start it.
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJob>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    if req.issue_number.is_none() && req.title.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "title is required without an issue number".to_string(),
        ));
    }
    let store = state.engine.store();
    let project = store
        .project(req.project_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("project {} not found", req.project_id),
            )
        })?;
    let job = store
        .insert_job(Job::new(
            JobId(0),
            project.id,
            req.task_type,
            req.title,
            req.body,
            req.issue_number,
        ))
        .await
        .map_err(internal)?;
    // The worker handle is not kept; cancellation goes through the engine.
    let _worker = state.engine.start(job.clone(), project, req.follow_up);
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /api/jobs/{id}
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Job>, ApiError> {
    let job = JobId(id);
    state
        .engine
        .store()
        .job(job)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found(job))
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct CancelResponse {
    cancelled: bool,
}

/// POST /api/jobs/{id}/cancel
async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job = JobId(id);
    if state.engine.store().job(job).await.map_err(internal)?.is_none() {
        return Err(not_found(job));
    }
    let cancelled = state.engine.cancel(job).await.map_err(internal)?;
    Ok(Json(CancelResponse { cancelled }))
}

fn not_found(job: JobId) -> ApiError {
    (StatusCode::NOT_FOUND, format!("job {job} not found"))
}

fn internal(err: anyhow::Error) -> ApiError {
    warn!(err = %format!("{err:#}"), "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use patchrunner::core::types::JobStatus;
    use patchrunner::io::config::RunnerConfig;
    use patchrunner::test_support::{
        FakeTracker, ScriptedProvider, ScriptedRun, TestRepo, engine_with,
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::app;

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request");
        let response = app(state.clone()).oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, value)
    }

    fn idle_state() -> AppState {
        let (engine, _) = engine_with(
            RunnerConfig::default(),
            Arc::new(ScriptedProvider::default()),
            Arc::new(FakeTracker::new()),
        );
        AppState::new(engine)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (status, body) = call(&idle_state(), "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("ok".to_string()));
    }

    #[tokio::test]
    async fn unknown_provider_is_bad_request() {
        let body = json!({ "repo_path": "/tmp/x", "provider": "copilot" });
        let (status, body) = call(&idle_state(), "POST", "/api/projects", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.as_str().unwrap_or_default().contains("provider not found"));
    }

    #[tokio::test]
    async fn job_for_unknown_project_is_not_found() {
        let body = json!({ "project_id": 9, "title": "x" });
        let (status, _) = call(&idle_state(), "POST", "/api/jobs", Some(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn direct_job_without_title_is_rejected() {
        let state = idle_state();
        let (_, project) = call(
            &state,
            "POST",
            "/api/projects",
            Some(json!({ "repo_path": "/tmp/x" })),
        )
        .await;
        let body = json!({ "project_id": project["id"] });
        let (status, _) = call(&state, "POST", "/api/jobs", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let (status, _) = call(&idle_state(), "POST", "/api/jobs/5/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn created_job_runs_to_completion() {
        let repo = TestRepo::new().expect("repo");
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedRun::write(
            "api.txt",
            "from api\n",
            "done",
        )]));
        let (engine, _) = engine_with(repo.config(), provider, Arc::new(FakeTracker::new()));
        let state = AppState::new(engine);

        let project = json!({ "repo_path": repo.project_path(), "base_branch": "main" });
        let (status, project) = call(&state, "POST", "/api/projects", Some(project)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(project["provider"], "claude-code");

        let job = json!({ "project_id": project["id"], "title": "Add api.txt" });
        let (status, job) = call(&state, "POST", "/api/jobs", Some(job)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(job["status"], "running");

        let uri = format!("/api/jobs/{}", job["id"]);
        let mut last = Value::Null;
        for _ in 0..200 {
            let (status, current) = call(&state, "GET", &uri, None).await;
            assert_eq!(status, StatusCode::OK);
            if current["status"] != "running" {
                last = current;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(last["status"], JobStatus::Completed.as_str());
        let branch = last["branch"].as_str().expect("branch").to_string();
        assert_eq!(repo.remote_file(&branch, "api.txt").as_deref(), Some("from api\n"));

        let (status, cancel) = call(&state, "POST", &format!("{uri}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancel, json!({ "cancelled": false }));
    }
}
