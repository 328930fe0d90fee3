//! JSON control surface over the scheduler and the run log.
//!
//! The daemon mounts this next to the background jobs; operators list job
//! state, start/stop/trigger by name, and read recent run outcomes.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use tap_sched::{ExecutionOutcome, JobControl, SchedError};
use tap_store::{Store, StoreError};

pub const CRATE_NAME: &str = "tap-web";

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub control: Arc<dyn JobControl>,
    pub store: Arc<dyn Store>,
}

impl AppState {
    pub fn new(control: Arc<dyn JobControl>, store: Arc<dyn Store>) -> Self {
        Self { control, store }
    }
}

/// Envelope for every mutating endpoint. `success` tracks the operation the
/// caller asked for, not just HTTP transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs_handler))
        .route("/jobs/{name}", get(job_status_handler))
        .route("/jobs/{name}/start", post(start_job_handler))
        .route("/jobs/{name}/stop", post(stop_job_handler))
        .route("/jobs/{name}/trigger", post(trigger_job_handler))
        .route("/runs", get(recent_runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn list_jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.control.list_jobs().await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => sched_error_response(err),
    }
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.control.job_status(&name).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => sched_error_response(err),
    }
}

async fn start_job_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.control.start_job(&name).await {
        Ok(()) => Json(ActionResponse {
            success: true,
            message: format!("job {name} started"),
        })
        .into_response(),
        Err(err) => sched_error_response(err),
    }
}

async fn stop_job_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.control.stop_job(&name).await {
        Ok(()) => Json(ActionResponse {
            success: true,
            message: format!("job {name} stopped"),
        })
        .into_response(),
        Err(err) => sched_error_response(err),
    }
}

async fn trigger_job_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.control.trigger_job(&name).await {
        Ok(outcome) => {
            let (success, message) = match outcome {
                ExecutionOutcome::Succeeded => (true, format!("job {name} completed")),
                ExecutionOutcome::Failed => {
                    (false, format!("job {name} failed; see the run log"))
                }
                ExecutionOutcome::Skipped => (
                    false,
                    format!("job {name} is already running; trigger skipped"),
                ),
            };
            Json(ActionResponse { success, message }).into_response()
        }
        Err(err) => sched_error_response(err),
    }
}

async fn recent_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUNS_LIMIT)
        .clamp(1, MAX_RUNS_LIMIT);
    match state.store.recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => store_error_response(err),
    }
}

fn sched_error_response(err: SchedError) -> Response {
    let status = match &err {
        SchedError::UnknownJob(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ActionResponse {
            success: false,
            message: err.to_string(),
        }),
    )
        .into_response()
}

fn store_error_response(err: StoreError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ActionResponse {
            success: false,
            message: err.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tap_core::{Recurrence, RunRecord};
    use tap_sched::{JobHandler, JobSpec, JobStatus, Scheduler};
    use tap_store::MemoryStore;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct TestCtx;

    struct OkHandler;

    #[async_trait]
    impl JobHandler<TestCtx> for OkHandler {
        async fn execute(&self, _ctx: &TestCtx) -> anyhow::Result<String> {
            Ok("done".to_string())
        }
    }

    fn spec(name: &str) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            description: format!("test job {name}"),
            recurrence: Recurrence::Every { minutes: 60 },
            timeout_secs: 300,
        }
    }

    async fn test_app() -> (Router, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = Scheduler::new(store.clone(), Arc::new(TestCtx), 5);
        sched
            .register(spec("tender-ingestion"), OkHandler)
            .await
            .expect("registering job");
        let state = AppState::new(Arc::new(sched), store.clone());
        (app(state), store)
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn jobs_listing_reports_registered_jobs() {
        let (app, _store) = test_app().await;
        let resp = app.oneshot(get("/jobs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let jobs: Vec<JobStatus> = body_json(resp).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "tender-ingestion");
        assert!(jobs[0].active);
        assert_eq!(jobs[0].run_count, 0);
    }

    #[tokio::test]
    async fn unknown_job_names_return_not_found() {
        let (app, _store) = test_app().await;

        let resp = app.clone().oneshot(get("/jobs/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app.oneshot(post("/jobs/nope/trigger")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let action: ActionResponse = body_json(resp).await;
        assert!(!action.success);
        assert!(action.message.contains("unknown job"));
    }

    #[tokio::test]
    async fn trigger_executes_and_updates_the_counters() {
        let (app, _store) = test_app().await;

        let resp = app
            .clone()
            .oneshot(post("/jobs/tender-ingestion/trigger"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let action: ActionResponse = body_json(resp).await;
        assert!(action.success);

        let resp = app.oneshot(get("/jobs/tender-ingestion")).await.unwrap();
        let status: JobStatus = body_json(resp).await;
        assert_eq!(status.run_count, 1);
        assert_eq!(status.error_count, 0);
        assert!(status.last_run.is_some());
    }

    #[tokio::test]
    async fn stop_and_start_flip_the_active_flag() {
        let (app, _store) = test_app().await;

        let resp = app
            .clone()
            .oneshot(post("/jobs/tender-ingestion/stop"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(get("/jobs/tender-ingestion"))
            .await
            .unwrap();
        let status: JobStatus = body_json(resp).await;
        assert!(!status.active);
        assert!(!status.armed);

        let resp = app
            .clone()
            .oneshot(post("/jobs/tender-ingestion/start"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(get("/jobs/tender-ingestion")).await.unwrap();
        let status: JobStatus = body_json(resp).await;
        assert!(status.active);
        assert!(status.armed);
    }

    #[tokio::test]
    async fn runs_endpoint_is_newest_first_and_bounded() {
        let (app, store) = test_app().await;
        for i in 0..5 {
            let started = Utc::now() + chrono::Duration::seconds(i);
            store
                .record_run(&RunRecord {
                    run_id: Uuid::new_v4(),
                    job: "tender-ingestion".to_string(),
                    started_at: started,
                    finished_at: started,
                    success: true,
                    summary: format!("run {i}"),
                    errors: Vec::new(),
                })
                .await
                .unwrap();
        }

        let resp = app.oneshot(get("/runs?limit=2")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let runs: Vec<RunRecord> = body_json(resp).await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].summary, "run 4");
    }
}
