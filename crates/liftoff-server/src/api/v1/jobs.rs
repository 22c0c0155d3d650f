//! Deferred job submission.
//!
//! `POST /v1/jobs` validates the payload, caches a `queued` status and
//! schedules a unit on the task runner. The unit runs under the submitting
//! request's context: it reads configuration and the pool from
//! [`ExecutionContext::current`], records the job, marks it `finished` in
//! the cache and emits `job.finished`.

use anyhow::Context as _;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;
use uuid::Uuid;

use liftoff_core::{ExecutionContext, Param, Params, TaskStats};
use liftoff_support::CacheClient;

use super::schema::{JobAccepted, JobRequest, JobState, JobStatus};
use crate::fault::{ApplicationError, RequestFault};
use crate::registry::{Routable, RouteDescriptor};
use crate::signals::{SignalRegistry, Signals};
use crate::state::{AppContext, AppState};

/// Emitted after a job is recorded. The payload is the finished [`JobStatus`].
pub const JOB_FINISHED: &str = "job.finished";

/// Longest accepted message, in bytes.
pub const MAX_MESSAGE_LEN: usize = 4096;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS job_runs (
    id TEXT PRIMARY KEY,
    message TEXT NOT NULL,
    app_name TEXT NOT NULL,
    request_id TEXT
)";

const INSERT_RUN: &str = "INSERT INTO job_runs (id, message, app_name, request_id)
    VALUES (:id, :message, :app_name, :request_id)";

/// `/v1/jobs` routes.
#[derive(Debug, Clone, Copy)]
pub struct JobRoutes;

impl Routable for JobRoutes {
    fn descriptor(&self) -> RouteDescriptor {
        RouteDescriptor::new("/v1/jobs")
            .route("POST", "/")
            .route("GET", "/stats")
            .route("GET", "/:id")
    }

    fn router(&self, _ctx: &AppContext) -> Router<AppState> {
        Router::new()
            .route("/", post(submit_job))
            .route("/stats", get(job_stats))
            .route("/:id", get(get_job))
    }

    fn register_signals(&self, signals: &mut SignalRegistry) {
        signals.connect(JOB_FINISHED, |payload| async move {
            let job: JobStatus = serde_json::from_value(payload)?;
            info!(
                job_id = %job.id,
                request_id = ?job.request_id,
                "Job finished"
            );
            Ok(())
        });
    }
}

/// Cache key of a job's status.
pub fn job_key(id: &str) -> String {
    format!("job:{id}")
}

async fn submit_job(
    State(state): State<AppState>,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), RequestFault> {
    let Json(request) = body.map_err(|rejection| {
        ApplicationError::new(rejection.status(), "invalid_body", rejection.body_text())
    })?;

    let message = request.message.trim();
    if message.is_empty() {
        return Err(ApplicationError::unprocessable("invalid_job", "message must not be empty").into());
    }
    if message.len() > MAX_MESSAGE_LEN {
        return Err(ApplicationError::unprocessable("invalid_job", "message is too long")
            .with_metadata(serde_json::json!({"max_len": MAX_MESSAGE_LEN}))
            .into());
    }

    let job = JobStatus {
        id: Uuid::new_v4().to_string(),
        status: JobState::Queued,
        message: message.to_string(),
        request_id: ExecutionContext::current()
            .and_then(|ctx| ctx.request_id().map(str::to_string)),
        app_name: None,
    };

    let cache = state.context().cache().clone();
    cache
        .set_json(&job_key(&job.id), &job)
        .map_err(|e| RequestFault::internal(format!("encode job status: {e}")))?;

    let signals = state.signals().clone();
    let queued = job.clone();
    let task_id = state
        .tasks()
        .schedule(move || run_job(queued, cache, signals))?;

    info!(job_id = %job.id, task_id = %task_id, "Job queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job,
            task_id: task_id.to_string(),
        }),
    ))
}

async fn run_job(mut job: JobStatus, cache: CacheClient, signals: Signals) -> anyhow::Result<()> {
    let ctx = ExecutionContext::current().context("job ran outside an execution context")?;
    let app_name = ctx.config().settings().app_name.clone();

    ctx.db().execute(CREATE_TABLE, Params::None).await?;
    ctx.db()
        .execute(
            INSERT_RUN,
            Params::keyed([
                ("id", Param::from(job.id.as_str())),
                ("message", Param::from(job.message.as_str())),
                ("app_name", Param::from(app_name.as_str())),
                ("request_id", Param::from(ctx.request_id())),
            ]),
        )
        .await?;

    job.status = JobState::Finished;
    job.app_name = Some(app_name);
    cache.set_json(&job_key(&job.id), &job)?;

    signals.emit(JOB_FINISHED, serde_json::to_value(&job)?)?;
    Ok(())
}

async fn job_stats(State(state): State<AppState>) -> Json<TaskStats> {
    Json(state.tasks().stats())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, RequestFault> {
    state
        .context()
        .cache()
        .get_json(&job_key(&id))
        .map(Json)
        .ok_or_else(|| {
            ApplicationError::new(StatusCode::NOT_FOUND, "job_not_found", format!("no job {id}"))
                .into()
        })
}
