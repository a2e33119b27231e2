//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use gpusched_core::{
    DeviceId, DeviceInfo, DeviceMetrics, Job, JobMetadata, ResourceRequirements, SchedError,
};
use gpusched_provider::GpuProvider;
use gpusched_scheduler::{Scheduler, SchedulerStats};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Create the API router
pub fn create_router(scheduler: Arc<Scheduler>) -> Router {
    let state = Arc::new(AppState { scheduler });

    Router::new()
        .route("/api/v1/jobs", post(submit_job))
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/jobs/:id/complete", post(complete_job))
        .route("/api/v1/jobs/:id/fail", post(fail_job))
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:id", get(get_device))
        .route("/api/v1/devices/:id/metrics", get(get_device_metrics))
        .route("/api/v1/metrics", get(get_all_metrics))
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: SchedError) -> (StatusCode, String) {
    let status = match &e {
        SchedError::JobNotFound(_) | SchedError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        SchedError::InvalidJob(_) => StatusCode::BAD_REQUEST,
        SchedError::DuplicateJob(_) | SchedError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SchedError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Request to submit a job
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    /// Caller-chosen id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub metadata: JobMetadata,
}

impl From<SubmitJobRequest> for Job {
    fn from(req: SubmitJobRequest) -> Self {
        let mut job = Job::new(req.name, req.image, req.commands)
            .with_resources(req.resources)
            .with_metadata(req.metadata);
        job.environment = req.environment;
        if let Some(id) = req.id {
            job.id = id;
        }
        job
    }
}

/// Response for a submitted job
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub id: String,
}

/// Submit a job for placement
async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), (StatusCode, String)> {
    info!(
        name = %req.name,
        image = %req.image,
        gpu_memory_mb = req.resources.gpu_memory_mb,
        "Submitting job"
    );

    let id = state
        .scheduler
        .submit_job(Job::from(req))
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(SubmitJobResponse { id })))
}

/// List all jobs
async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Job>> {
    Ok(Json(state.scheduler.list_jobs().await))
}

/// Get a specific job
async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Job> {
    let job = state.scheduler.get_job(&id).await.map_err(error_response)?;
    Ok(Json(job))
}

/// Cancel a pending job
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Job> {
    info!(job_id = %id, "Cancelling job");

    let job = state.scheduler.cancel_job(&id).await.map_err(error_response)?;
    Ok(Json(job))
}

/// Request to report a job's exit
#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub exit_code: i32,
}

/// Report that a running job exited
async fn complete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<Job> {
    let job = state
        .scheduler
        .complete_job(&id, req.exit_code)
        .await
        .map_err(error_response)?;
    Ok(Json(job))
}

/// Request to report a job failure
#[derive(Debug, Serialize, Deserialize)]
pub struct FailRequest {
    pub reason: String,
}

/// Report that a running job failed
async fn fail_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<FailRequest>,
) -> ApiResult<Job> {
    let job = state
        .scheduler
        .fail_job(&id, req.reason)
        .await
        .map_err(error_response)?;
    Ok(Json(job))
}

/// List all devices
async fn list_devices(State(state): State<Arc<AppState>>) -> ApiResult<Vec<DeviceInfo>> {
    let devices = state
        .scheduler
        .provider()
        .all_devices()
        .await
        .map_err(error_response)?;
    Ok(Json(devices))
}

/// Get a specific device
async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DeviceId>,
) -> ApiResult<DeviceInfo> {
    let device = state
        .scheduler
        .provider()
        .device_info(id)
        .await
        .map_err(error_response)?;
    Ok(Json(device))
}

/// Get the latest telemetry for a device
async fn get_device_metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DeviceId>,
) -> ApiResult<DeviceMetrics> {
    let metrics = state
        .scheduler
        .provider()
        .metrics(id)
        .await
        .map_err(error_response)?;
    Ok(Json(metrics))
}

/// Get the latest telemetry for every device
async fn get_all_metrics(State(state): State<Arc<AppState>>) -> ApiResult<Vec<DeviceMetrics>> {
    let metrics = state
        .scheduler
        .provider()
        .all_metrics()
        .await
        .map_err(error_response)?;
    Ok(Json(metrics))
}

/// Job counts per status
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: usize,
    pub scheduled: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl From<&SchedulerStats> for JobCounts {
    fn from(stats: &SchedulerStats) -> Self {
        Self {
            pending: stats.pending,
            scheduled: stats.scheduled,
            running: stats.running,
            completed: stats.completed,
            failed: stats.failed,
            cancelled: stats.cancelled,
        }
    }
}

/// System status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub provider: String,
    pub vendor: String,
    pub policy: String,
    pub devices: usize,
    pub queued: usize,
    pub jobs: JobCounts,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<StatusResponse> {
    let provider = state.scheduler.provider();
    let stats = state.scheduler.stats().await;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        provider: provider.name().to_string(),
        vendor: provider.vendor().to_string(),
        policy: state.scheduler.strategy_name().to_string(),
        devices: provider.device_count().await,
        queued: stats.queued,
        jobs: JobCounts::from(&stats),
    }))
}
