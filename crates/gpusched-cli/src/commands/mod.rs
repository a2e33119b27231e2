//! CLI commands implementation

use anyhow::{bail, Result};
use gpusched_core::{DeviceInfo, DeviceMetrics, Job, JobStatus, ResourceRequirements};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(path, "GET");
        let response = self.client.get(self.url(path)).send().await?;
        decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        debug!(path, "POST");
        let response = self.client.post(self.url(path)).json(body).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let error = response.text().await?;
        bail!("{} ({})", error, status);
    }
    Ok(response.json().await?)
}

/// Parse a KEY=VALUE pair
pub fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Job submission body
#[derive(Debug, Serialize)]
pub struct Submission {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub image: String,
    pub commands: Vec<String>,
    pub environment: HashMap<String, String>,
    pub resources: ResourceRequirements,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

/// Job counts from the status endpoint
#[derive(Debug, Deserialize)]
pub struct JobCounts {
    pub pending: usize,
    pub scheduled: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub provider: String,
    pub vendor: String,
    pub policy: String,
    pub devices: usize,
    pub queued: usize,
    pub jobs: JobCounts,
}

/// Submit a job
pub async fn submit(client: &ApiClient, submission: Submission) -> Result<()> {
    let response: SubmitResponse = client.post("/api/v1/jobs", &submission).await?;

    println!("Job '{}' submitted", submission.name);
    println!("  ID: {}", response.id);
    println!(
        "  GPU memory: {} MB x {}",
        submission.resources.gpu_memory_mb, submission.resources.gpu_count
    );

    Ok(())
}

/// List jobs, optionally filtered by status
pub async fn jobs(client: &ApiClient, status: Option<String>) -> Result<()> {
    let filter = status.as_deref().map(parse_status).transpose()?;
    let jobs: Vec<Job> = client.get("/api/v1/jobs").await?;
    let jobs: Vec<Job> = jobs
        .into_iter()
        .filter(|j| filter.map_or(true, |s| j.status == s))
        .collect();

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!(
        "{:<36} {:<20} {:<10} {:<10} {:<10}",
        "ID", "NAME", "STATUS", "MEMORY", "DEVICES"
    );
    println!("{}", "-".repeat(90));
    for job in jobs {
        println!(
            "{:<36} {:<20} {:<10} {:<10} {:<10}",
            job.id,
            job.name,
            job.status.to_string(),
            format!("{}MB", job.resources.gpu_memory_mb),
            device_list(&job)
        );
    }

    Ok(())
}

/// Show one job
pub async fn job(client: &ApiClient, job: String) -> Result<()> {
    let id = resolve_job_id(client, &job).await?;
    let job: Job = client.get(&format!("/api/v1/jobs/{}", id)).await?;
    print_job_details(&job);
    Ok(())
}

/// Cancel a pending job
pub async fn cancel(client: &ApiClient, job: String) -> Result<()> {
    let id = resolve_job_id(client, &job).await?;
    let job: Job = client
        .post(&format!("/api/v1/jobs/{}/cancel", id), &serde_json::json!({}))
        .await?;
    println!("Job '{}' cancelled", job.name);
    Ok(())
}

/// Report a job's exit code
pub async fn complete(client: &ApiClient, job: String, exit_code: i32) -> Result<()> {
    let id = resolve_job_id(client, &job).await?;
    let job: Job = client
        .post(
            &format!("/api/v1/jobs/{}/complete", id),
            &serde_json::json!({ "exit_code": exit_code }),
        )
        .await?;
    println!("Job '{}' is now {}", job.name, job.status);
    Ok(())
}

/// Report a job failure
pub async fn fail(client: &ApiClient, job: String, reason: String) -> Result<()> {
    let id = resolve_job_id(client, &job).await?;
    let job: Job = client
        .post(
            &format!("/api/v1/jobs/{}/fail", id),
            &serde_json::json!({ "reason": reason }),
        )
        .await?;
    println!("Job '{}' is now {}", job.name, job.status);
    Ok(())
}

/// Show devices
pub async fn devices(client: &ApiClient) -> Result<()> {
    let devices: Vec<DeviceInfo> = client.get("/api/v1/devices").await?;

    if devices.is_empty() {
        println!("No devices found");
        return Ok(());
    }

    for device in devices {
        println!(
            "[{}] {} ({}) - {}/{}MB free - {:.0}% busy - {} job(s)",
            device.id,
            device.name,
            device.vendor,
            device.memory.free_mb,
            device.memory.total_mb,
            device.utilization,
            device.running_jobs.len()
        );
    }

    Ok(())
}

/// Show telemetry for one device or all of them
pub async fn metrics(client: &ApiClient, device: Option<u32>) -> Result<()> {
    let metrics: Vec<DeviceMetrics> = match device {
        Some(id) => vec![client.get(&format!("/api/v1/devices/{}/metrics", id)).await?],
        None => client.get("/api/v1/metrics").await?,
    };

    println!(
        "{:<6} {:<8} {:<8} {:<16} {:<8} {:<8}",
        "GPU", "UTIL", "MEM", "USED/TOTAL", "TEMP", "POWER"
    );
    println!("{}", "-".repeat(60));
    for m in metrics {
        println!(
            "{:<6} {:<8} {:<8} {:<16} {:<8} {:<8}",
            m.device_id,
            format!("{:.0}%", m.utilization.gpu),
            format!("{:.0}%", m.utilization.memory),
            format!("{}/{}MB", m.memory.used_mb, m.memory.total_mb),
            format!("{:.0}C", m.temperature_c),
            format!("{:.0}W", m.power_w)
        );
        for p in m.processes {
            println!("       pid {} {} ({} MB)", p.pid, p.job_id, p.used_memory_mb);
        }
    }

    Ok(())
}

/// Show system status
pub async fn status(client: &ApiClient) -> Result<()> {
    let status: StatusResponse = client.get("/api/v1/status").await?;

    println!("gpusched v{}", status.version);
    println!();
    println!("Provider: {} ({})", status.provider, status.vendor);
    println!("Policy: {}", status.policy);
    println!("Devices: {}", status.devices);
    println!("Queued: {}", status.queued);
    println!(
        "Jobs: {} pending, {} running, {} completed, {} failed, {} cancelled",
        status.jobs.pending + status.jobs.scheduled,
        status.jobs.running,
        status.jobs.completed,
        status.jobs.failed,
        status.jobs.cancelled
    );

    Ok(())
}

fn parse_status(s: &str) -> Result<JobStatus> {
    match JobStatus::ALL
        .iter()
        .find(|status| status.to_string().eq_ignore_ascii_case(s))
    {
        Some(status) => Ok(*status),
        None => bail!("Unknown job status '{}'", s),
    }
}

/// Helper to resolve a job id from an id or a name
async fn resolve_job_id(client: &ApiClient, job: &str) -> Result<String> {
    let jobs: Vec<Job> = client.get("/api/v1/jobs").await?;
    if jobs.iter().any(|j| j.id == job) {
        return Ok(job.to_string());
    }

    let mut named = jobs.into_iter().filter(|j| j.name == job);
    match (named.next(), named.next()) {
        (Some(found), None) => Ok(found.id),
        (Some(_), Some(_)) => bail!("Job name '{}' is ambiguous, use the id", job),
        (None, _) => bail!("Job '{}' not found", job),
    }
}

fn device_list(job: &Job) -> String {
    match &job.placement {
        Some(placement) => placement
            .device_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(","),
        None => "-".to_string(),
    }
}

/// Helper to print job details
fn print_job_details(job: &Job) {
    println!("Job: {}", job.name);
    println!("  ID: {}", job.id);
    println!("  Image: {}", job.image);
    if !job.commands.is_empty() {
        println!("  Command: {}", job.commands.join(" "));
    }
    println!("  Status: {}", job.status);
    println!(
        "  Requested: {} MB x {} GPU(s)",
        job.resources.gpu_memory_mb, job.resources.gpu_count
    );
    println!("  Submitted: {}", job.submit_time);
    if let Some(placement) = &job.placement {
        println!(
            "  Placement: node {} devices [{}]{}",
            placement.node_id,
            device_list(job),
            if placement.use_mps { " (MPS)" } else { "" }
        );
    }
    if let Some(start) = job.start_time {
        println!("  Started: {}", start);
    }
    if let Some(end) = job.end_time {
        println!("  Ended: {}", end);
    }
    if let Some(usage) = &job.usage {
        println!(
            "  Usage: peak {} MB, {:.0}% GPU, {:.1}s, exit code {}",
            usage.peak_gpu_memory_mb, usage.avg_gpu_utilization, usage.runtime_secs, usage.exit_code
        );
    }
    if let Some(reason) = &job.failure_reason {
        println!("  Failure: {}", reason);
    }
    if job.placement_attempts > 0 && job.status == JobStatus::Pending {
        println!("  Placement attempts: {}", job.placement_attempts);
    }
}
