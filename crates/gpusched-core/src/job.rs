//! Job, requirement and lifecycle type definitions

use crate::device::DeviceId;
use crate::error::{SchedError, SchedResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A unit of work placed onto GPU devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique identifier, assigned at creation
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Container image reference
    pub image: String,
    /// Command and arguments
    pub commands: Vec<String>,
    /// Environment variables
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Declared resource requirements
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Workload description consumed by predictors
    #[serde(default)]
    pub metadata: JobMetadata,
    /// Current lifecycle state
    pub status: JobStatus,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Device binding, set once when placed
    pub placement: Option<Placement>,
    /// Actual consumption, set once the job ends
    pub usage: Option<ResourceUsage>,
    /// Failed placement attempts so far
    #[serde(default)]
    pub placement_attempts: u32,
    /// Diagnostic for Failed jobs
    pub failure_reason: Option<String>,
}

impl Job {
    /// Create a new pending job with default requirements
    pub fn new(name: String, image: String, commands: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            image,
            commands,
            environment: HashMap::new(),
            resources: ResourceRequirements::default(),
            metadata: JobMetadata::default(),
            status: JobStatus::Pending,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            placement: None,
            usage: None,
            placement_attempts: 0,
            failure_reason: None,
        }
    }

    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow
    pub fn transition(&mut self, next: JobStatus) -> SchedResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SchedError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Wall-clock seconds between start and end, if both are known
    pub fn runtime_secs(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Resource requirements for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    /// GPU memory per device in MB
    pub gpu_memory_mb: u64,
    /// Number of GPUs required
    pub gpu_count: u32,
    /// Fractional GPU share (0 means a whole device)
    pub gpu_fraction: f64,
    pub cpu_cores: u32,
    pub system_memory_mb: u64,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            gpu_memory_mb: 0,
            gpu_count: 1,
            gpu_fraction: 0.0,
            cpu_cores: 1,
            system_memory_mb: 0,
        }
    }
}

impl ResourceRequirements {
    /// Requirements asking for `gpu_memory_mb` on a single device
    pub fn gpu_memory(gpu_memory_mb: u64) -> Self {
        Self {
            gpu_memory_mb,
            ..Self::default()
        }
    }
}

/// Informational workload description, not used by placement itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMetadata {
    pub model_type: String,
    pub batch_size: u32,
    pub sequence_length: u32,
    pub num_parameters: u64,
}

/// Binding of a job to its devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    /// Primary device
    pub device_id: DeviceId,
    /// Every device the job holds, primary first
    pub device_ids: Vec<DeviceId>,
    pub node_id: String,
    pub use_mps: bool,
    pub container_id: Option<String>,
}

/// Consumption summary filled in when a job ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_gpu_memory_mb: u64,
    pub avg_gpu_utilization: f64,
    pub runtime_secs: f64,
    pub exit_code: i32,
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue
    Pending,
    /// Device chosen, execution not started
    Scheduled,
    /// Allocation confirmed by the provider
    Running,
    Completed,
    Failed,
    /// Withdrawn before placement
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Lifecycle edges: Pending -> Scheduled -> Running -> {Completed | Failed},
    /// Pending -> {Cancelled | Failed}
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Scheduled)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Scheduled, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "Pending"),
            JobStatus::Scheduled => write!(f, "Scheduled"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed => write!(f, "Failed"),
            JobStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}
