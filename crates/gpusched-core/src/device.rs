//! Device identity, capacity and telemetry snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fleet-local device index, stable for a provider's lifetime
pub type DeviceId = u32;

/// Bytes per MiB, the granularity all memory figures are reported in
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// GPU vendor types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Simulator,
    Unknown,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Apple => write!(f, "Apple"),
            GpuVendor::Simulator => write!(f, "simulator"),
            GpuVendor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Memory counters in MB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
}

impl MemoryMetrics {
    /// Build counters from byte totals; free is derived so the three always agree
    pub fn from_bytes(total_bytes: u64, used_bytes: u64) -> Self {
        let total_mb = total_bytes / BYTES_PER_MB;
        let used_mb = used_bytes / BYTES_PER_MB;
        Self {
            total_mb,
            used_mb,
            free_mb: total_mb.saturating_sub(used_mb),
        }
    }
}

/// Capability flags of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// MPS-style process sharing
    pub supports_mps: bool,
    /// MIG-style partitioning
    pub supports_mig: bool,
    pub supports_multi_process: bool,
    pub max_concurrent_processes: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_mps: false,
            supports_mig: false,
            supports_multi_process: false,
            max_concurrent_processes: 1,
        }
    }
}

/// Immutable snapshot of a device. Re-query the provider for fresh state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub vendor: GpuVendor,
    pub memory: MemoryMetrics,
    /// GPU utilization percentage (0-100)
    pub utilization: f64,
    pub capabilities: Capabilities,
    /// Ids of the jobs currently allocated on this device
    pub running_jobs: Vec<String>,
}

impl DeviceInfo {
    pub fn free_memory_mb(&self) -> u64 {
        self.memory.free_mb
    }

    /// Whether another process fits under the device's concurrency limit
    pub fn has_process_slot(&self) -> bool {
        (self.running_jobs.len() as u64) < self.capabilities.max_concurrent_processes as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UtilizationMetrics {
    /// Compute utilization (0-100)
    pub gpu: f64,
    /// Memory utilization (0-100)
    pub memory: f64,
}

/// Per-process usage record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub used_memory_mb: u64,
    pub job_id: String,
}

/// Point-in-time telemetry produced by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub utilization: UtilizationMetrics,
    pub memory: MemoryMetrics,
    /// Degrees Celsius
    pub temperature_c: f64,
    /// Watts
    pub power_w: f64,
    pub processes: Vec<ProcessInfo>,
}

impl DeviceMetrics {
    /// Memory the given job holds according to this snapshot
    pub fn job_memory_mb(&self, job_id: &str) -> Option<u64> {
        self.processes
            .iter()
            .find(|p| p.job_id == job_id)
            .map(|p| p.used_memory_mb)
    }
}

/// Device-side reservation handed to `GpuProvider::allocate_job`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub job_id: String,
    pub memory_mb: u64,
    /// Fractional contribution to device utilization (0-1)
    pub compute_intensity: f64,
    pub estimated_runtime_secs: f64,
}

/// MIG partition layout request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigConfig {
    /// Instance profiles such as `1g.10gb`
    pub instance_profiles: Vec<String>,
}
