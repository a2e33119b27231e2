//! Provider trait definitions

use async_trait::async_trait;
use gpusched_core::{
    AllocationRequest, Capabilities, DeviceId, DeviceInfo, DeviceMetrics, GpuVendor, MigConfig,
    ProviderOptions, SchedError, SchedResult, Shutdown,
};

/// Uniform device operations every GPU backend implements
#[async_trait]
pub trait GpuProvider: Send + Sync {
    /// One-time setup. Background work started here stops when `shutdown` fires.
    async fn initialize(&mut self, shutdown: Shutdown, options: &ProviderOptions)
        -> SchedResult<()>;

    /// Number of devices visible to this backend
    async fn device_count(&self) -> usize;

    /// Snapshot of one device
    async fn device_info(&self, device_id: DeviceId) -> SchedResult<DeviceInfo>;

    /// Snapshots of every device, ordered by id
    async fn all_devices(&self) -> SchedResult<Vec<DeviceInfo>>;

    /// Latest telemetry of one device
    async fn metrics(&self, device_id: DeviceId) -> SchedResult<DeviceMetrics>;

    /// Latest telemetry of every device, ordered by id
    async fn all_metrics(&self) -> SchedResult<Vec<DeviceMetrics>>;

    async fn capabilities(&self, device_id: DeviceId) -> SchedResult<Capabilities>;

    /// Reserve device memory for a job
    async fn allocate_job(
        &self,
        device_id: DeviceId,
        request: &AllocationRequest,
    ) -> SchedResult<()>;

    /// Free exactly what `allocate_job` reserved for `job_id`
    async fn release_job(&self, device_id: DeviceId, job_id: &str) -> SchedResult<()>;

    async fn enable_mps(&self, _device_id: DeviceId) -> SchedResult<()> {
        Err(SchedError::NotSupported(format!("MPS on {}", self.name())))
    }

    async fn disable_mps(&self, _device_id: DeviceId) -> SchedResult<()> {
        Err(SchedError::NotSupported(format!("MPS on {}", self.name())))
    }

    async fn configure_mig(&self, _device_id: DeviceId, _config: &MigConfig) -> SchedResult<()> {
        Err(SchedError::NotSupported(format!("MIG on {}", self.name())))
    }

    /// Registry name of the backend
    fn name(&self) -> &'static str;

    fn vendor(&self) -> GpuVendor;

    /// Release backend resources. Other calls must not follow.
    async fn close(&self) -> SchedResult<()>;
}
