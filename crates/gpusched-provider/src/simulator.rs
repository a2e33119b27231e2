//! Simulated GPU backend
//!
//! Owns a fixed set of virtual devices. Memory accounting is exact and
//! applied synchronously on allocate/release; utilization, temperature and
//! power are derived from the running jobs (plus bounded noise in realistic
//! mode) by a background loop that ticks once per update interval.
//!
//! Lock order: the fleet lock (read for queries and job changes, write only
//! while initializing) is taken before a device lock, and no operation holds
//! two device locks at once.

use async_trait::async_trait;
use chrono::Utc;
use gpusched_core::{
    AllocationRequest, Capabilities, DeviceId, DeviceInfo, DeviceMetrics, GpuVendor,
    MemoryMetrics, MigConfig, ProcessInfo, ProviderOptions, SchedError, SchedResult, Shutdown,
    UtilizationMetrics, BYTES_PER_MB,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::traits::GpuProvider;

const BYTES_PER_GB: u64 = 1024 * BYTES_PER_MB;

const BASE_TEMPERATURE_C: f64 = 35.0;
const TEMPERATURE_PER_UTIL: f64 = 0.5;
const BASE_POWER_W: f64 = 50.0;
const POWER_PER_UTIL: f64 = 3.0;
/// Half-width of the utilization noise band, in percentage points
const UTILIZATION_NOISE: f64 = 5.0;

const SIMULATED_CAPABILITIES: Capabilities = Capabilities {
    supports_mps: true,
    supports_mig: false,
    supports_multi_process: true,
    max_concurrent_processes: 8,
};

/// Simulator settings, built from the provider options
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub num_gpus: usize,
    pub memory_per_gpu_bytes: u64,
    pub gpu_name: String,
    /// Add ±5 point noise to computed utilization
    pub realistic_mode: bool,
    pub update_interval: Duration,
    /// Fixed RNG seed for reproducible baselines and noise
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            num_gpus: 4,
            memory_per_gpu_bytes: 24 * BYTES_PER_GB,
            gpu_name: "Simulated GPU A100".to_string(),
            realistic_mode: true,
            update_interval: Duration::from_secs(1),
            seed: None,
        }
    }
}

impl SimulatorConfig {
    /// Overlay recognised option keys on `self`. Unknown keys are ignored.
    pub fn apply_options(mut self, options: &ProviderOptions) -> SchedResult<Self> {
        if let Some(num_gpus) = option_u64(options, "num_gpus")? {
            if num_gpus == 0 || num_gpus > DeviceId::MAX as u64 {
                return Err(SchedError::Initialization(format!(
                    "num_gpus must be between 1 and {}, got {}",
                    DeviceId::MAX,
                    num_gpus
                )));
            }
            self.num_gpus = num_gpus as usize;
        }
        if let Some(memory_gb) = option_u64(options, "memory_per_gpu_gb")? {
            if memory_gb == 0 {
                return Err(SchedError::Initialization(
                    "memory_per_gpu_gb must be at least 1".to_string(),
                ));
            }
            self.memory_per_gpu_bytes = memory_gb
                .checked_mul(BYTES_PER_GB)
                .ok_or_else(|| {
                    SchedError::Initialization(format!("memory_per_gpu_gb too large: {}", memory_gb))
                })?;
        }
        if let Some(value) = options.get("gpu_name") {
            self.gpu_name = value
                .as_str()
                .ok_or_else(|| invalid_option("gpu_name", "a string", value))?
                .to_string();
        }
        if let Some(value) = options.get("realistic_mode") {
            self.realistic_mode = value
                .as_bool()
                .ok_or_else(|| invalid_option("realistic_mode", "a boolean", value))?;
        }
        if let Some(interval_ms) = option_u64(options, "update_interval_ms")? {
            if interval_ms == 0 {
                return Err(SchedError::Initialization(
                    "update_interval_ms must be at least 1".to_string(),
                ));
            }
            self.update_interval = Duration::from_millis(interval_ms);
        }
        if let Some(seed) = option_u64(options, "seed")? {
            self.seed = Some(seed);
        }
        Ok(self)
    }
}

fn invalid_option(key: &str, expected: &str, value: &serde_json::Value) -> SchedError {
    SchedError::Initialization(format!("option '{}' must be {}, got {}", key, expected, value))
}

fn option_u64(options: &ProviderOptions, key: &str) -> SchedResult<Option<u64>> {
    match options.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid_option(key, "a non-negative integer", value)),
    }
}

/// A job's footprint on a virtual device
#[derive(Debug, Clone)]
struct SimulatedJob {
    pid: u32,
    memory_allocated: u64,
    compute_intensity: f64,
}

/// Mutable part of a virtual device, guarded by the device lock
#[derive(Debug)]
struct DeviceState {
    /// Always the sum of `memory_allocated` over `running_jobs`
    memory_used: u64,
    running_jobs: BTreeMap<String, SimulatedJob>,
    /// Replaced wholesale, never edited field by field
    metrics: DeviceMetrics,
}

#[derive(Debug)]
struct VirtualDevice {
    id: DeviceId,
    name: String,
    memory_total: u64,
    state: RwLock<DeviceState>,
}

impl VirtualDevice {
    fn new(id: DeviceId, name: String, memory_total: u64, rng: &mut StdRng) -> Self {
        let metrics = DeviceMetrics {
            device_id: id,
            timestamp: Utc::now(),
            utilization: UtilizationMetrics::default(),
            memory: MemoryMetrics::from_bytes(memory_total, 0),
            temperature_c: BASE_TEMPERATURE_C + rng.gen_range(0..10) as f64,
            power_w: BASE_POWER_W + rng.gen::<f64>() * 50.0,
            processes: Vec::new(),
        };

        Self {
            id,
            name,
            memory_total,
            state: RwLock::new(DeviceState {
                memory_used: 0,
                running_jobs: BTreeMap::new(),
                metrics,
            }),
        }
    }

    fn info(&self, state: &DeviceState) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            name: self.name.clone(),
            vendor: GpuVendor::Simulator,
            memory: MemoryMetrics::from_bytes(self.memory_total, state.memory_used),
            utilization: state.metrics.utilization.gpu,
            capabilities: SIMULATED_CAPABILITIES,
            running_jobs: state.running_jobs.keys().cloned().collect(),
        }
    }

    fn memory_utilization(&self, memory_used: u64) -> f64 {
        (memory_used as f64 / self.memory_total as f64 * 100.0).clamp(0.0, 100.0)
    }

    fn processes(state: &DeviceState) -> Vec<ProcessInfo> {
        state
            .running_jobs
            .iter()
            .map(|(job_id, job)| ProcessInfo {
                pid: job.pid,
                used_memory_mb: job.memory_allocated / BYTES_PER_MB,
                job_id: job_id.clone(),
            })
            .collect()
    }

    /// Swap in a snapshot whose memory view matches the current job set,
    /// keeping the derived compute telemetry of the last tick.
    fn sync_memory_view(&self, state: &mut DeviceState) {
        let gpu_util = state.metrics.utilization.gpu;
        let temperature_c = state.metrics.temperature_c;
        let power_w = state.metrics.power_w;
        state.metrics = DeviceMetrics {
            device_id: self.id,
            timestamp: Utc::now(),
            utilization: UtilizationMetrics {
                gpu: gpu_util,
                memory: self.memory_utilization(state.memory_used),
            },
            memory: MemoryMetrics::from_bytes(self.memory_total, state.memory_used),
            temperature_c,
            power_w,
            processes: Self::processes(state),
        };
    }

    /// One recomputation tick for this device
    fn recompute(&self, state: &mut DeviceState, rng: &mut StdRng, realistic_mode: bool) {
        let intensity: f64 = state
            .running_jobs
            .values()
            .map(|job| job.compute_intensity)
            .sum();

        let mut gpu_util = intensity * 100.0;
        if realistic_mode {
            gpu_util += rng.gen_range(-UTILIZATION_NOISE..=UTILIZATION_NOISE);
        }
        let gpu_util = gpu_util.clamp(0.0, 100.0);

        state.metrics = DeviceMetrics {
            device_id: self.id,
            timestamp: Utc::now(),
            utilization: UtilizationMetrics {
                gpu: gpu_util,
                memory: self.memory_utilization(state.memory_used),
            },
            memory: MemoryMetrics::from_bytes(self.memory_total, state.memory_used),
            temperature_c: (BASE_TEMPERATURE_C + TEMPERATURE_PER_UTIL * gpu_util).trunc(),
            power_w: BASE_POWER_W + POWER_PER_UTIL * gpu_util,
            processes: Self::processes(state),
        };
    }
}

/// State shared between the provider and its recomputation task
struct Fleet {
    devices: RwLock<Vec<Arc<VirtualDevice>>>,
    rng: Mutex<StdRng>,
}

impl Fleet {
    fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rng)
    }

    async fn refresh(&self, realistic_mode: bool) {
        let devices = self.devices.read().await;
        for device in devices.iter() {
            let mut state = device.state.write().await;
            self.with_rng(|rng| device.recompute(&mut state, rng, realistic_mode));
        }
    }
}

fn lookup(devices: &[Arc<VirtualDevice>], device_id: DeviceId) -> SchedResult<&Arc<VirtualDevice>> {
    devices
        .get(device_id as usize)
        .ok_or(SchedError::DeviceNotFound(device_id))
}

/// Simulated GPU provider, registered as `simulator`
pub struct SimulatedProvider {
    config: SimulatorConfig,
    fleet: Arc<Fleet>,
    updater: Mutex<Option<JoinHandle<()>>>,
    initialized: bool,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    pub const NAME: &'static str = "simulator";

    /// Create an uninitialized simulator with default settings
    pub fn new() -> Self {
        Self::with_config(SimulatorConfig::default())
    }

    /// Create an uninitialized simulator whose devices are named `{gpu_name}-{index}`
    pub fn with_gpu_name(gpu_name: &str) -> Self {
        Self::with_config(SimulatorConfig {
            gpu_name: gpu_name.to_string(),
            ..SimulatorConfig::default()
        })
    }

    /// Create an uninitialized simulator; options passed to `initialize` override `config`
    pub fn with_config(config: SimulatorConfig) -> Self {
        Self {
            config,
            fleet: Arc::new(Fleet {
                devices: RwLock::new(Vec::new()),
                rng: Mutex::new(StdRng::from_entropy()),
            }),
            updater: Mutex::new(None),
            initialized: false,
        }
    }

    /// Run one recomputation tick now
    pub async fn refresh_metrics(&self) {
        self.fleet.refresh(self.config.realistic_mode).await;
    }

    fn spawn_updater(&self, mut shutdown: Shutdown) -> JoinHandle<()> {
        let fleet = Arc::clone(&self.fleet);
        let interval = self.config.update_interval;
        let realistic_mode = self.config.realistic_mode;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_ms = interval.as_millis() as u64,
                realistic_mode, "Metrics updater started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.triggered() => break,
                    _ = ticker.tick() => fleet.refresh(realistic_mode).await,
                }
            }

            info!("Metrics updater stopped");
        })
    }
}

#[async_trait]
impl GpuProvider for SimulatedProvider {
    async fn initialize(
        &mut self,
        shutdown: Shutdown,
        options: &ProviderOptions,
    ) -> SchedResult<()> {
        if self.initialized {
            return Err(SchedError::Initialization(
                "simulator already initialized".to_string(),
            ));
        }

        self.config = self.config.clone().apply_options(options)?;

        {
            let mut devices = self.fleet.devices.write().await;
            let mut rng = match self.config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };

            *devices = (0..self.config.num_gpus)
                .map(|i| {
                    Arc::new(VirtualDevice::new(
                        i as DeviceId,
                        format!("{}-{}", self.config.gpu_name, i),
                        self.config.memory_per_gpu_bytes,
                        &mut rng,
                    ))
                })
                .collect();

            *self.fleet.rng.lock().unwrap_or_else(|e| e.into_inner()) = rng;
        }

        let handle = self.spawn_updater(shutdown);
        *self.updater.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        self.initialized = true;

        info!(
            devices = self.config.num_gpus,
            memory_per_gpu_mb = self.config.memory_per_gpu_bytes / BYTES_PER_MB,
            realistic_mode = self.config.realistic_mode,
            "Simulator initialized"
        );

        Ok(())
    }

    async fn device_count(&self) -> usize {
        self.fleet.devices.read().await.len()
    }

    async fn device_info(&self, device_id: DeviceId) -> SchedResult<DeviceInfo> {
        let devices = self.fleet.devices.read().await;
        let device = lookup(&devices, device_id)?;
        let state = device.state.read().await;
        Ok(device.info(&state))
    }

    async fn all_devices(&self) -> SchedResult<Vec<DeviceInfo>> {
        let devices = self.fleet.devices.read().await;
        let mut infos = Vec::with_capacity(devices.len());
        for device in devices.iter() {
            let state = device.state.read().await;
            infos.push(device.info(&state));
        }
        Ok(infos)
    }

    async fn metrics(&self, device_id: DeviceId) -> SchedResult<DeviceMetrics> {
        let devices = self.fleet.devices.read().await;
        let device = lookup(&devices, device_id)?;
        let state = device.state.read().await;
        Ok(state.metrics.clone())
    }

    async fn all_metrics(&self) -> SchedResult<Vec<DeviceMetrics>> {
        let devices = self.fleet.devices.read().await;
        let mut metrics = Vec::with_capacity(devices.len());
        for device in devices.iter() {
            metrics.push(device.state.read().await.metrics.clone());
        }
        Ok(metrics)
    }

    async fn capabilities(&self, device_id: DeviceId) -> SchedResult<Capabilities> {
        let devices = self.fleet.devices.read().await;
        lookup(&devices, device_id)?;
        Ok(SIMULATED_CAPABILITIES)
    }

    async fn allocate_job(
        &self,
        device_id: DeviceId,
        request: &AllocationRequest,
    ) -> SchedResult<()> {
        let devices = self.fleet.devices.read().await;
        let device = lookup(&devices, device_id)?;
        let mut state = device.state.write().await;

        if state.running_jobs.contains_key(&request.job_id) {
            return Err(SchedError::InvalidJob(format!(
                "job {} already allocated on device {}",
                request.job_id, device_id
            )));
        }

        let requested = request.memory_mb.saturating_mul(BYTES_PER_MB);
        let free = device.memory_total - state.memory_used;
        if requested > free {
            return Err(SchedError::InsufficientMemory {
                device_id,
                requested_mb: request.memory_mb,
                free_mb: free / BYTES_PER_MB,
            });
        }

        let compute_intensity = if request.compute_intensity.is_finite() {
            request.compute_intensity.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let pid = self.fleet.with_rng(|rng| rng.gen_range(1..65536));

        state.running_jobs.insert(
            request.job_id.clone(),
            SimulatedJob {
                pid,
                memory_allocated: requested,
                compute_intensity,
            },
        );
        state.memory_used += requested;
        device.sync_memory_view(&mut state);

        debug!(
            device_id,
            job_id = %request.job_id,
            memory_mb = request.memory_mb,
            compute_intensity,
            "Allocated job on simulated device"
        );

        Ok(())
    }

    async fn release_job(&self, device_id: DeviceId, job_id: &str) -> SchedResult<()> {
        let devices = self.fleet.devices.read().await;
        let device = lookup(&devices, device_id)?;
        let mut state = device.state.write().await;

        let job = state
            .running_jobs
            .remove(job_id)
            .ok_or_else(|| SchedError::JobNotFoundOnDevice {
                device_id,
                job_id: job_id.to_string(),
            })?;
        state.memory_used -= job.memory_allocated;
        device.sync_memory_view(&mut state);

        debug!(
            device_id,
            job_id,
            memory_mb = job.memory_allocated / BYTES_PER_MB,
            "Released job from simulated device"
        );

        Ok(())
    }

    async fn enable_mps(&self, _device_id: DeviceId) -> SchedResult<()> {
        Ok(())
    }

    async fn disable_mps(&self, _device_id: DeviceId) -> SchedResult<()> {
        Ok(())
    }

    async fn configure_mig(&self, _device_id: DeviceId, _config: &MigConfig) -> SchedResult<()> {
        // Capability absence wins over id validation.
        Err(SchedError::NotSupported(
            "MIG partitioning is not simulated".to_string(),
        ))
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn vendor(&self) -> GpuVendor {
        GpuVendor::Simulator
    }

    async fn close(&self) -> SchedResult<()> {
        let handle = self.updater.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            info!("Simulator closed");
        }
        Ok(())
    }
}
