//! Main scheduler logic
//!
//! The scheduler owns the job table and the pending queue; it is the only
//! place job status changes. A single placement loop drains the queue in
//! passes. A job that does not fit goes back to the tail, so placement order
//! can differ from submission order once requeueing happens; later jobs that
//! fit are not blocked behind one that does not.

use chrono::Utc;
use gpusched_core::{
    AllocationRequest, DeviceId, DeviceInfo, Job, JobQueue, JobStatus, Placement,
    PredictionRequest, ProviderConfig, ResourceUsage, SchedError, SchedResult, SchedulerConfig,
    Shutdown,
};
use gpusched_provider::{GpuProvider, ProviderRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::placement::{strategy_for, Demand, PlacementDecision, PlacementStrategy};
use crate::predictor::Predictor;

#[derive(Debug, Default)]
struct SchedulerState {
    jobs: HashMap<String, Job>,
    queue: JobQueue,
}

/// Result of one placement attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// Queue was empty
    Idle,
    Placed,
    /// Requeued for a later pass
    Deferred,
    /// Marked Failed
    Failed,
    /// Stale queue entry or job withdrawn mid-placement
    Skipped,
}

/// Job counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub pending: usize,
    pub scheduled: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Scheduler places submitted jobs onto provider devices
pub struct Scheduler {
    provider: Arc<dyn GpuProvider>,
    state: Mutex<SchedulerState>,
    strategy: Arc<dyn PlacementStrategy>,
    predictor: Option<Arc<dyn Predictor>>,
    min_confidence: f64,
    config: SchedulerConfig,
    wakeup: Notify,
}

impl Scheduler {
    /// Create a scheduler over an initialized provider
    pub fn new(provider: Arc<dyn GpuProvider>, config: SchedulerConfig) -> Self {
        let strategy = strategy_for(config.policy);

        info!(
            provider = provider.name(),
            vendor = %provider.vendor(),
            policy = strategy.name(),
            "Scheduler initialized"
        );

        Self {
            provider,
            state: Mutex::new(SchedulerState::default()),
            strategy,
            predictor: None,
            min_confidence: 0.0,
            config,
            wakeup: Notify::new(),
        }
    }

    /// Select, build and initialize a provider by registry name, then create a
    /// scheduler over it. Provider initialization failures are returned as-is.
    pub async fn from_registry(
        registry: &ProviderRegistry,
        provider_config: &ProviderConfig,
        config: SchedulerConfig,
        shutdown: Shutdown,
    ) -> SchedResult<Self> {
        let mut provider = registry.create(&provider_config.name)?;
        if let Err(e) = provider.initialize(shutdown, &provider_config.options).await {
            error!(
                provider = %provider_config.name,
                error = %e,
                "Provider initialization failed"
            );
            return Err(e);
        }

        Ok(Self::new(Arc::from(provider), config))
    }

    /// Consult `predictor` before placement; predictions below `min_confidence` are ignored
    pub fn with_predictor(mut self, predictor: Arc<dyn Predictor>, min_confidence: f64) -> Self {
        self.predictor = Some(predictor);
        self.min_confidence = min_confidence;
        self
    }

    pub fn provider(&self) -> &Arc<dyn GpuProvider> {
        &self.provider
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Record a job as Pending and queue it. Never waits for placement.
    pub async fn submit_job(&self, mut job: Job) -> SchedResult<String> {
        if job.id.trim().is_empty() {
            return Err(SchedError::InvalidJob("job id must not be empty".to_string()));
        }

        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(SchedError::DuplicateJob(job.id));
        }

        job.status = JobStatus::Pending;
        job.submit_time = Utc::now();
        job.start_time = None;
        job.end_time = None;
        job.placement = None;
        job.usage = None;
        job.placement_attempts = 0;
        job.failure_reason = None;

        info!(
            job_id = %job.id,
            name = %job.name,
            gpu_memory_mb = job.resources.gpu_memory_mb,
            gpu_count = job.resources.gpu_count,
            "Job submitted"
        );

        let id = job.id.clone();
        state.queue.enqueue(id.clone());
        state.jobs.insert(id.clone(), job);
        drop(state);

        self.wakeup.notify_one();
        Ok(id)
    }

    /// Try every job queued at the start of the pass once. Returns how many were placed.
    pub async fn schedule_pass(&self) -> usize {
        let queued = self.state.lock().await.queue.len();
        let mut placed = 0;

        for _ in 0..queued {
            match self.place_next().await {
                Attempt::Idle => break,
                Attempt::Placed => placed += 1,
                Attempt::Deferred | Attempt::Failed | Attempt::Skipped => {}
            }
        }

        placed
    }

    /// Placement loop. Runs passes until `shutdown` fires, sleeping until the
    /// next submission/release or the poll interval whenever a pass places nothing.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let poll_interval = self.config.poll_interval();
        info!(
            policy = self.strategy.name(),
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Placement loop started"
        );

        while !shutdown.is_triggered() {
            if self.schedule_pass().await > 0 {
                continue;
            }

            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        info!("Placement loop stopped");
    }

    async fn place_next(&self) -> Attempt {
        let job = {
            let mut state = self.state.lock().await;
            let Some(job_id) = state.queue.dequeue() else {
                return Attempt::Idle;
            };
            match state.jobs.get(&job_id) {
                Some(job) if job.status == JobStatus::Pending => job.clone(),
                _ => return Attempt::Skipped,
            }
        };

        let devices = match self.provider.all_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to query devices");
                return self.requeue(&job.id, &e.to_string()).await;
            }
        };

        let declared = Demand::declared(&job);
        if let Some(reason) = declared.unplaceable_reason(&devices) {
            self.fail_pending(&job.id, format!("unplaceable: {}", reason))
                .await;
            return Attempt::Failed;
        }

        let Some((decision, demand)) = self.plan(&job, &declared, &devices).await else {
            debug!(
                job_id = %job.id,
                gpu_memory_mb = declared.memory_mb,
                "No device has room, requeueing"
            );
            return self
                .requeue(&job.id, "no device with enough free memory")
                .await;
        };

        if let Err(e) = self.allocate(&job.id, &decision, &demand).await {
            if !e.is_placement_retryable() {
                self.fail_pending(&job.id, format!("allocation rejected: {}", e))
                    .await;
                return Attempt::Failed;
            }
            debug!(job_id = %job.id, error = %e, "Allocation lost a race, requeueing");
            return self.requeue(&job.id, &e.to_string()).await;
        }

        self.commit_placement(&job.id, &decision, &devices).await
    }

    /// Choose devices, refining the declared demand with a confident prediction
    async fn plan(
        &self,
        job: &Job,
        declared: &Demand,
        devices: &[DeviceInfo],
    ) -> Option<(PlacementDecision, Demand)> {
        let decision = self.strategy.place(declared, devices)?;
        let Some(predictor) = &self.predictor else {
            return Some((decision, declared.clone()));
        };

        let request = PredictionRequest {
            job: job.clone(),
            co_located_jobs: self.co_located_jobs(devices, decision.primary()).await,
        };

        let prediction = match predictor.predict(&request).await {
            Ok(response) => response.for_job(&job.id).cloned(),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Predictor unavailable, using declared requirements");
                None
            }
        };
        let Some(prediction) = prediction.filter(|p| p.confidence >= self.min_confidence) else {
            return Some((decision, declared.clone()));
        };

        let adjusted = Demand {
            memory_mb: declared.memory_mb.max(prediction.predicted_memory_mb),
            estimated_runtime_secs: prediction.predicted_runtime_secs.max(0.0),
            ..declared.clone()
        };
        if adjusted.memory_mb == declared.memory_mb {
            return Some((decision, adjusted));
        }

        match self.strategy.place(&adjusted, devices) {
            Some(refined) => {
                debug!(
                    job_id = %job.id,
                    declared_mb = declared.memory_mb,
                    predicted_mb = adjusted.memory_mb,
                    "Using predicted memory demand"
                );
                Some((refined, adjusted))
            }
            None => {
                warn!(
                    job_id = %job.id,
                    predicted_mb = adjusted.memory_mb,
                    "Predicted memory does not fit, using declared requirements"
                );
                Some((
                    decision,
                    Demand {
                        memory_mb: declared.memory_mb,
                        ..adjusted
                    },
                ))
            }
        }
    }

    async fn co_located_jobs(&self, devices: &[DeviceInfo], device_id: DeviceId) -> Vec<Job> {
        let Some(device) = devices.iter().find(|d| d.id == device_id) else {
            return Vec::new();
        };
        let state = self.state.lock().await;
        device
            .running_jobs
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    /// Allocate on every chosen device, rolling back on the first failure
    async fn allocate(
        &self,
        job_id: &str,
        decision: &PlacementDecision,
        demand: &Demand,
    ) -> SchedResult<()> {
        let request = AllocationRequest {
            job_id: job_id.to_string(),
            memory_mb: demand.memory_mb,
            compute_intensity: demand.compute_intensity,
            estimated_runtime_secs: demand.estimated_runtime_secs,
        };

        for (i, device_id) in decision.device_ids.iter().enumerate() {
            if let Err(e) = self.provider.allocate_job(*device_id, &request).await {
                self.release_devices(job_id, &decision.device_ids[..i]).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn release_devices(&self, job_id: &str, device_ids: &[DeviceId]) {
        for device_id in device_ids {
            if let Err(e) = self.provider.release_job(*device_id, job_id).await {
                warn!(job_id, device_id, error = %e, "Failed to release device");
            }
        }
    }

    async fn commit_placement(
        &self,
        job_id: &str,
        decision: &PlacementDecision,
        devices: &[DeviceInfo],
    ) -> Attempt {
        let mut state = self.state.lock().await;
        let job = match state.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Pending => job,
            _ => {
                // Cancelled while the allocation was in flight.
                self.release_devices(job_id, &decision.device_ids).await;
                return Attempt::Skipped;
            }
        };

        let primary = decision.primary();
        let supports_mps = devices
            .iter()
            .find(|d| d.id == primary)
            .map_or(false, |d| d.capabilities.supports_mps);
        let fraction = job.resources.gpu_fraction;
        let use_mps = supports_mps && fraction > 0.0 && fraction < 1.0;

        job.placement = Some(Placement {
            device_id: primary,
            device_ids: decision.device_ids.clone(),
            node_id: self.config.node_id.clone(),
            use_mps,
            container_id: None,
        });
        if let Err(e) = job
            .transition(JobStatus::Scheduled)
            .and_then(|()| job.transition(JobStatus::Running))
        {
            error!(job_id, error = %e, "Unexpected lifecycle state after allocation");
            return Attempt::Skipped;
        }
        job.start_time = Some(Utc::now());

        info!(
            job_id,
            device_id = primary,
            devices = ?decision.device_ids,
            use_mps,
            "Job placed"
        );
        drop(state);

        if use_mps {
            if let Err(e) = self.provider.enable_mps(primary).await {
                debug!(device_id = primary, error = %e, "MPS not enabled");
            }
        }

        Attempt::Placed
    }

    /// Put a job back at the tail, or fail it once its attempt budget is spent
    async fn requeue(&self, job_id: &str, reason: &str) -> Attempt {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Attempt::Skipped;
        };
        if job.status != JobStatus::Pending {
            return Attempt::Skipped;
        }

        job.placement_attempts += 1;
        if let Some(max) = self.config.max_placement_attempts {
            if job.placement_attempts >= max {
                let attempts = job.placement_attempts;
                Self::mark_failed(
                    job,
                    format!("not placed after {} attempts: {}", attempts, reason),
                );
                return Attempt::Failed;
            }
        }

        state.queue.enqueue(job_id.to_string());
        Attempt::Deferred
    }

    async fn fail_pending(&self, job_id: &str, reason: String) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(job_id) {
            if job.status == JobStatus::Pending {
                Self::mark_failed(job, reason);
            }
        }
    }

    fn mark_failed(job: &mut Job, reason: String) {
        warn!(job_id = %job.id, reason = %reason, "Job failed before placement");
        job.status = JobStatus::Failed;
        job.end_time = Some(Utc::now());
        job.failure_reason = Some(reason);
    }

    /// Report a job's exit. Code 0 completes it, anything else fails it.
    pub async fn complete_job(&self, job_id: &str, exit_code: i32) -> SchedResult<Job> {
        if exit_code == 0 {
            self.finish(job_id, JobStatus::Completed, exit_code, None)
                .await
        } else {
            self.finish(
                job_id,
                JobStatus::Failed,
                exit_code,
                Some(format!("exited with code {}", exit_code)),
            )
            .await
        }
    }

    /// Report that a running job failed
    pub async fn fail_job(&self, job_id: &str, reason: String) -> SchedResult<Job> {
        self.finish(job_id, JobStatus::Failed, -1, Some(reason)).await
    }

    async fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        exit_code: i32,
        reason: Option<String>,
    ) -> SchedResult<Job> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedError::JobNotFound(job_id.to_string()))?;

        if job.status != JobStatus::Running {
            return Err(SchedError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: status,
            });
        }
        let placement = job
            .placement
            .clone()
            .ok_or_else(|| SchedError::Internal(format!("running job {} has no placement", job_id)))?;

        let mut peak_memory_mb = 0;
        let mut utilization_sum = 0.0;
        let mut samples = 0usize;
        for device_id in &placement.device_ids {
            match self.provider.metrics(*device_id).await {
                Ok(metrics) => {
                    let used = metrics
                        .job_memory_mb(job_id)
                        .unwrap_or(job.resources.gpu_memory_mb);
                    peak_memory_mb = peak_memory_mb.max(used);
                    utilization_sum += metrics.utilization.gpu;
                    samples += 1;
                }
                Err(e) => warn!(job_id, device_id, error = %e, "Final metrics unavailable"),
            }
            if let Err(e) = self.provider.release_job(*device_id, job_id).await {
                warn!(job_id, device_id, error = %e, "Failed to release device");
            }
        }

        job.transition(status)?;
        job.end_time = Some(Utc::now());
        job.usage = Some(ResourceUsage {
            peak_gpu_memory_mb: peak_memory_mb,
            avg_gpu_utilization: if samples > 0 {
                utilization_sum / samples as f64
            } else {
                0.0
            },
            runtime_secs: job.runtime_secs().unwrap_or(0.0),
            exit_code,
        });
        job.failure_reason = reason;

        info!(job_id, status = %status, exit_code, "Job finished");
        let snapshot = job.clone();
        drop(state);

        self.wakeup.notify_one();
        Ok(snapshot)
    }

    /// Withdraw a job that has not been placed yet
    pub async fn cancel_job(&self, job_id: &str) -> SchedResult<Job> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedError::JobNotFound(job_id.to_string()))?;

        job.transition(JobStatus::Cancelled)?;
        job.end_time = Some(Utc::now());
        let snapshot = job.clone();
        state.queue.remove(job_id);
        drop(state);

        info!(job_id, "Job cancelled");
        self.wakeup.notify_one();
        Ok(snapshot)
    }

    pub async fn get_job(&self, job_id: &str) -> SchedResult<Job> {
        self.state
            .lock()
            .await
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| SchedError::JobNotFound(job_id.to_string()))
    }

    /// All jobs, oldest submission first
    pub async fn list_jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.submit_time.cmp(&b.submit_time).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Queued job ids, head first
    pub async fn queued_job_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.queue.iter().map(str::to_string).collect()
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        let mut stats = SchedulerStats {
            queued: state.queue.len(),
            ..SchedulerStats::default()
        };
        for job in state.jobs.values() {
            let count = match job.status {
                JobStatus::Pending => &mut stats.pending,
                JobStatus::Scheduled => &mut stats.scheduled,
                JobStatus::Running => &mut stats.running,
                JobStatus::Completed => &mut stats.completed,
                JobStatus::Failed => &mut stats.failed,
                JobStatus::Cancelled => &mut stats.cancelled,
            };
            *count += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gpusched_core::{
        shutdown, Capabilities, DeviceMetrics, GpuVendor, MigConfig, Prediction,
        PredictionResponse, ProviderOptions, ResourceRequirements, ShutdownTrigger,
    };
    use gpusched_provider::SimulatedProvider;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn sim_options(num_gpus: u64, memory_gb: u64) -> ProviderOptions {
        ProviderOptions::from([
            ("num_gpus".to_string(), json!(num_gpus)),
            ("memory_per_gpu_gb".to_string(), json!(memory_gb)),
            ("realistic_mode".to_string(), json!(false)),
            ("update_interval_ms".to_string(), json!(3_600_000)),
        ])
    }

    async fn simulator(num_gpus: u64, memory_gb: u64) -> (Arc<dyn GpuProvider>, ShutdownTrigger) {
        let (trigger, shutdown) = shutdown::channel();
        let mut provider = SimulatedProvider::new();
        provider
            .initialize(shutdown, &sim_options(num_gpus, memory_gb))
            .await
            .unwrap();
        (Arc::new(provider), trigger)
    }

    async fn scheduler(num_gpus: u64, memory_gb: u64) -> (Scheduler, ShutdownTrigger) {
        let (provider, trigger) = simulator(num_gpus, memory_gb).await;
        (Scheduler::new(provider, SchedulerConfig::default()), trigger)
    }

    fn job(name: &str, memory_mb: u64) -> Job {
        Job::new(
            name.to_string(),
            "pytorch:latest".to_string(),
            vec!["python".to_string(), "train.py".to_string()],
        )
        .with_resources(ResourceRequirements::gpu_memory(memory_mb))
    }

    #[tokio::test]
    async fn test_two_of_three_jobs_fit() {
        let (scheduler, _trigger) = scheduler(2, 8).await;
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            ids.push(scheduler.submit_job(job(name, 5000)).await.unwrap());
        }

        assert_eq!(scheduler.schedule_pass().await, 2);

        let jobs: Vec<Job> = {
            let mut jobs = Vec::new();
            for id in &ids {
                jobs.push(scheduler.get_job(id).await.unwrap());
            }
            jobs
        };
        let running: Vec<&Job> = jobs.iter().filter(|j| j.status == JobStatus::Running).collect();
        assert_eq!(running.len(), 2);
        let mut devices: Vec<DeviceId> = running
            .iter()
            .map(|j| j.placement.as_ref().unwrap().device_id)
            .collect();
        devices.sort();
        assert_eq!(devices, vec![0, 1]);
        assert!(running.iter().all(|j| j.start_time.is_some()));

        assert_eq!(jobs[2].status, JobStatus::Pending);
        assert!(jobs[2].placement.is_none());
        assert_eq!(scheduler.queued_job_ids().await, vec![ids[2].clone()]);
    }

    #[tokio::test]
    async fn test_waiting_job_placed_after_completion() {
        let (scheduler, _trigger) = scheduler(2, 8).await;
        let a = scheduler.submit_job(job("a", 5000)).await.unwrap();
        scheduler.submit_job(job("b", 5000)).await.unwrap();
        let c = scheduler.submit_job(job("c", 5000)).await.unwrap();
        scheduler.schedule_pass().await;

        let done = scheduler.complete_job(&a, 0).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        assert_eq!(scheduler.schedule_pass().await, 1);
        let c = scheduler.get_job(&c).await.unwrap();
        assert_eq!(c.status, JobStatus::Running);
        assert_eq!(
            c.placement.unwrap().device_id,
            done.placement.unwrap().device_id
        );
        assert_eq!(scheduler.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_best_fit_packs_tightly() {
        let (scheduler, _trigger) = scheduler(2, 8).await;
        scheduler
            .provider()
            .allocate_job(
                1,
                &AllocationRequest {
                    job_id: "external".to_string(),
                    memory_mb: 4000,
                    compute_intensity: 0.5,
                    estimated_runtime_secs: 0.0,
                },
            )
            .await
            .unwrap();

        let id = scheduler.submit_job(job("small", 2000)).await.unwrap();
        scheduler.schedule_pass().await;
        let placed = scheduler.get_job(&id).await.unwrap();
        assert_eq!(placed.placement.unwrap().device_id, 1);
    }

    #[tokio::test]
    async fn test_requeue_does_not_block_later_jobs() {
        let (scheduler, _trigger) = scheduler(1, 8).await;
        let first = scheduler.submit_job(job("first", 6000)).await.unwrap();
        scheduler.schedule_pass().await;

        let big = scheduler.submit_job(job("big", 4000)).await.unwrap();
        let small = scheduler.submit_job(job("small", 1000)).await.unwrap();
        assert_eq!(scheduler.schedule_pass().await, 1);

        assert_eq!(scheduler.get_job(&first).await.unwrap().status, JobStatus::Running);
        assert_eq!(scheduler.get_job(&small).await.unwrap().status, JobStatus::Running);
        let big = scheduler.get_job(&big).await.unwrap();
        assert_eq!(big.status, JobStatus::Pending);
        assert_eq!(big.placement_attempts, 1);
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let (scheduler, _trigger) = scheduler(1, 8).await;

        let mut anonymous = job("a", 100);
        anonymous.id = String::new();
        assert!(matches!(
            scheduler.submit_job(anonymous).await.unwrap_err(),
            SchedError::InvalidJob(_)
        ));

        let first = job("a", 100);
        let duplicate = first.clone();
        scheduler.submit_job(first).await.unwrap();
        assert!(matches!(
            scheduler.submit_job(duplicate).await.unwrap_err(),
            SchedError::DuplicateJob(_)
        ));
        assert_eq!(scheduler.queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_unplaceable_job_fails_with_reason() {
        let (scheduler, _trigger) = scheduler(2, 8).await;
        let too_big = scheduler.submit_job(job("huge", 10000)).await.unwrap();
        let mut gang = job("gang", 1000);
        gang.resources.gpu_count = 3;
        let gang = scheduler.submit_job(gang).await.unwrap();

        assert_eq!(scheduler.schedule_pass().await, 0);

        for id in [&too_big, &gang] {
            let failed = scheduler.get_job(id).await.unwrap();
            assert_eq!(failed.status, JobStatus::Failed);
            assert!(failed.failure_reason.unwrap().starts_with("unplaceable"));
            assert!(failed.end_time.is_some());
        }
        assert_eq!(scheduler.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_bounded_retries() {
        let (provider, _trigger) = simulator(1, 8).await;
        let config = SchedulerConfig {
            max_placement_attempts: Some(2),
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(provider, config);

        scheduler.submit_job(job("filler", 8000)).await.unwrap();
        let waiting = scheduler.submit_job(job("waiting", 4000)).await.unwrap();

        scheduler.schedule_pass().await;
        let job = scheduler.get_job(&waiting).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.placement_attempts, 1);

        scheduler.schedule_pass().await;
        let job = scheduler.get_job(&waiting).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().contains("after 2 attempts"));
        assert_eq!(scheduler.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_pending_only() {
        let (scheduler, _trigger) = scheduler(1, 8).await;
        let placed = scheduler.submit_job(job("placed", 8000)).await.unwrap();
        scheduler.schedule_pass().await;
        let waiting = scheduler.submit_job(job("waiting", 1000)).await.unwrap();

        let cancelled = scheduler.cancel_job(&waiting).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.placement.is_none());
        assert_eq!(scheduler.queue_len().await, 0);

        assert!(matches!(
            scheduler.cancel_job(&placed).await.unwrap_err(),
            SchedError::InvalidTransition { .. }
        ));
        assert!(matches!(
            scheduler.cancel_job("missing").await.unwrap_err(),
            SchedError::JobNotFound(_)
        ));

        let device = scheduler.provider().device_info(0).await.unwrap();
        assert_eq!(device.running_jobs, vec![placed]);
    }

    #[tokio::test]
    async fn test_completion_fills_usage_and_frees_device() {
        let (scheduler, _trigger) = scheduler(1, 8).await;
        let id = scheduler.submit_job(job("a", 3000)).await.unwrap();
        scheduler.schedule_pass().await;
        assert_eq!(
            scheduler.provider().device_info(0).await.unwrap().memory.free_mb,
            8192 - 3000
        );

        let done = scheduler.complete_job(&id, 0).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.end_time.is_some());
        assert!(done.failure_reason.is_none());
        let usage = done.usage.unwrap();
        assert_eq!(usage.peak_gpu_memory_mb, 3000);
        assert_eq!(usage.exit_code, 0);
        assert!(usage.runtime_secs >= 0.0);

        assert_eq!(
            scheduler.provider().device_info(0).await.unwrap().memory.free_mb,
            8192
        );
        assert!(matches!(
            scheduler.complete_job(&id, 0).await.unwrap_err(),
            SchedError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_nonzero_exit_and_explicit_failure() {
        let (scheduler, _trigger) = scheduler(2, 8).await;
        let a = scheduler.submit_job(job("a", 1000)).await.unwrap();
        let b = scheduler.submit_job(job("b", 1000)).await.unwrap();
        let pending = scheduler.submit_job(job("c", 100_000)).await.unwrap();
        scheduler.schedule_pass().await;

        let a = scheduler.complete_job(&a, 137).await.unwrap();
        assert_eq!(a.status, JobStatus::Failed);
        assert_eq!(a.usage.unwrap().exit_code, 137);
        assert_eq!(a.failure_reason.as_deref(), Some("exited with code 137"));

        let b = scheduler.fail_job(&b, "node lost".to_string()).await.unwrap();
        assert_eq!(b.status, JobStatus::Failed);
        assert_eq!(b.failure_reason.as_deref(), Some("node lost"));

        assert!(scheduler.fail_job(&pending, "x".to_string()).await.is_err());

        let stats = scheduler.stats().await;
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_gang_placement_and_release() {
        let (scheduler, _trigger) = scheduler(3, 8).await;
        let mut gang = job("gang", 4000);
        gang.resources.gpu_count = 2;
        let id = scheduler.submit_job(gang).await.unwrap();
        scheduler.schedule_pass().await;

        let placed = scheduler.get_job(&id).await.unwrap();
        let placement = placed.placement.unwrap();
        assert_eq!(placement.device_ids, vec![0, 1]);
        assert_eq!(placement.device_id, 0);
        for device_id in [0, 1] {
            let info = scheduler.provider().device_info(device_id).await.unwrap();
            assert_eq!(info.running_jobs, vec![id.clone()]);
        }

        scheduler.complete_job(&id, 0).await.unwrap();
        for device in scheduler.provider().all_devices().await.unwrap() {
            assert!(device.running_jobs.is_empty());
            assert_eq!(device.memory.used_mb, 0);
        }
    }

    #[tokio::test]
    async fn test_fractional_job_uses_mps() {
        let (scheduler, _trigger) = scheduler(1, 8).await;
        let mut shared = job("shared", 1000);
        shared.resources.gpu_fraction = 0.5;
        let shared = scheduler.submit_job(shared).await.unwrap();
        let whole = scheduler.submit_job(job("whole", 1000)).await.unwrap();
        scheduler.schedule_pass().await;

        let shared = scheduler.get_job(&shared).await.unwrap();
        assert!(shared.placement.unwrap().use_mps);
        let whole = scheduler.get_job(&whole).await.unwrap();
        assert!(!whole.placement.unwrap().use_mps);
    }

    /// Simulator wrapper whose first `failures` allocations lose a race.
    /// With a gate, every allocation parks until the gate is released.
    struct RacyProvider {
        inner: SimulatedProvider,
        failures: AtomicUsize,
        gate: Option<Arc<AllocationGate>>,
    }

    #[derive(Default)]
    struct AllocationGate {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl GpuProvider for RacyProvider {
        async fn initialize(&mut self, shutdown: Shutdown, options: &ProviderOptions) -> SchedResult<()> {
            self.inner.initialize(shutdown, options).await
        }
        async fn device_count(&self) -> usize {
            self.inner.device_count().await
        }
        async fn device_info(&self, device_id: DeviceId) -> SchedResult<DeviceInfo> {
            self.inner.device_info(device_id).await
        }
        async fn all_devices(&self) -> SchedResult<Vec<DeviceInfo>> {
            self.inner.all_devices().await
        }
        async fn metrics(&self, device_id: DeviceId) -> SchedResult<DeviceMetrics> {
            self.inner.metrics(device_id).await
        }
        async fn all_metrics(&self) -> SchedResult<Vec<DeviceMetrics>> {
            self.inner.all_metrics().await
        }
        async fn capabilities(&self, device_id: DeviceId) -> SchedResult<Capabilities> {
            self.inner.capabilities(device_id).await
        }
        async fn allocate_job(&self, device_id: DeviceId, request: &AllocationRequest) -> SchedResult<()> {
            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SchedError::InsufficientMemory {
                    device_id,
                    requested_mb: request.memory_mb,
                    free_mb: 0,
                });
            }
            self.inner.allocate_job(device_id, request).await
        }
        async fn release_job(&self, device_id: DeviceId, job_id: &str) -> SchedResult<()> {
            self.inner.release_job(device_id, job_id).await
        }
        async fn configure_mig(&self, device_id: DeviceId, config: &MigConfig) -> SchedResult<()> {
            self.inner.configure_mig(device_id, config).await
        }
        fn name(&self) -> &'static str {
            "racy"
        }
        fn vendor(&self) -> GpuVendor {
            GpuVendor::Simulator
        }
        async fn close(&self) -> SchedResult<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_allocation_race_requeues() {
        let (_trigger, shutdown) = shutdown::channel();
        let mut provider = RacyProvider {
            inner: SimulatedProvider::new(),
            failures: AtomicUsize::new(1),
            gate: None,
        };
        provider.initialize(shutdown, &sim_options(1, 8)).await.unwrap();
        let scheduler = Scheduler::new(Arc::new(provider), SchedulerConfig::default());

        let id = scheduler.submit_job(job("a", 1000)).await.unwrap();
        assert_eq!(scheduler.schedule_pass().await, 0);
        let waiting = scheduler.get_job(&id).await.unwrap();
        assert_eq!(waiting.status, JobStatus::Pending);
        assert_eq!(scheduler.queue_len().await, 1);

        assert_eq!(scheduler.schedule_pass().await, 1);
        assert_eq!(scheduler.get_job(&id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_cancel_during_allocation_releases_device() {
        let (_trigger, shutdown) = shutdown::channel();
        let gate = Arc::new(AllocationGate::default());
        let mut provider = RacyProvider {
            inner: SimulatedProvider::new(),
            failures: AtomicUsize::new(0),
            gate: Some(Arc::clone(&gate)),
        };
        provider.initialize(shutdown, &sim_options(1, 8)).await.unwrap();
        let scheduler = Arc::new(Scheduler::new(Arc::new(provider), SchedulerConfig::default()));

        let id = scheduler.submit_job(job("a", 2000)).await.unwrap();
        let pass = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.schedule_pass().await }
        });

        gate.entered.notified().await;
        let cancelled = scheduler.cancel_job(&id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        gate.release.notify_one();

        assert_eq!(pass.await.unwrap(), 0);
        let job = scheduler.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.placement.is_none());

        let device = scheduler.provider().device_info(0).await.unwrap();
        assert_eq!(device.memory.used_mb, 0);
        assert!(device.running_jobs.is_empty());
        assert_eq!(scheduler.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_rejected_allocation_fails_job() {
        let (scheduler, _trigger) = scheduler(1, 8).await;
        scheduler
            .provider()
            .allocate_job(
                0,
                &AllocationRequest {
                    job_id: "x".to_string(),
                    memory_mb: 1000,
                    compute_intensity: 0.5,
                    estimated_runtime_secs: 0.0,
                },
            )
            .await
            .unwrap();

        let mut clash = job("clash", 1000);
        clash.id = "x".to_string();
        scheduler.submit_job(clash).await.unwrap();

        assert_eq!(scheduler.schedule_pass().await, 0);
        let failed = scheduler.get_job("x").await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.failure_reason.unwrap().contains("allocation rejected"));
        assert!(failed.end_time.is_some());
        assert_eq!(scheduler.queue_len().await, 0);

        let device = scheduler.provider().device_info(0).await.unwrap();
        assert_eq!(device.memory.used_mb, 1000);
    }

    struct FixedPredictor {
        memory_mb: u64,
        confidence: f64,
    }

    #[async_trait]
    impl Predictor for FixedPredictor {
        async fn predict(&self, request: &PredictionRequest) -> SchedResult<PredictionResponse> {
            Ok(PredictionResponse {
                predictions: vec![Prediction {
                    job_id: request.job.id.clone(),
                    predicted_memory_mb: self.memory_mb,
                    predicted_runtime_secs: 90.0,
                    confidence: self.confidence,
                    interference_probability: 0.0,
                }],
                model_version: "test".to_string(),
            })
        }
    }

    struct DownPredictor;

    #[async_trait]
    impl Predictor for DownPredictor {
        async fn predict(&self, _request: &PredictionRequest) -> SchedResult<PredictionResponse> {
            Err(SchedError::Predictor("connection refused".to_string()))
        }
    }

    async fn occupied_fleet() -> (Arc<dyn GpuProvider>, ShutdownTrigger) {
        let (provider, trigger) = simulator(2, 8).await;
        provider
            .allocate_job(
                0,
                &AllocationRequest {
                    job_id: "external".to_string(),
                    memory_mb: 4000,
                    compute_intensity: 0.5,
                    estimated_runtime_secs: 0.0,
                },
            )
            .await
            .unwrap();
        (provider, trigger)
    }

    #[tokio::test]
    async fn test_confident_prediction_raises_demand() {
        let (provider, _trigger) = occupied_fleet().await;
        let scheduler = Scheduler::new(provider, SchedulerConfig::default()).with_predictor(
            Arc::new(FixedPredictor {
                memory_mb: 6000,
                confidence: 0.9,
            }),
            0.5,
        );

        let id = scheduler.submit_job(job("a", 1000)).await.unwrap();
        scheduler.schedule_pass().await;

        let placed = scheduler.get_job(&id).await.unwrap();
        assert_eq!(placed.placement.unwrap().device_id, 1);
        let device = scheduler.provider().device_info(1).await.unwrap();
        assert_eq!(device.memory.used_mb, 6000);
    }

    #[tokio::test]
    async fn test_low_confidence_prediction_ignored() {
        let (provider, _trigger) = occupied_fleet().await;
        let scheduler = Scheduler::new(provider, SchedulerConfig::default()).with_predictor(
            Arc::new(FixedPredictor {
                memory_mb: 6000,
                confidence: 0.2,
            }),
            0.5,
        );

        let id = scheduler.submit_job(job("a", 1000)).await.unwrap();
        scheduler.schedule_pass().await;
        assert_eq!(
            scheduler.get_job(&id).await.unwrap().placement.unwrap().device_id,
            0
        );
    }

    #[tokio::test]
    async fn test_predictor_outage_falls_back() {
        let (provider, _trigger) = occupied_fleet().await;
        let scheduler = Scheduler::new(provider, SchedulerConfig::default())
            .with_predictor(Arc::new(DownPredictor), 0.5);

        let id = scheduler.submit_job(job("a", 1000)).await.unwrap();
        assert_eq!(scheduler.schedule_pass().await, 1);
        let placed = scheduler.get_job(&id).await.unwrap();
        assert_eq!(placed.status, JobStatus::Running);
        assert_eq!(placed.placement.unwrap().device_id, 0);
        assert_eq!(
            scheduler.provider().device_info(0).await.unwrap().memory.used_mb,
            5000
        );
    }

    #[tokio::test]
    async fn test_run_loop_places_and_stops() {
        let (provider, _provider_trigger) = simulator(1, 8).await;
        let config = SchedulerConfig {
            poll_interval_ms: 20,
            ..SchedulerConfig::default()
        };
        let scheduler = Arc::new(Scheduler::new(provider, config));
        let (trigger, shutdown) = shutdown::channel();

        let runner = Arc::clone(&scheduler);
        let handle = tokio::spawn(async move { runner.run(shutdown).await });

        let id = scheduler.submit_job(job("a", 1000)).await.unwrap();
        let running = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if scheduler.get_job(&id).await.unwrap().status == JobStatus::Running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(running.is_ok());

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_from_registry() {
        let registry = ProviderRegistry::with_builtin();
        let (_trigger, shutdown) = shutdown::channel();

        let missing = ProviderConfig {
            name: "nvml".to_string(),
            options: ProviderOptions::new(),
        };
        let err = Scheduler::from_registry(&registry, &missing, SchedulerConfig::default(), shutdown.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SchedError::ProviderNotFound(_)));

        let bad = ProviderConfig {
            name: "simulator".to_string(),
            options: ProviderOptions::from([("num_gpus".to_string(), json!("many"))]),
        };
        let err = Scheduler::from_registry(&registry, &bad, SchedulerConfig::default(), shutdown.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SchedError::Initialization(_)));

        let good = ProviderConfig {
            name: "simulator".to_string(),
            options: sim_options(2, 8),
        };
        let scheduler = Scheduler::from_registry(&registry, &good, SchedulerConfig::default(), shutdown)
            .await
            .unwrap();
        assert_eq!(scheduler.provider().device_count().await, 2);
        assert_eq!(scheduler.strategy_name(), "best-fit");
    }
}
