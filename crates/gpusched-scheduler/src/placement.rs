//! Device selection policies

use gpusched_core::{DeviceId, DeviceInfo, Job, PlacementPolicy};
use std::cmp::Reverse;
use std::sync::Arc;

/// What a job needs from each device it lands on
#[derive(Debug, Clone, PartialEq)]
pub struct Demand {
    /// Memory per device in MB
    pub memory_mb: u64,
    /// Distinct devices required
    pub gpu_count: usize,
    /// Contribution to device utilization (0-1)
    pub compute_intensity: f64,
    pub estimated_runtime_secs: f64,
}

impl Demand {
    /// Demand from the job's declared requirements
    pub fn declared(job: &Job) -> Self {
        let fraction = job.resources.gpu_fraction;
        let compute_intensity = if fraction.is_finite() && fraction > 0.0 {
            fraction.min(1.0)
        } else {
            1.0
        };

        Self {
            memory_mb: job.resources.gpu_memory_mb,
            gpu_count: job.resources.gpu_count.max(1) as usize,
            compute_intensity,
            estimated_runtime_secs: 0.0,
        }
    }

    /// Whether `device` can take this demand right now
    pub fn fits(&self, device: &DeviceInfo) -> bool {
        device.free_memory_mb() >= self.memory_mb && device.has_process_slot()
    }

    /// Why this demand can never be met by `devices`, even when idle
    pub fn unplaceable_reason(&self, devices: &[DeviceInfo]) -> Option<String> {
        let capable = devices
            .iter()
            .filter(|d| {
                d.memory.total_mb >= self.memory_mb && d.capabilities.max_concurrent_processes > 0
            })
            .count();

        if capable >= self.gpu_count {
            return None;
        }

        let largest = devices.iter().map(|d| d.memory.total_mb).max().unwrap_or(0);
        Some(format!(
            "requires {} GPU(s) with {} MB each; {} of {} devices qualify (largest has {} MB)",
            self.gpu_count,
            self.memory_mb,
            capable,
            devices.len(),
            largest
        ))
    }
}

/// Devices chosen for a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    /// Distinct devices, primary first
    pub device_ids: Vec<DeviceId>,
}

impl PlacementDecision {
    pub fn primary(&self) -> DeviceId {
        self.device_ids[0]
    }
}

/// Strategy for choosing devices
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick `demand.gpu_count` devices that fit, or `None` if too few do
    fn place(&self, demand: &Demand, devices: &[DeviceInfo]) -> Option<PlacementDecision>;
}

fn select_by<K, F>(demand: &Demand, devices: &[DeviceInfo], key: F) -> Option<PlacementDecision>
where
    K: Ord,
    F: Fn(&DeviceInfo) -> K,
{
    if demand.gpu_count == 0 {
        return None;
    }

    let mut eligible: Vec<&DeviceInfo> = devices.iter().filter(|d| demand.fits(d)).collect();
    if eligible.len() < demand.gpu_count {
        return None;
    }

    eligible.sort_by_key(|d| key(*d));
    Some(PlacementDecision {
        device_ids: eligible
            .into_iter()
            .take(demand.gpu_count)
            .map(|d| d.id)
            .collect(),
    })
}

/// Smallest free memory left after placement, lowest id on ties.
/// Keeps large contiguous blocks free on other devices.
pub struct BestFit;

impl PlacementStrategy for BestFit {
    fn name(&self) -> &'static str {
        "best-fit"
    }

    fn place(&self, demand: &Demand, devices: &[DeviceInfo]) -> Option<PlacementDecision> {
        select_by(demand, devices, |d| (d.free_memory_mb() - demand.memory_mb, d.id))
    }
}

/// Lowest device id that fits
pub struct FirstFit;

impl PlacementStrategy for FirstFit {
    fn name(&self) -> &'static str {
        "first-fit"
    }

    fn place(&self, demand: &Demand, devices: &[DeviceInfo]) -> Option<PlacementDecision> {
        select_by(demand, devices, |d| d.id)
    }
}

/// Largest free memory left after placement, lowest id on ties
pub struct WorstFit;

impl PlacementStrategy for WorstFit {
    fn name(&self) -> &'static str {
        "worst-fit"
    }

    fn place(&self, demand: &Demand, devices: &[DeviceInfo]) -> Option<PlacementDecision> {
        select_by(demand, devices, |d| {
            (Reverse(d.free_memory_mb() - demand.memory_mb), d.id)
        })
    }
}

/// Strategy implementing `policy`
pub fn strategy_for(policy: PlacementPolicy) -> Arc<dyn PlacementStrategy> {
    match policy {
        PlacementPolicy::BestFit => Arc::new(BestFit),
        PlacementPolicy::FirstFit => Arc::new(FirstFit),
        PlacementPolicy::WorstFit => Arc::new(WorstFit),
    }
}
