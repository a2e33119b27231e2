//! gpusched-scheduler: Job placement for gpusched
//!
//! This crate provides the scheduling logic that places jobs onto devices:
//! - Pending-job intake and the placement loop
//! - Device selection policies (best, first and worst fit)
//! - Optional consultation of an external memory/runtime predictor
//! - Completion, failure and cancellation handling

pub mod placement;
pub mod predictor;
pub mod scheduler;

pub use placement::{strategy_for, Demand, PlacementDecision, PlacementStrategy};
pub use predictor::{HttpPredictor, Predictor};
pub use scheduler::{Scheduler, SchedulerStats};
