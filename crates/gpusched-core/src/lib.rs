//! gpusched-core: Core types for the gpusched job scheduler
//!
//! This crate provides the fundamental types used throughout gpusched:
//! - Device identity, capability and telemetry snapshots
//! - Jobs, requirements and the job lifecycle
//! - The pending-job queue
//! - Predictor wire types
//! - Configuration types
//! - Error handling and the shutdown signal

pub mod config;
pub mod device;
pub mod error;
pub mod job;
pub mod prediction;
pub mod queue;
pub mod shutdown;

pub use config::*;
pub use device::*;
pub use error::*;
pub use job::*;
pub use prediction::*;
pub use queue::JobQueue;
pub use shutdown::{Shutdown, ShutdownTrigger};
