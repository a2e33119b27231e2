//! gpusched-provider: Device provider abstraction layer
//!
//! This crate provides the backend-neutral device interface:
//! - The `GpuProvider` trait every backend implements
//! - A name-keyed registry for selecting a backend at startup
//! - A simulated backend for development and testing

pub mod registry;
pub mod simulator;
pub mod traits;

pub use registry::{ProviderFactory, ProviderRegistry};
pub use simulator::{SimulatedProvider, SimulatorConfig};
pub use traits::GpuProvider;
