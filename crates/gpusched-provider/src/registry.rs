//! Name-keyed directory of provider constructors
//!
//! The process-wide registry is populated with the built-in backends on first
//! access; further backends register themselves at startup before any lookup.
//! Tests that need isolation build their own [`ProviderRegistry`].

use gpusched_core::{SchedError, SchedResult};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::debug;

use crate::simulator::SimulatedProvider;
use crate::traits::GpuProvider;

/// Zero-argument constructor for a fresh, uninitialized provider
pub type ProviderFactory = Arc<dyn Fn() -> Box<dyn GpuProvider> + Send + Sync>;

/// Name -> constructor table. Holds no device state.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, ProviderFactory>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the backends shipped with this crate
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(SimulatedProvider::NAME, || {
            Box::new(SimulatedProvider::new()) as Box<dyn GpuProvider>
        });
        registry
    }

    /// Register a factory. An existing entry under `name` is replaced.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn GpuProvider> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        if factories.insert(name.to_string(), Arc::new(factory)).is_some() {
            debug!(provider = name, "Replaced provider registration");
        } else {
            debug!(provider = name, "Registered provider");
        }
    }

    /// Look up the factory registered under `name`
    pub fn get(&self, name: &str) -> SchedResult<ProviderFactory> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories
            .get(name)
            .cloned()
            .ok_or_else(|| SchedError::ProviderNotFound(name.to_string()))
    }

    /// Build a fresh, uninitialized provider registered under `name`
    pub fn create(&self, name: &str) -> SchedResult<Box<dyn GpuProvider>> {
        let factory = self.get(name)?;
        Ok(factory())
    }

    /// Registered names, in no particular order
    pub fn list(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.keys().cloned().collect()
    }
}

static GLOBAL: OnceLock<ProviderRegistry> = OnceLock::new();

/// The process-wide registry
pub fn global() -> &'static ProviderRegistry {
    GLOBAL.get_or_init(ProviderRegistry::with_builtin)
}

/// Register a factory in the process-wide registry (last registration wins)
pub fn register<F>(name: &str, factory: F)
where
    F: Fn() -> Box<dyn GpuProvider> + Send + Sync + 'static,
{
    global().register(name, factory);
}

/// Look up a factory in the process-wide registry
pub fn get(name: &str) -> SchedResult<ProviderFactory> {
    global().get(name)
}

/// Names in the process-wide registry
pub fn list_providers() -> Vec<String> {
    global().list()
}
