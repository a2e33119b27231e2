//! Configuration types for gpusched

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Open key/value options handed to `GpuProvider::initialize`
pub type ProviderOptions = HashMap<String, serde_json::Value>;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Device backend selection
    pub provider: ProviderConfig,
    /// Placement loop configuration
    pub scheduler: SchedulerConfig,
    /// Optional prediction service
    pub predictor: PredictorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::SchedError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::SchedError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::SchedError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

/// Device backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Registry name of the backend
    pub name: String,
    /// Backend-specific options
    pub options: ProviderOptions,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "simulator".to_string(),
            options: ProviderOptions::new(),
        }
    }
}

/// Placement policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementPolicy {
    /// Smallest remaining free memory after placement
    #[default]
    BestFit,
    /// Lowest device id that fits
    FirstFit,
    /// Largest remaining free memory after placement
    WorstFit,
}

impl std::fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementPolicy::BestFit => write!(f, "best-fit"),
            PlacementPolicy::FirstFit => write!(f, "first-fit"),
            PlacementPolicy::WorstFit => write!(f, "worst-fit"),
        }
    }
}

/// Placement loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub policy: PlacementPolicy,
    /// Idle wait between passes when nothing was placed
    pub poll_interval_ms: u64,
    /// Fail a job after this many unsuccessful placement attempts (unbounded if unset)
    pub max_placement_attempts: Option<u32>,
    /// Node recorded in placements
    pub node_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: PlacementPolicy::BestFit,
            poll_interval_ms: 500,
            max_placement_attempts: None,
            node_id: "local".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Prediction service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Base URL; no predictor is consulted when unset
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
    /// Predictions below this confidence are ignored
    pub min_confidence: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 2000,
            min_confidence: 0.5,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
