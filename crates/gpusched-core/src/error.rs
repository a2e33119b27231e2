//! Error types for gpusched

use crate::device::DeviceId;
use crate::job::JobStatus;
use thiserror::Error;

/// Main error type for gpusched
#[derive(Error, Debug)]
pub enum SchedError {
    /// No backend is registered under the requested name
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// Device id outside the provider's `[0, count)` range
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// Allocation exceeds the free memory of a device
    #[error("Insufficient memory on device {device_id}: requested {requested_mb} MB, free {free_mb} MB")]
    InsufficientMemory {
        device_id: DeviceId,
        requested_mb: u64,
        free_mb: u64,
    },

    /// Release for a job the device does not currently hold
    #[error("Job {job_id} not found on device {device_id}")]
    JobNotFoundOnDevice { device_id: DeviceId, job_id: String },

    /// Capability the backend does not implement
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Bad provider configuration or unreachable hardware
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Job id unknown to the scheduler
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Malformed job submission
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Job id already tracked by the scheduler
    #[error("Duplicate job: {0}")]
    DuplicateJob(String),

    /// Status change not allowed by the job lifecycle
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// Prediction service failure
    #[error("Predictor error: {0}")]
    Predictor(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpusched operations
pub type SchedResult<T> = Result<T, SchedError>;

impl SchedError {
    /// Device-id and capacity failures the placement loop absorbs by
    /// treating the device as ineligible and retrying later.
    pub fn is_placement_retryable(&self) -> bool {
        matches!(
            self,
            SchedError::DeviceNotFound(_)
                | SchedError::InsufficientMemory { .. }
                | SchedError::JobNotFoundOnDevice { .. }
        )
    }
}

impl From<serde_json::Error> for SchedError {
    fn from(err: serde_json::Error) -> Self {
        SchedError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SchedError {
    fn from(err: toml::de::Error) -> Self {
        SchedError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::InsufficientMemory {
            device_id: 1,
            requested_mb: 4096,
            free_mb: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient memory on device 1: requested 4096 MB, free 1024 MB"
        );

        let err = SchedError::InvalidTransition {
            job_id: "a".to_string(),
            from: JobStatus::Completed,
            to: JobStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for job a: Completed -> Running"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SchedError = io_err.into();
        assert!(matches!(err, SchedError::Io(_)));
    }

    #[test]
    fn test_placement_retryable() {
        assert!(SchedError::DeviceNotFound(9).is_placement_retryable());
        assert!(SchedError::InsufficientMemory {
            device_id: 0,
            requested_mb: 1,
            free_mb: 0
        }
        .is_placement_retryable());
        assert!(!SchedError::NotSupported("mig".to_string()).is_placement_retryable());
        assert!(!SchedError::Initialization("bad".to_string()).is_placement_retryable());
    }
}
