//! Wire types for the external memory/runtime predictor

use crate::job::Job;
use serde::{Deserialize, Serialize};

/// Forecast for a single job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub job_id: String,
    pub predicted_memory_mb: u64,
    pub predicted_runtime_secs: f64,
    /// 0-1
    pub confidence: f64,
    /// Probability the job slows down co-located work (0-1)
    pub interference_probability: f64,
}

/// A job plus the jobs already running on its candidate device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub job: Job,
    pub co_located_jobs: Vec<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub predictions: Vec<Prediction>,
    #[serde(default)]
    pub model_version: String,
}

impl PredictionResponse {
    pub fn for_job(&self, job_id: &str) -> Option<&Prediction> {
        self.predictions.iter().find(|p| p.job_id == job_id)
    }
}
