//! Client side of the external memory/runtime predictor

use async_trait::async_trait;
use gpusched_core::{PredictionRequest, PredictionResponse, PredictorConfig, SchedError, SchedResult};
use std::time::Duration;
use tracing::debug;

/// Forecasts memory and runtime for a job next to its co-located jobs
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, request: &PredictionRequest) -> SchedResult<PredictionResponse>;
}

/// Predictor reached over HTTP: `POST {endpoint}/predict` with a JSON body
pub struct HttpPredictor {
    client: reqwest::Client,
    url: String,
}

impl HttpPredictor {
    /// Create a new HTTP predictor client
    pub fn new(endpoint: &str, timeout: Duration) -> SchedResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedError::Predictor(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}/predict", endpoint.trim_end_matches('/')),
        })
    }

    /// Build a client from configuration; `None` when no endpoint is set
    pub fn from_config(config: &PredictorConfig) -> SchedResult<Option<Self>> {
        config
            .endpoint
            .as_deref()
            .map(|endpoint| Self::new(endpoint, Duration::from_millis(config.timeout_ms)))
            .transpose()
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, request: &PredictionRequest) -> SchedResult<PredictionResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| SchedError::Predictor(format!("request to {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SchedError::Predictor(format!(
                "{} returned {}",
                self.url, status
            )));
        }

        let prediction: PredictionResponse = response
            .json()
            .await
            .map_err(|e| SchedError::Predictor(format!("invalid response: {}", e)))?;

        debug!(
            job_id = %request.job.id,
            predictions = prediction.predictions.len(),
            model_version = %prediction.model_version,
            "Predictor responded"
        );

        Ok(prediction)
    }
}
