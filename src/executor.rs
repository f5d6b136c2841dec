use crate::{decoder::DecodedImage, model_service::RawPrediction, resolver::LoadedModel};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum InferenceCause {
    #[error("{0}")]
    Predictor(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("inference worker panicked: {0}")]
    WorkerPanicked(String),
}

#[derive(Error, Debug)]
#[error("inference failed on model {version} for {width}x{height} image: {cause}")]
pub struct InferenceError {
    pub version: String,
    pub width: u32,
    pub height: u32,
    #[source]
    pub cause: InferenceCause,
}

/// Runs predictor calls on the blocking pool, at most `num_workers` at once.
/// Callers beyond that wait for a free permit.
pub struct InferenceExecutor {
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl InferenceExecutor {
    pub fn new(num_workers: usize, timeout: Option<Duration>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(num_workers.max(1))),
            timeout,
        }
    }

    pub async fn run(
        &self,
        model: Arc<LoadedModel>,
        image: Arc<DecodedImage>,
        threshold: f32,
    ) -> Result<Vec<RawPrediction>, InferenceError> {
        let (version, width, height) = (model.version.clone(), image.width(), image.height());
        let job = self.run_job(model, image, threshold);

        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, job).await {
                Ok(outcome) => outcome,
                Err(_) => Err(InferenceCause::TimedOut(limit)),
            },
            None => job.await,
        };

        outcome.map_err(|cause| {
            tracing::error!(version = %version, width, height, error = %cause, "Inference failed");
            InferenceError {
                version,
                width,
                height,
                cause,
            }
        })
    }

    async fn run_job(
        &self,
        model: Arc<LoadedModel>,
        image: Arc<DecodedImage>,
        threshold: f32,
    ) -> Result<Vec<RawPrediction>, InferenceCause> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| InferenceCause::WorkerPanicked(e.to_string()))?;

        // The permit moves into the job so a timed-out caller does not free
        // a slot that is still busy.
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            model.predictor.predict(&image, threshold)
        })
        .await
        .map_err(|e| InferenceCause::WorkerPanicked(e.to_string()))?
        .map_err(|e| InferenceCause::Predictor(e.to_string()))
    }
}
