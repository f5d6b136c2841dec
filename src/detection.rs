use crate::{
    decoder::decode,
    error::{DetectionError, ValidationError},
    executor::InferenceExecutor,
    resolver::ModelResolver,
    shaper::{shape, DetectionResult},
    telemetry::Metrics,
};
use bytes::Bytes;
use futures::future::try_join_all;
use std::{sync::Arc, time::Instant};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;

#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub image: Bytes,
    pub confidence_threshold: f32,
    pub model_version: Option<String>,
}

impl DetectionRequest {
    pub fn new(image: impl Into<Bytes>, confidence_threshold: f32) -> Self {
        Self {
            image: image.into(),
            confidence_threshold,
            model_version: None,
        }
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.model_version = version;
        self
    }
}

pub fn validate_threshold(threshold: f32) -> Result<f32, ValidationError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(ValidationError::ThresholdOutOfRange(threshold))
    }
}

/// Decode, resolve, infer, shape.
pub struct DetectionService {
    resolver: Arc<ModelResolver>,
    executor: InferenceExecutor,
    metrics: Option<Arc<Metrics>>,
}

impl DetectionService {
    pub fn new(resolver: Arc<ModelResolver>, executor: InferenceExecutor) -> Self {
        Self {
            resolver,
            executor,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn resolver(&self) -> &ModelResolver {
        &self.resolver
    }

    pub async fn detect(&self, request: DetectionRequest) -> Result<DetectionResult, DetectionError> {
        let threshold = validate_threshold(request.confidence_threshold)?;
        let image = Arc::new(decode(&request.image)?);
        let model = self
            .resolver
            .resolve(request.model_version.as_deref())
            .await?;

        let start = Instant::now();
        let predictions = self
            .executor
            .run(model.clone(), image.clone(), threshold)
            .await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if let Some(metrics) = &self.metrics {
            metrics.record_inference_duration(elapsed_ms, &model.version);
        }
        tracing::debug!(
            version = %model.version,
            input_size = model.input_size,
            detections = predictions.len(),
            elapsed_ms,
            "Inference completed"
        );

        Ok(shape(predictions, &image, &model, threshold))
    }

    /// Runs every request concurrently. Results keep input order and the
    /// first failure fails the whole batch.
    pub async fn batch_detect(
        &self,
        requests: Vec<DetectionRequest>,
    ) -> Result<Vec<DetectionResult>, DetectionError> {
        try_join_all(requests.into_iter().map(|request| self.detect(request))).await
    }
}
