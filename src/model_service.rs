use crate::decoder::DecodedImage;
use std::path::Path;
use thiserror::Error;

/// One object as emitted by a predictor, in source pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPrediction {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

#[derive(Error, Debug)]
pub enum PredictorError {
    #[error("Session mutex poisoned: {0}")]
    Poisoned(String),
    #[error("Failed to build tensor: {0}")]
    Tensor(String),
    #[error("Inference failed: {0}")]
    Run(String),
    #[error("Unexpected model output: {0}")]
    Output(String),
}

/// A ready-to-run detector. Implementations block, so callers must keep them
/// off the async runtime threads.
pub trait Predictor: Send + Sync + 'static {
    /// Every returned prediction has `confidence >= threshold`.
    fn predict(
        &self,
        image: &DecodedImage,
        threshold: f32,
    ) -> Result<Vec<RawPrediction>, PredictorError>;

    fn framework(&self) -> &'static str;
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Model file not found: {0}")]
    NotFound(String),
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Invalid model artifact: {0}")]
    Invalid(String),
}

/// Everything a loader learns about an artifact.
pub struct ModelArtifact {
    pub predictor: Box<dyn Predictor>,
    pub class_names: Option<Vec<String>>,
    pub input_size: u32,
}

pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, path: &Path) -> Result<ModelArtifact, LoadError>;
}
