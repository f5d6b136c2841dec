//! Stub collaborators shared by the unit tests.

use crate::{
    config::ModelConfig,
    decoder::DecodedImage,
    model_service::{LoadError, ModelArtifact, ModelLoader, Predictor, PredictorError, RawPrediction},
    registry::{ModelRegistry, RegistryError},
};
use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashSet},
    io::Cursor,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

pub fn model_config(dir: &Path) -> ModelConfig {
    ModelConfig {
        default_path: dir.join("default.onnx"),
        versions: BTreeMap::from([("v2".to_string(), dir.join("v2.onnx"))]),
        builtin_path: dir.join("yolov8n.onnx"),
        builtin_url: None,
        labels_file: None,
        input_size: 640,
        iou_threshold: 0.7,
        num_workers: 2,
        inference_timeout_ms: None,
    }
}

pub fn solid_jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, height, Rgb(color));
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buffer, ImageFormat::Jpeg)
        .unwrap();
    buffer.into_inner()
}

/// Emits a fixed set of predictions, filtered by the requested threshold.
pub struct StubPredictor {
    predictions: Vec<RawPrediction>,
    fail: bool,
    delay: Duration,
}

impl StubPredictor {
    pub fn with_predictions(predictions: Vec<RawPrediction>) -> Self {
        Self {
            predictions,
            fail: false,
            delay: Duration::ZERO,
        }
    }

    pub fn failing() -> Self {
        Self {
            predictions: Vec::new(),
            fail: true,
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            predictions: Vec::new(),
            fail: false,
            delay,
        }
    }
}

impl Predictor for StubPredictor {
    fn predict(
        &self,
        _image: &DecodedImage,
        threshold: f32,
    ) -> Result<Vec<RawPrediction>, PredictorError> {
        std::thread::sleep(self.delay);
        if self.fail {
            return Err(PredictorError::Run("stub predictor failure".to_string()));
        }
        Ok(self
            .predictions
            .iter()
            .copied()
            .filter(|p| p.confidence >= threshold)
            .collect())
    }

    fn framework(&self) -> &'static str {
        "YOLOv8"
    }
}

pub fn sample_predictions() -> Vec<RawPrediction> {
    vec![
        RawPrediction {
            x1: 10.0,
            y1: 20.0,
            x2: 100.0,
            y2: 150.0,
            confidence: 0.95,
            class_id: 1,
        },
        RawPrediction {
            x1: 200.0,
            y1: 50.0,
            x2: 300.0,
            y2: 200.0,
            confidence: 0.5,
            class_id: 7,
        },
    ]
}

/// Counts load attempts and fails for paths registered with `reject`.
pub struct StubLoader {
    loads: AtomicUsize,
    delay: Duration,
    rejected: Mutex<HashSet<PathBuf>>,
    class_names: Option<Vec<String>>,
}

impl StubLoader {
    pub fn new() -> Arc<Self> {
        Self::slow(Duration::ZERO)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            delay,
            rejected: Mutex::new(HashSet::new()),
            class_names: Some(vec!["motor".to_string(), "frame".to_string()]),
        })
    }

    pub fn reject(&self, path: &Path) {
        self.rejected.lock().insert(path.to_path_buf());
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for StubLoader {
    fn load(&self, path: &Path) -> Result<ModelArtifact, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);

        if !path.exists() {
            return Err(LoadError::NotFound(path.display().to_string()));
        }
        if self.rejected.lock().contains(path) {
            return Err(LoadError::Invalid(format!("corrupt artifact {}", path.display())));
        }

        Ok(ModelArtifact {
            predictor: Box::new(StubPredictor::with_predictions(sample_predictions())),
            class_names: self.class_names.clone(),
            input_size: 640,
        })
    }
}

/// Registry that either serves every version from `dir` or is unreachable.
pub struct StubRegistry {
    dir: Option<PathBuf>,
    requested: Mutex<Vec<String>>,
}

impl StubRegistry {
    pub fn serving(dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            dir: Some(dir.to_path_buf()),
            requested: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            dir: None,
            requested: Mutex::new(Vec::new()),
        })
    }

    pub fn artifact_for(&self, version: &str) -> PathBuf {
        self.dir
            .as_deref()
            .unwrap_or_else(|| Path::new("/nonexistent"))
            .join(format!("registry-{}.onnx", version))
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl ModelRegistry for StubRegistry {
    async fn fetch(&self, version: &str) -> Result<PathBuf, RegistryError> {
        self.requested.lock().push(version.to_string());
        match &self.dir {
            Some(_) => {
                let path = self.artifact_for(version);
                std::fs::write(&path, b"registry model").map_err(|source| RegistryError::Write {
                    path: path.clone(),
                    source,
                })?;
                Ok(path)
            }
            None => Err(RegistryError::EmptyArtifact(format!(
                "unreachable registry for {}",
                version
            ))),
        }
    }

    fn default_version(&self) -> &str {
        "latest"
    }
}
