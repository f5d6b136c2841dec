use crate::{
    config::ModelConfig,
    decoder::DecodedImage,
    labels::{load_labels, parse_ultralytics_names},
    model_service::{LoadError, ModelArtifact, ModelLoader, Predictor, PredictorError, RawPrediction},
};
use image::imageops::FilterType;
use ndarray::{s, Array, ArrayD, Axis, Ix2, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

const FRAMEWORK: &str = "YOLOv8";

fn intersection(box1: &RawPrediction, box2: &RawPrediction) -> f32 {
    let w = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.);
    let h = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.);
    w * h
}

fn union(box1: &RawPrediction, box2: &RawPrediction) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn iou(box1: &RawPrediction, box2: &RawPrediction) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

fn to_input_tensor(image: &DecodedImage, input_size: u32) -> Array<f32, Ix4> {
    let img = image::imageops::resize(
        image.pixels(),
        input_size,
        input_size,
        FilterType::CatmullRom,
    );

    let size = input_size as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Turns a YOLOv8 head output `[1, 4 + classes, anchors]` into boxes in
/// source pixel coordinates, keeping scores `>= threshold`, then applies
/// class-aware NMS. Output is ordered by descending confidence.
fn decode_output(
    outputs: &ArrayD<f32>,
    img_width: u32,
    img_height: u32,
    input_size: u32,
    threshold: f32,
    iou_threshold: f32,
) -> Result<Vec<RawPrediction>, PredictorError> {
    let shape = outputs.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
        return Err(PredictorError::Output(format!(
            "expected [1, 4 + classes, anchors], got {:?}",
            shape
        )));
    }

    let scale_x = img_width as f32 / input_size as f32;
    let scale_y = img_height as f32 / input_size as f32;

    let mut boxes = Vec::new();
    let output = outputs
        .slice(s![0, .., ..])
        .into_dimensionality::<Ix2>()
        .map_err(|e| PredictorError::Output(e.to_string()))?
        .reversed_axes();

    for row in output.axis_iter(Axis(0)) {
        let (class_id, prob) = row
            .iter()
            .skip(4)
            .enumerate()
            .fold((0usize, f32::MIN), |accum, (index, value)| {
                if *value > accum.1 {
                    (index, *value)
                } else {
                    accum
                }
            });

        if prob < threshold {
            continue;
        }

        let xc = row[0] * scale_x;
        let yc = row[1] * scale_y;
        let w = row[2] * scale_x;
        let h = row[3] * scale_y;

        boxes.push(RawPrediction {
            class_id: class_id as u32,
            confidence: prob,
            x1: xc - w / 2.,
            y1: yc - h / 2.,
            x2: xc + w / 2.,
            y2: yc + h / 2.,
        });
    }

    Ok(non_max_suppression(boxes, iou_threshold))
}

fn non_max_suppression(mut boxes: Vec<RawPrediction>, iou_threshold: f32) -> Vec<RawPrediction> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));
    let mut result = Vec::new();

    while !boxes.is_empty() {
        let best = boxes.remove(0);
        boxes.retain(|other| other.class_id != best.class_id || iou(&best, other) < iou_threshold);
        result.push(best);
    }

    result
}

pub struct OrtPredictor {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    input_size: u32,
    iou_threshold: f32,
}

impl OrtPredictor {
    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, PredictorError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| PredictorError::Poisoned(e.to_string()))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| PredictorError::Tensor(e.to_string()))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| PredictorError::Run(e.to_string()))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| PredictorError::Output(e.to_string()))?;

        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| PredictorError::Output(format!("invalid tensor shape: {}", e)))
    }
}

impl Predictor for OrtPredictor {
    fn predict(
        &self,
        image: &DecodedImage,
        threshold: f32,
    ) -> Result<Vec<RawPrediction>, PredictorError> {
        let input = to_input_tensor(image, self.input_size);
        let outputs = self.run_inference(&input)?;

        decode_output(
            &outputs,
            image.width(),
            image.height(),
            self.input_size,
            threshold,
            self.iou_threshold,
        )
    }

    fn framework(&self) -> &'static str {
        FRAMEWORK
    }
}

/// Opens ONNX artifacts as a small pool of sessions, one per inference
/// worker, so concurrent jobs on the same model do not contend on one lock.
pub struct OrtModelLoader {
    num_instances: usize,
    input_size: u32,
    iou_threshold: f32,
    fallback_labels: Option<Vec<String>>,
}

impl OrtModelLoader {
    pub fn new(model_config: &ModelConfig) -> Result<Self, LoadError> {
        init_environment()?;

        let fallback_labels = match &model_config.labels_file {
            Some(path) => Some(load_labels(path).map_err(|e| {
                LoadError::Invalid(format!("failed to load labels {}: {}", path.display(), e))
            })?),
            None => None,
        };

        Ok(Self {
            num_instances: model_config.num_workers.max(1),
            input_size: model_config.input_size,
            iou_threshold: model_config.iou_threshold,
            fallback_labels,
        })
    }
}

/// Commits the process-wide ONNX Runtime environment. Later calls reuse the
/// first environment.
#[cfg(feature = "tensorrt")]
fn init_environment() -> Result<(), LoadError> {
    use ort::execution_providers::TensorRTExecutionProvider;

    ort::init()
        .with_execution_providers([TensorRTExecutionProvider::default()
            .with_engine_cache(true)
            .build()])
        .commit()?;
    Ok(())
}

#[cfg(not(feature = "tensorrt"))]
fn init_environment() -> Result<(), LoadError> {
    ort::init().commit()?;
    Ok(())
}

fn read_class_names(session: &Session) -> Option<Vec<String>> {
    let metadata = session.metadata().ok()?;
    match metadata.custom("names") {
        Ok(Some(raw)) => parse_ultralytics_names(&raw),
        _ => None,
    }
}

impl ModelLoader for OrtModelLoader {
    fn load(&self, path: &Path) -> Result<ModelArtifact, LoadError> {
        if !path.exists() {
            return Err(LoadError::NotFound(path.display().to_string()));
        }

        let sessions = (0..self.num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(path)?;
                Ok(Mutex::new(session))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        let class_names = sessions
            .first()
            .and_then(|session| session.lock().ok().and_then(|s| read_class_names(&s)))
            .or_else(|| self.fallback_labels.clone());

        tracing::info!(
            "Created {} ONNX sessions for {}",
            self.num_instances,
            path.display()
        );

        Ok(ModelArtifact {
            predictor: Box::new(OrtPredictor {
                sessions,
                counter: AtomicUsize::new(0),
                input_size: self.input_size,
                iou_threshold: self.iou_threshold,
            }),
            class_names,
            input_size: self.input_size,
        })
    }
}
