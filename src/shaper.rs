use crate::{
    decoder::DecodedImage, model_service::RawPrediction, resolver::LoadedModel,
    resolver::ModelSource,
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: String,
    pub center: [f32; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub framework: String,
    pub confidence_threshold: f32,
    pub model_version: String,
    pub source: ModelSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    pub image_info: ImageInfo,
    pub model_info: ModelInfo,
}

/// Builds the response payload. Boxes are passed through unclipped and in
/// predictor order.
pub fn shape(
    predictions: Vec<RawPrediction>,
    image: &DecodedImage,
    model: &LoadedModel,
    threshold: f32,
) -> DetectionResult {
    let detections = predictions
        .into_iter()
        .map(|p| Detection {
            bbox: [p.x1, p.y1, p.x2, p.y2],
            confidence: p.confidence,
            class_id: p.class_id,
            class_name: class_name(model.class_names.as_deref(), p.class_id),
            center: [(p.x1 + p.x2) / 2.0, (p.y1 + p.y2) / 2.0],
        })
        .collect();

    DetectionResult {
        detections,
        image_info: ImageInfo {
            width: image.width(),
            height: image.height(),
            channels: image.channels(),
        },
        model_info: ModelInfo {
            framework: model.framework().to_string(),
            confidence_threshold: threshold,
            model_version: model.version.clone(),
            source: model.source,
        },
    }
}

fn class_name(names: Option<&[String]>, class_id: u32) -> String {
    names
        .and_then(|names| names.get(class_id as usize))
        .cloned()
        .unwrap_or_else(|| format!("class_{}", class_id))
}
