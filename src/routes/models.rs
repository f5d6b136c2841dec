use crate::{
    error::DetectionError,
    resolver::{ModelSource, DEFAULT_VERSION},
    server::SharedState,
};
use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::instrument;

#[derive(Serialize)]
pub struct ModelCatalog {
    default_model: &'static str,
    models: BTreeMap<&'static str, ModelEntry>,
}

#[derive(Serialize)]
pub struct ModelEntry {
    #[serde(rename = "type")]
    kind: &'static str,
    framework: &'static str,
    input_size: u32,
    classes: Vec<String>,
    available_versions: BTreeMap<String, String>,
    loaded_versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfoParams {
    model_version: Option<String>,
}

#[derive(Serialize)]
pub struct ModelInfoResponse {
    success: bool,
    data: ModelDetails,
}

#[derive(Serialize)]
pub struct ModelDetails {
    version: String,
    source: ModelSource,
    framework: &'static str,
    input_size: u32,
    classes: Vec<String>,
}

/// Describes the default model. Resolving it makes it resident if it was not
/// already.
#[instrument(skip(state))]
pub async fn list_models(
    State(state): State<SharedState>,
) -> Result<Json<ModelCatalog>, DetectionError> {
    state.metrics.record_request("/models");
    let resolver = state.detection_service.resolver();
    let model = resolver.resolve(None).await?;

    let entry = ModelEntry {
        kind: "object_detection",
        framework: model.framework(),
        input_size: model.input_size,
        classes: model.class_names.clone().unwrap_or_default(),
        available_versions: resolver.available_versions(),
        loaded_versions: resolver.loaded_versions(),
    };

    Ok(Json(ModelCatalog {
        default_model: DEFAULT_VERSION,
        models: BTreeMap::from([("part_detection", entry)]),
    }))
}

#[instrument(skip(state))]
pub async fn model_info(
    State(state): State<SharedState>,
    Query(params): Query<ModelInfoParams>,
) -> Result<Json<ModelInfoResponse>, DetectionError> {
    state.metrics.record_request("/model-info");
    let model = state
        .detection_service
        .resolver()
        .resolve(params.model_version.as_deref())
        .await?;

    Ok(Json(ModelInfoResponse {
        success: true,
        data: ModelDetails {
            version: model.version.clone(),
            source: model.source,
            framework: model.framework(),
            input_size: model.input_size,
            classes: model.class_names.clone().unwrap_or_default(),
        },
    }))
}
