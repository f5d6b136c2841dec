use axum::{response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Banner {
    message: &'static str,
    version: &'static str,
    status: &'static str,
}

pub async fn index() -> impl IntoResponse {
    Json(Banner {
        message: "Part detection API",
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
    })
}
