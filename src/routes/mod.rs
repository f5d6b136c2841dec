mod health;
mod identify;
mod index;
mod metrics;
mod models;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(index::index))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/models", get(models::list_models))
        .route("/model-info", get(models::model_info))
        .route("/identify", post(identify::identify))
        .route("/batch-identify", post(identify::batch_identify))
}


#[cfg(test)]
mod tests {
    use super::test_support::{json_body, router};
    use axum::{body::Body, http::Request, http::StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let tmp = TempDir::new().unwrap();
        let response = router(tmp.path())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_index_banner() {
        let tmp = TempDir::new().unwrap();
        let response = router(tmp.path())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = json_body(response).await;
        assert_eq!(body["status"], "running");
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let tmp = TempDir::new().unwrap();
        let response = router(tmp.path())
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let tmp = TempDir::new().unwrap();
        let response = router(tmp.path())
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
