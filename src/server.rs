use crate::{
    config::{Config, ServerConfig},
    detection::DetectionService,
    routes::api_routes,
    telemetry::Metrics,
};
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    Router,
};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

#[derive(Clone)]
pub struct SharedState {
    pub detection_service: Arc<DetectionService>,
    pub server_config: ServerConfig,
    pub metrics: Arc<Metrics>,
}

pub fn build_router(state: SharedState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.server_config.max_upload_bytes);
    let cors = cors_layer(&state.server_config.allowed_origins);

    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(body_limit)
        .layer(cors)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods([Method::GET, Method::POST, Method::OPTIONS]);

    if allowed_origins.is_empty() {
        return cors.allow_origin(Any).allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();

    cors.allow_origin(AllowOrigin::list(origins)).allow_headers(Any)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        detection_service: Arc<DetectionService>,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState {
            detection_service,
            server_config: config.server.clone(),
            metrics,
        };

        let router = build_router(app_state).layer(metrics_layer);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                tracing::info!("Server stopped");
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
