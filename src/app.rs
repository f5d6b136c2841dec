use crate::{
    config::Config,
    detection::DetectionService,
    executor::InferenceExecutor,
    model_service::ModelLoader,
    ort_service::OrtModelLoader,
    registry::{HttpModelRegistry, ModelRegistry},
    resolver::ModelResolver,
    server::HttpServer,
    telemetry::Metrics,
};
use anyhow::Context;
use std::{sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new().context("failed to set up metrics exporter")?);

    let loader: Arc<dyn ModelLoader> = Arc::new(
        OrtModelLoader::new(&config.model).context("failed to initialize ONNX Runtime")?,
    );
    let registry: Option<Arc<dyn ModelRegistry>> = match &config.registry {
        Some(registry_config) => {
            tracing::info!(url = %registry_config.url, "Model registry enabled");
            Some(Arc::new(
                HttpModelRegistry::new(registry_config).context("failed to build registry client")?,
            ))
        }
        None => None,
    };

    let resolver = Arc::new(
        ModelResolver::new(loader, registry, config.model.clone()).with_metrics(metrics.clone()),
    );

    let default_model = match resolver.resolve(None).await {
        Ok(model) => model,
        Err(e) => {
            tracing::error!("No usable model, refusing to start: {}", e);
            return Err(e).context("failed to resolve the default model");
        }
    };
    tracing::info!(
        version = %default_model.version,
        source = default_model.source.as_str(),
        "Default model ready"
    );

    let executor = InferenceExecutor::new(
        config.model.num_workers,
        config.model.inference_timeout_ms.map(Duration::from_millis),
    );
    let detection_service =
        Arc::new(DetectionService::new(resolver, executor).with_metrics(metrics.clone()));

    let server = HttpServer::new(detection_service, metrics, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
