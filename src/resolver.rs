use crate::{
    config::ModelConfig,
    model_service::{LoadError, ModelArtifact, ModelLoader, Predictor},
    registry::{download, ModelRegistry, RegistryError},
    telemetry::Metrics,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::OnceCell;

/// Cache key used when a request names no version.
pub const DEFAULT_VERSION: &str = "default";
pub const BUILTIN_VERSION: &str = "builtin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Registry,
    Local,
    Builtin,
}

impl ModelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSource::Registry => "registry",
            ModelSource::Local => "local",
            ModelSource::Builtin => "builtin",
        }
    }
}

pub struct LoadedModel {
    pub version: String,
    pub source: ModelSource,
    pub predictor: Arc<dyn Predictor>,
    pub class_names: Option<Vec<String>>,
    pub input_size: u32,
}

impl LoadedModel {
    fn from_resident(version: &str, source: ModelSource, resident: &ResidentArtifact) -> Self {
        Self {
            version: version.to_string(),
            source,
            predictor: resident.predictor.clone(),
            class_names: resident.class_names.clone(),
            input_size: resident.input_size,
        }
    }

    pub fn framework(&self) -> &'static str {
        self.predictor.framework()
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("version", &self.version)
            .field("source", &self.source)
            .field("input_size", &self.input_size)
            .finish_non_exhaustive()
    }
}

/// Why a single artifact could not be made resident.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Fetch(#[from] RegistryError),
    #[error("model loading task failed: {0}")]
    Join(String),
}

#[derive(Error, Debug)]
pub enum ModelResolutionError {
    #[error("failed to load local model {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: ArtifactError,
    },
    #[error("no usable model: built-in model {path} could not be loaded: {reason}")]
    Exhausted { path: PathBuf, reason: String },
}

/// A loaded artifact, shared by every version label that resolves to it.
struct ResidentArtifact {
    predictor: Arc<dyn Predictor>,
    class_names: Option<Vec<String>>,
    input_size: u32,
}

type VersionSlot = Arc<OnceCell<Arc<LoadedModel>>>;
type ArtifactSlot = Arc<OnceCell<Arc<ResidentArtifact>>>;

/// Maps a version identifier to a resident model, walking
/// registry → local path → built-in default.
///
/// Two single-flight caches back it: one per version label and one per
/// artifact path. Each artifact file is loaded at most once however many
/// labels point at it, and the built-in download runs at most once at a time.
pub struct ModelResolver {
    loader: Arc<dyn ModelLoader>,
    registry: Option<Arc<dyn ModelRegistry>>,
    config: ModelConfig,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, VersionSlot>>,
    artifacts: Mutex<HashMap<PathBuf, ArtifactSlot>>,
    metrics: Option<Arc<Metrics>>,
}

impl ModelResolver {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        registry: Option<Arc<dyn ModelRegistry>>,
        config: ModelConfig,
    ) -> Self {
        Self {
            loader,
            registry,
            config,
            http: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
            artifacts: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn resolve(
        &self,
        version: Option<&str>,
    ) -> Result<Arc<LoadedModel>, ModelResolutionError> {
        let version = self.canonical(version);
        let key = version.unwrap_or(DEFAULT_VERSION);
        let slot = {
            let mut cache = self.cache.lock();
            cache.entry(key.to_string()).or_default().clone()
        };

        let model = slot
            .get_or_try_init(|| self.load_uncached(version))
            .await?
            .clone();

        // Unknown labels that fell back are not pinned, so arbitrary
        // client-supplied versions cannot grow the cache.
        if let Some(v) = version {
            if model.source != ModelSource::Registry && !self.config.versions.contains_key(v) {
                let mut cache = self.cache.lock();
                if cache.get(key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    cache.remove(key);
                }
            }
        }

        Ok(model)
    }

    /// Without a registry an unmapped version can only ever land on the
    /// default chain, so it shares the default slot.
    fn canonical<'a>(&self, version: Option<&'a str>) -> Option<&'a str> {
        match version {
            Some(v) if v == DEFAULT_VERSION => None,
            Some(v) if self.registry.is_some() || self.config.versions.contains_key(v) => Some(v),
            _ => None,
        }
    }

    /// Versions that can be requested, mapped to their artifact file name.
    pub fn available_versions(&self) -> BTreeMap<String, String> {
        let mut versions = BTreeMap::new();
        versions.insert(
            DEFAULT_VERSION.to_string(),
            file_name(&self.config.default_path),
        );
        for (version, path) in &self.config.versions {
            versions.insert(version.clone(), file_name(path));
        }
        versions
    }

    pub fn loaded_versions(&self) -> Vec<String> {
        let cache = self.cache.lock();
        let mut loaded: Vec<String> = cache
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(version, _)| version.clone())
            .collect();
        loaded.sort();
        loaded
    }

    async fn load_uncached(
        &self,
        version: Option<&str>,
    ) -> Result<Arc<LoadedModel>, ModelResolutionError> {
        if let Some(registry) = &self.registry {
            let registry_version = version.unwrap_or_else(|| registry.default_version());
            match registry.fetch(registry_version).await {
                Ok(path) => match self.resident(&path, ModelSource::Registry, None).await {
                    Ok(resident) => {
                        tracing::info!(
                            version = registry_version,
                            path = %path.display(),
                            "Resolved model from registry"
                        );
                        return Ok(self.finish(registry_version, ModelSource::Registry, &resident));
                    }
                    Err(e) => {
                        tracing::warn!(
                            version = registry_version,
                            error = %e,
                            "Registry artifact failed to load, falling back to local model"
                        );
                        if let ArtifactError::Load(_) = e {
                            discard(&path).await;
                        }
                    }
                },
                Err(e) => tracing::warn!(
                    version = registry_version,
                    error = %e,
                    "Registry unavailable, falling back to local model"
                ),
            }
        }

        let (local_path, mapped) = self.config.local_path(version);
        if local_path.exists() {
            let label = match (mapped, version) {
                (true, Some(v)) => v,
                _ => DEFAULT_VERSION,
            };
            let resident = self
                .resident(local_path, ModelSource::Local, None)
                .await
                .map_err(|source| {
                    tracing::error!(
                        path = %local_path.display(),
                        error = %source,
                        "Local model failed to load"
                    );
                    ModelResolutionError::Local {
                        path: local_path.to_path_buf(),
                        source,
                    }
                })?;
            tracing::info!(
                version = label,
                path = %local_path.display(),
                "Resolved model from local path"
            );
            return Ok(self.finish(label, ModelSource::Local, &resident));
        }

        tracing::warn!(
            path = %local_path.display(),
            "Model not found at local path, using built-in default"
        );
        self.load_builtin().await
    }

    async fn load_builtin(&self) -> Result<Arc<LoadedModel>, ModelResolutionError> {
        let path = &self.config.builtin_path;
        let resident = self
            .resident(
                path,
                ModelSource::Builtin,
                self.config.builtin_url.as_deref(),
            )
            .await
            .map_err(|e| {
                tracing::error!(path = %path.display(), reason = %e, "No usable model");
                ModelResolutionError::Exhausted {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?;
        tracing::info!(path = %path.display(), "Resolved built-in model");
        Ok(self.finish(BUILTIN_VERSION, ModelSource::Builtin, &resident))
    }

    /// Loads `path` once for the resolver's lifetime. When `download_url` is
    /// set and the file is missing it is fetched first, inside the same
    /// single-flight section. A failure leaves the slot empty.
    async fn resident(
        &self,
        path: &Path,
        source: ModelSource,
        download_url: Option<&str>,
    ) -> Result<Arc<ResidentArtifact>, ArtifactError> {
        let slot = {
            let mut artifacts = self.artifacts.lock();
            artifacts.entry(path.to_path_buf()).or_default().clone()
        };

        let resident = slot
            .get_or_try_init(|| async {
                if let Some(url) = download_url {
                    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                        tracing::info!(url = %url, "Fetching built-in model");
                        if let Some(parent) = path.parent() {
                            tokio::fs::create_dir_all(parent).await.map_err(|source| {
                                RegistryError::Write {
                                    path: parent.to_path_buf(),
                                    source,
                                }
                            })?;
                        }
                        download(&self.http, url, path).await?;
                    }
                }

                let artifact = self.load_blocking(path).await?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_model_load(source.as_str());
                }
                Ok::<_, ArtifactError>(Arc::new(ResidentArtifact {
                    predictor: Arc::from(artifact.predictor),
                    class_names: artifact.class_names,
                    input_size: artifact.input_size,
                }))
            })
            .await?;

        Ok(resident.clone())
    }

    /// Runs the blocking loader off the runtime threads.
    async fn load_blocking(&self, path: &Path) -> Result<ModelArtifact, ArtifactError> {
        let loader = self.loader.clone();
        let path = path.to_path_buf();
        let artifact = tokio::task::spawn_blocking(move || loader.load(&path))
            .await
            .map_err(|e| ArtifactError::Join(e.to_string()))??;
        Ok(artifact)
    }

    fn finish(
        &self,
        version: &str,
        source: ModelSource,
        resident: &ResidentArtifact,
    ) -> Arc<LoadedModel> {
        Arc::new(LoadedModel::from_resident(version, source, resident))
    }
}

/// Drops a registry artifact the loader rejected so the next resolution
/// fetches it again instead of reusing the broken copy.
async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::warn!(path = %path.display(), "Removed rejected registry artifact"),
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "Failed to remove rejected registry artifact"
        ),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{model_config, StubLoader, StubRegistry};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolve_prefers_registry() {
        let tmp = TempDir::new().unwrap();
        let loader = StubLoader::new();
        let registry = StubRegistry::serving(tmp.path());
        let resolver = ModelResolver::new(
            loader.clone(),
            Some(registry.clone()),
            model_config(tmp.path()),
        );

        let model = resolver.resolve(Some("7")).await.unwrap();

        assert_eq!(model.source, ModelSource::Registry);
        assert_eq!(model.version, "7");
        assert_eq!(registry.requested(), vec!["7".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_registry_uses_default_version() {
        let tmp = TempDir::new().unwrap();
        let registry = StubRegistry::serving(tmp.path());
        let resolver = ModelResolver::new(
            StubLoader::new(),
            Some(registry.clone()),
            model_config(tmp.path()),
        );

        let model = resolver.resolve(None).await.unwrap();

        assert_eq!(model.version, "latest");
        assert_eq!(registry.requested(), vec!["latest".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_mapped_local_version() {
        let tmp = TempDir::new().unwrap();
        let config = model_config(tmp.path());
        std::fs::write(&config.versions["v2"], b"v2").unwrap();
        let resolver = ModelResolver::new(
            StubLoader::new(),
            Some(StubRegistry::failing()),
            config,
        );

        let model = resolver.resolve(Some("v2")).await.unwrap();

        assert_eq!(model.source, ModelSource::Local);
        assert_eq!(model.version, "v2");
    }

    #[tokio::test]
    async fn test_resolve_unknown_version_uses_default_local_path() {
        let tmp = TempDir::new().unwrap();
        let config = model_config(tmp.path());
        std::fs::write(&config.default_path, b"default").unwrap();
        let resolver = ModelResolver::new(StubLoader::new(), None, config);

        let model = resolver.resolve(Some("v9")).await.unwrap();

        assert_eq!(model.source, ModelSource::Local);
        assert_eq!(model.version, DEFAULT_VERSION);
    }

    #[tokio::test]
    async fn test_resolve_unknown_version_walks_whole_chain() {
        let tmp = TempDir::new().unwrap();
        let config = model_config(tmp.path());
        std::fs::write(&config.builtin_path, b"builtin").unwrap();
        let registry = StubRegistry::failing();
        let resolver = ModelResolver::new(StubLoader::new(), Some(registry.clone()), config);

        let model = resolver.resolve(Some("v9")).await.unwrap();

        assert_eq!(registry.requested(), vec!["v9".to_string()]);
        assert_eq!(model.source, ModelSource::Builtin);
        assert_eq!(model.version, BUILTIN_VERSION);
    }

    #[tokio::test]
    async fn test_resolve_corrupt_registry_artifact_falls_back() {
        let tmp = TempDir::new().unwrap();
        let config = model_config(tmp.path());
        std::fs::write(&config.default_path, b"default").unwrap();
        let loader = StubLoader::new();
        let registry = StubRegistry::serving(tmp.path());
        let rejected = registry.artifact_for("3");
        loader.reject(&rejected);
        let resolver = ModelResolver::new(loader.clone(), Some(registry), config);

        let model = resolver.resolve(Some("3")).await.unwrap();

        assert_eq!(model.source, ModelSource::Local);
        assert_eq!(loader.loads(), 2);
        assert!(!rejected.exists());
    }

    #[tokio::test]
    async fn test_resolve_fails_when_builtin_unavailable() {
        let tmp = TempDir::new().unwrap();
        let resolver = ModelResolver::new(StubLoader::new(), None, model_config(tmp.path()));

        let result = resolver.resolve(None).await;

        assert!(matches!(result, Err(ModelResolutionError::Exhausted { .. })));
        assert!(resolver.loaded_versions().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_existing_but_broken_local_model_fails() {
        let tmp = TempDir::new().unwrap();
        let config = model_config(tmp.path());
        std::fs::write(&config.default_path, b"corrupt").unwrap();
        std::fs::write(&config.builtin_path, b"builtin").unwrap();
        let loader = StubLoader::new();
        loader.reject(&config.default_path);
        let resolver = ModelResolver::new(loader, None, config);

        let result = resolver.resolve(None).await;

        assert!(matches!(result, Err(ModelResolutionError::Local { .. })));
    }

    #[tokio::test]
    async fn test_resolve_caches_per_version() {
        let tmp = TempDir::new().unwrap();
        let config = model_config(tmp.path());
        std::fs::write(&config.default_path, b"default").unwrap();
        let loader = StubLoader::new();
        let resolver = ModelResolver::new(loader.clone(), None, config);

        let first = resolver.resolve(None).await.unwrap();
        let second = resolver.resolve(None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.loads(), 1);
        assert_eq!(resolver.loaded_versions(), vec![DEFAULT_VERSION.to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_loads_once() {
        let tmp = TempDir::new().unwrap();
        let config = model_config(tmp.path());
        std::fs::write(&config.default_path, b"default").unwrap();
        let loader = StubLoader::slow(std::time::Duration::from_millis(100));
        let resolver = Arc::new(ModelResolver::new(loader.clone(), None, config));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve(Some("v1")).await })
            })
            .collect();

        let models: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(loader.loads(), 1);
        assert!(models.iter().all(|m| Arc::ptr_eq(m, &models[0])));
    }

    #[tokio::test]
    async fn test_unknown_versions_share_default_artifact() {
        let tmp = TempDir::new().unwrap();
        let config = model_config(tmp.path());
        std::fs::write(&config.default_path, b"default").unwrap();
        let loader = StubLoader::new();
        let resolver = ModelResolver::new(loader.clone(), None, config);

        let a = resolver.resolve(Some("a")).await.unwrap();
        let b = resolver.resolve(Some("b")).await.unwrap();
        let default = resolver.resolve(None).await.unwrap();

        assert_eq!(loader.loads(), 1);
        assert!(Arc::ptr_eq(&a, &default));
        assert!(Arc::ptr_eq(&b, &default));
        assert_eq!(resolver.loaded_versions(), vec![DEFAULT_VERSION.to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_versions_load_fallback_once_with_registry() {
        let tmp = TempDir::new().unwrap();
        let config = model_config(tmp.path());
        std::fs::write(&config.builtin_path, b"builtin").unwrap();
        let loader = StubLoader::new();
        let registry = StubRegistry::failing();
        let resolver = ModelResolver::new(loader.clone(), Some(registry.clone()), config);

        let a = resolver.resolve(Some("a")).await.unwrap();
        let b = resolver.resolve(Some("b")).await.unwrap();

        assert_eq!(loader.loads(), 1);
        assert!(Arc::ptr_eq(&a.predictor, &b.predictor));
        assert_eq!(registry.requested(), vec!["a".to_string(), "b".to_string()]);
        assert!(resolver.loaded_versions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_missing_mapped_versions_share_one_builtin_download() {
        use axum::{routing::get, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(
            "/yolov8n.onnx",
            get({
                let hits = hits.clone();
                move || async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    b"onnx bytes".to_vec()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let tmp = TempDir::new().unwrap();
        let mut config = model_config(tmp.path());
        config
            .versions
            .insert("v3".to_string(), tmp.path().join("v3.onnx"));
        config.builtin_url = Some(format!("http://{}/yolov8n.onnx", addr));
        let builtin = config.builtin_path.clone();
        let loader = StubLoader::new();
        let resolver = ModelResolver::new(loader.clone(), None, config);

        let (v2, v3) = tokio::join!(resolver.resolve(Some("v2")), resolver.resolve(Some("v3")));
        let (v2, v3) = (v2.unwrap(), v3.unwrap());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(loader.loads(), 1);
        assert_eq!(v2.source, ModelSource::Builtin);
        assert!(Arc::ptr_eq(&v2.predictor, &v3.predictor));
        assert!(builtin.exists());
        assert!(!builtin.with_extension("part").exists());
    }

    #[tokio::test]
    async fn test_failed_resolution_is_retried() {
        let tmp = TempDir::new().unwrap();
        let config = model_config(tmp.path());
        let builtin = config.builtin_path.clone();
        let resolver = ModelResolver::new(StubLoader::new(), None, config);

        assert!(resolver.resolve(None).await.is_err());
        std::fs::write(&builtin, b"builtin").unwrap();
        assert!(resolver.resolve(None).await.is_ok());
    }

    #[test]
    fn test_available_versions_hide_directories() {
        let tmp = TempDir::new().unwrap();
        let resolver = ModelResolver::new(StubLoader::new(), None, model_config(tmp.path()));

        let versions = resolver.available_versions();

        assert_eq!(versions["default"], "default.onnx");
        assert_eq!(versions["v2"], "v2.onnx");
        assert!(versions.values().all(|name| !name.contains('/')));
    }
}
