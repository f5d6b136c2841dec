use crate::config::RegistryConfig;
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("download failed for {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to write model to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry returned an empty artifact for {0}")]
    EmptyArtifact(String),
    #[error("failed to build registry client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Remote source of versioned model artifacts.
#[async_trait]
pub trait ModelRegistry: Send + Sync + 'static {
    /// Makes the artifact for `version` available locally and returns its path.
    async fn fetch(&self, version: &str) -> Result<PathBuf, RegistryError>;

    fn default_version(&self) -> &str;
}

/// Registry reachable over HTTP at
/// `GET {url}/models/{model_name}/versions/{version}`, answering with the
/// raw ONNX bytes. Fetched artifacts are kept under `cache_dir`.
pub struct HttpModelRegistry {
    client: reqwest::Client,
    base_url: String,
    model_name: String,
    default_version: String,
    cache_dir: PathBuf,
}

impl HttpModelRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(RegistryError::Client)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model_name: config.model_name.clone(),
            default_version: config.default_version.clone(),
            cache_dir: config.cache_dir.clone(),
        })
    }

    fn artifact_url(&self, version: &str) -> String {
        format!(
            "{}/models/{}/versions/{}",
            self.base_url, self.model_name, version
        )
    }

    fn artifact_path(&self, version: &str) -> PathBuf {
        let sanitized: String = version
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.cache_dir
            .join(format!("{}-{}.onnx", self.model_name, sanitized))
    }
}

#[async_trait]
impl ModelRegistry for HttpModelRegistry {
    /// Pinned versions are immutable and served from the cache once present.
    /// The default version is a moving tag, so it is downloaded again and the
    /// cached copy only serves when the registry is unreachable.
    async fn fetch(&self, version: &str) -> Result<PathBuf, RegistryError> {
        let dest = self.artifact_path(version);
        let cached = fs::try_exists(&dest).await.unwrap_or(false);
        let moving = version == self.default_version;
        if cached && !moving {
            tracing::debug!("Using cached registry artifact {}", dest.display());
            return Ok(dest);
        }

        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|source| RegistryError::Write {
                path: self.cache_dir.clone(),
                source,
            })?;

        match download(&self.client, &self.artifact_url(version), &dest).await {
            Ok(()) => Ok(dest),
            Err(e) if cached => {
                tracing::warn!(
                    version,
                    error = %e,
                    "Registry refresh failed, using cached artifact {}",
                    dest.display()
                );
                Ok(dest)
            }
            Err(e) => Err(e),
        }
    }

    fn default_version(&self) -> &str {
        &self.default_version
    }
}

/// Downloads `url` into `dest` through a `.part` file renamed on success, so
/// a failed transfer never leaves a file at `dest`.
pub async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> Result<(), RegistryError> {
    let temp_path = dest.with_extension("part");

    let result = download_inner(client, url, dest, &temp_path).await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }

    result
}

async fn download_inner(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    temp_path: &Path,
) -> Result<(), RegistryError> {
    let download_error = |source: reqwest::Error| RegistryError::Download {
        url: url.to_string(),
        source,
    };
    let write_error = |path: &Path, source: std::io::Error| RegistryError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(download_error)?;

    let mut file = fs::File::create(temp_path)
        .await
        .map_err(|e| write_error(temp_path, e))?;

    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await.map_err(download_error)? {
        file.write_all(&chunk)
            .await
            .map_err(|e| write_error(temp_path, e))?;
        written += chunk.len() as u64;
    }

    if written == 0 {
        return Err(RegistryError::EmptyArtifact(url.to_string()));
    }

    file.flush().await.map_err(|e| write_error(temp_path, e))?;
    drop(file);

    fs::rename(temp_path, dest)
        .await
        .map_err(|e| write_error(dest, e))?;

    tracing::info!("Downloaded {} bytes from {} to {}", written, url, dest.display());
    Ok(())
}
