//! Flux Operator installation

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::k8s::control_plane::{ApplyOutcome, ControlPlane};
use crate::utils::errors::{BurstError, Result};

/// Where the operator install manifest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Local(PathBuf),
    Remote(String),
}

impl ManifestSource {
    /// `http(s)://` values are remote, anything else is a local path
    pub fn parse(value: &str) -> Self {
        if value.starts_with("https://") || value.starts_with("http://") {
            ManifestSource::Remote(value.to_string())
        } else {
            ManifestSource::Local(PathBuf::from(value))
        }
    }
}

impl fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestSource::Local(path) => write!(f, "{}", path.display()),
            ManifestSource::Remote(url) => write!(f, "{}", url),
        }
    }
}

/// Installs the operator, fetching remote manifests at most once per
/// installer. Cached copies live in temporary files removed on drop.
pub struct OperatorInstaller {
    http: reqwest::Client,
    cache: Mutex<HashMap<String, NamedTempFile>>,
}

impl Default for OperatorInstaller {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorInstaller {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Local path of the manifest, downloading it on a cache miss
    pub async fn resolve(&self, source: &ManifestSource) -> Result<PathBuf> {
        match source {
            ManifestSource::Local(path) => {
                if !path.is_file() {
                    return Err(BurstError::configuration(format!(
                        "operator manifest {} does not exist",
                        path.display()
                    )));
                }
                Ok(path.clone())
            }
            ManifestSource::Remote(url) => {
                let mut cache = self.cache.lock().await;
                if let Some(file) = cache.get(url) {
                    tracing::debug!(url = %url, path = %file.path().display(), "Operator manifest cache hit");
                    return Ok(file.path().to_path_buf());
                }

                let file = self.fetch(url).await?;
                let path = file.path().to_path_buf();
                cache.insert(url.clone(), file);
                Ok(path)
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<NamedTempFile> {
        crate::log_info!("Downloading Flux Operator manifest from {}...", url);

        let fetch_err =
            |e: reqwest::Error| BurstError::manifest(format!("failed to download {}: {}", url, e));

        let body = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(fetch_err)?
            .bytes()
            .await
            .map_err(fetch_err)?;

        let write_err = |e: std::io::Error| {
            BurstError::manifest(format!("failed to cache operator manifest: {}", e))
        };
        let mut file = tempfile::Builder::new()
            .prefix("flux-operator-")
            .suffix(".yaml")
            .tempfile()
            .map_err(write_err)?;
        file.write_all(&body).map_err(write_err)?;

        tracing::debug!(url = %url, path = %file.path().display(), bytes = body.len(), "Cached operator manifest");
        Ok(file)
    }

    async fn load(&self, source: &ManifestSource) -> Result<String> {
        let path = self.resolve(source).await?;
        read_manifest(&path)
    }

    /// Apply the operator manifest. Re-applying onto a cluster that already
    /// runs the operator is a success.
    pub async fn ensure_installed(
        &self,
        source: &ManifestSource,
        control_plane: &dyn ControlPlane,
    ) -> Result<ApplyOutcome> {
        let manifest = self.load(source).await?;

        let outcome = match control_plane.apply_manifest(&manifest).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_already_exists() => ApplyOutcome::AlreadyPresent,
            Err(e) => return Err(e),
        };

        tracing::info!(source = %source, outcome = %outcome, "Flux Operator installed");
        Ok(outcome)
    }
}

fn read_manifest(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        BurstError::manifest(format!("failed to read operator manifest {}: {}", path.display(), e))
    })
}
