//! GKE cluster provisioning through the gcloud CLI

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Output;
use std::sync::{Arc, LazyLock};
use tempfile::TempDir;
use tokio::process::Command;

use crate::k8s::control_plane::{ControlPlane, DryRunControlPlane, KubeControlPlane};
use crate::utils::dryrun;
use crate::utils::errors::{BurstError, Result};
use crate::utils::progress::{ClusterOp, ClusterProgress};

static ALREADY_EXISTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ALREADY_EXISTS|already exists").expect("static regex is valid")
});

static PERMANENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)PERMISSION_DENIED|INVALID_ARGUMENT|FAILED_PRECONDITION|QUOTA_EXCEEDED|quota .*exceeded|insufficient regional quota|project .*not found|has not been used in project|is not enabled|invalid machine type",
    )
    .expect("static regex is valid")
});

static NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)NOT_FOUND|was not found|could not find").expect("static regex is valid")
});

/// What to provision. Project and zone belong to the handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    pub name: String,
    pub node_count: u32,
    pub machine_type: String,
}

/// A cluster as the provider reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRef {
    pub name: String,
    pub node_count: Option<u32>,
    pub machine_type: Option<String>,
}

impl From<&ClusterSpec> for ClusterRef {
    fn from(spec: &ClusterSpec) -> Self {
        Self {
            name: spec.name.clone(),
            node_count: Some(spec.node_count),
            machine_type: Some(spec.machine_type.clone()),
        }
    }
}

/// Cloud-provider side of a bursted cluster.
///
/// `create` reports a cluster that is already there as
/// [`BurstError::AlreadyExists`]; provider faults come back as
/// [`BurstError::TransientProvision`] or [`BurstError::PermanentProvision`].
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    async fn create(&self, spec: &ClusterSpec) -> Result<ClusterRef>;

    /// `None` when the provider has no cluster by that name
    async fn describe(&self, name: &str) -> Result<Option<ClusterRef>>;

    async fn list(&self) -> Result<Vec<ClusterRef>>;

    /// Client for the cluster's Kubernetes API
    async fn control_plane(&self, cluster: &ClusterRef) -> Result<Arc<dyn ControlPlane>>;

    async fn delete(&self, cluster: &ClusterRef) -> Result<()>;
}

/// Map gcloud's stderr on a failed mutation to the provisioning taxonomy.
/// Anything not recognized as permanent is assumed to be worth a retry.
pub fn classify_gcloud_failure(stderr: &str) -> BurstError {
    let message = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if ALREADY_EXISTS.is_match(&message) {
        BurstError::AlreadyExists(message)
    } else if PERMANENT.is_match(&message) {
        BurstError::PermanentProvision(message)
    } else {
        BurstError::TransientProvision(message)
    }
}

/// A failed get-credentials means the cluster is gone when gcloud says so
fn classify_credentials_failure(cluster: &str, stderr: &str) -> BurstError {
    if NOT_FOUND.is_match(stderr) {
        BurstError::ClusterNotFound(cluster.to_string())
    } else {
        classify_gcloud_failure(stderr)
    }
}

/// Subset of `gcloud container clusters describe --format=json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GkeCluster {
    name: String,
    #[serde(default)]
    current_node_count: Option<u32>,
    #[serde(default)]
    node_config: Option<GkeNodeConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GkeNodeConfig {
    #[serde(default)]
    machine_type: Option<String>,
}

impl From<GkeCluster> for ClusterRef {
    fn from(cluster: GkeCluster) -> Self {
        Self {
            name: cluster.name,
            node_count: cluster.current_node_count,
            machine_type: cluster.node_config.and_then(|c| c.machine_type),
        }
    }
}

fn parse_cluster(json: &[u8]) -> Result<ClusterRef> {
    serde_json::from_slice::<GkeCluster>(json)
        .map(ClusterRef::from)
        .map_err(|e| BurstError::TransientProvision(format!("unreadable gcloud output: {}", e)))
}

fn parse_cluster_list(json: &[u8]) -> Result<Vec<ClusterRef>> {
    serde_json::from_slice::<Vec<GkeCluster>>(json)
        .map(|clusters| clusters.into_iter().map(ClusterRef::from).collect())
        .map_err(|e| BurstError::TransientProvision(format!("unreadable gcloud output: {}", e)))
}

/// Clusters in one project and zone, managed with `gcloud container clusters`
pub struct GkeClusterHandle {
    project: String,
    zone: String,
    /// Per-cluster kubeconfigs written by get-credentials
    kubeconfigs: TempDir,
}

impl GkeClusterHandle {
    pub fn new(project: impl Into<String>, zone: impl Into<String>) -> Result<Self> {
        let kubeconfigs = tempfile::Builder::new()
            .prefix("fluxburst-kubeconfig-")
            .tempdir()
            .map_err(|e| {
                BurstError::configuration(format!("failed to create kubeconfig directory: {}", e))
            })?;

        Ok(Self {
            project: project.into(),
            zone: zone.into(),
            kubeconfigs,
        })
    }

    fn kubeconfig_path(&self, cluster: &str) -> PathBuf {
        self.kubeconfigs.path().join(format!("{}.yaml", cluster))
    }

    fn clusters_cmd(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("gcloud");
        cmd.args(["container", "clusters"])
            .args(args)
            .args(["--project", self.project.as_str(), "--zone", self.zone.as_str()])
            .kill_on_drop(true);
        cmd
    }

    async fn output(&self, mut cmd: Command) -> Result<Output> {
        tracing::debug!(command = ?cmd.as_std(), "Running gcloud");
        cmd.output().await.map_err(|e| {
            BurstError::configuration(format!(
                "failed to run gcloud: {} (install the Google Cloud CLI)",
                e
            ))
        })
    }
}

#[async_trait]
impl ClusterHandle for GkeClusterHandle {
    async fn create(&self, spec: &ClusterSpec) -> Result<ClusterRef> {
        let num_nodes = spec.node_count.to_string();
        let cmd = self.clusters_cmd(&[
            "create",
            &spec.name,
            "--num-nodes",
            &num_nodes,
            "--machine-type",
            &spec.machine_type,
            "--quiet",
        ]);

        if dryrun::is_dry_run() {
            dryrun::log_action(&format!(
                "create GKE cluster {} ({} x {})",
                spec.name, spec.node_count, spec.machine_type
            ));
            return Ok(ClusterRef::from(spec));
        }

        let progress = ClusterProgress::start(ClusterOp::Create, &spec.name);
        progress.set_step(format!(
            "creating {} x {} nodes",
            spec.node_count, spec.machine_type
        ));

        let output = match self.output(cmd).await {
            Ok(output) => output,
            Err(e) => {
                progress.failed("create failed");
                return Err(e);
            }
        };

        if !output.status.success() {
            let err = classify_gcloud_failure(&String::from_utf8_lossy(&output.stderr));
            if err.is_already_exists() {
                progress.done("already exists");
            } else {
                progress.failed("create failed");
            }
            return Err(err);
        }

        progress.done("created");
        tracing::info!(
            cluster = %spec.name,
            nodes = spec.node_count,
            secs = progress.elapsed().as_secs(),
            "GKE cluster created"
        );
        Ok(ClusterRef::from(spec))
    }

    async fn describe(&self, name: &str) -> Result<Option<ClusterRef>> {
        let output = self
            .output(self.clusters_cmd(&["describe", name, "--format", "json"]))
            .await?;

        if output.status.success() {
            return parse_cluster(&output.stdout).map(Some);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if NOT_FOUND.is_match(&stderr) {
            Ok(None)
        } else {
            Err(classify_gcloud_failure(&stderr))
        }
    }

    async fn list(&self) -> Result<Vec<ClusterRef>> {
        let output = self
            .output(self.clusters_cmd(&["list", "--format", "json"]))
            .await?;

        if !output.status.success() {
            return Err(classify_gcloud_failure(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }
        parse_cluster_list(&output.stdout)
    }

    async fn control_plane(&self, cluster: &ClusterRef) -> Result<Arc<dyn ControlPlane>> {
        if dryrun::is_dry_run() {
            return Ok(Arc::new(DryRunControlPlane));
        }

        let kubeconfig = self.kubeconfig_path(&cluster.name);
        let mut cmd = self.clusters_cmd(&["get-credentials", &cluster.name]);
        cmd.env("KUBECONFIG", &kubeconfig);

        let output = self.output(cmd).await?;
        if !output.status.success() {
            return Err(classify_credentials_failure(
                &cluster.name,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        tracing::debug!(cluster = %cluster.name, kubeconfig = %kubeconfig.display(), "Fetched cluster credentials");
        let control_plane = KubeControlPlane::from_kubeconfig(&kubeconfig).await?;
        Ok(Arc::new(control_plane))
    }

    async fn delete(&self, cluster: &ClusterRef) -> Result<()> {
        if dryrun::is_dry_run() {
            dryrun::log_action(&format!("delete GKE cluster {}", cluster.name));
            return Ok(());
        }

        let progress = ClusterProgress::start(ClusterOp::Delete, &cluster.name);
        let output = self
            .output(self.clusters_cmd(&["delete", &cluster.name, "--quiet"]))
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if NOT_FOUND.is_match(&stderr) {
                progress.done("already gone");
                return Ok(());
            }
            progress.failed("delete failed");
            return Err(classify_gcloud_failure(&stderr));
        }

        progress.done("deleted");
        let _ = std::fs::remove_file(self.kubeconfig_path(&cluster.name));
        Ok(())
    }
}
