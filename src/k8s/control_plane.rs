//! Control-plane client for a remote cluster
//!
//! Every call is idempotent from the caller's point of view: conflicts on
//! create come back as [`ApplyOutcome::AlreadyPresent`] instead of errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, DynamicObject, GroupVersionKind, ObjectMeta, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{Discovery, Scope};
use kube::{Client, Config};
use serde::Deserialize;
use std::path::Path;

use crate::config::minicluster::MiniCluster;
use crate::utils::dryrun;
use crate::utils::errors::{BurstError, Result};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "fluxburst-gke";

/// What a control-plane call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    AlreadyPresent,
}

impl std::fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyOutcome::Created => write!(f, "created"),
            ApplyOutcome::Updated => write!(f, "updated"),
            ApplyOutcome::AlreadyPresent => write!(f, "already present"),
        }
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Apply every document of a multi-document YAML manifest
    async fn apply_manifest(&self, manifest: &str) -> Result<ApplyOutcome>;

    async fn ensure_namespace(&self, namespace: &str) -> Result<ApplyOutcome>;

    /// Create the secret, or replace it when one with the same name exists
    async fn ensure_secret(&self, secret: &Secret) -> Result<ApplyOutcome>;

    async fn apply_minicluster(&self, minicluster: &MiniCluster) -> Result<ApplyOutcome>;
}

/// Get priority for a Kubernetes resource kind (lower = apply first)
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" => 7,
        _ => 10,
    }
}

/// Split a multi-document YAML manifest into objects, ordered for apply.
/// Empty documents are dropped.
pub fn parse_manifest(manifest: &str) -> Result<Vec<serde_json::Value>> {
    let mut objects = Vec::new();

    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_json::Value::deserialize(document)
            .map_err(|e| BurstError::manifest(format!("invalid YAML document: {}", e)))?;
        if value.is_null() {
            continue;
        }
        objects.push(value);
    }

    objects.sort_by_key(|obj| kind_priority(obj.get("kind").and_then(|k| k.as_str()).unwrap_or("")));
    Ok(objects)
}

/// Kubernetes-backed control plane
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from a kubeconfig written by the cluster handle
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            BurstError::manifest(format!("failed to read kubeconfig {}: {}", path.display(), e))
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                BurstError::manifest(format!("failed to load kubeconfig {}: {}", path.display(), e))
            })?;
        let client = Client::try_from(config)?;
        Ok(Self::new(client))
    }

    async fn apply_object(
        &self,
        discovery: &Discovery,
        obj: &serde_json::Value,
        params: &PatchParams,
    ) -> Result<()> {
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BurstError::manifest("document is missing kind"))?;
        let api_version = obj
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BurstError::manifest(format!("{} is missing apiVersion", kind)))?;
        let name = obj
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BurstError::manifest(format!("{} is missing metadata.name", kind)))?;
        let namespace = obj.pointer("/metadata/namespace").and_then(|v| v.as_str());

        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind::gvk(group, version, kind);

        let (resource, caps) = discovery.resolve_gvk(&gvk).ok_or_else(|| {
            BurstError::manifest(format!("unknown resource type {}/{}", api_version, kind))
        })?;

        let api: Api<DynamicObject> = match caps.scope {
            Scope::Namespaced => {
                Api::namespaced_with(self.client.clone(), namespace.unwrap_or("default"), &resource)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        };

        api.patch(name, params, &Patch::Apply(obj)).await?;
        tracing::debug!(kind = %kind, name = %name, namespace = ?namespace, "Applied manifest object");
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn apply_manifest(&self, manifest: &str) -> Result<ApplyOutcome> {
        let objects = parse_manifest(manifest)?;
        if objects.is_empty() {
            return Err(BurstError::manifest("manifest contains no objects"));
        }

        // Namespaces and CRDs first, then rediscover so the new kinds resolve
        let (foundational, rest): (Vec<_>, Vec<_>) = objects.iter().partition(|obj| {
            matches!(
                obj.get("kind").and_then(|k| k.as_str()),
                Some("Namespace") | Some("CustomResourceDefinition")
            )
        });

        let params = PatchParams::apply(FIELD_MANAGER).force();

        for phase in [foundational, rest] {
            if phase.is_empty() {
                continue;
            }
            let discovery = Discovery::new(self.client.clone()).run().await?;
            for obj in phase {
                self.apply_object(&discovery, obj, &params).await?;
            }
        }

        Ok(ApplyOutcome::Updated)
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<ApplyOutcome> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(ApplyOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(ApplyOutcome::AlreadyPresent),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_secret(&self, secret: &Secret) -> Result<ApplyOutcome> {
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| BurstError::manifest("secret has no name"))?;
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| BurstError::manifest("secret has no namespace"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        match api.create(&PostParams::default(), secret).await {
            Ok(_) => Ok(ApplyOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                api.replace(name, &PostParams::default(), secret).await?;
                Ok(ApplyOutcome::Updated)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_minicluster(&self, minicluster: &MiniCluster) -> Result<ApplyOutcome> {
        let namespace = minicluster
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| BurstError::manifest("MiniCluster has no namespace"))?;
        let api: Api<MiniCluster> = Api::namespaced(self.client.clone(), namespace);

        match api.create(&PostParams::default(), minicluster).await {
            Ok(_) => Ok(ApplyOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(ApplyOutcome::AlreadyPresent),
            Err(e) => Err(e.into()),
        }
    }
}

/// Logs every mutation instead of performing it
pub struct DryRunControlPlane;

#[async_trait]
impl ControlPlane for DryRunControlPlane {
    async fn apply_manifest(&self, manifest: &str) -> Result<ApplyOutcome> {
        let objects = parse_manifest(manifest)?;
        dryrun::log_action(&format!("apply {} operator manifest objects", objects.len()));
        Ok(ApplyOutcome::Updated)
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<ApplyOutcome> {
        dryrun::log_action(&format!("create namespace {}", namespace));
        Ok(ApplyOutcome::Created)
    }

    async fn ensure_secret(&self, secret: &Secret) -> Result<ApplyOutcome> {
        dryrun::log_action(&format!(
            "create secret {}/{}",
            secret.metadata.namespace.as_deref().unwrap_or_default(),
            secret.metadata.name.as_deref().unwrap_or_default()
        ));
        Ok(ApplyOutcome::Created)
    }

    async fn apply_minicluster(&self, minicluster: &MiniCluster) -> Result<ApplyOutcome> {
        dryrun::log_action(&format!(
            "create MiniCluster {}/{} (size {})",
            minicluster.metadata.namespace.as_deref().unwrap_or_default(),
            minicluster.metadata.name.as_deref().unwrap_or_default(),
            minicluster.spec.size
        ));
        Ok(ApplyOutcome::Created)
    }
}
