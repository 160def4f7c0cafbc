//! In-memory fakes of the cloud provider and the remote control plane

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::minicluster::MiniCluster;
use crate::k8s::control_plane::{ApplyOutcome, ControlPlane};
use crate::k8s::gke::{ClusterHandle, ClusterRef, ClusterSpec};
use crate::utils::errors::{BurstError, Result};

#[derive(Default)]
pub struct FakeControlPlane {
    fail_install: bool,
    /// MiniCluster names whose submission fails
    failing_miniclusters: HashSet<String>,
    /// Cancelled right after the first successful submission
    cancel_after_submit: Option<CancellationToken>,
    manifests: AtomicUsize,
    namespaces: Mutex<HashSet<String>>,
    secrets: Mutex<HashMap<String, Secret>>,
    miniclusters: Mutex<BTreeMap<String, MiniCluster>>,
}

impl FakeControlPlane {
    pub fn failing_install(mut self) -> Self {
        self.fail_install = true;
        self
    }

    pub fn failing_minicluster(mut self, name: &str) -> Self {
        self.failing_miniclusters.insert(name.to_string());
        self
    }

    pub fn cancelling_after_submit(mut self, token: CancellationToken) -> Self {
        self.cancel_after_submit = Some(token);
        self
    }

    pub fn manifest_applies(&self) -> usize {
        self.manifests.load(Ordering::SeqCst)
    }

    pub fn namespaces(&self) -> HashSet<String> {
        self.namespaces.lock().unwrap().clone()
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.secrets.lock().unwrap().get(name).cloned()
    }

    pub fn submitted(&self) -> Vec<String> {
        self.miniclusters.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn apply_manifest(&self, _manifest: &str) -> Result<ApplyOutcome> {
        if self.fail_install {
            return Err(BurstError::manifest("injected install failure"));
        }
        // Create-style install: the second apply hits existing objects
        if self.manifests.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(BurstError::AlreadyExists("flux-operator".to_string()));
        }
        Ok(ApplyOutcome::Created)
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<ApplyOutcome> {
        if self.namespaces.lock().unwrap().insert(namespace.to_string()) {
            Ok(ApplyOutcome::Created)
        } else {
            Ok(ApplyOutcome::AlreadyPresent)
        }
    }

    async fn ensure_secret(&self, secret: &Secret) -> Result<ApplyOutcome> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        match self.secrets.lock().unwrap().insert(name, secret.clone()) {
            None => Ok(ApplyOutcome::Created),
            Some(_) => Ok(ApplyOutcome::Updated),
        }
    }

    async fn apply_minicluster(&self, minicluster: &MiniCluster) -> Result<ApplyOutcome> {
        let name = minicluster.metadata.name.clone().unwrap_or_default();
        if self.failing_miniclusters.contains(&name) {
            return Err(BurstError::manifest(format!("admission webhook denied {}", name)));
        }
        let mut submitted = self.miniclusters.lock().unwrap();
        if submitted.contains_key(&name) {
            return Ok(ApplyOutcome::AlreadyPresent);
        }
        submitted.insert(name, minicluster.clone());
        if let Some(token) = &self.cancel_after_submit {
            token.cancel();
        }
        Ok(ApplyOutcome::Created)
    }
}

/// Scripted responses for `create`; once exhausted every create succeeds.
/// `existing` stands in for the clusters the provider actually has.
#[derive(Default)]
pub struct FakeClusterHandle {
    pub create_script: Mutex<Vec<BurstError>>,
    pub control_plane: Arc<FakeControlPlane>,
    pub existing: Mutex<HashSet<String>>,
    /// `create` never returns, like a provider operation that takes minutes
    hang_create: bool,
    creates: Mutex<Vec<ClusterSpec>>,
    describes: AtomicUsize,
    deletes: Mutex<Vec<String>>,
}

impl FakeClusterHandle {
    pub fn with_control_plane(control_plane: FakeControlPlane) -> Self {
        Self {
            control_plane: Arc::new(control_plane),
            ..Default::default()
        }
    }

    pub fn script(self, errors: Vec<BurstError>) -> Self {
        *self.create_script.lock().unwrap() = errors;
        self
    }

    pub fn hanging_create(mut self) -> Self {
        self.hang_create = true;
        self
    }

    pub fn describes(&self) -> usize {
        self.describes.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> Vec<ClusterSpec> {
        self.creates.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterHandle for FakeClusterHandle {
    async fn create(&self, spec: &ClusterSpec) -> Result<ClusterRef> {
        self.creates.lock().unwrap().push(spec.clone());
        if self.hang_create {
            std::future::pending::<()>().await;
        }

        let scripted = {
            let mut script = self.create_script.lock().unwrap();
            (!script.is_empty()).then(|| script.remove(0))
        };
        if let Some(err) = scripted {
            return Err(err);
        }

        if !self.existing.lock().unwrap().insert(spec.name.clone()) {
            return Err(BurstError::AlreadyExists(format!("cluster {}", spec.name)));
        }
        Ok(ClusterRef::from(spec))
    }

    async fn describe(&self, name: &str) -> Result<Option<ClusterRef>> {
        self.describes.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .existing
            .lock()
            .unwrap()
            .contains(name)
            .then(|| ClusterRef {
                name: name.to_string(),
                node_count: None,
                machine_type: None,
            }))
    }

    async fn list(&self) -> Result<Vec<ClusterRef>> {
        let mut names: Vec<String> = self.existing.lock().unwrap().iter().cloned().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| ClusterRef {
                name,
                node_count: None,
                machine_type: None,
            })
            .collect())
    }

    async fn control_plane(&self, cluster: &ClusterRef) -> Result<Arc<dyn ControlPlane>> {
        if !self.existing.lock().unwrap().contains(&cluster.name) {
            return Err(BurstError::ClusterNotFound(cluster.name.clone()));
        }
        Ok(self.control_plane.clone())
    }

    async fn delete(&self, cluster: &ClusterRef) -> Result<()> {
        self.deletes.lock().unwrap().push(cluster.name.clone());
        self.existing.lock().unwrap().remove(&cluster.name);
        Ok(())
    }
}
