//! Process-local record of the clusters this plugin has provisioned.
//!
//! Nothing here is persisted. After a restart the registry starts empty and
//! has to be rebuilt with [`BurstRunner::reconcile`](crate::burst::runner::BurstRunner::reconcile).

use std::collections::HashMap;
use std::fmt;

use crate::k8s::gke::ClusterRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Absent,
    Provisioning,
    Ready,
    Deleting,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionState::Absent => "absent",
            ProvisionState::Provisioning => "provisioning",
            ProvisionState::Ready => "ready",
            ProvisionState::Deleting => "deleting",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCluster {
    pub name: String,
    pub state: ProvisionState,
    pub node_count: u32,
    pub machine_type: String,
}

impl RemoteCluster {
    pub fn to_ref(&self) -> ClusterRef {
        ClusterRef {
            name: self.name.clone(),
            node_count: Some(self.node_count),
            machine_type: Some(self.machine_type.clone()),
        }
    }
}

#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clusters: HashMap<String, RemoteCluster>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&RemoteCluster> {
        self.clusters.get(name)
    }

    /// Unknown clusters are `Absent`
    pub fn state(&self, name: &str) -> ProvisionState {
        self.clusters
            .get(name)
            .map_or(ProvisionState::Absent, |c| c.state)
    }

    pub fn upsert(&mut self, cluster: RemoteCluster) {
        self.clusters.insert(cluster.name.clone(), cluster);
    }

    /// Returns false when the cluster is not registered
    pub fn set_state(&mut self, name: &str, state: ProvisionState) -> bool {
        match self.clusters.get_mut(name) {
            Some(cluster) => {
                tracing::debug!(cluster = %name, from = %cluster.state, to = %state, "Cluster state change");
                cluster.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<RemoteCluster> {
        self.clusters.remove(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> Vec<RemoteCluster> {
        let mut clusters: Vec<RemoteCluster> = self.clusters.values().cloned().collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        clusters
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str, state: ProvisionState) -> RemoteCluster {
        RemoteCluster {
            name: name.to_string(),
            state,
            node_count: 4,
            machine_type: "c2-standard-8".to_string(),
        }
    }

    #[test]
    fn test_unknown_cluster_is_absent() {
        let registry = ClusterRegistry::new();
        assert_eq!(registry.state("flux-cluster"), ProvisionState::Absent);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let mut registry = ClusterRegistry::new();
        registry.upsert(cluster("flux-cluster", ProvisionState::Provisioning));
        assert!(registry.set_state("flux-cluster", ProvisionState::Ready));
        assert_eq!(registry.state("flux-cluster"), ProvisionState::Ready);
        assert!(!registry.set_state("other", ProvisionState::Ready));

        registry.remove("flux-cluster");
        assert_eq!(registry.state("flux-cluster"), ProvisionState::Absent);
    }

    #[test]
    fn test_names_sorted() {
        let mut registry = ClusterRegistry::new();
        registry.upsert(cluster("b", ProvisionState::Ready));
        registry.upsert(cluster("a", ProvisionState::Deleting));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.snapshot()[0].state, ProvisionState::Deleting);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_to_ref() {
        let r = cluster("a", ProvisionState::Ready).to_ref();
        assert_eq!(r.node_count, Some(4));
        assert_eq!(r.machine_type.as_deref(), Some("c2-standard-8"));
    }
}
