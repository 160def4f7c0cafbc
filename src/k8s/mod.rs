//! Cloud provider and Kubernetes operations

pub mod control_plane;
pub mod gke;
