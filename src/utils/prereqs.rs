//! External tools the GKE backend shells out to

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrereqError {
    #[error("{name} not found on PATH. {hint}")]
    NotFound { name: &'static str, hint: &'static str },
}

/// How badly a missing tool hurts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Nothing works without it
    Required,
    /// Only some operations fail without it
    Recommended,
}

#[derive(Debug, Clone, Copy)]
pub struct Tool {
    pub name: &'static str,
    pub hint: &'static str,
    pub requirement: Requirement,
}

impl Tool {
    pub fn locate(&self) -> Result<PathBuf, PrereqError> {
        which::which(self.name).map_err(|_| PrereqError::NotFound {
            name: self.name,
            hint: self.hint,
        })
    }
}

/// Cluster create, describe, list, delete and get-credentials
pub const GCLOUD: Tool = Tool {
    name: "gcloud",
    hint: "Install from: https://cloud.google.com/sdk/docs/install",
    requirement: Requirement::Required,
};

/// Exec credential plugin referenced by GKE kubeconfigs
pub const GKE_AUTH_PLUGIN: Tool = Tool {
    name: "gke-gcloud-auth-plugin",
    hint: "Install with: gcloud components install gke-gcloud-auth-plugin",
    requirement: Requirement::Recommended,
};

pub const BURST_TOOLS: [Tool; 2] = [GCLOUD, GKE_AUTH_PLUGIN];

/// Outcome of looking up one tool
#[derive(Debug)]
pub struct ToolCheck {
    pub tool: Tool,
    pub location: Result<PathBuf, PrereqError>,
}

pub fn check_tools(tools: &[Tool]) -> Vec<ToolCheck> {
    tools
        .iter()
        .map(|tool| ToolCheck {
            tool: *tool,
            location: tool.locate(),
        })
        .collect()
}
