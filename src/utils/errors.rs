//! Error taxonomy for the bursting lifecycle, with actionable suggestions

use colored::Colorize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result alias used across the library
pub type Result<T, E = BurstError> = std::result::Result<T, E>;

/// Coarse classification of a [`BurstError`], used by the control loop to
/// decide between continue, retry and abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    AlreadyExists,
    TransientProvision,
    PermanentProvision,
    NotFound,
    PermissionDenied,
    ControlPlane,
    Submission,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BurstError {
    /// Missing or invalid parameter; reported before any remote call
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The resource is already there; callers treat this as success
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Network blip, quota propagation delay, provider 5xx
    #[error("transient provisioning failure: {0}")]
    TransientProvision(String),

    /// Invalid project, quota exceeded, bad machine type
    #[error("permanent provisioning failure: {0}")]
    PermanentProvision(String),

    /// The provider no longer has a cluster we expected to use
    #[error("cluster {0} not found at the provider")]
    ClusterNotFound(String),

    #[error("credential file not found: {}", .0.display())]
    CredentialNotFound(PathBuf),

    #[error("permission denied reading credential file: {}", .0.display())]
    CredentialPermissionDenied(PathBuf),

    #[error("failed to read credential file {}: {source}", path.display())]
    CredentialUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("submission of job {job} failed: {reason}")]
    Submission { job: String, reason: String },

    /// The job feed could not be read or parsed
    #[error("job source error: {0}")]
    JobSource(String),
}

impl BurstError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    /// Map an I/O failure on a credential file to the matching variant
    pub fn from_credential_io(path: &Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::CredentialNotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => {
                Self::CredentialPermissionDenied(path.to_path_buf())
            }
            _ => Self::CredentialUnreadable {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::JobSource(_) => ErrorKind::Configuration,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::TransientProvision(_) => ErrorKind::TransientProvision,
            Self::PermanentProvision(_) => ErrorKind::PermanentProvision,
            Self::ClusterNotFound(_)
            | Self::CredentialNotFound(_)
            | Self::CredentialUnreadable { .. } => ErrorKind::NotFound,
            Self::CredentialPermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Kube(kube::Error::Api(ae)) if ae.code == 409 => ErrorKind::AlreadyExists,
            Self::Kube(_) | Self::Manifest(_) => ErrorKind::ControlPlane,
            Self::Submission { .. } => ErrorKind::Submission,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// Whether a retry with backoff has a chance of succeeding
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientProvision(_) => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 429 || ae.code >= 500,
            Self::Kube(kube::Error::HyperError(_) | kube::Error::Service(_)) => true,
            _ => false,
        }
    }

    /// Hints shown to the operator alongside the error
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Self::Configuration(_) => vec![
                "Check the [burst] section of your .fluxburst.toml".to_string(),
                "Print a complete example with: fluxburst-gke config example".to_string(),
            ],
            Self::CredentialNotFound(path) => vec![
                format!("Verify the munge key exists at {}", path.display()),
                "Set burst.munge_key to the key used by the lead broker".to_string(),
            ],
            Self::CredentialPermissionDenied(path) => vec![
                format!("Make {} readable by this user (e.g. chmod 0400 and chown)", path.display()),
                "Run the plugin as the munge user".to_string(),
            ],
            Self::PermanentProvision(_) => vec![
                "Verify the project id and that the GKE API is enabled".to_string(),
                "Check compute quota for the requested machine type".to_string(),
            ],
            Self::ClusterNotFound(_) => vec![
                "The cluster was deleted outside fluxburst-gke; the next run creates it again"
                    .to_string(),
                "List clusters with: fluxburst-gke cluster list".to_string(),
            ],
            Self::TransientProvision(_) => vec![
                "Retry the burst; the provider reported a temporary failure".to_string(),
                "Raise retry.max_attempts if this happens often".to_string(),
            ],
            Self::Kube(_) | Self::Manifest(_) => vec![
                "Run with -vv to see the failing request".to_string(),
                "Check the cluster is reachable: fluxburst-gke check".to_string(),
            ],
            _ => Vec::new(),
        }
    }

    /// Display the error with suggestions
    pub fn display(&self) {
        crate::log_error!("{}", self);

        let suggestions = self.suggestions();
        if !suggestions.is_empty() {
            println!();
            println!("{}", "Suggestions:".yellow().bold());
            for suggestion in &suggestions {
                println!("  {} {}", "→".blue(), suggestion);
            }
        }
    }
}

/// Helper to display error and exit
pub fn display_error_and_exit(error: &BurstError) -> ! {
    error.display();
    std::process::exit(1);
}
