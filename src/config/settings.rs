//! Configuration file support for fluxburst-gke

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::retry::RetryConfig;

/// Default location of the Flux Operator install manifest
pub const DEFAULT_FLUX_OPERATOR_YAML: &str =
    "https://raw.githubusercontent.com/flux-framework/flux-operator/main/examples/dist/flux-operator.yaml";

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub burst: BurstSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub runner: RunnerSettings,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Raw bursting parameters as they appear in the file.
///
/// Required values are optional here and enforced by
/// [`BurstParameters::from_settings`](crate::config::params::BurstParameters::from_settings).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BurstSettings {
    /// Google Cloud project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    #[serde(default = "default_zone")]
    pub zone: String,

    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    #[serde(default = "default_machine_type")]
    pub machine_type: String,

    /// Per-container CPU limit, as a Kubernetes quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,

    /// Per-container memory limit, as a Kubernetes quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,

    /// Container image for MiniCluster pods
    #[serde(default = "default_image")]
    pub image: String,

    /// Name prefix for generated MiniClusters
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Local path or URL of the Flux Operator install manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flux_operator_yaml: Option<String>,

    /// Local munge.key shared with the lead broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub munge_key: Option<PathBuf>,

    #[serde(default = "default_munge_secret_name")]
    pub munge_secret_name: String,

    /// Broker config override for the bursted brokers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_toml: Option<String>,

    /// Lead broker service hostname or ip address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_host: Option<String>,

    /// Lead broker service port (e.g. 30093)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_size: Option<u32>,

    /// Job name of the lead broker; derived from the hostname when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_jobname: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flux_user: Option<String>,

    /// Arguments to flux wrap, e.g. "strace,-e,network,-tt"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap: Option<String>,

    #[serde(default = "default_option_flags")]
    pub option_flags: String,
}

/// Admission settings
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SchedulerSettings {
    /// Reject jobs needing more nodes than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<u32>,

    /// Only admit jobs submitted with the burstable marker
    #[serde(default)]
    pub require_burstable: bool,
}

/// Control loop settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RunnerSettings {
    #[serde(default = "default_max_concurrent_submissions")]
    pub max_concurrent_submissions: usize,

    /// Write each generated MiniCluster to a temporary YAML file before applying it
    #[serde(default)]
    pub persist_specs: bool,
}

// Default value functions
fn default_zone() -> String {
    "us-central1-a".to_string()
}

fn default_cluster_name() -> String {
    "flux-cluster".to_string()
}

fn default_machine_type() -> String {
    "c2-standard-8".to_string()
}

fn default_image() -> String {
    "ghcr.io/flux-framework/flux-restful-api:latest".to_string()
}

fn default_name() -> String {
    "burst-0".to_string()
}

fn default_namespace() -> String {
    "flux-operator".to_string()
}

fn default_munge_secret_name() -> String {
    "munge-key".to_string()
}

fn default_log_level() -> u8 {
    7
}

fn default_option_flags() -> String {
    "-ompi=openmpi@5 -c 1 -o cpu-affinity=per-task".to_string()
}

fn default_max_concurrent_submissions() -> usize {
    4
}

impl Default for BurstSettings {
    fn default() -> Self {
        Self {
            project: None,
            zone: default_zone(),
            cluster_name: default_cluster_name(),
            machine_type: default_machine_type(),
            cpu_limit: None,
            memory_limit: None,
            image: default_image(),
            name: default_name(),
            namespace: default_namespace(),
            flux_operator_yaml: None,
            munge_key: None,
            munge_secret_name: default_munge_secret_name(),
            broker_toml: None,
            lead_host: None,
            lead_port: None,
            lead_size: None,
            lead_jobname: None,
            log_level: default_log_level(),
            flux_user: None,
            wrap: None,
            option_flags: default_option_flags(),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_submissions: default_max_concurrent_submissions(),
            persist_specs: false,
        }
    }
}

impl Settings {
    /// Load settings from an explicit path, the standard locations, or defaults.
    ///
    /// An explicit path that cannot be read is an error; a broken file found
    /// in a standard location is too, since silently ignoring it would burst
    /// with unintended parameters.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        match Self::find_config_file() {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load settings from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(settings)
    }

    /// Find config file in standard locations
    /// Priority:
    /// 1. .fluxburst.toml in current directory
    /// 2. ~/.config/fluxburst-gke/config.toml (XDG config directory)
    fn find_config_file() -> Option<PathBuf> {
        let local_config = PathBuf::from(".fluxburst.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("fluxburst-gke").join("config.toml");
            if xdg_config.exists() {
                return Some(xdg_config);
            }
        }

        None
    }

    /// Generate example config file content
    pub fn example_config() -> String {
        let header = "# fluxburst-gke configuration file\n\
                      # Place this file at ~/.config/fluxburst-gke/config.toml or .fluxburst.toml\n\
                      # Required: burst.project, burst.lead_host, burst.lead_port, burst.lead_size\n\n";

        let mut example = Settings::default();
        example.burst.project = Some("my-gcp-project".to_string());
        example.burst.lead_host = Some("10.0.0.12".to_string());
        example.burst.lead_port = Some(30093);
        example.burst.lead_size = Some(4);
        example.burst.munge_key = Some(PathBuf::from("/etc/munge/munge.key"));

        match toml::to_string_pretty(&example) {
            Ok(config) => format!("{}{}", header, config),
            Err(e) => format!("{}# failed to render example: {}\n", header, e),
        }
    }
}
