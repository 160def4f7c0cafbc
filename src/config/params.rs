//! Validated, immutable bursting parameters

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

use crate::config::settings::{BurstSettings, DEFAULT_FLUX_OPERATOR_YAML};
use crate::install::operator::ManifestSource;
use crate::utils::errors::{BurstError, Result};

/// Environment variable GKE credentials are discovered from
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex is valid")
});

/// Kubernetes object names and labels
const MAX_DNS_LABEL: usize = 63;

/// GKE rejects longer cluster names
const MAX_GKE_CLUSTER_NAME: usize = 40;

/// MiniClusters are named `<name>-<job id>` and a job id has up to 20 digits
const MAX_MINICLUSTER_PREFIX: usize = MAX_DNS_LABEL - 1 - 20;

/// Where the remote brokers connect back to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadBroker {
    pub host: String,
    pub port: u16,
    pub size: u32,
    /// Job name of the lead broker's MiniCluster
    pub name: String,
}

/// Configuration for one plugin instance. Built once by
/// [`BurstParameters::from_settings`] and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct BurstParameters {
    pub project: String,
    pub zone: String,
    pub cluster_name: String,
    pub machine_type: String,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub image: String,
    pub name: String,
    pub namespace: String,
    pub operator_manifest: ManifestSource,
    pub munge_key: Option<PathBuf>,
    pub munge_secret_name: String,
    pub broker_toml: Option<String>,
    pub lead: LeadBroker,
    pub log_level: u8,
    pub flux_user: Option<String>,
    pub wrap: Option<String>,
    pub option_flags: String,
}

impl BurstParameters {
    /// Validate raw settings. Every required value is checked here so that
    /// nothing is discovered missing halfway through a burst.
    pub fn from_settings(raw: &BurstSettings) -> Result<Self> {
        let project = required(raw.project.as_deref(), "burst.project")?;
        let lead_host = required(raw.lead_host.as_deref(), "burst.lead_host")?;

        let lead_port = raw
            .lead_port
            .ok_or_else(|| missing("burst.lead_port"))?;
        if lead_port == 0 {
            return Err(BurstError::configuration("burst.lead_port must be non-zero"));
        }

        let lead_size = raw
            .lead_size
            .ok_or_else(|| missing("burst.lead_size"))?;
        if lead_size == 0 {
            return Err(BurstError::configuration("burst.lead_size must be at least 1"));
        }

        for (field, value, max_len) in [
            ("burst.cluster_name", raw.cluster_name.as_str(), MAX_GKE_CLUSTER_NAME),
            ("burst.name", raw.name.as_str(), MAX_MINICLUSTER_PREFIX),
            ("burst.namespace", raw.namespace.as_str(), MAX_DNS_LABEL),
            ("burst.munge_secret_name", raw.munge_secret_name.as_str(), MAX_DNS_LABEL),
        ] {
            if !DNS_LABEL.is_match(value) {
                return Err(BurstError::configuration(format!(
                    "{} '{}' is not a valid DNS-1123 label",
                    field, value
                )));
            }
            if value.len() > max_len {
                return Err(BurstError::configuration(format!(
                    "{} '{}' is {} characters; at most {} are allowed",
                    field,
                    value,
                    value.len(),
                    max_len
                )));
            }
        }

        if raw.image.trim().is_empty() {
            return Err(missing("burst.image"));
        }

        let lead_name = match raw.lead_jobname.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                let host = hostname::get()
                    .map_err(|e| {
                        BurstError::configuration(format!(
                            "burst.lead_jobname is unset and the hostname is unavailable: {}",
                            e
                        ))
                    })?
                    .to_string_lossy()
                    .into_owned();
                lead_jobname_from_hostname(&host)
            }
        };

        let operator_manifest = ManifestSource::parse(
            raw.flux_operator_yaml
                .as_deref()
                .unwrap_or(DEFAULT_FLUX_OPERATOR_YAML),
        );

        Ok(Self {
            project,
            zone: raw.zone.clone(),
            cluster_name: raw.cluster_name.clone(),
            machine_type: raw.machine_type.clone(),
            cpu_limit: non_empty(&raw.cpu_limit),
            memory_limit: non_empty(&raw.memory_limit),
            image: raw.image.clone(),
            name: raw.name.clone(),
            namespace: raw.namespace.clone(),
            operator_manifest,
            munge_key: raw.munge_key.clone(),
            munge_secret_name: raw.munge_secret_name.clone(),
            broker_toml: non_empty(&raw.broker_toml),
            lead: LeadBroker {
                host: lead_host,
                port: lead_port,
                size: lead_size,
                name: lead_name,
            },
            log_level: raw.log_level,
            flux_user: non_empty(&raw.flux_user),
            wrap: non_empty(&raw.wrap),
            option_flags: raw.option_flags.clone(),
        })
    }

    /// Name of the secret MiniClusters reference, if a munge key is configured
    pub fn munge_secret(&self) -> Option<&str> {
        self.munge_key
            .as_ref()
            .map(|_| self.munge_secret_name.as_str())
    }
}

/// Pods of a MiniCluster are named `<job>-<index>`; strip the index.
pub fn lead_jobname_from_hostname(hostname: &str) -> String {
    match hostname.rsplit_once('-') {
        Some((job, _)) if !job.is_empty() => job.to_string(),
        _ => hostname.to_string(),
    }
}

fn required(value: Option<&str>, field: &str) -> Result<String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(missing(field)),
    }
}

fn missing(field: &str) -> BurstError {
    BurstError::configuration(format!("{} is required", field))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::ErrorKind;

    fn valid() -> BurstSettings {
        BurstSettings {
            project: Some("hpc-burst".to_string()),
            lead_host: Some("10.0.0.12".to_string()),
            lead_port: Some(30093),
            lead_size: Some(4),
            lead_jobname: Some("flux-sample".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_settings() {
        let params = BurstParameters::from_settings(&valid()).unwrap();
        assert_eq!(params.project, "hpc-burst");
        assert_eq!(
            params.lead,
            LeadBroker {
                host: "10.0.0.12".to_string(),
                port: 30093,
                size: 4,
                name: "flux-sample".to_string(),
            }
        );
        assert!(matches!(params.operator_manifest, ManifestSource::Remote(_)));
        assert!(params.munge_secret().is_none());
    }

    #[test]
    fn test_missing_required_fields() {
        for field in ["project", "lead_host", "lead_port", "lead_size"] {
            let mut raw = valid();
            match field {
                "project" => raw.project = None,
                "lead_host" => raw.lead_host = Some("  ".to_string()),
                "lead_port" => raw.lead_port = None,
                _ => raw.lead_size = None,
            }
            let err = BurstParameters::from_settings(&raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration);
            assert!(err.to_string().contains(field), "{}", err);
        }
    }

    #[test]
    fn test_invalid_names_rejected() {
        let mut raw = valid();
        raw.namespace = "Flux_Operator".to_string();
        let err = BurstParameters::from_settings(&raw).unwrap_err();
        assert!(err.to_string().contains("burst.namespace"));
    }

    #[test]
    fn test_name_length_limits() {
        let mut raw = valid();
        raw.cluster_name = "c".repeat(41);
        let err = BurstParameters::from_settings(&raw).unwrap_err();
        assert!(err.to_string().contains("burst.cluster_name"), "{}", err);

        raw.cluster_name = "c".repeat(40);
        assert!(BurstParameters::from_settings(&raw).is_ok());

        // Leaves room for "-<job id>" with the largest job id
        raw.name = "n".repeat(43);
        let err = BurstParameters::from_settings(&raw).unwrap_err();
        assert!(err.to_string().contains("at most 42"), "{}", err);

        raw.name = "n".repeat(42);
        let params = BurstParameters::from_settings(&raw).unwrap();
        let longest = format!("{}-{}", params.name, u64::MAX);
        assert_eq!(longest.len(), 63);
    }

    #[test]
    fn test_empty_optionals_dropped() {
        let mut raw = valid();
        raw.wrap = Some(String::new());
        raw.cpu_limit = Some(" 2 ".to_string());
        raw.munge_key = Some(PathBuf::from("/etc/munge/munge.key"));
        let params = BurstParameters::from_settings(&raw).unwrap();
        assert!(params.wrap.is_none());
        assert_eq!(params.cpu_limit.as_deref(), Some("2"));
        assert_eq!(params.munge_secret(), Some("munge-key"));
    }

    #[test]
    fn test_local_manifest_source() {
        let mut raw = valid();
        raw.flux_operator_yaml = Some("/opt/flux-operator.yaml".to_string());
        let params = BurstParameters::from_settings(&raw).unwrap();
        assert_eq!(
            params.operator_manifest,
            ManifestSource::Local(PathBuf::from("/opt/flux-operator.yaml"))
        );
    }

    #[test]
    fn test_lead_jobname_from_hostname() {
        assert_eq!(lead_jobname_from_hostname("flux-sample-0"), "flux-sample");
        assert_eq!(lead_jobname_from_hostname("lead"), "lead");
        assert_eq!(lead_jobname_from_hostname("-0"), "-0");
    }
}
