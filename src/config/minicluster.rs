//! MiniCluster custom resource generation
//!
//! A MiniCluster is the Flux Operator's description of a group of Flux
//! brokers. The ones generated here carry a back-reference to the lead broker
//! so the remote brokers join the local instance instead of forming their own.

use kube::CustomResource;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use crate::burst::job::Job;
use crate::config::params::{BurstParameters, LeadBroker};
use crate::utils::errors::{BurstError, Result};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "flux-framework.org",
    version = "v1alpha2",
    kind = "MiniCluster",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MiniClusterSpec {
    pub size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<u32>,
    pub interactive: bool,
    pub logging: Logging,
    pub flux: FluxSpec,
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Logging {
    pub zeromq: bool,
    pub quiet: bool,
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FluxSpec {
    pub option_flags: String,
    pub connect_timeout: String,
    pub log_level: u8,
    pub bursting: Bursting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub munge_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bursting {
    pub lead_broker: LeadBrokerRef,
    pub clusters: Vec<BurstedCluster>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeadBrokerRef {
    pub address: String,
    pub port: u16,
    pub name: String,
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BurstedCluster {
    pub size: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    pub command: String,
    pub run_flux: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ContainerResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flux_user: Option<FluxUser>,
}

/// Requests always mirror limits; there is no separate headroom.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerResources {
    pub limits: BTreeMap<String, String>,
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FluxUser {
    pub name: String,
}

/// Name of the MiniCluster generated for a job
pub fn minicluster_name(params: &BurstParameters, job: &Job) -> String {
    format!("{}-{}", params.name, job.id)
}

/// Resources block for the given limits, or `None` when neither is set
pub fn container_resources(
    cpu_limit: Option<&str>,
    memory_limit: Option<&str>,
) -> Option<ContainerResources> {
    if cpu_limit.is_none() && memory_limit.is_none() {
        return None;
    }

    let mut resources = ContainerResources::default();
    for (key, value) in [("cpu", cpu_limit), ("memory", memory_limit)] {
        if let Some(value) = value {
            resources.limits.insert(key.to_string(), value.to_string());
            resources.requests.insert(key.to_string(), value.to_string());
        }
    }
    Some(resources)
}

/// Container for a job; job-level resource overrides win over the plugin limits
pub fn build_container(job: &Job, params: &BurstParameters) -> ContainerSpec {
    let cpu = job.resources.cpu.as_deref().or(params.cpu_limit.as_deref());
    let memory = job
        .resources
        .memory
        .as_deref()
        .or(params.memory_limit.as_deref());

    ContainerSpec {
        image: params.image.clone(),
        command: job.command_line(),
        run_flux: true,
        resources: container_resources(cpu, memory),
        flux_user: params
            .flux_user
            .as_ref()
            .map(|name| FluxUser { name: name.clone() }),
    }
}

/// Build the MiniCluster for one job. Pure: no I/O, no clock, no randomness.
pub fn build(job: &Job, params: &BurstParameters, lead: &LeadBroker) -> MiniCluster {
    let name = minicluster_name(params, job);

    let spec = MiniClusterSpec {
        size: job.nodes,
        tasks: (job.tasks > 0).then_some(job.tasks),
        interactive: false,
        logging: Logging::default(),
        flux: FluxSpec {
            option_flags: params.option_flags.clone(),
            connect_timeout: "5s".to_string(),
            log_level: params.log_level,
            bursting: Bursting {
                lead_broker: LeadBrokerRef {
                    address: lead.host.clone(),
                    port: lead.port,
                    name: lead.name.clone(),
                    size: lead.size,
                },
                clusters: vec![BurstedCluster {
                    size: job.nodes,
                    name: name.clone(),
                }],
            },
            munge_secret: params.munge_secret().map(str::to_string),
            broker_config: params.broker_toml.clone(),
            wrap: params.wrap.clone(),
        },
        containers: vec![build_container(job, params)],
    };

    MiniCluster {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(params.namespace.clone()),
            labels: Some(
                [
                    (
                        "app.kubernetes.io/managed-by".to_string(),
                        "fluxburst-gke".to_string(),
                    ),
                    ("fluxburst.flux-framework.org/job".to_string(), job.id.to_string()),
                ]
                .into(),
            ),
            ..Default::default()
        },
        spec,
    }
}

/// Render a MiniCluster as YAML
pub fn to_yaml(minicluster: &MiniCluster) -> Result<String> {
    serde_yaml::to_string(minicluster)
        .map_err(|e| BurstError::manifest(format!("failed to serialize MiniCluster: {}", e)))
}

/// Persist a MiniCluster to a temporary YAML file that outlives the process
pub fn write_spec_file(minicluster: &MiniCluster) -> Result<PathBuf> {
    let yaml = to_yaml(minicluster)?;
    let io_err = |e: std::io::Error| {
        BurstError::manifest(format!("failed to write MiniCluster spec: {}", e))
    };

    let mut file = tempfile::Builder::new()
        .prefix("minicluster-")
        .suffix(".yaml")
        .tempfile()
        .map_err(io_err)?;
    file.write_all(yaml.as_bytes()).map_err(io_err)?;

    let (_, path) = file.keep().map_err(|e| io_err(e.error))?;
    Ok(path)
}
