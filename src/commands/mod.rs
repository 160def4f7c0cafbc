//! Command implementations for the fluxburst-gke CLI

pub mod check;
pub mod cluster;
pub mod config;
pub mod render;
pub mod run;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::burst::runner::{BurstRunner, RunnerOptions};
use crate::burst::scheduler::BurstScheduler;
use crate::config::params::BurstParameters;
use crate::config::settings::Settings;
use crate::k8s::gke::GkeClusterHandle;

/// Validated parameters, or an error naming the missing setting
pub fn load_params(settings: &Settings) -> Result<Arc<BurstParameters>> {
    let params = BurstParameters::from_settings(&settings.burst)?;
    Ok(Arc::new(params))
}

/// A runner backed by the real GKE handle
pub fn gke_runner(settings: &Settings) -> Result<BurstRunner> {
    let params = load_params(settings)?;
    let options = RunnerOptions::from_settings(settings)?;
    let handle = GkeClusterHandle::new(params.project.as_str(), params.zone.as_str())
        .context("Failed to set up the GKE cluster handle")?;

    Ok(BurstRunner::new(
        params,
        BurstScheduler::from_settings(&settings.scheduler),
        Arc::new(handle),
        options,
    ))
}
