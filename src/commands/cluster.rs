//! Cluster command implementations

use anyhow::{Context, Result, bail};
use colored::Colorize;

use crate::config::settings::Settings;
use crate::k8s::gke::{ClusterHandle, GkeClusterHandle};

fn handle(settings: &Settings) -> Result<GkeClusterHandle> {
    let Some(project) = settings.burst.project.as_deref() else {
        bail!("burst.project is required (set it in the config file or pass --project)");
    };
    GkeClusterHandle::new(project, settings.burst.zone.as_str())
        .context("Failed to set up the GKE cluster handle")
}

/// Handle cluster list command
pub async fn list(settings: &Settings) -> Result<()> {
    let clusters = handle(settings)?.list().await?;

    if clusters.is_empty() {
        crate::log_info!("No clusters in zone {}", settings.burst.zone);
        return Ok(());
    }

    for cluster in clusters {
        let marker = if cluster.name == settings.burst.cluster_name {
            "*".green().to_string()
        } else {
            " ".to_string()
        };
        println!(
            "{} {:<30} {:>5} nodes  {}",
            marker,
            cluster.name,
            cluster
                .node_count
                .map_or_else(|| "?".to_string(), |n| n.to_string()),
            cluster.machine_type.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Handle cluster delete command.
///
/// Without a name, the configured burst cluster is adopted into the runner's
/// registry and removed through it.
pub async fn delete(settings: &Settings, name: Option<String>, yes: bool) -> Result<()> {
    match name {
        Some(name) => delete_named(settings, &name, yes).await,
        None => delete_registered(settings, yes).await,
    }
}

async fn delete_named(settings: &Settings, name: &str, yes: bool) -> Result<()> {
    let handle = handle(settings)?;

    let Some(cluster) = handle.describe(name).await? else {
        crate::log_warn!("Cluster '{}' does not exist", name);
        return Ok(());
    };

    if !yes && !crate::utils::confirm(&format!("Are you sure you want to delete cluster '{}'?", name))? {
        crate::log_info!("Deletion cancelled");
        return Ok(());
    }

    handle.delete(&cluster).await?;
    crate::log_info!("Cluster '{}' deleted", name);
    Ok(())
}

async fn delete_registered(settings: &Settings, yes: bool) -> Result<()> {
    let runner = super::gke_runner(settings)?;
    runner.reconcile().await?;

    let names: Vec<String> = runner.registry().await.into_iter().map(|c| c.name).collect();
    if names.is_empty() {
        crate::log_warn!("Cluster '{}' does not exist", settings.burst.cluster_name);
        return Ok(());
    }

    if !yes
        && !crate::utils::confirm(&format!(
            "Are you sure you want to delete cluster(s) {}?",
            names.join(", ")
        ))?
    {
        crate::log_info!("Deletion cancelled");
        return Ok(());
    }

    let report = runner.cleanup().await;
    for name in &report.deleted {
        println!("  {} {} deleted", "✓".green(), name);
    }
    for (name, reason) in &report.failed {
        println!("  {} {}: {}", "✗".red(), name, reason);
    }

    if !report.failed.is_empty() {
        bail!("{} cluster(s) could not be deleted", report.failed.len());
    }
    Ok(())
}
