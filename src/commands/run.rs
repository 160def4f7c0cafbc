//! Run one burst cycle for the jobs in a file

use anyhow::{Result, bail};
use colored::Colorize;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::burst::job::{JobFile, JobSource};
use crate::burst::runner::{BatchReport, JobOutcome};
use crate::config::settings::Settings;

pub async fn run(settings: &Settings, jobs_file: &Path) -> Result<()> {
    let runner = super::gke_runner(settings)?;
    let source = JobFile::new(jobs_file);
    crate::log_info!("Reading jobs from {}", source.path().display());
    let jobs = source.pending_jobs()?;
    let total = jobs.len();

    for job in jobs {
        runner.admit(job).await;
    }

    let admitted = runner.pending_len().await;
    crate::log_info!("Admitted {} of {} job(s) for bursting", admitted, total);
    if admitted == 0 {
        crate::log_warn!("No jobs admitted; nothing to burst");
        return Ok(());
    }

    // The registry starts empty in every process
    match runner.reconcile().await {
        Ok(report) if !report.adopted.is_empty() => {
            crate::log_info!("Reusing existing cluster(s): {}", report.adopted.join(", "));
        }
        Ok(_) => {}
        Err(e) => crate::log_warn!("Could not list existing clusters: {}", e),
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            crate::log_warn!("Interrupted; letting in-flight submissions finish");
            on_interrupt.cancel();
        }
    });

    let report = runner.run_with_cancel(cancel).await?;
    print_report(&report);

    if report.failed() > 0 {
        bail!("{} job(s) failed to burst", report.failed());
    }
    if let Some(state) = report.aborted_at {
        bail!("burst cancelled while {}; {} job(s) not attempted", state, report.not_attempted());
    }
    Ok(())
}

pub fn print_report(report: &BatchReport) {
    println!();
    println!("{} {}", "Cluster:".bold(), report.cluster);
    for (id, outcome) in &report.results {
        match outcome {
            JobOutcome::Submitted { minicluster, outcome } => {
                println!("  {} job {} -> {} ({})", "✓".green(), id, minicluster, outcome);
            }
            JobOutcome::Failed { reason } => {
                println!("  {} job {}: {}", "✗".red(), id, reason);
            }
            JobOutcome::NotAttempted => {
                println!("  {} job {} not attempted", "-".yellow(), id);
            }
        }
    }
    println!();
    println!(
        "{} submitted, {} failed, {} not attempted",
        report.submitted(),
        report.failed(),
        report.not_attempted()
    );
}
