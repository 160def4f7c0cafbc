//! Process-wide dry-run switch. Cluster and Kubernetes mutations print what
//! they would do instead of doing it.

use colored::Colorize;
use std::sync::atomic::{AtomicBool, Ordering};

static DRY_RUN: AtomicBool = AtomicBool::new(false);

/// Enable or disable dry-run mode for this process
pub fn set_dry_run(enabled: bool) {
    DRY_RUN.store(enabled, Ordering::SeqCst);
}

pub fn is_dry_run() -> bool {
    DRY_RUN.load(Ordering::SeqCst)
}

pub fn log_action(action: &str) {
    if !is_dry_run() {
        return;
    }
    tracing::debug!(action, "Skipped by dry run");
    println!("  {} would {}", "dry-run:".cyan().bold(), action);
}
