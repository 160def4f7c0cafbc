//! Preflight checks

use anyhow::{Result, bail};

use crate::config::settings::Settings;
use crate::utils::preflight::PreflightChecker;

pub async fn check(settings: &Settings) -> Result<()> {
    let mut checker = PreflightChecker::new();
    checker.run_all(settings).await;

    if !checker.print_report() {
        bail!("preflight checks failed");
    }
    Ok(())
}
