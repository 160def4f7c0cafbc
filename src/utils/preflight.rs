//! Checks run by `fluxburst-gke check` before any cloud resources are touched

use colored::Colorize;

use crate::config::params::{BurstParameters, CREDENTIALS_ENV};
use crate::config::settings::Settings;
use crate::install::credentials;
use crate::install::operator::{ManifestSource, OperatorInstaller};
use crate::utils::prereqs::{self, BURST_TOOLS, Requirement};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pass,
    Warn,
    Fail,
}

/// One line of the preflight report
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub area: &'static str,
    pub status: Status,
    pub detail: String,
}

impl CheckResult {
    fn new(area: &'static str, status: Status, detail: impl Into<String>) -> Self {
        Self {
            area,
            status,
            detail: detail.into(),
        }
    }

    fn print(&self) {
        let mark = match self.status {
            Status::Pass => "✓".green(),
            Status::Warn => "⚠".yellow(),
            Status::Fail => "✗".red(),
        };
        println!("  {} {:<12} {}", mark, self.area.bold(), self.detail);
    }
}

pub struct PreflightChecker {
    results: Vec<CheckResult>,
    credentials_env: String,
}

impl PreflightChecker {
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
            credentials_env: CREDENTIALS_ENV.to_string(),
        }
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    fn count(&self, status: Status) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    fn record(&mut self, area: &'static str, status: Status, detail: impl Into<String>) {
        self.results.push(CheckResult::new(area, status, detail));
    }

    /// Run every check. Checks that need validated parameters are skipped
    /// when the configuration itself is invalid.
    pub async fn run_all(&mut self, settings: &Settings) {
        crate::log_info!("Running preflight checks");

        self.check_credentials_env();
        self.check_tools();

        if let Err(e) = settings.retry.validate() {
            self.record("config", Status::Fail, e.to_string());
        }

        let params = match BurstParameters::from_settings(&settings.burst) {
            Ok(params) => {
                self.record(
                    "config",
                    Status::Pass,
                    format!("project {}, cluster {}", params.project, params.cluster_name),
                );
                params
            }
            Err(e) => {
                self.record("config", Status::Fail, e.to_string());
                return;
            }
        };

        self.check_munge_key(&params);
        self.check_manifest(&params.operator_manifest).await;
    }

    /// Print the report. Returns false if any check failed.
    pub fn print_report(&self) -> bool {
        println!();
        for result in &self.results {
            result.print();
        }
        println!();

        let failed = self.count(Status::Fail);
        let warned = self.count(Status::Warn);
        match (failed, warned) {
            (0, 0) => println!("{}", "Ready to burst".green()),
            (0, w) => println!("{} warning(s); bursting may still work", w),
            (f, w) => println!("{} {} failed, {} warning(s)", "Not ready:".red(), f, w),
        }
        failed == 0
    }

    fn check_credentials_env(&mut self) {
        let var = self.credentials_env.clone();
        if std::env::var_os(&var).is_some_and(|v| !v.is_empty()) {
            self.record("credentials", Status::Pass, format!("{} is set", var));
        } else {
            self.record(
                "credentials",
                Status::Fail,
                format!("{} is not set; no job will be admitted for bursting", var),
            );
        }
    }

    fn check_tools(&mut self) {
        for check in prereqs::check_tools(&BURST_TOOLS) {
            match (check.location, check.tool.requirement) {
                (Ok(path), _) => self.record(
                    "tools",
                    Status::Pass,
                    format!("{} at {}", check.tool.name, path.display()),
                ),
                (Err(e), Requirement::Required) => self.record("tools", Status::Fail, e.to_string()),
                (Err(e), Requirement::Recommended) => {
                    self.record("tools", Status::Warn, e.to_string())
                }
            }
        }
    }

    fn check_munge_key(&mut self, params: &BurstParameters) {
        let Some(path) = &params.munge_key else {
            self.record(
                "munge key",
                Status::Warn,
                "burst.munge_key is not set; bursted brokers cannot authenticate to the lead broker",
            );
            return;
        };

        match credentials::materialize(path, &params.munge_secret_name, &params.namespace) {
            Ok(_) => self.record("munge key", Status::Pass, format!("{} is readable", path.display())),
            Err(e) => self.record("munge key", Status::Fail, e.to_string()),
        }
    }

    async fn check_manifest(&mut self, source: &ManifestSource) {
        match OperatorInstaller::new().resolve(source).await {
            Ok(_) => self.record("operator", Status::Pass, format!("manifest available: {}", source)),
            Err(e) => self.record("operator", Status::Fail, e.to_string()),
        }
    }
}

impl Default for PreflightChecker {
    fn default() -> Self {
        Self::new()
    }
}
