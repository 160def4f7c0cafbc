//! Admission of pending jobs into the next burst

use std::collections::BTreeMap;
use std::fmt;

use crate::burst::job::{Job, JobId};
use crate::config::params::CREDENTIALS_ENV;
use crate::config::settings::SchedulerSettings;

/// Jobs waiting for the next run cycle, keyed by id
#[derive(Debug, Default)]
pub struct PendingBatch {
    jobs: BTreeMap<JobId, Job>,
}

impl PendingBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a job with the same id is already queued
    pub fn insert(&mut self, job: Job) -> bool {
        if self.jobs.contains_key(&job.id) {
            return false;
        }
        self.jobs.insert(job.id, job);
        true
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Empty the batch, returning its jobs in id order
    pub fn drain(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.jobs).into_values().collect()
    }

    /// Put jobs back after an interrupted cycle
    pub fn restore(&mut self, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            self.insert(job);
        }
    }
}

/// Decides whether a job is a candidate for bursting
pub trait AdmissionPolicy: Send + Sync + fmt::Debug {
    fn accepts(&self, job: &Job) -> bool;
}

#[derive(Debug, Default)]
pub struct AdmitAll;

impl AdmissionPolicy for AdmitAll {
    fn accepts(&self, _job: &Job) -> bool {
        true
    }
}

/// Rejects jobs asking for more nodes than a burst cluster may have
#[derive(Debug)]
pub struct MaxNodes(pub u32);

impl AdmissionPolicy for MaxNodes {
    fn accepts(&self, job: &Job) -> bool {
        job.nodes <= self.0
    }
}

/// Admits only jobs that carry the burstable marker
#[derive(Debug)]
pub struct BurstableOnly;

impl AdmissionPolicy for BurstableOnly {
    fn accepts(&self, job: &Job) -> bool {
        job.burstable
    }
}

/// Every policy has to accept
#[derive(Debug)]
pub struct AllOf(pub Vec<Box<dyn AdmissionPolicy>>);

impl AdmissionPolicy for AllOf {
    fn accepts(&self, job: &Job) -> bool {
        self.0.iter().all(|policy| policy.accepts(job))
    }
}

#[derive(Debug)]
pub struct BurstScheduler {
    policy: Box<dyn AdmissionPolicy>,
    credentials_env: String,
}

impl Default for BurstScheduler {
    fn default() -> Self {
        Self::new(Box::new(AdmitAll))
    }
}

impl BurstScheduler {
    pub fn new(policy: Box<dyn AdmissionPolicy>) -> Self {
        Self {
            policy,
            credentials_env: CREDENTIALS_ENV.to_string(),
        }
    }

    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        let mut policies: Vec<Box<dyn AdmissionPolicy>> = Vec::new();
        if settings.require_burstable {
            policies.push(Box::new(BurstableOnly));
        }
        if let Some(max) = settings.max_nodes {
            policies.push(Box::new(MaxNodes(max)));
        }

        match policies.len() {
            0 => Self::default(),
            1 => Self::new(policies.remove(0)),
            _ => Self::new(Box::new(AllOf(policies))),
        }
    }

    /// Read credentials presence from a different variable
    pub fn with_credentials_env(mut self, var: impl Into<String>) -> Self {
        self.credentials_env = var.into();
        self
    }

    pub fn credentials_available(&self) -> bool {
        std::env::var_os(&self.credentials_env).is_some_and(|v| !v.is_empty())
    }

    /// Queue `job` for bursting if it qualifies.
    ///
    /// Without cloud credentials nothing is admitted. A job that is already
    /// queued is reported as admitted and not queued twice.
    pub fn admit(&self, batch: &mut PendingBatch, job: Job) -> bool {
        if !self.credentials_available() {
            tracing::warn!(
                job = %job.id,
                env = %self.credentials_env,
                "Cloud credentials not set; not bursting"
            );
            return false;
        }

        if batch.contains(job.id) {
            tracing::debug!(job = %job.id, "Job already pending");
            return true;
        }

        if !self.policy.accepts(&job) {
            tracing::info!(job = %job.id, nodes = job.nodes, policy = ?self.policy, "Job rejected by admission policy");
            return false;
        }

        tracing::info!(job = %job.id, nodes = job.nodes, "Job admitted for bursting");
        batch.insert(job)
    }
}
