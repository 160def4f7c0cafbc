//! The bursting control loop.
//!
//! One call to [`BurstRunner::run`] takes the pending batch through
//! `Idle -> Provisioning -> Installing -> Submitting -> Settled` and back to
//! `Idle`. Every step is safe to repeat: an existing cluster, operator,
//! namespace, secret or MiniCluster counts as success.
//!
//! The pending batch and the cluster registry share one lock, held for the
//! whole cycle, so concurrent triggers run one after another.

use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::burst::job::{Job, JobId};
use crate::burst::registry::{ClusterRegistry, ProvisionState, RemoteCluster};
use crate::burst::scheduler::{BurstScheduler, PendingBatch};
use crate::config::minicluster;
use crate::config::params::BurstParameters;
use crate::config::settings::Settings;
use crate::install::credentials;
use crate::install::operator::OperatorInstaller;
use crate::k8s::control_plane::{ApplyOutcome, ControlPlane};
use crate::k8s::gke::{ClusterHandle, ClusterRef, ClusterSpec};
use crate::utils::errors::{BurstError, Result};
use crate::utils::retry::{RetryConfig, retry_with_backoff};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Provisioning,
    Installing,
    Submitting,
    Settled,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Provisioning => "provisioning",
            RunState::Installing => "installing",
            RunState::Submitting => "submitting",
            RunState::Settled => "settled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Submitted {
        minicluster: String,
        outcome: ApplyOutcome,
    },
    Failed {
        reason: String,
    },
    /// The cycle was cancelled before this job was tried; it is pending again
    NotAttempted,
}

/// Result of one run cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub cluster: String,
    pub results: BTreeMap<JobId, JobOutcome>,
    /// Set when cancellation stopped the cycle early
    pub aborted_at: Option<RunState>,
}

impl BatchReport {
    fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            results: BTreeMap::new(),
            aborted_at: None,
        }
    }

    fn all(cluster: &str, jobs: &[Job], outcome: JobOutcome) -> Self {
        let mut report = Self::new(cluster);
        for job in jobs {
            report.results.insert(job.id, outcome.clone());
        }
        report
    }

    pub fn submitted(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Submitted { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Failed { .. }))
    }

    pub fn not_attempted(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::NotAttempted))
    }

    fn count(&self, pred: impl Fn(&JobOutcome) -> bool) -> usize {
        self.results.values().filter(|o| pred(*o)).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.aborted_at.is_none()
    }
}

/// Number of nodes a cluster needs to host every job in the batch.
///
/// Jobs share the cluster one after another, so the largest job decides.
pub fn required_capacity(jobs: &[Job]) -> u32 {
    jobs.iter().map(|j| j.nodes).max().unwrap_or(0)
}

/// Knobs for the control loop, from the `[runner]` and `[retry]` sections
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub max_concurrent_submissions: usize,
    pub persist_specs: bool,
    pub retry: RetryConfig,
}

impl RunnerOptions {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.retry.validate()?;
        Ok(Self {
            max_concurrent_submissions: settings.runner.max_concurrent_submissions.max(1),
            persist_specs: settings.runner.persist_specs,
            retry: settings.retry.clone(),
        })
    }
}

/// Provider clusters adopted into, and stale entries dropped from, the registry
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub adopted: Vec<String>,
    pub dropped: Vec<String>,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Default)]
struct RunnerState {
    pending: PendingBatch,
    registry: ClusterRegistry,
}

/// Cycle inputs checked before anything remote is touched
struct Prepared {
    secret: Option<Secret>,
}

pub struct BurstRunner {
    params: Arc<BurstParameters>,
    scheduler: BurstScheduler,
    handle: Arc<dyn ClusterHandle>,
    installer: OperatorInstaller,
    options: RunnerOptions,
    state: Mutex<RunnerState>,
}

impl BurstRunner {
    pub fn new(
        params: Arc<BurstParameters>,
        scheduler: BurstScheduler,
        handle: Arc<dyn ClusterHandle>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            params,
            scheduler,
            handle,
            installer: OperatorInstaller::new(),
            options,
            state: Mutex::new(RunnerState::default()),
        }
    }

    pub async fn admit(&self, job: Job) -> bool {
        let mut state = self.state.lock().await;
        self.scheduler.admit(&mut state.pending, job)
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn registry(&self) -> Vec<RemoteCluster> {
        self.state.lock().await.registry.snapshot()
    }

    pub async fn run(&self) -> Result<BatchReport> {
        self.run_with_cancel(CancellationToken::new()).await
    }

    /// Run one cycle.
    ///
    /// Cancelling `cancel` interrupts provisioning or installation at once,
    /// including any backoff sleep; jobs not yet submitted go back to the
    /// pending batch. `Err` is returned only for problems found before any remote call
    /// (unreadable munge key, missing operator manifest); the batch is left
    /// untouched. Remote failures are reported per job in the `BatchReport`.
    pub async fn run_with_cancel(&self, cancel: CancellationToken) -> Result<BatchReport> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let cluster_name = self.params.cluster_name.clone();

        if state.pending.is_empty() {
            tracing::debug!(state = %RunState::Idle, "No pending jobs");
            return Ok(BatchReport::new(&cluster_name));
        }

        let prepared = self.prepare().await?;
        let jobs = state.pending.drain();

        transition(RunState::Provisioning, &cluster_name);
        let capacity = required_capacity(&jobs);
        let provisioned = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.provision(&mut state.registry, capacity) => Some(result),
        };
        let cluster = match provisioned {
            Some(Ok(cluster)) => cluster,
            Some(Err(e)) => return Ok(abort(&cluster_name, &jobs, RunState::Provisioning, &e)),
            None => {
                // The provider may still finish the create; reconcile adopts it later
                if state.registry.state(&cluster_name) == ProvisionState::Provisioning {
                    state.registry.remove(&cluster_name);
                }
                return Ok(interrupt(&mut state.pending, &cluster_name, jobs, RunState::Provisioning));
            }
        };

        transition(RunState::Installing, &cluster_name);
        let installed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.install(&cluster, &prepared) => Some(result),
        };
        let control_plane = match installed {
            Some(Ok(control_plane)) => control_plane,
            Some(Err(e)) => {
                if matches!(e, BurstError::ClusterNotFound(_)) {
                    state.registry.remove(&cluster_name);
                }
                return Ok(abort(&cluster_name, &jobs, RunState::Installing, &e));
            }
            None => {
                return Ok(interrupt(&mut state.pending, &cluster_name, jobs, RunState::Installing));
            }
        };

        transition(RunState::Submitting, &cluster_name);

        let outcomes: Vec<(JobId, JobOutcome)> = stream::iter(jobs.iter())
            .map(|job| self.submit(job, control_plane.as_ref(), &cancel))
            .buffer_unordered(self.options.max_concurrent_submissions)
            .collect()
            .await;

        let mut report = BatchReport::new(&cluster_name);
        report.results.extend(outcomes);

        let not_attempted: Vec<Job> = jobs
            .into_iter()
            .filter(|job| report.results.get(&job.id) == Some(&JobOutcome::NotAttempted))
            .collect();
        if !not_attempted.is_empty() {
            tracing::warn!(
                cluster = %cluster_name,
                jobs = not_attempted.len(),
                "Cycle cancelled during submission; returning jobs to the pending batch"
            );
            state.pending.restore(not_attempted);
            report.aborted_at = Some(RunState::Submitting);
        }

        transition(RunState::Settled, &cluster_name);
        tracing::info!(
            cluster = %cluster_name,
            submitted = report.submitted(),
            failed = report.failed(),
            not_attempted = report.not_attempted(),
            "Burst cycle settled"
        );
        transition(RunState::Idle, &cluster_name);
        Ok(report)
    }

    /// Local checks that must pass before the provider is contacted
    async fn prepare(&self) -> Result<Prepared> {
        let secret = match &self.params.munge_key {
            Some(path) => Some(credentials::materialize(
                path,
                &self.params.munge_secret_name,
                &self.params.namespace,
            )?),
            None => None,
        };

        self.installer.resolve(&self.params.operator_manifest).await?;
        Ok(Prepared { secret })
    }

    async fn provision(&self, registry: &mut ClusterRegistry, capacity: u32) -> Result<ClusterRef> {
        let name = &self.params.cluster_name;

        let cached = registry
            .get(name)
            .filter(|c| c.state == ProvisionState::Ready)
            .map(|c| (c.to_ref(), c.node_count));

        if let Some((cached, cached_nodes)) = cached {
            match self.handle.describe(name).await? {
                Some(live) => {
                    let nodes = live.node_count.unwrap_or(cached_nodes);
                    if nodes < capacity {
                        tracing::warn!(
                            cluster = %name,
                            nodes,
                            required = capacity,
                            "Reusing a cluster smaller than the largest pending job"
                        );
                    }
                    return Ok(ClusterRef {
                        node_count: Some(nodes),
                        ..cached
                    });
                }
                None => {
                    tracing::warn!(cluster = %name, "Registered cluster is gone at the provider; creating it again");
                    registry.remove(name);
                }
            }
        }

        let spec = ClusterSpec {
            name: name.clone(),
            node_count: capacity,
            machine_type: self.params.machine_type.clone(),
        };

        registry.upsert(RemoteCluster {
            name: name.clone(),
            state: ProvisionState::Provisioning,
            node_count: capacity,
            machine_type: spec.machine_type.clone(),
        });

        let created = retry_with_backoff(
            &self.options.retry,
            "create cluster",
            BurstError::is_retryable,
            || self.handle.create(&spec),
        )
        .await;

        let cluster = match created {
            Ok(cluster) => cluster,
            Err(e) if e.is_already_exists() => {
                tracing::info!(cluster = %name, "Cluster already exists; reusing it");
                match self.handle.describe(name).await {
                    Ok(Some(cluster)) => cluster,
                    _ => ClusterRef::from(&spec),
                }
            }
            Err(e) => {
                registry.remove(name);
                tracing::error!(cluster = %name, error = %e, "Provisioning failed");
                return Err(e);
            }
        };

        registry.upsert(RemoteCluster {
            name: name.clone(),
            state: ProvisionState::Ready,
            node_count: cluster.node_count.unwrap_or(capacity),
            machine_type: cluster
                .machine_type
                .clone()
                .unwrap_or_else(|| spec.machine_type.clone()),
        });
        Ok(cluster)
    }

    async fn install(
        &self,
        cluster: &ClusterRef,
        prepared: &Prepared,
    ) -> Result<Arc<dyn ControlPlane>> {
        let control_plane = self.handle.control_plane(cluster).await?;

        let outcome = self
            .installer
            .ensure_installed(&self.params.operator_manifest, control_plane.as_ref())
            .await?;
        tracing::debug!(cluster = %cluster.name, outcome = %outcome, "Operator ready");

        let outcome = control_plane.ensure_namespace(&self.params.namespace).await?;
        tracing::debug!(namespace = %self.params.namespace, outcome = %outcome, "Namespace ready");

        if let Some(secret) = &prepared.secret {
            let outcome = control_plane.ensure_secret(secret).await?;
            tracing::info!(
                secret = %self.params.munge_secret_name,
                namespace = %self.params.namespace,
                outcome = %outcome,
                "Munge key secret ready"
            );
        }

        Ok(control_plane)
    }

    async fn submit(
        &self,
        job: &Job,
        control_plane: &dyn ControlPlane,
        cancel: &CancellationToken,
    ) -> (JobId, JobOutcome) {
        if cancel.is_cancelled() {
            return (job.id, JobOutcome::NotAttempted);
        }

        let spec = minicluster::build(job, &self.params, &self.params.lead);
        let name = minicluster::minicluster_name(&self.params, job);

        if self.options.persist_specs {
            match minicluster::write_spec_file(&spec) {
                Ok(path) => tracing::info!(job = %job.id, path = %path.display(), "Wrote MiniCluster spec"),
                Err(e) => return (job.id, failed(job, e)),
            }
        }

        let outcome = match control_plane.apply_minicluster(&spec).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_already_exists() => ApplyOutcome::AlreadyPresent,
            Err(e) => return (job.id, failed(job, e)),
        };

        tracing::info!(job = %job.id, minicluster = %name, outcome = %outcome, "Job submitted");
        (
            job.id,
            JobOutcome::Submitted {
                minicluster: name,
                outcome,
            },
        )
    }

    /// Bring the registry in line with the provider after a restart.
    ///
    /// The configured cluster is adopted when the provider has it; entries
    /// the provider no longer knows are dropped.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut state = self.state.lock().await;
        let remote = self.handle.list().await?;
        let mut report = ReconcileReport::default();

        for name in state.registry.names() {
            if !remote.iter().any(|c| c.name == name) {
                tracing::warn!(cluster = %name, "Registered cluster no longer exists at the provider");
                state.registry.remove(&name);
                report.dropped.push(name);
            }
        }

        let wanted = &self.params.cluster_name;
        if let Some(cluster) = remote.iter().find(|c| &c.name == wanted) {
            if state.registry.get(wanted).is_none() {
                state.registry.upsert(RemoteCluster {
                    name: cluster.name.clone(),
                    state: ProvisionState::Ready,
                    node_count: cluster.node_count.unwrap_or(0),
                    machine_type: cluster
                        .machine_type
                        .clone()
                        .unwrap_or_else(|| self.params.machine_type.clone()),
                });
                tracing::info!(cluster = %wanted, "Adopted existing cluster");
                report.adopted.push(wanted.clone());
            }
        }

        Ok(report)
    }

    /// Delete every registered cluster. Failures are collected, not fatal,
    /// and leave the cluster registered as ready.
    pub async fn cleanup(&self) -> CleanupReport {
        let mut state = self.state.lock().await;
        let mut report = CleanupReport::default();

        for cluster in state.registry.snapshot() {
            state.registry.set_state(&cluster.name, ProvisionState::Deleting);
            match self.handle.delete(&cluster.to_ref()).await {
                Ok(()) => {
                    state.registry.remove(&cluster.name);
                    tracing::info!(cluster = %cluster.name, "Cluster deleted");
                    report.deleted.push(cluster.name);
                }
                Err(e) => {
                    state.registry.set_state(&cluster.name, ProvisionState::Ready);
                    tracing::error!(cluster = %cluster.name, error = %e, "Cluster deletion failed");
                    report.failed.push((cluster.name, e.to_string()));
                }
            }
        }

        report
    }
}

fn transition(to: RunState, cluster: &str) {
    tracing::info!(state = %to, cluster = %cluster, "Burst state");
}

fn failed(job: &Job, err: BurstError) -> JobOutcome {
    let err = BurstError::Submission {
        job: job.id.to_string(),
        reason: err.to_string(),
    };
    tracing::error!(job = %job.id, error = %err, "Job submission failed");
    JobOutcome::Failed {
        reason: err.to_string(),
    }
}

fn abort(cluster: &str, jobs: &[Job], at: RunState, err: &BurstError) -> BatchReport {
    tracing::error!(cluster = %cluster, state = %at, error = %err, "Burst cycle aborted");
    BatchReport::all(
        cluster,
        jobs,
        JobOutcome::Failed {
            reason: err.to_string(),
        },
    )
}

fn interrupt(pending: &mut PendingBatch, cluster: &str, jobs: Vec<Job>, at: RunState) -> BatchReport {
    tracing::warn!(cluster = %cluster, state = %at, "Burst cycle cancelled");
    let mut report = BatchReport::all(cluster, &jobs, JobOutcome::NotAttempted);
    report.aborted_at = Some(at);
    pending.restore(jobs);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::BurstSettings;
    use crate::testing::{FakeClusterHandle, FakeControlPlane};
    use crate::utils::errors::ErrorKind;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const MANIFEST: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: operator-system\n";

    struct Fixture {
        runner: BurstRunner,
        handle: Arc<FakeClusterHandle>,
        _manifest: NamedTempFile,
    }

    fn fixture(handle: FakeClusterHandle, customize: impl FnOnce(&mut BurstSettings)) -> Fixture {
        fixture_with_retry(handle, RetryConfig::fast(3), customize)
    }

    fn fixture_with_retry(
        handle: FakeClusterHandle,
        retry: RetryConfig,
        customize: impl FnOnce(&mut BurstSettings),
    ) -> Fixture {
        let mut manifest = NamedTempFile::new().unwrap();
        manifest.write_all(MANIFEST.as_bytes()).unwrap();

        let mut raw = BurstSettings {
            project: Some("hpc-burst".to_string()),
            lead_host: Some("10.0.0.12".to_string()),
            lead_port: Some(30093),
            lead_size: Some(4),
            lead_jobname: Some("flux-sample".to_string()),
            flux_operator_yaml: Some(manifest.path().display().to_string()),
            ..Default::default()
        };
        customize(&mut raw);

        let params = Arc::new(BurstParameters::from_settings(&raw).unwrap());
        let handle = Arc::new(handle);
        let options = RunnerOptions {
            max_concurrent_submissions: 1,
            persist_specs: false,
            retry,
        };
        let scheduler = BurstScheduler::default().with_credentials_env("PATH");
        let runner = BurstRunner::new(params, scheduler, handle.clone(), options);

        Fixture {
            runner,
            handle,
            _manifest: manifest,
        }
    }

    async fn admit_all(runner: &BurstRunner, jobs: &[(u64, u32)]) {
        for &(id, nodes) in jobs {
            assert!(runner.admit(Job::new(id, nodes, nodes, &["hostname"])).await);
        }
    }

    #[test]
    fn test_required_capacity_is_max() {
        let jobs = vec![
            Job::new(1, 4, 4, &["a"]),
            Job::new(2, 2, 2, &["b"]),
            Job::new(3, 8, 8, &["c"]),
        ];
        assert_eq!(required_capacity(&jobs), 8);
        assert_eq!(required_capacity(&[]), 0);
    }

    #[tokio::test]
    async fn test_run_provisions_for_largest_job() {
        let f = fixture(FakeClusterHandle::default(), |_| {});
        admit_all(&f.runner, &[(1, 4), (2, 2), (3, 8)]).await;

        let report = f.runner.run().await.unwrap();

        let creates = f.handle.creates();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].node_count, 8);
        assert_eq!(creates[0].name, "flux-cluster");

        assert_eq!(report.submitted(), 3);
        assert!(report.is_success());
        assert_eq!(
            f.handle.control_plane.submitted(),
            vec!["burst-0-1", "burst-0-2", "burst-0-3"]
        );
        assert!(f.handle.control_plane.namespaces().contains("flux-operator"));
        assert_eq!(f.runner.pending_len().await, 0);

        let registry = f.runner.registry().await;
        assert_eq!(registry.len(), 1);
        assert_eq!(registry[0].state, ProvisionState::Ready);
        assert_eq!(registry[0].node_count, 8);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let f = fixture(FakeClusterHandle::default(), |_| {});
        let report = f.runner.run().await.unwrap();
        assert!(report.results.is_empty());
        assert!(f.handle.creates().is_empty());
    }

    #[tokio::test]
    async fn test_one_failed_submission_does_not_affect_siblings() {
        let control_plane = FakeControlPlane::default().failing_minicluster("burst-0-2");
        let f = fixture(FakeClusterHandle::with_control_plane(control_plane), |_| {});
        admit_all(&f.runner, &[(1, 2), (2, 2), (3, 2)]).await;

        let report = f.runner.run().await.unwrap();

        assert_eq!(report.submitted(), 2);
        assert_eq!(report.failed(), 1);
        match &report.results[&JobId(2)] {
            JobOutcome::Failed { reason } => assert!(reason.contains("burst-0-2"), "{}", reason),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(report.results[&JobId(1)], JobOutcome::Submitted { .. }));
        assert!(matches!(report.results[&JobId(3)], JobOutcome::Submitted { .. }));
    }

    #[tokio::test]
    async fn test_permanent_provision_failure_fails_every_job() {
        let handle = FakeClusterHandle::default()
            .script(vec![BurstError::PermanentProvision("quota exceeded".to_string())]);
        let f = fixture(handle, |_| {});
        admit_all(&f.runner, &[(1, 2), (2, 4)]).await;

        let report = f.runner.run().await.unwrap();

        assert_eq!(f.handle.creates().len(), 1);
        assert_eq!(report.failed(), 2);
        for outcome in report.results.values() {
            match outcome {
                JobOutcome::Failed { reason } => assert!(reason.contains("quota exceeded")),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert!(f.handle.control_plane.submitted().is_empty());
        assert!(f.runner.registry().await.is_empty());
        assert_eq!(f.runner.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_transient_provision_failure_is_retried() {
        let handle = FakeClusterHandle::default().script(vec![
            BurstError::TransientProvision("503".to_string()),
            BurstError::TransientProvision("503".to_string()),
        ]);
        let f = fixture(handle, |_| {});
        admit_all(&f.runner, &[(1, 2)]).await;

        let report = f.runner.run().await.unwrap();

        assert_eq!(f.handle.creates().len(), 3);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_exhausted_retries_abort_batch() {
        let handle = FakeClusterHandle::default().script(vec![
            BurstError::TransientProvision("503".to_string()),
            BurstError::TransientProvision("503".to_string()),
            BurstError::TransientProvision("503".to_string()),
        ]);
        let f = fixture(handle, |_| {});
        admit_all(&f.runner, &[(1, 2)]).await;

        let report = f.runner.run().await.unwrap();
        assert_eq!(f.handle.creates().len(), 3);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test]
    async fn test_existing_cluster_counts_as_success() {
        let handle = FakeClusterHandle::default();
        handle.existing.lock().unwrap().insert("flux-cluster".to_string());
        let f = fixture(handle, |_| {});
        admit_all(&f.runner, &[(1, 2)]).await;

        let report = f.runner.run().await.unwrap();

        assert!(report.is_success());
        assert_eq!(f.runner.registry().await[0].state, ProvisionState::Ready);
    }

    #[tokio::test]
    async fn test_second_cycle_reuses_cluster_and_operator() {
        let f = fixture(FakeClusterHandle::default(), |_| {});

        admit_all(&f.runner, &[(1, 2)]).await;
        assert!(f.runner.run().await.unwrap().is_success());

        admit_all(&f.runner, &[(2, 2)]).await;
        assert!(f.runner.run().await.unwrap().is_success());

        // The second install reports a conflict, which counts as installed
        assert_eq!(f.handle.creates().len(), 1);
        assert_eq!(f.handle.control_plane.manifest_applies(), 2);
    }

    #[tokio::test]
    async fn test_cluster_deleted_out_of_band_is_recreated() {
        let f = fixture(FakeClusterHandle::default(), |_| {});
        admit_all(&f.runner, &[(1, 2)]).await;
        assert!(f.runner.run().await.unwrap().is_success());

        f.handle.existing.lock().unwrap().clear();
        admit_all(&f.runner, &[(2, 2)]).await;
        let report = f.runner.run().await.unwrap();

        assert!(report.is_success());
        assert_eq!(f.handle.describes(), 1);
        assert_eq!(f.handle.creates().len(), 2);
        assert!(f.handle.existing.lock().unwrap().contains("flux-cluster"));
        assert_eq!(f.runner.registry().await[0].state, ProvisionState::Ready);
    }

    #[tokio::test]
    async fn test_cluster_missing_at_install_drops_registry_entry() {
        // The provider claims the cluster exists but it is gone by the time
        // credentials are fetched
        let handle = FakeClusterHandle::default()
            .script(vec![BurstError::AlreadyExists("cluster flux-cluster".to_string())]);
        let f = fixture(handle, |_| {});
        admit_all(&f.runner, &[(1, 2)]).await;

        let report = f.runner.run().await.unwrap();

        match &report.results[&JobId(1)] {
            JobOutcome::Failed { reason } => assert!(reason.contains("not found"), "{}", reason),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(f.runner.registry().await.is_empty());

        // Nothing stale is left behind, so the next cycle creates it
        admit_all(&f.runner, &[(2, 2)]).await;
        assert!(f.runner.run().await.unwrap().is_success());
        assert_eq!(f.handle.creates().len(), 2);
    }

    #[tokio::test]
    async fn test_install_failure_fails_every_job() {
        let control_plane = FakeControlPlane::default().failing_install();
        let f = fixture(FakeClusterHandle::with_control_plane(control_plane), |_| {});
        admit_all(&f.runner, &[(1, 2), (2, 2)]).await;

        let report = f.runner.run().await.unwrap();
        assert_eq!(report.failed(), 2);
        assert!(f.handle.control_plane.submitted().is_empty());
        // The cluster itself is fine and stays registered
        assert_eq!(f.runner.registry().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_munge_key_stops_before_provisioning() {
        let f = fixture(FakeClusterHandle::default(), |raw| {
            raw.munge_key = Some(PathBuf::from("/nonexistent/munge.key"));
        });
        admit_all(&f.runner, &[(1, 2)]).await;

        let err = f.runner.run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(f.handle.creates().is_empty());
        assert_eq!(f.runner.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_munge_secret_created_on_cluster() {
        let mut key = NamedTempFile::new().unwrap();
        key.write_all(b"\x00\x01munge\xff").unwrap();
        let key_path = key.path().to_path_buf();

        let f = fixture(FakeClusterHandle::default(), |raw| raw.munge_key = Some(key_path));
        admit_all(&f.runner, &[(1, 2)]).await;
        assert!(f.runner.run().await.unwrap().is_success());

        let secret = f.handle.control_plane.secret("munge-key").unwrap();
        assert_eq!(
            secret.data.unwrap()[credentials::MUNGE_KEY_FIELD].0,
            b"\x00\x01munge\xff".to_vec()
        );
    }

    #[tokio::test]
    async fn test_cancel_before_run_returns_jobs_to_batch() {
        let f = fixture(FakeClusterHandle::default(), |_| {});
        admit_all(&f.runner, &[(1, 2), (2, 2)]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = f.runner.run_with_cancel(cancel).await.unwrap();

        assert_eq!(report.aborted_at, Some(RunState::Provisioning));
        assert_eq!(report.not_attempted(), 2);
        assert!(f.handle.creates().is_empty());
        assert_eq!(f.runner.pending_len().await, 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_cluster_creation() {
        let f = fixture(FakeClusterHandle::default().hanging_create(), |_| {});
        admit_all(&f.runner, &[(1, 2), (2, 4)]).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), f.runner.run_with_cancel(cancel))
            .await
            .expect("cancellation did not interrupt the create")
            .unwrap();

        assert_eq!(report.aborted_at, Some(RunState::Provisioning));
        assert_eq!(report.not_attempted(), 2);
        assert_eq!(f.handle.creates().len(), 1);
        assert!(f.runner.registry().await.is_empty());
        assert_eq!(f.runner.pending_len().await, 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff_sleep() {
        let handle = FakeClusterHandle::default()
            .script(vec![BurstError::TransientProvision("503".to_string())]);
        let slow = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        };
        let f = fixture_with_retry(handle, slow, |_| {});
        admit_all(&f.runner, &[(1, 2)]).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), f.runner.run_with_cancel(cancel))
            .await
            .expect("cancellation did not interrupt the backoff")
            .unwrap();

        assert_eq!(report.aborted_at, Some(RunState::Provisioning));
        assert_eq!(f.handle.creates().len(), 1);
        assert_eq!(f.runner.pending_len().await, 1);
    }

    #[test]
    fn test_options_reject_invalid_retry_settings() {
        let mut settings = Settings::default();
        settings.retry.backoff_multiplier = -2.0;
        let err = RunnerOptions::from_settings(&settings).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        settings.retry = RetryConfig::default();
        settings.runner.max_concurrent_submissions = 0;
        assert_eq!(
            RunnerOptions::from_settings(&settings).unwrap().max_concurrent_submissions,
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_during_submission() {
        let cancel = CancellationToken::new();
        let control_plane = FakeControlPlane::default().cancelling_after_submit(cancel.clone());
        let f = fixture(FakeClusterHandle::with_control_plane(control_plane), |_| {});
        admit_all(&f.runner, &[(1, 2), (2, 2), (3, 2)]).await;

        let report = f.runner.run_with_cancel(cancel).await.unwrap();

        assert_eq!(report.aborted_at, Some(RunState::Submitting));
        assert!(matches!(report.results[&JobId(1)], JobOutcome::Submitted { .. }));
        assert_eq!(report.results[&JobId(2)], JobOutcome::NotAttempted);
        assert_eq!(report.results[&JobId(3)], JobOutcome::NotAttempted);
        assert!(!report.is_success());
        assert_eq!(f.handle.control_plane.submitted(), vec!["burst-0-1"]);
        assert_eq!(f.runner.pending_len().await, 2);
    }

    #[tokio::test]
    async fn test_reconcile_adopts_and_drops() {
        let f = fixture(FakeClusterHandle::default(), |_| {});
        admit_all(&f.runner, &[(1, 2)]).await;
        f.runner.run().await.unwrap();

        // Deleted behind our back
        f.handle.existing.lock().unwrap().clear();
        let report = f.runner.reconcile().await.unwrap();
        assert_eq!(report.dropped, vec!["flux-cluster"]);
        assert!(f.runner.registry().await.is_empty());

        f.handle.existing.lock().unwrap().insert("flux-cluster".to_string());
        f.handle.existing.lock().unwrap().insert("unrelated".to_string());
        let report = f.runner.reconcile().await.unwrap();
        assert_eq!(report.adopted, vec!["flux-cluster"]);
        assert_eq!(f.runner.registry().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_registered_clusters() {
        let f = fixture(FakeClusterHandle::default(), |_| {});
        admit_all(&f.runner, &[(1, 2)]).await;
        f.runner.run().await.unwrap();

        let report = f.runner.cleanup().await;
        assert_eq!(report.deleted, vec!["flux-cluster"]);
        assert!(report.failed.is_empty());
        assert_eq!(f.handle.deletes(), vec!["flux-cluster"]);
        assert!(f.runner.registry().await.is_empty());
    }
}
