//! Fleet reconciler.
//!
//! The convergence loop for one fleet prefix:
//! - Snapshots cloud and registry state into per-worker records
//! - Tears down unhealthy workers every pass, regardless of desired count
//! - Creates or removes workers to close the gap to the desired count
//! - Hands dead workers' telemetry to the metrics pipeline
//! - Emits a `reconciliation` summary event and returns the signed delta
//!
//! Passes are mutually exclusive per reconciler; per-worker operations
//! within a pass run through a bounded pool with individual deadlines, so
//! one hung backend call never stalls the rest of the batch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use fleet_events::{EventSink, RunnerEvent};

use crate::cloud::{CloudBackend, CloudError, CreateInstance};
use crate::health::HealthState;
use crate::metrics::{MetricsPipeline, RunnerMetrics};
use crate::registry::{JobRegistry, RegistryError};
use crate::telemetry::TelemetryStore;
use crate::worker::{build_fleet_snapshot, runner_name, WorkerRecord};

/// Policy for removing workers outside normal health sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Never touch busy workers.
    #[default]
    IdleOnly,
    /// Remove idle workers now; tear down busy workers once their pre-job
    /// compliance check resolves (a `post-job` telemetry write appears),
    /// bounded by [`ReconcilerSettings::check_wait`].
    IdleThenWaitForCheck,
    /// Remove busy workers immediately.
    All,
    /// Like `All`, and registry failures during deregistration are
    /// downgraded to warnings: cloud deletion proceeds regardless.
    Force,
}

impl FlushMode {
    fn is_force(self) -> bool {
        matches!(self, FlushMode::Force)
    }

    fn removes_busy_now(self) -> bool {
        matches!(self, FlushMode::All | FlushMode::Force)
    }
}

/// Errors that fail a whole reconciliation pass.
///
/// Per-worker failures are logged and absorbed into the returned delta;
/// only fatal configuration, mutual exclusion, and snapshot failures
/// surface here.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reconciliation cannot proceed at all; retrying cannot help.
    #[error("configuration error: {0}")]
    Config(String),

    /// A pass for this fleet is already in flight.
    #[error("a reconciliation pass is already in flight")]
    PassInFlight,

    #[error("snapshot operation timed out: {operation}")]
    Timeout { operation: &'static str },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Static parameters of one managed fleet.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Naming prefix shared by every worker in this fleet.
    pub prefix: String,
    /// Unit element in generated names.
    pub unit: String,
    /// Registry scope runners register under.
    pub scope: String,
    /// Cloud flavor, also the fleet label on emitted events.
    pub flavor: String,
    /// Cloud boot image.
    pub image: String,
    /// Cloud network.
    pub network: String,
    /// Boot script template with `{name}` and `{registration_token}`
    /// placeholders.
    pub boot_script: String,
    /// Deadline for each individual cloud or registry call.
    pub op_timeout: Duration,
    /// Bound on concurrent per-worker operations.
    pub parallelism: usize,
    /// How long a deferred busy worker may wait for its compliance check
    /// before being torn down anyway.
    pub check_wait: Duration,
}

impl ReconcilerSettings {
    /// Reject settings reconciliation cannot run with.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        for (field, value) in [
            ("image", &self.image),
            ("flavor", &self.flavor),
            ("network", &self.network),
        ] {
            if value.is_empty() {
                return Err(ReconcileError::Config(format!(
                    "cloud {} is not configured",
                    field
                )));
            }
        }
        Ok(())
    }

    fn render_boot_script(&self, name: &str, registration_token: &str) -> String {
        self.boot_script
            .replace("{name}", name)
            .replace("{registration_token}", registration_token)
    }
}

/// The reconciliation engine for one fleet prefix.
pub struct FleetReconciler {
    cloud: Arc<dyn CloudBackend>,
    registry: Arc<dyn JobRegistry>,
    telemetry: Arc<dyn TelemetryStore>,
    pipeline: MetricsPipeline,
    sink: Arc<dyn EventSink>,
    settings: ReconcilerSettings,
    /// Serializes passes; a second concurrent call fails fast.
    pass_lock: Mutex<()>,
    /// Busy workers awaiting their compliance check, by name, with the
    /// instant after which they are torn down regardless.
    deferred: StdMutex<HashMap<String, Instant>>,
}

impl FleetReconciler {
    pub fn new(
        cloud: Arc<dyn CloudBackend>,
        registry: Arc<dyn JobRegistry>,
        telemetry: Arc<dyn TelemetryStore>,
        sink: Arc<dyn EventSink>,
        settings: ReconcilerSettings,
        telemetry_max_bytes: u64,
    ) -> Self {
        let pipeline = MetricsPipeline::new(
            Arc::clone(&telemetry),
            Arc::clone(&sink),
            telemetry_max_bytes,
        );
        Self {
            cloud,
            registry,
            telemetry,
            pipeline,
            sink,
            settings,
            pass_lock: Mutex::new(()),
            deferred: StdMutex::new(HashMap::new()),
        }
    }

    /// Run one reconciliation pass toward `desired_count` healthy workers.
    ///
    /// Returns the signed change in healthy-worker count actually observed,
    /// never an optimistic estimate.
    pub async fn reconcile(
        &self,
        desired_count: usize,
        flush_mode: FlushMode,
    ) -> Result<i64, ReconcileError> {
        self.settings.validate()?;
        let _pass = self
            .pass_lock
            .try_lock()
            .map_err(|_| ReconcileError::PassInFlight)?;
        let started = Instant::now();
        let force = flush_mode.is_force();

        let records = self.snapshot(force).await?;
        let initial_healthy = records.iter().filter(|r| r.health.is_healthy()).count();
        debug!(
            total = records.len(),
            healthy = initial_healthy,
            desired = desired_count,
            "Fleet snapshot taken"
        );

        // Unhealthy sweep, independent of the desired count.
        let unhealthy: Vec<WorkerRecord> = records
            .iter()
            .filter(|r| r.health.is_unhealthy())
            .cloned()
            .collect();
        let swept = self.teardown_batch(unhealthy, force).await;
        let unhealthy_removed = swept.len();

        let mut removed_names = swept;
        removed_names.extend(self.resolve_deferred(&records, force).await);

        // Recompute the surviving population. Pending workers count toward
        // capacity but are never removal candidates.
        let healthy: Vec<&WorkerRecord> = records
            .iter()
            .filter(|r| r.health.is_healthy() && !removed_names.contains(&r.name))
            .collect();
        let pending = records
            .iter()
            .filter(|r| r.health == HealthState::Pending)
            .count();

        let mut created_names: Vec<String> = Vec::new();
        let capacity = healthy.len() + pending;
        if capacity < desired_count {
            created_names = self.create_batch(desired_count - capacity).await;
        } else if healthy.len() > desired_count {
            let excess = healthy.len() - desired_count;
            let (victims, deferred_marks) = self.select_excess(&healthy, excess, flush_mode);
            self.mark_deferred(deferred_marks);
            removed_names.extend(self.teardown_batch(victims, force).await);
        }

        // Resume partial teardowns: telemetry whose worker no longer exists.
        let mut live: HashSet<String> = records
            .iter()
            .filter(|r| !removed_names.contains(&r.name))
            .map(|r| r.name.clone())
            .collect();
        live.extend(created_names.iter().cloned());
        self.sweep_orphaned_telemetry(&live).await;

        let idle_retained = records
            .iter()
            .filter(|r| r.health == HealthState::Idle && !removed_names.contains(&r.name))
            .count();
        let summary = RunnerEvent::Reconciliation {
            timestamp: Utc::now().timestamp(),
            flavor: self.settings.flavor.clone(),
            unhealthy_removed,
            idle_retained,
            duration_secs: started.elapsed().as_secs_f64(),
        };
        if let Err(err) = self.sink.emit(&summary) {
            warn!(error = %err, "Failed to emit reconciliation event");
        }

        let delta = match self.snapshot(force).await {
            Ok(final_records) => {
                let final_healthy =
                    final_records.iter().filter(|r| r.health.is_healthy()).count();
                final_healthy as i64 - initial_healthy as i64
            }
            Err(err) => {
                // Fall back to what this pass actually did.
                let removed_healthy = records
                    .iter()
                    .filter(|r| r.health.is_healthy() && removed_names.contains(&r.name))
                    .count();
                warn!(
                    error = %err,
                    "Final fleet listing failed, reporting per-operation delta"
                );
                created_names.len() as i64 - removed_healthy as i64
            }
        };

        info!(
            desired = desired_count,
            delta,
            unhealthy_removed,
            created = created_names.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reconciliation pass complete"
        );
        Ok(delta)
    }

    /// Forcibly remove workers outside normal scale-down.
    ///
    /// Removes every unhealthy and idle worker; busy workers are handled
    /// per `flush_mode`. Returns the number of workers actually removed.
    /// Idempotent for `IdleOnly`: a second call with no new jobs removes
    /// nothing.
    pub async fn flush_fleet(&self, flush_mode: FlushMode) -> Result<usize, ReconcileError> {
        self.settings.validate()?;
        let _pass = self
            .pass_lock
            .try_lock()
            .map_err(|_| ReconcileError::PassInFlight)?;
        let force = flush_mode.is_force();

        let records = self.snapshot(force).await?;

        let mut victims: Vec<WorkerRecord> = records
            .iter()
            .filter(|r| r.health.is_unhealthy() || r.health == HealthState::Idle)
            .cloned()
            .collect();
        let mut deferred_marks = Vec::new();
        for record in records.iter().filter(|r| r.health == HealthState::Busy) {
            if flush_mode.removes_busy_now() {
                victims.push(record.clone());
            } else if flush_mode == FlushMode::IdleThenWaitForCheck {
                deferred_marks.push(record.name.clone());
            }
        }
        self.mark_deferred(deferred_marks);

        let mut removed = self.teardown_batch(victims, force).await;
        removed.extend(self.resolve_deferred(&records, force).await);

        let live: HashSet<String> = records
            .iter()
            .filter(|r| !removed.contains(&r.name))
            .map(|r| r.name.clone())
            .collect();
        self.sweep_orphaned_telemetry(&live).await;

        info!(mode = ?flush_mode, removed = removed.len(), "Fleet flush complete");
        Ok(removed.len())
    }

    /// List both external systems and join them into worker records.
    ///
    /// The two listings are taken at slightly different instants; a worker
    /// changing state between them is resolved conservatively next pass.
    async fn snapshot(&self, force: bool) -> Result<Vec<WorkerRecord>, ReconcileError> {
        let instances = match timeout(
            self.settings.op_timeout,
            self.cloud.list_instances(&self.settings.prefix),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ReconcileError::Timeout {
                    operation: "cloud instance listing",
                })
            }
        };

        let registrations = match timeout(
            self.settings.op_timeout,
            self.registry.list_registered(&self.settings.scope),
        )
        .await
        {
            Ok(Ok(registrations)) => registrations,
            Ok(Err(err)) if force => {
                warn!(error = %err, "Registry listing failed, proceeding with cloud state only");
                Vec::new()
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) if force => {
                warn!("Registry listing timed out, proceeding with cloud state only");
                Vec::new()
            }
            Err(_) => {
                return Err(ReconcileError::Timeout {
                    operation: "registry listing",
                })
            }
        };

        let registrations = registrations
            .into_iter()
            .filter(|r| r.name.starts_with(&self.settings.prefix))
            .collect();

        Ok(build_fleet_snapshot(instances, registrations))
    }

    /// Create `count` workers through the bounded pool. One failure never
    /// aborts the batch; returns the names actually created.
    async fn create_batch(&self, count: usize) -> Vec<String> {
        info!(count, "Creating runners");
        stream::iter(0..count)
            .map(|_| self.create_runner())
            .buffer_unordered(self.settings.parallelism.max(1))
            .filter_map(|name| async move { name })
            .collect()
            .await
    }

    async fn create_runner(&self) -> Option<String> {
        let name = runner_name(&self.settings.prefix, &self.settings.unit);

        // Each worker gets a fresh single-use token embedded in its boot
        // script; a stale token fails this creation and is re-fetched on
        // the next pass, never retried here.
        let token = match timeout(
            self.settings.op_timeout,
            self.registry.get_registration_token(&self.settings.scope),
        )
        .await
        {
            Ok(Ok(token)) => token,
            Ok(Err(err)) => {
                warn!(runner = %name, error = %err, "Failed to fetch registration token");
                return None;
            }
            Err(_) => {
                warn!(runner = %name, "Registration token fetch timed out");
                return None;
            }
        };

        let request = CreateInstance {
            name: name.clone(),
            image: self.settings.image.clone(),
            flavor: self.settings.flavor.clone(),
            network: self.settings.network.clone(),
            boot_script: self.settings.render_boot_script(&name, &token.value),
        };

        match timeout(
            self.settings.op_timeout,
            self.cloud.create_instance(&request),
        )
        .await
        {
            Ok(Ok(instance)) => {
                info!(runner = %name, id = %instance.id, "Runner created");
                Some(name)
            }
            Ok(Err(err)) => {
                warn!(
                    runner = %name,
                    error = %err,
                    retryable = err.is_retryable(),
                    "Failed to create runner"
                );
                None
            }
            Err(_) => {
                warn!(runner = %name, "Runner creation timed out");
                None
            }
        }
    }

    /// Pick `excess` workers to remove, preferring idle over busy. Busy
    /// workers are only selected as `flush_mode` permits; under
    /// `IdleThenWaitForCheck` they are marked for deferred removal instead.
    fn select_excess(
        &self,
        healthy: &[&WorkerRecord],
        excess: usize,
        flush_mode: FlushMode,
    ) -> (Vec<WorkerRecord>, Vec<String>) {
        let mut victims: Vec<WorkerRecord> = healthy
            .iter()
            .filter(|r| r.health == HealthState::Idle)
            .take(excess)
            .map(|r| (*r).clone())
            .collect();

        let remaining = excess.saturating_sub(victims.len());
        let mut deferred = Vec::new();
        if remaining > 0 {
            let busy = healthy
                .iter()
                .filter(|r| r.health == HealthState::Busy)
                .take(remaining);
            if flush_mode.removes_busy_now() {
                victims.extend(busy.map(|r| (*r).clone()));
            } else if flush_mode == FlushMode::IdleThenWaitForCheck {
                deferred.extend(busy.map(|r| r.name.clone()));
            }
        }
        (victims, deferred)
    }

    fn mark_deferred(&self, names: Vec<String>) {
        if names.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.settings.check_wait;
        let mut deferred = self.deferred.lock().expect("deferred lock poisoned");
        for name in names {
            if !deferred.contains_key(&name) {
                info!(
                    runner = %name,
                    "Busy runner marked for removal once its compliance check resolves"
                );
                deferred.insert(name, deadline);
            }
        }
    }

    /// Tear down deferred busy workers whose compliance check has resolved
    /// (a post-job write appeared) or whose wait bound has expired.
    async fn resolve_deferred(
        &self,
        records: &[WorkerRecord],
        force: bool,
    ) -> HashSet<String> {
        let due: Vec<WorkerRecord> = {
            let mut deferred = self.deferred.lock().expect("deferred lock poisoned");
            if deferred.is_empty() {
                return HashSet::new();
            }
            let by_name: HashMap<&str, &WorkerRecord> =
                records.iter().map(|r| (r.name.as_str(), r)).collect();

            // Entries whose worker no longer exists have nothing left to remove.
            deferred.retain(|name, _| by_name.contains_key(name.as_str()));

            let now = Instant::now();
            deferred
                .iter()
                .filter_map(|(name, deadline)| {
                    let record = by_name.get(name.as_str())?;
                    let check_resolved = matches!(
                        self.telemetry.read(name),
                        Ok(Some(snapshot)) if snapshot.post_job.is_some()
                    );
                    if check_resolved {
                        info!(runner = %name, "Compliance check resolved, removing deferred runner");
                    } else if now >= *deadline {
                        warn!(runner = %name, "Compliance check wait expired, removing deferred runner");
                    } else {
                        return None;
                    }
                    Some((*record).clone())
                })
                .collect()
        };

        let removed = self.teardown_batch(due, force).await;
        if !removed.is_empty() {
            let mut deferred = self.deferred.lock().expect("deferred lock poisoned");
            for name in &removed {
                deferred.remove(name);
            }
        }
        removed
    }

    /// Tear down a batch through the bounded pool, collecting the names
    /// that were fully removed. Failures are logged per worker and retried
    /// next pass.
    async fn teardown_batch(&self, victims: Vec<WorkerRecord>, force: bool) -> HashSet<String> {
        if victims.is_empty() {
            return HashSet::new();
        }
        stream::iter(victims)
            .map(|record| self.teardown(record, force))
            .buffer_unordered(self.settings.parallelism.max(1))
            .filter_map(|name| async move { name })
            .collect()
            .await
    }

    /// Remove one worker: deregister, extract-or-quarantine telemetry,
    /// delete the cloud instance, delete the telemetry entry.
    ///
    /// Order matters: deregistration comes first so the registry never
    /// routes a job to a half-deleted worker, and telemetry is read before
    /// anything that could race a rebooting instance. Partial completion is
    /// resumed from store state next pass rather than tracked separately.
    async fn teardown(&self, record: WorkerRecord, force: bool) -> Option<String> {
        let name = record.name.clone();
        debug!(runner = %name, health = %record.health, "Tearing down runner");

        if let Some(registration) = &record.registration {
            if !self.deregister(&name, registration.id, force).await {
                return None;
            }
        }

        let telemetry_done = match self.pipeline.extract_runner(&name) {
            Ok(Some(metrics)) => {
                let queue_duration = self.lookup_queue_duration(&metrics).await;
                self.pipeline
                    .issue_events(&metrics, &self.settings.flavor, queue_duration);
                true
            }
            // Missing entry, or quarantined by the pipeline.
            Ok(None) => true,
            Err(err) => {
                warn!(
                    runner = %name,
                    error = %err,
                    "Telemetry extraction failed, keeping entry for next pass"
                );
                false
            }
        };

        if let Some(id) = record.cloud_id.clone() {
            // Detached task: an in-flight pass cancellation must never
            // abandon an issued deletion.
            let cloud = Arc::clone(&self.cloud);
            let delete_id = id.clone();
            let handle =
                tokio::spawn(async move { cloud.delete_instance(&delete_id).await });
            match timeout(self.settings.op_timeout, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    warn!(runner = %name, id = %id, error = %err, "Failed to delete cloud instance");
                    return None;
                }
                Ok(Err(err)) => {
                    warn!(runner = %name, id = %id, error = %err, "Cloud deletion task failed");
                    return None;
                }
                Err(_) => {
                    warn!(runner = %name, id = %id, "Cloud instance deletion timed out");
                    return None;
                }
            }
        }

        if !telemetry_done {
            return None;
        }
        if let Err(err) = self.telemetry.delete(&name) {
            warn!(runner = %name, error = %err, "Failed to delete telemetry entry");
            return None;
        }

        debug!(runner = %name, "Runner torn down");
        Some(name)
    }

    /// Consume a fresh removal token to delete the registration. Under
    /// `force`, registry failures are downgraded to warnings and teardown
    /// proceeds to cloud deletion.
    async fn deregister(&self, name: &str, worker_id: u64, force: bool) -> bool {
        let token = match timeout(
            self.settings.op_timeout,
            self.registry.get_removal_token(&self.settings.scope),
        )
        .await
        {
            Ok(Ok(token)) => token,
            Ok(Err(err)) => {
                if force {
                    warn!(runner = %name, error = %err, "Removal token fetch failed, forcing teardown");
                    return true;
                }
                warn!(runner = %name, error = %err, "Failed to fetch removal token, deferring teardown");
                return false;
            }
            Err(_) => {
                if force {
                    warn!(runner = %name, "Removal token fetch timed out, forcing teardown");
                    return true;
                }
                warn!(runner = %name, "Removal token fetch timed out, deferring teardown");
                return false;
            }
        };

        match timeout(
            self.settings.op_timeout,
            self.registry
                .delete_registration(&self.settings.scope, worker_id, &token),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                if force {
                    warn!(
                        runner = %name,
                        error = %err,
                        credential = err.is_credential(),
                        "Deregistration failed, forcing teardown"
                    );
                    true
                } else {
                    warn!(runner = %name, error = %err, "Failed to deregister runner, deferring teardown");
                    false
                }
            }
            Err(_) => {
                if force {
                    warn!(runner = %name, "Deregistration timed out, forcing teardown");
                    true
                } else {
                    warn!(runner = %name, "Deregistration timed out, deferring teardown");
                    false
                }
            }
        }
    }

    /// Emit events for telemetry whose worker is gone, then drop the
    /// entries. `live` names are skipped outright; their telemetry may
    /// still be mid-write.
    async fn sweep_orphaned_telemetry(&self, live: &HashSet<String>) {
        for metrics in self.pipeline.extract(live) {
            let queue_duration = self.lookup_queue_duration(&metrics).await;
            self.pipeline
                .issue_events(&metrics, &self.settings.flavor, queue_duration);
            if let Err(err) = self.telemetry.delete(&metrics.runner) {
                warn!(runner = %metrics.runner, error = %err, "Failed to delete telemetry entry");
            }
        }
    }

    /// Best-effort queue-duration lookup; omitted, not defaulted, on failure.
    async fn lookup_queue_duration(&self, metrics: &RunnerMetrics) -> Option<f64> {
        let pre = metrics.pre_job.as_ref()?;
        match timeout(
            self.settings.op_timeout,
            self.registry
                .job_queue_duration(&self.settings.scope, pre.run_id),
        )
        .await
        {
            Ok(Ok(duration)) => duration,
            Ok(Err(err)) => {
                debug!(
                    runner = %metrics.runner,
                    run_id = pre.run_id,
                    error = %err,
                    "Queue duration lookup failed, omitting"
                );
                None
            }
            Err(_) => {
                debug!(
                    runner = %metrics.runner,
                    run_id = pre.run_id,
                    "Queue duration lookup timed out, omitting"
                );
                None
            }
        }
    }
}
