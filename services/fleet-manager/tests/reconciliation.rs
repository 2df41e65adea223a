//! Integration tests for the fleet reconciliation flow.
//!
//! Uses MockCloud linked to MockRegistry so a successful create registers
//! the runner immediately (zero-latency boot), which makes convergence
//! observable within a single pass.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_events::{EventKind, EventSink, MemorySink, RunnerEvent};
use fleet_manager::cloud::{CloudBackend, InstanceStatus, MockCloud};
use fleet_manager::reconciler::{FleetReconciler, FlushMode, ReconcilerSettings};
use fleet_manager::registry::{JobRegistry, MockRegistry};
use fleet_manager::telemetry::{
    FsTelemetryStore, TelemetryStore, INSTALLED_FILE, POST_JOB_FILE, PRE_JOB_FILE,
};

const PREFIX: &str = "ci-large";

struct Harness {
    _tmp: tempfile::TempDir,
    telemetry_root: PathBuf,
    cloud: Arc<MockCloud>,
    registry: Arc<MockRegistry>,
    sink: Arc<MemorySink>,
    reconciler: FleetReconciler,
}

impl Harness {
    fn new() -> Self {
        Self::with_check_wait(Duration::from_secs(900))
    }

    fn with_check_wait(check_wait: Duration) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let telemetry_root = tmp.path().join("telemetry");

        let registry = Arc::new(MockRegistry::new());
        let cloud = Arc::new(MockCloud::with_registry(Arc::clone(&registry)));
        let telemetry = Arc::new(
            FsTelemetryStore::open(&telemetry_root, tmp.path().join("quarantine")).unwrap(),
        );
        let sink = Arc::new(MemorySink::new());

        let settings = ReconcilerSettings {
            prefix: PREFIX.to_string(),
            unit: "0".to_string(),
            scope: "acme".to_string(),
            flavor: "large".to_string(),
            image: "runner-image".to_string(),
            network: "net-1".to_string(),
            boot_script: "#!/bin/sh\nsetup --name {name} --token {registration_token}\n"
                .to_string(),
            op_timeout: Duration::from_secs(5),
            parallelism: 4,
            check_wait,
        };

        let reconciler = FleetReconciler::new(
            Arc::clone(&cloud) as Arc<dyn CloudBackend>,
            Arc::clone(&registry) as Arc<dyn JobRegistry>,
            Arc::clone(&telemetry) as Arc<dyn TelemetryStore>,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            settings,
            1024 * 1024,
        );

        Self {
            _tmp: tmp,
            telemetry_root,
            cloud,
            registry,
            sink,
            reconciler,
        }
    }

    /// Seed a worker present and active on both sides.
    fn seed_healthy(&self, name: &str, busy: bool) {
        self.cloud.seed(name, InstanceStatus::Active);
        self.registry.register(name, true, busy);
    }

    fn write_telemetry(&self, name: &str, file: &str, contents: &[u8]) {
        let dir = self.telemetry_root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file), contents).unwrap();
    }
}

fn pre_job_json() -> &'static [u8] {
    br#"{"timestamp":1700000100,"workflow":"build","run_id":42,"repository":"acme/widgets","trigger_event":"push"}"#
}

fn post_job_json() -> &'static [u8] {
    br#"{"timestamp":1700000500,"status":"normal"}"#
}

#[tokio::test]
async fn test_convergence_from_empty() {
    let h = Harness::new();

    let delta = h.reconciler.reconcile(5, FlushMode::IdleOnly).await.unwrap();

    assert_eq!(delta, 5);
    let names = h.cloud.instance_names();
    assert_eq!(names.len(), 5);
    assert!(names.iter().all(|n| n.starts_with("ci-large-0-")));
    assert_eq!(h.registry.registered_names().len(), 5);
}

#[tokio::test]
async fn test_scale_up_requests_exact_deficit() {
    let h = Harness::new();
    h.seed_healthy("ci-large-0-idle1", false);
    h.seed_healthy("ci-large-0-busy1", true);

    let delta = h.reconciler.reconcile(5, FlushMode::IdleOnly).await.unwrap();

    assert_eq!(delta, 3);
    assert_eq!(h.cloud.instance_names().len(), 5);
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let h = Harness::new();

    h.reconciler.reconcile(3, FlushMode::IdleOnly).await.unwrap();
    let names_after_first = h.cloud.instance_names();

    let delta = h.reconciler.reconcile(3, FlushMode::IdleOnly).await.unwrap();

    assert_eq!(delta, 0);
    assert_eq!(h.cloud.instance_names(), names_after_first);
}

#[tokio::test]
async fn test_scale_down_prefers_idle() {
    let h = Harness::new();
    h.seed_healthy("ci-large-0-idle1", false);
    h.seed_healthy("ci-large-0-idle2", false);
    h.seed_healthy("ci-large-0-busy1", true);

    let delta = h.reconciler.reconcile(1, FlushMode::IdleOnly).await.unwrap();

    assert_eq!(delta, -2);
    assert_eq!(h.cloud.instance_names(), vec!["ci-large-0-busy1"]);
}

#[tokio::test]
async fn test_unhealthy_sweep_overrides_desired() {
    let h = Harness::new();
    h.seed_healthy("ci-large-0-idle1", false);
    h.seed_healthy("ci-large-0-idle2", false);
    h.seed_healthy("ci-large-0-idle3", false);
    // Cloud instances that never registered
    h.cloud.seed("ci-large-0-orphan1", InstanceStatus::Active);
    h.cloud.seed("ci-large-0-orphan2", InstanceStatus::Error);

    let delta = h.reconciler.reconcile(3, FlushMode::IdleOnly).await.unwrap();

    assert_eq!(delta, 0);
    assert_eq!(
        h.cloud.instance_names(),
        vec!["ci-large-0-idle1", "ci-large-0-idle2", "ci-large-0-idle3"]
    );

    let summary = h
        .sink
        .events()
        .into_iter()
        .find(|e| e.kind() == EventKind::Reconciliation)
        .expect("reconciliation event emitted");
    match summary {
        RunnerEvent::Reconciliation {
            unhealthy_removed,
            idle_retained,
            flavor,
            ..
        } => {
            assert_eq!(unhealthy_removed, 2);
            assert_eq!(idle_retained, 3);
            assert_eq!(flavor, "large");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_busy_workers_protected_under_idle_only() {
    let h = Harness::new();
    for i in 0..4 {
        h.seed_healthy(&format!("ci-large-0-busy{}", i), true);
    }

    let delta = h.reconciler.reconcile(1, FlushMode::IdleOnly).await.unwrap();

    assert_eq!(delta, 0);
    assert_eq!(h.cloud.instance_names().len(), 4);
}

#[tokio::test]
async fn test_stale_registration_removed_registry_side_only() {
    let h = Harness::new();
    h.registry.register("ci-large-0-stale", true, false);

    let delta = h.reconciler.reconcile(0, FlushMode::IdleOnly).await.unwrap();

    assert_eq!(delta, 0);
    assert!(h.registry.registered_names().is_empty());
    assert!(h.cloud.deleted_ids().is_empty());
}

#[tokio::test]
async fn test_unreachable_worker_removed() {
    let h = Harness::new();
    h.cloud.seed("ci-large-0-dead", InstanceStatus::Active);
    h.registry.register("ci-large-0-dead", false, false);

    h.reconciler.reconcile(0, FlushMode::IdleOnly).await.unwrap();

    assert!(h.cloud.instance_names().is_empty());
    assert!(h.registry.registered_names().is_empty());
}

#[tokio::test]
async fn test_pending_counts_toward_capacity() {
    let h = Harness::new();
    h.cloud.seed("ci-large-0-pend", InstanceStatus::Building);

    let delta = h.reconciler.reconcile(2, FlushMode::IdleOnly).await.unwrap();

    // One creation on top of the pending worker; the pending worker is
    // neither removed nor counted healthy.
    assert_eq!(h.cloud.instance_names().len(), 2);
    assert_eq!(delta, 1);
}

#[tokio::test]
async fn test_creation_failure_does_not_abort_batch() {
    let h = Harness::new();
    h.cloud.fail_next_creates(1);

    let delta = h.reconciler.reconcile(3, FlushMode::IdleOnly).await.unwrap();

    assert_eq!(delta, 2);
    assert_eq!(h.cloud.instance_names().len(), 2);
}

#[tokio::test]
async fn test_worker_going_offline_is_replaced() {
    let h = Harness::new();
    h.reconciler.reconcile(2, FlushMode::IdleOnly).await.unwrap();
    let victim = h.cloud.instance_names()[0].clone();

    // The agent crashes without deregistering
    h.registry.set_online(&victim, false);

    let delta = h.reconciler.reconcile(2, FlushMode::IdleOnly).await.unwrap();

    // One unreachable worker swept, one replacement created
    assert_eq!(delta, 1);
    let names = h.cloud.instance_names();
    assert_eq!(names.len(), 2);
    assert!(!names.contains(&victim));
}

#[tokio::test]
async fn test_registration_token_failure_skips_creation() {
    let h = Harness::new();
    h.registry.fail_token_fetches(true);

    let delta = h.reconciler.reconcile(2, FlushMode::IdleOnly).await.unwrap();

    // No token, no boot script, no instance; retried next pass
    assert_eq!(delta, 0);
    assert!(h.cloud.instance_names().is_empty());
}

#[tokio::test]
async fn test_worker_finishing_job_becomes_flushable() {
    let h = Harness::new();
    h.seed_healthy("ci-large-0-w1", true);

    let removed = h.reconciler.flush_fleet(FlushMode::IdleOnly).await.unwrap();
    assert_eq!(removed, 0);

    h.registry.set_busy("ci-large-0-w1", false);

    let removed = h.reconciler.flush_fleet(FlushMode::IdleOnly).await.unwrap();
    assert_eq!(removed, 1);
    assert!(h.cloud.instance_names().is_empty());
}

#[tokio::test]
async fn test_flush_idle_only_is_idempotent() {
    let h = Harness::new();
    h.seed_healthy("ci-large-0-idle1", false);
    h.seed_healthy("ci-large-0-idle2", false);
    h.seed_healthy("ci-large-0-busy1", true);

    let removed = h.reconciler.flush_fleet(FlushMode::IdleOnly).await.unwrap();
    assert_eq!(removed, 2);

    let removed = h.reconciler.flush_fleet(FlushMode::IdleOnly).await.unwrap();
    assert_eq!(removed, 0);
    assert_eq!(h.cloud.instance_names(), vec!["ci-large-0-busy1"]);
}

#[tokio::test]
async fn test_flush_all_removes_busy_immediately() {
    let h = Harness::new();
    h.seed_healthy("ci-large-0-idle1", false);
    h.seed_healthy("ci-large-0-busy1", true);

    let removed = h.reconciler.flush_fleet(FlushMode::All).await.unwrap();

    assert_eq!(removed, 2);
    assert!(h.cloud.instance_names().is_empty());
}

#[tokio::test]
async fn test_rejected_credentials_block_teardown_without_force() {
    let h = Harness::new();
    h.seed_healthy("ci-large-0-idle1", false);
    h.registry.reject_removal_credentials(true);

    let removed = h.reconciler.flush_fleet(FlushMode::IdleOnly).await.unwrap();

    // Deregistration failed, so the worker is kept for the next pass.
    assert_eq!(removed, 0);
    assert_eq!(h.cloud.instance_names(), vec!["ci-large-0-idle1"]);
}

#[tokio::test]
async fn test_force_deletes_cloud_despite_rejected_credentials() {
    let h = Harness::new();
    h.seed_healthy("ci-large-0-idle1", false);
    h.seed_healthy("ci-large-0-idle2", false);
    h.registry.reject_removal_credentials(true);

    let removed = h.reconciler.flush_fleet(FlushMode::Force).await.unwrap();

    assert_eq!(removed, 2);
    assert!(h.cloud.instance_names().is_empty());
    // Registrations are left stale; the next pass removes them once the
    // registry accepts credentials again.
    assert_eq!(h.registry.registered_names().len(), 2);
}

#[tokio::test]
async fn test_force_proceeds_when_registry_listing_fails() {
    let h = Harness::new();
    h.seed_healthy("ci-large-0-idle1", false);
    h.registry.fail_listings(true);

    // A normal flush cannot even snapshot.
    assert!(h.reconciler.flush_fleet(FlushMode::IdleOnly).await.is_err());

    // Force proceeds with cloud state only and deletes the instance.
    let removed = h.reconciler.flush_fleet(FlushMode::Force).await.unwrap();
    assert_eq!(removed, 1);
    assert!(h.cloud.instance_names().is_empty());
}

#[tokio::test]
async fn test_deferred_busy_removal_waits_for_check() {
    let h = Harness::new();
    h.seed_healthy("ci-large-0-busy1", true);

    let removed = h
        .reconciler
        .flush_fleet(FlushMode::IdleThenWaitForCheck)
        .await
        .unwrap();
    assert_eq!(removed, 0);
    assert_eq!(h.cloud.instance_names(), vec!["ci-large-0-busy1"]);

    // The compliance check resolves: the worker writes post-job telemetry.
    h.write_telemetry("ci-large-0-busy1", POST_JOB_FILE, post_job_json());

    let removed = h
        .reconciler
        .flush_fleet(FlushMode::IdleThenWaitForCheck)
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(h.cloud.instance_names().is_empty());
}

#[tokio::test]
async fn test_deferred_busy_removal_expires() {
    let h = Harness::with_check_wait(Duration::ZERO);
    h.seed_healthy("ci-large-0-busy1", true);

    // With a zero wait bound the worker is torn down in the same call,
    // post-job write or not.
    let removed = h
        .reconciler
        .flush_fleet(FlushMode::IdleThenWaitForCheck)
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(h.cloud.instance_names().is_empty());
}

#[tokio::test]
async fn test_orphaned_telemetry_swept_with_events() {
    let h = Harness::new();
    // Telemetry left behind by a worker that no longer exists anywhere
    h.write_telemetry("ci-large-0-dead", INSTALLED_FILE, b"1700000000");
    h.write_telemetry("ci-large-0-dead", PRE_JOB_FILE, pre_job_json());
    h.write_telemetry("ci-large-0-dead", POST_JOB_FILE, post_job_json());
    h.registry.set_queue_duration(42, 7.5);

    h.reconciler.reconcile(0, FlushMode::IdleOnly).await.unwrap();

    let events = h.sink.events();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind()).collect();
    assert!(kinds.contains(&EventKind::RunnerInstalled));
    assert!(kinds.contains(&EventKind::RunnerStart));
    assert!(kinds.contains(&EventKind::RunnerStop));

    let start = events
        .iter()
        .find(|e| e.kind() == EventKind::RunnerStart)
        .unwrap();
    match start {
        RunnerEvent::RunnerStart { queue_duration, .. } => {
            assert_eq!(*queue_duration, Some(7.5));
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Entry deleted after successful emission
    assert!(!h.telemetry_root.join("ci-large-0-dead").exists());
}

#[tokio::test]
async fn test_teardown_extracts_telemetry_before_deletion() {
    let h = Harness::new();
    h.cloud.seed("ci-large-0-gone", InstanceStatus::Active);
    h.registry.register("ci-large-0-gone", false, false); // offline -> unreachable
    h.write_telemetry("ci-large-0-gone", PRE_JOB_FILE, pre_job_json());
    h.write_telemetry("ci-large-0-gone", POST_JOB_FILE, post_job_json());

    h.reconciler.reconcile(0, FlushMode::IdleOnly).await.unwrap();

    let kinds: Vec<EventKind> = h.sink.events().iter().map(|e| e.kind()).collect();
    assert!(kinds.contains(&EventKind::RunnerStop));
    assert!(!h.telemetry_root.join("ci-large-0-gone").exists());
}

#[tokio::test]
async fn test_active_worker_telemetry_left_alone() {
    let h = Harness::new();
    h.seed_healthy("ci-large-0-busy1", true);
    h.write_telemetry("ci-large-0-busy1", PRE_JOB_FILE, pre_job_json());

    h.reconciler.reconcile(1, FlushMode::IdleOnly).await.unwrap();

    // The worker is live, so its telemetry is skipped, not consumed.
    assert!(h.telemetry_root.join("ci-large-0-busy1").exists());
    let kinds: Vec<EventKind> = h.sink.events().iter().map(|e| e.kind()).collect();
    assert!(!kinds.contains(&EventKind::RunnerStart));
}

#[tokio::test]
async fn test_missing_cloud_config_fails_loudly() {
    let h = Harness::new();
    // Rebuild with an empty image to hit settings validation
    let settings = ReconcilerSettings {
        prefix: PREFIX.to_string(),
        unit: "0".to_string(),
        scope: "acme".to_string(),
        flavor: "large".to_string(),
        image: String::new(),
        network: "net-1".to_string(),
        boot_script: String::new(),
        op_timeout: Duration::from_secs(5),
        parallelism: 4,
        check_wait: Duration::from_secs(900),
    };
    let reconciler = FleetReconciler::new(
        Arc::clone(&h.cloud) as Arc<dyn CloudBackend>,
        Arc::clone(&h.registry) as Arc<dyn JobRegistry>,
        Arc::new(
            FsTelemetryStore::open(
                h._tmp.path().join("telemetry2"),
                h._tmp.path().join("quarantine2"),
            )
            .unwrap(),
        ),
        Arc::clone(&h.sink) as Arc<dyn EventSink>,
        settings,
        1024 * 1024,
    );

    let err = reconciler.reconcile(1, FlushMode::IdleOnly).await.unwrap_err();
    assert!(err.to_string().contains("configuration error"));
    // No backend call was made
    assert!(h.cloud.instance_names().is_empty());
}
