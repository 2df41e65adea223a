//! Metrics extraction and quarantine pipeline.
//!
//! Converts raw worker telemetry into typed [`RunnerMetrics`] and gated
//! lifecycle events. Telemetry is adversarial input, so integrity failures
//! never become pass failures:
//!
//! - Any file over the size ceiling quarantines the entire entry unread
//! - Any present file that fails schema validation quarantines the entire
//!   entry; no partial events are emitted from corrupt data
//! - A missing or zero-length file is legitimate partial telemetry from a
//!   crashed worker and silently gates out the events that need it

use std::collections::HashSet;
use std::str;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use fleet_events::{EventKind, EventSink, JobStatus, RunnerEvent};

use crate::telemetry::{TelemetryError, TelemetrySnapshot, TelemetryStore};

/// Default per-file size ceiling: 1 MiB.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Document the worker writes immediately before starting a job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreJob {
    pub timestamp: i64,
    pub workflow: String,
    pub run_id: u64,
    pub repository: String,
    pub trigger_event: String,
}

/// Document the worker writes immediately after the job finishes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostJob {
    pub timestamp: i64,
    pub status: JobStatus,
    #[serde(default)]
    pub status_detail: Option<String>,
}

/// Validated telemetry for one runner. Each item is independently optional.
#[derive(Debug, Clone)]
pub struct RunnerMetrics {
    pub runner: String,
    pub installed: Option<i64>,
    pub pre_job: Option<PreJob>,
    pub post_job: Option<PostJob>,
}

/// The extraction pipeline.
pub struct MetricsPipeline {
    store: Arc<dyn TelemetryStore>,
    sink: Arc<dyn EventSink>,
    max_file_bytes: u64,
}

impl MetricsPipeline {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        sink: Arc<dyn EventSink>,
        max_file_bytes: u64,
    ) -> Self {
        Self {
            store,
            sink,
            max_file_bytes,
        }
    }

    /// Extract metrics for every entry not named in `ignore`.
    ///
    /// Names in `ignore` belong to still-active workers whose telemetry may
    /// be mid-write; they are skipped outright rather than raced against.
    /// Integrity failures quarantine the offending entry and processing
    /// continues with the next one.
    pub fn extract(&self, ignore: &HashSet<String>) -> Vec<RunnerMetrics> {
        let names = match self.store.list_names() {
            Ok(names) => names,
            Err(err) => {
                warn!(error = %err, "Failed to list telemetry entries");
                return Vec::new();
            }
        };

        let mut extracted = Vec::new();
        for name in names {
            if ignore.contains(&name) {
                continue;
            }
            match self.extract_runner(&name) {
                Ok(Some(metrics)) => extracted.push(metrics),
                Ok(None) => {}
                Err(err) => {
                    warn!(runner = %name, error = %err, "Failed to read telemetry entry");
                }
            }
        }
        extracted
    }

    /// Extract metrics for a single runner.
    ///
    /// Returns `Ok(None)` when the entry does not exist or was quarantined.
    pub fn extract_runner(&self, name: &str) -> Result<Option<RunnerMetrics>, TelemetryError> {
        let Some(sizes) = self.store.sizes(name)? else {
            return Ok(None);
        };

        // Oversized payloads are a tamper signal: quarantine unread.
        if sizes.largest() > self.max_file_bytes {
            warn!(
                runner = %name,
                bytes = sizes.largest(),
                ceiling = self.max_file_bytes,
                "Telemetry exceeds size ceiling, quarantining entry"
            );
            self.store.archive_and_delete(name)?;
            return Ok(None);
        }

        let Some(snapshot) = self.store.read(name)? else {
            return Ok(None);
        };

        match Self::validate(name, &snapshot) {
            Ok(metrics) => Ok(Some(metrics)),
            Err(reason) => {
                warn!(
                    runner = %name,
                    reason = %reason,
                    "Telemetry failed validation, quarantining entry"
                );
                self.store.archive_and_delete(name)?;
                Ok(None)
            }
        }
    }

    /// Parse the three items independently; any invalid present item fails
    /// the whole entry.
    fn validate(name: &str, snapshot: &TelemetrySnapshot) -> Result<RunnerMetrics, String> {
        let installed = snapshot
            .installed
            .as_deref()
            .map(|bytes| {
                str::from_utf8(bytes)
                    .map_err(|_| "installed timestamp is not UTF-8".to_string())?
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| "installed timestamp is not an integer".to_string())
            })
            .transpose()?;

        let pre_job = snapshot
            .pre_job
            .as_deref()
            .map(|bytes| {
                serde_json::from_slice::<PreJob>(bytes)
                    .map_err(|err| format!("pre-job document invalid: {}", err))
            })
            .transpose()?;

        let post_job = snapshot
            .post_job
            .as_deref()
            .map(|bytes| {
                serde_json::from_slice::<PostJob>(bytes)
                    .map_err(|err| format!("post-job document invalid: {}", err))
            })
            .transpose()?;

        Ok(RunnerMetrics {
            runner: name.to_string(),
            installed,
            pre_job,
            post_job,
        })
    }

    /// Emit the events whose required inputs are present, in order.
    ///
    /// Missing prerequisites silently skip that event kind; a crashed
    /// worker legitimately has partial telemetry. Returns the kinds that
    /// were actually emitted.
    pub fn issue_events(
        &self,
        metrics: &RunnerMetrics,
        flavor: &str,
        queue_duration: Option<f64>,
    ) -> HashSet<EventKind> {
        let mut emitted = HashSet::new();
        let now = Utc::now().timestamp();

        if let (Some(installed), Some(pre)) = (metrics.installed, &metrics.pre_job) {
            self.emit(
                &mut emitted,
                RunnerEvent::RunnerInstalled {
                    timestamp: now,
                    runner: metrics.runner.clone(),
                    flavor: flavor.to_string(),
                    duration: (pre.timestamp - installed) as f64,
                },
            );
        }

        if let Some(pre) = &metrics.pre_job {
            self.emit(
                &mut emitted,
                RunnerEvent::RunnerStart {
                    timestamp: now,
                    runner: metrics.runner.clone(),
                    flavor: flavor.to_string(),
                    workflow: pre.workflow.clone(),
                    repository: pre.repository.clone(),
                    idle: metrics.installed.map(|i| (pre.timestamp - i) as f64),
                    queue_duration,
                },
            );
        }

        if let (Some(pre), Some(post)) = (&metrics.pre_job, &metrics.post_job) {
            self.emit(
                &mut emitted,
                RunnerEvent::RunnerStop {
                    timestamp: now,
                    runner: metrics.runner.clone(),
                    flavor: flavor.to_string(),
                    workflow: pre.workflow.clone(),
                    repository: pre.repository.clone(),
                    job_duration: (post.timestamp - pre.timestamp) as f64,
                    status: post.status,
                    status_detail: post.status_detail.clone(),
                },
            );
        }

        emitted
    }

    fn emit(&self, emitted: &mut HashSet<EventKind>, event: RunnerEvent) {
        match self.sink.emit(&event) {
            Ok(()) => {
                emitted.insert(event.kind());
            }
            Err(err) => {
                warn!(event = %event.kind(), error = %err, "Failed to emit event");
            }
        }
    }
}
