//! Runner lifecycle event records.
//!
//! Every record is flat and self-describing: serialization produces an
//! object with an `event` name field and a Unix `timestamp`, suitable for
//! appending to a structured log or telemetry sink.

use serde::{Deserialize, Serialize};

/// Outcome of a job as reported by the worker's post-job telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job ran and finished normally.
    Normal,
    /// Job ran but exited abnormally.
    Abnormal,
    /// The pre-job registry compliance check failed; the job never ran.
    RegistryCheckFailure,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Normal => write!(f, "normal"),
            JobStatus::Abnormal => write!(f, "abnormal"),
            JobStatus::RegistryCheckFailure => write!(f, "registry_check_failure"),
        }
    }
}

/// A single emitted event.
///
/// Durations are in seconds, derived from timestamps the worker wrote to
/// its telemetry store. Optional fields are omitted from the serialized
/// record when unavailable, never defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// Runner software finished installing and the runner picked up work.
    RunnerInstalled {
        timestamp: i64,
        runner: String,
        flavor: String,
        /// Seconds between install completion and the first job starting.
        duration: f64,
    },

    /// Runner picked up a job.
    RunnerStart {
        timestamp: i64,
        runner: String,
        flavor: String,
        workflow: String,
        repository: String,
        /// Seconds the runner sat idle before this job, if install time is known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idle: Option<f64>,
        /// Seconds the job waited in the queue, if the registry lookup succeeded.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue_duration: Option<f64>,
    },

    /// Job finished, or the pre-job compliance check failed.
    RunnerStop {
        timestamp: i64,
        runner: String,
        flavor: String,
        workflow: String,
        repository: String,
        /// Seconds between job start and job end.
        job_duration: f64,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_detail: Option<String>,
    },

    /// Summary of one reconciliation pass, emitted by the reconciler.
    Reconciliation {
        timestamp: i64,
        flavor: String,
        unhealthy_removed: usize,
        idle_retained: usize,
        duration_secs: f64,
    },
}

impl RunnerEvent {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            RunnerEvent::RunnerInstalled { .. } => EventKind::RunnerInstalled,
            RunnerEvent::RunnerStart { .. } => EventKind::RunnerStart,
            RunnerEvent::RunnerStop { .. } => EventKind::RunnerStop,
            RunnerEvent::Reconciliation { .. } => EventKind::Reconciliation,
        }
    }

    /// Unix timestamp of the event.
    pub fn timestamp(&self) -> i64 {
        match self {
            RunnerEvent::RunnerInstalled { timestamp, .. }
            | RunnerEvent::RunnerStart { timestamp, .. }
            | RunnerEvent::RunnerStop { timestamp, .. }
            | RunnerEvent::Reconciliation { timestamp, .. } => *timestamp,
        }
    }
}

/// Event kind, used to report which events a pipeline call emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunnerInstalled,
    RunnerStart,
    RunnerStop,
    Reconciliation,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::RunnerInstalled => write!(f, "runner_installed"),
            EventKind::RunnerStart => write!(f, "runner_start"),
            EventKind::RunnerStop => write!(f, "runner_stop"),
            EventKind::Reconciliation => write!(f, "reconciliation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_field() {
        let event = RunnerEvent::RunnerStop {
            timestamp: 1_700_000_000,
            runner: "ci-large-0-abc123de".to_string(),
            flavor: "large".to_string(),
            workflow: "build".to_string(),
            repository: "acme/widgets".to_string(),
            job_duration: 42.0,
            status: JobStatus::Normal,
            status_detail: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "runner_stop");
        assert_eq!(json["timestamp"], 1_700_000_000_i64);
        assert_eq!(json["status"], "normal");
        // Absent optionals are omitted, not serialized as null
        assert!(json.get("status_detail").is_none());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = RunnerEvent::RunnerStart {
            timestamp: 1_700_000_100,
            runner: "ci-large-0-abc123de".to_string(),
            flavor: "large".to_string(),
            workflow: "build".to_string(),
            repository: "acme/widgets".to_string(),
            idle: None,
            queue_duration: Some(3.5),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("idle").is_none());
        assert_eq!(json["queue_duration"], 3.5);
    }

    #[test]
    fn test_event_kind_roundtrip() {
        let event = RunnerEvent::Reconciliation {
            timestamp: 1_700_000_200,
            flavor: "large".to_string(),
            unhealthy_removed: 2,
            idle_retained: 3,
            duration_secs: 1.25,
        };
        assert_eq!(event.kind(), EventKind::Reconciliation);
        assert_eq!(event.timestamp(), 1_700_000_200);

        let json = serde_json::to_string(&event).unwrap();
        let back: RunnerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
