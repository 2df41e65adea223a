//! Worker health classification.
//!
//! Joins per-name cloud state with registry state and assigns exactly one
//! lifecycle state. The function is pure and total: every combination of
//! inputs maps to a state, and anything outside `Idle`/`Busy`/`Pending` is
//! a removal candidate on every pass regardless of the desired count.

use serde::{Deserialize, Serialize};

use crate::cloud::InstanceStatus;

/// Health state of one worker, derived per pass and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Cloud instance building, not yet registered. Grace period.
    Pending,
    /// Registered, online, not running a job. Eligible for scale-down.
    Idle,
    /// Registered, online, running a job. Protected unless a flush policy
    /// explicitly targets busy workers.
    Busy,
    /// Cloud instance exists but never registered, or is in cloud error
    /// state. Always removed.
    OrphanedCloud,
    /// Registered on the registry with no matching cloud instance. Always
    /// removed, registry-side only.
    StaleRegistration,
    /// Cloud instance exists and is registered, but the agent is offline.
    /// Always removed.
    Unreachable,
}

impl HealthState {
    /// Whether this worker counts toward the healthy population.
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Idle | HealthState::Busy)
    }

    /// Whether the unhealthy sweep removes this worker every pass.
    pub fn is_unhealthy(&self) -> bool {
        !matches!(
            self,
            HealthState::Idle | HealthState::Busy | HealthState::Pending
        )
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Pending => write!(f, "pending"),
            HealthState::Idle => write!(f, "idle"),
            HealthState::Busy => write!(f, "busy"),
            HealthState::OrphanedCloud => write!(f, "orphaned_cloud"),
            HealthState::StaleRegistration => write!(f, "stale_registration"),
            HealthState::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Classify one worker from its joined cloud and registry observations.
///
/// `cloud_status` is `None` when no cloud instance of this name exists;
/// `online` and `busy` are only meaningful when `registered` is true.
///
/// Tie-breaks: cloud error state wins over everything, and the
/// orphaned/stale classifications win over `Unreachable`. The
/// definitionally-absent combination (no cloud instance, not registered)
/// maps to `StaleRegistration`, whose teardown is a no-op; the snapshot
/// builder never materializes such a record.
pub fn classify(
    cloud_status: Option<InstanceStatus>,
    registered: bool,
    online: bool,
    busy: bool,
) -> HealthState {
    match (cloud_status, registered) {
        // Cloud error state overrides any registration.
        (Some(InstanceStatus::Error), _) => HealthState::OrphanedCloud,
        (Some(InstanceStatus::Building), false) => HealthState::Pending,
        (Some(_), false) => HealthState::OrphanedCloud,
        (None, _) => HealthState::StaleRegistration,
        (Some(_), true) => {
            if !online {
                HealthState::Unreachable
            } else if busy {
                HealthState::Busy
            } else {
                HealthState::Idle
            }
        }
    }
}
