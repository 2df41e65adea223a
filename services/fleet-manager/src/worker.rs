//! Worker records and fleet snapshots.
//!
//! A [`WorkerRecord`] joins one worker's cloud and registry observations
//! under its name, the global join key. Records are rebuilt from fresh
//! listings on every reconciliation pass and never persisted.

use std::collections::BTreeMap;

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::cloud::{Instance, InstanceStatus, ServerId};
use crate::health::{classify, HealthState};
use crate::registry::Registration;

/// Length of the random suffix in generated runner names.
const NAME_SUFFIX_LEN: usize = 8;

/// One worker as observed by the current pass.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Globally unique name, the join key across all three systems.
    pub name: String,
    /// Cloud instance id, present iff an instance of this name exists.
    pub cloud_id: Option<ServerId>,
    /// Cloud status, present iff `cloud_id` is.
    pub cloud_status: Option<InstanceStatus>,
    /// Registry record, present iff a runner of this name is registered.
    pub registration: Option<Registration>,
    /// Derived health state.
    pub health: HealthState,
}

impl WorkerRecord {
    pub fn registered(&self) -> bool {
        self.registration.is_some()
    }

    pub fn busy(&self) -> bool {
        self.registration.as_ref().is_some_and(|r| r.busy)
    }
}

/// Generate a fresh runner name: `<prefix>-<unit>-<random suffix>`.
pub fn runner_name(prefix: &str, unit: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_LEN)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("{}-{}-{}", prefix, unit, suffix)
}

/// Join cloud instances and registrations into per-worker records.
///
/// A name present in neither source yields no record. Output is sorted by
/// name so passes are deterministic for a given pair of listings.
pub fn build_fleet_snapshot(
    instances: Vec<Instance>,
    registrations: Vec<Registration>,
) -> Vec<WorkerRecord> {
    let mut joined: BTreeMap<String, (Option<Instance>, Option<Registration>)> = BTreeMap::new();

    for instance in instances {
        let name = instance.name.clone();
        joined.entry(name).or_default().0 = Some(instance);
    }
    for registration in registrations {
        let name = registration.name.clone();
        joined.entry(name).or_default().1 = Some(registration);
    }

    joined
        .into_iter()
        .map(|(name, (instance, registration))| {
            let cloud_status = instance.as_ref().map(|i| i.status);
            let (registered, online, busy) = match &registration {
                Some(r) => (true, r.online, r.busy),
                None => (false, false, false),
            };
            WorkerRecord {
                name,
                cloud_id: instance.map(|i| i.id),
                cloud_status,
                registration,
                health: classify(cloud_status, registered, online, busy),
            }
        })
        .collect()
}
