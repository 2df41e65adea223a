//! Configuration for the fleet manager.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::metrics::DEFAULT_MAX_FILE_BYTES;
use crate::reconciler::ReconcilerSettings;

/// Fleet manager configuration, loaded from `FLEET_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cloud backend API URL.
    pub cloud_url: String,

    /// Cloud backend auth token.
    pub cloud_token: String,

    /// Job registry API URL.
    pub registry_url: String,

    /// Job registry auth token.
    pub registry_token: String,

    /// Naming prefix shared by every worker in the fleet.
    pub prefix: String,

    /// Unit element in generated worker names.
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

    /// Target number of healthy workers.
    pub desired_count: usize,

    /// Seconds between reconciliation passes.
    pub reconcile_interval_secs: u64,

    /// Root directory of the worker telemetry store.
    pub telemetry_dir: String,

    /// Quarantine directory for telemetry that fails integrity checks.
    pub quarantine_dir: String,

    /// Per-file telemetry size ceiling in bytes.
    pub telemetry_max_bytes: u64,

    /// Deadline for each individual cloud or registry call, in seconds.
    pub op_timeout_secs: u64,

    /// Bound on concurrent per-worker operations.
    pub parallelism: usize,

    /// Seconds a deferred busy worker may wait for its compliance check.
    pub check_wait_secs: u64,

    /// JSONL file to append events to; structured logs when unset.
    pub events_file: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Scope, image, flavor, and network have no usable defaults; missing
    /// values fail loudly here since retrying cannot help.
    pub fn from_env() -> Result<Self> {
        let cloud_url =
            std::env::var("FLEET_CLOUD_URL").unwrap_or_else(|_| "http://127.0.0.1:8774".to_string());
        let cloud_token = std::env::var("FLEET_CLOUD_TOKEN").unwrap_or_default();

        let registry_url = std::env::var("FLEET_REGISTRY_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8200".to_string());
        let registry_token = std::env::var("FLEET_REGISTRY_TOKEN").unwrap_or_default();

        let prefix = std::env::var("FLEET_PREFIX").unwrap_or_else(|_| "runner".to_string());
        let unit = std::env::var("FLEET_UNIT").unwrap_or_else(|_| "0".to_string());

        let scope = std::env::var("FLEET_SCOPE").context("FLEET_SCOPE must be set")?;
        let flavor = std::env::var("FLEET_FLAVOR").context("FLEET_FLAVOR must be set")?;
        let image = std::env::var("FLEET_IMAGE").context("FLEET_IMAGE must be set")?;
        let network = std::env::var("FLEET_NETWORK").context("FLEET_NETWORK must be set")?;

        let boot_script = std::env::var("FLEET_BOOT_SCRIPT").unwrap_or_else(|_| {
            "#!/bin/sh\nexec /opt/runner/bootstrap --name {name} --registration-token {registration_token}\n"
                .to_string()
        });

        let desired_count = std::env::var("FLEET_DESIRED_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        let reconcile_interval_secs = std::env::var("FLEET_RECONCILE_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let telemetry_dir = std::env::var("FLEET_TELEMETRY_DIR")
            .unwrap_or_else(|_| "/var/lib/fleet/telemetry".to_string());
        let quarantine_dir = std::env::var("FLEET_QUARANTINE_DIR")
            .unwrap_or_else(|_| "/var/lib/fleet/quarantine".to_string());

        let telemetry_max_bytes = std::env::var("FLEET_TELEMETRY_MAX_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_FILE_BYTES);

        let op_timeout_secs = std::env::var("FLEET_OP_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let parallelism = std::env::var("FLEET_PARALLELISM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let check_wait_secs = std::env::var("FLEET_CHECK_WAIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(900);

        let events_file = std::env::var("FLEET_EVENTS_FILE").ok();

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            cloud_url,
            cloud_token,
            registry_url,
            registry_token,
            prefix,
            unit,
            scope,
            flavor,
            image,
            network,
            boot_script,
            desired_count,
            reconcile_interval_secs,
            telemetry_dir,
            quarantine_dir,
            telemetry_max_bytes,
            op_timeout_secs,
            parallelism,
            check_wait_secs,
            events_file,
            log_level,
        })
    }

    /// Derive the reconciler's settings from this configuration.
    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            prefix: self.prefix.clone(),
            unit: self.unit.clone(),
            scope: self.scope.clone(),
            flavor: self.flavor.clone(),
            image: self.image.clone(),
            network: self.network.clone(),
            boot_script: self.boot_script.clone(),
            op_timeout: Duration::from_secs(self.op_timeout_secs),
            parallelism: self.parallelism,
            check_wait: Duration::from_secs(self.check_wait_secs),
        }
    }
}
