//! Fleet manager binary.
//!
//! Wires configuration, the cloud and registry ports, the telemetry store,
//! and an event sink into a [`FleetReconciler`], then invokes a
//! reconciliation pass on a fixed interval until shutdown.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_events::{EventSink, JsonlSink, TracingSink};
use fleet_manager::cloud::HttpCloud;
use fleet_manager::config::Config;
use fleet_manager::reconciler::{FleetReconciler, FlushMode};
use fleet_manager::registry::HttpRegistry;
use fleet_manager::telemetry::FsTelemetryStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet manager");
    info!(
        prefix = %config.prefix,
        scope = %config.scope,
        flavor = %config.flavor,
        desired_count = config.desired_count,
        reconcile_interval_secs = config.reconcile_interval_secs,
        "Configuration loaded"
    );

    let cloud = Arc::new(HttpCloud::new(&config.cloud_url, &config.cloud_token));
    let registry = Arc::new(HttpRegistry::new(
        &config.registry_url,
        &config.registry_token,
    ));
    let telemetry = Arc::new(FsTelemetryStore::open(
        &config.telemetry_dir,
        &config.quarantine_dir,
    )?);

    let sink: Arc<dyn EventSink> = match &config.events_file {
        Some(path) => {
            info!(path = %path, "Appending events to file");
            Arc::new(JsonlSink::open(path)?)
        }
        None => Arc::new(TracingSink::new()),
    };

    let reconciler = Arc::new(FleetReconciler::new(
        cloud,
        registry,
        telemetry,
        sink,
        config.reconciler_settings(),
        config.telemetry_max_bytes,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_handle = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        let desired_count = config.desired_count;
        let interval = std::time::Duration::from_secs(config.reconcile_interval_secs);
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match reconciler.reconcile(desired_count, FlushMode::IdleOnly).await {
                            Ok(delta) => info!(delta, "Reconciliation pass finished"),
                            Err(e) => warn!(error = %e, "Reconciliation pass failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Reconciliation loop shutting down");
                            break;
                        }
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = loop_handle => {
            match result {
                Ok(()) => info!("Reconciliation loop exited"),
                Err(e) => error!(error = %e, "Reconciliation loop panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Fleet manager shutdown complete");
    Ok(())
}
