//! Fleet manager library.
//!
//! Maintains a fleet of ephemeral, single-job CI runners, converging the
//! live population on a desired target while reconciling three independent
//! sources of truth:
//!
//! - **Cloud backend**: the instances that actually exist ([`cloud`])
//! - **Job registry**: the runners registered to receive jobs ([`registry`])
//! - **Worker telemetry**: per-runner lifecycle files written by the
//!   runners themselves ([`telemetry`])
//!
//! ## Architecture
//!
//! - [`health`]: joins cloud and registry state into a health classification
//! - [`worker`]: per-runner records and fleet snapshots
//! - [`reconciler`]: the convergence loop (create/keep/destroy decisions)
//! - [`metrics`]: telemetry extraction with quarantine-on-corruption
//! - [`config`]: environment-based configuration for the binary
//!
//! A reconciliation pass is invoked from outside (a timer in the shipped
//! binary); the engine itself holds no long-lived background task.

pub mod cloud;
pub mod config;
pub mod health;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod telemetry;
pub mod worker;
