//! # fleet-events
//!
//! Event type definitions and sinks for the runner fleet manager.
//!
//! ## Design Principles
//!
//! - Events are flat, immutable records of observed runner lifecycle facts
//! - Every event carries a Unix `timestamp` and an `event` name field
//! - Durations are derived from worker telemetry, never measured here
//! - Sinks are append-only; emission failures never propagate into the
//!   reconciliation pass that produced the event
//!
//! ## Event Types
//!
//! - `runner_installed` - runner software finished installing
//! - `runner_start` - runner picked up a job
//! - `runner_stop` - job finished (or the pre-job check failed)
//! - `reconciliation` - summary of one reconciliation pass

mod error;
mod sink;
mod types;

pub use error::EventError;
pub use sink::{EventSink, JsonlSink, MemorySink, TracingSink};
pub use types::{EventKind, JobStatus, RunnerEvent};
