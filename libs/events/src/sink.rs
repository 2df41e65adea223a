//! Event sinks.
//!
//! A sink appends emitted events to some external destination. Sinks are
//! synchronous and infallible from the reconciler's point of view: callers
//! log emission errors and move on, they never fail a pass over them.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;

use crate::error::EventError;
use crate::types::RunnerEvent;

/// Destination for emitted events.
pub trait EventSink: Send + Sync {
    /// Append one event.
    fn emit(&self, event: &RunnerEvent) -> Result<(), EventError>;
}

/// Sink that emits events as structured log records.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: &RunnerEvent) -> Result<(), EventError> {
        let payload = serde_json::to_string(event)?;
        info!(
            target: "fleet_events",
            event = %event.kind(),
            payload = %payload,
            "Runner event"
        );
        Ok(())
    }
}

/// Sink that appends events to a JSON-lines file.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    /// Open (or create) the file at `path` for appending.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EventError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &RunnerEvent) -> Result<(), EventError> {
        let line = serde_json::to_string(event)?;
        let mut file = self.file.lock().expect("jsonl sink lock poisoned");
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RunnerEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events emitted so far, in emission order.
    pub fn events(&self) -> Vec<RunnerEvent> {
        self.events.lock().expect("memory sink lock poisoned").clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &RunnerEvent) -> Result<(), EventError> {
        self.events
            .lock()
            .expect("memory sink lock poisoned")
            .push(event.clone());
        Ok(())
    }
}
