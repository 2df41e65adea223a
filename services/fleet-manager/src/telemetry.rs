//! Worker telemetry store.
//!
//! Each runner owns one entry keyed by its name, created at boot and
//! written at most twice by the runner itself (pre-job, post-job). The
//! engine only ever reads entries, archives them to quarantine, or deletes
//! them after successful event emission. Contents are adversarial input: a
//! compromised job can write arbitrary bytes here, so nothing in this
//! module parses them - that is the metrics pipeline's job.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// File holding the Unix timestamp at which runner software finished installing.
pub const INSTALLED_FILE: &str = "installed";
/// File the runner writes immediately before starting a job.
pub const PRE_JOB_FILE: &str = "pre-job.json";
/// File the runner writes immediately after the job finishes.
pub const POST_JOB_FILE: &str = "post-job.json";

/// Errors from telemetry store operations.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Byte sizes of an entry's files, retrievable without reading contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySizes {
    pub installed: Option<u64>,
    pub pre_job: Option<u64>,
    pub post_job: Option<u64>,
}

impl TelemetrySizes {
    /// Size of the largest present file, 0 when the entry is empty.
    pub fn largest(&self) -> u64 {
        [self.installed, self.pre_job, self.post_job]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(0)
    }
}

/// Raw contents of one entry. Each item is independently optional.
///
/// A zero-length file (worker crashed mid-write) reads as missing, the
/// same as a file that was never written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub installed: Option<Vec<u8>>,
    pub pre_job: Option<Vec<u8>>,
    pub post_job: Option<Vec<u8>>,
}

/// Telemetry store interface.
pub trait TelemetryStore: Send + Sync {
    /// Names of all entries.
    fn list_names(&self) -> Result<Vec<String>, TelemetryError>;

    /// Byte sizes for one entry, `None` when the entry does not exist.
    fn sizes(&self, name: &str) -> Result<Option<TelemetrySizes>, TelemetryError>;

    /// Raw contents for one entry, `None` when the entry does not exist.
    fn read(&self, name: &str) -> Result<Option<TelemetrySnapshot>, TelemetryError>;

    /// Move the whole entry into quarantine for forensic review.
    fn archive_and_delete(&self, name: &str) -> Result<(), TelemetryError>;

    /// Delete the entry. Succeeds if it no longer exists.
    fn delete(&self, name: &str) -> Result<(), TelemetryError>;
}

/// Filesystem-backed telemetry store.
///
/// Layout: `<root>/<name>/{installed,pre-job.json,post-job.json}` with a
/// sibling quarantine directory. Archived entries are renamed to
/// `<quarantine>/<name>-<unix-ts>`, so the quarantine directory must live
/// on the same filesystem as the root.
pub struct FsTelemetryStore {
    root: PathBuf,
    quarantine: PathBuf,
}

impl FsTelemetryStore {
    /// Open a store rooted at `root`, creating both directories if needed.
    pub fn open(
        root: impl Into<PathBuf>,
        quarantine: impl Into<PathBuf>,
    ) -> Result<Self, TelemetryError> {
        let root = root.into();
        let quarantine = quarantine.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&quarantine)?;
        Ok(Self { root, quarantine })
    }

    fn entry_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn file_size(path: &Path) -> Result<Option<u64>, TelemetryError> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn read_item(path: &Path) -> Result<Option<Vec<u8>>, TelemetryError> {
        match fs::read(path) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl TelemetryStore for FsTelemetryStore {
    fn list_names(&self) -> Result<Vec<String>, TelemetryError> {
        let mut names = Vec::new();
        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            if dirent.file_type()?.is_dir() {
                names.push(dirent.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn sizes(&self, name: &str) -> Result<Option<TelemetrySizes>, TelemetryError> {
        let dir = self.entry_dir(name);
        if !dir.is_dir() {
            return Ok(None);
        }
        Ok(Some(TelemetrySizes {
            installed: Self::file_size(&dir.join(INSTALLED_FILE))?,
            pre_job: Self::file_size(&dir.join(PRE_JOB_FILE))?,
            post_job: Self::file_size(&dir.join(POST_JOB_FILE))?,
        }))
    }

    fn read(&self, name: &str) -> Result<Option<TelemetrySnapshot>, TelemetryError> {
        let dir = self.entry_dir(name);
        if !dir.is_dir() {
            return Ok(None);
        }
        Ok(Some(TelemetrySnapshot {
            installed: Self::read_item(&dir.join(INSTALLED_FILE))?,
            pre_job: Self::read_item(&dir.join(PRE_JOB_FILE))?,
            post_job: Self::read_item(&dir.join(POST_JOB_FILE))?,
        }))
    }

    fn archive_and_delete(&self, name: &str) -> Result<(), TelemetryError> {
        let dir = self.entry_dir(name);
        if !dir.is_dir() {
            return Ok(());
        }

        let stamp = chrono::Utc::now().timestamp();
        let mut target = self.quarantine.join(format!("{}-{}", name, stamp));
        let mut attempt = 0;
        while target.exists() {
            attempt += 1;
            target = self.quarantine.join(format!("{}-{}-{}", name, stamp, attempt));
        }

        fs::rename(&dir, &target)?;
        debug!(runner = %name, target = %target.display(), "Telemetry entry quarantined");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), TelemetryError> {
        match fs::remove_dir_all(self.entry_dir(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
