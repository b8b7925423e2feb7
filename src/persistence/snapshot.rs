//! Strategy snapshots.
//!
//! A snapshot is the strategy's [`StrategyRecord`] wrapped in a small
//! envelope carrying a schema version and the time it was taken.
//!
//! # Atomic Writes
//!
//! 1. Write to `<id>.json.tmp`
//! 2. fsync the file
//! 3. Rename to `<id>.json`
//! 4. fsync the directory

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::fsync::{fsync_dir, fsync_file};
use crate::orchestration::StrategyRecord;
use crate::types::StrategyId;

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// On-disk envelope around a strategy record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStrategy {
    /// Schema version for forward-compatible migrations.
    pub schema_version: u32,

    pub snapshot_at: DateTime<Utc>,

    pub strategy: StrategyRecord,
}

impl PersistedStrategy {
    pub fn new(strategy: StrategyRecord) -> Self {
        PersistedStrategy {
            schema_version: SCHEMA_VERSION,
            snapshot_at: Utc::now(),
            strategy,
        }
    }
}

/// Destination for strategy snapshots.
///
/// Called by the driver whenever the engine asked for a save. Errors are
/// reported to the caller but never change the engine's state.
pub trait SnapshotSink: Send {
    fn persist(&mut self, record: &StrategyRecord) -> Result<()>;
}

/// Writes each strategy to `<dir>/<strategy-id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonFileSink { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot for `id`.
    pub fn path_for(&self, id: &StrategyId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Loads the snapshot for `id`, if one was written.
    pub fn load(&self, id: &StrategyId) -> Result<Option<StrategyRecord>> {
        try_load_snapshot(&self.path_for(id))
    }
}

impl SnapshotSink for JsonFileSink {
    fn persist(&mut self, record: &StrategyRecord) -> Result<()> {
        let path = self.path_for(&record.id);
        save_snapshot_atomic(&path, &PersistedStrategy::new(record.clone()))?;
        debug!(strategy = %record.id, path = %path.display(), state = %record.state, "snapshot written");
        Ok(())
    }
}

/// Keeps the latest record in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    latest: Option<StrategyRecord>,
    writes: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&StrategyRecord> {
        self.latest.as_ref()
    }

    /// Number of records persisted so far.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl SnapshotSink for MemorySink {
    fn persist(&mut self, record: &StrategyRecord) -> Result<()> {
        self.latest = Some(record.clone());
        self.writes += 1;
        Ok(())
    }
}

/// Saves a snapshot atomically to disk.
///
/// # Errors
///
/// Returns an error if any IO operation fails.
pub fn save_snapshot_atomic(path: &Path, snapshot: &PersistedStrategy) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(snapshot)?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        fsync_file(&file)?;
    }

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }

    Ok(())
}

/// Loads the strategy record stored at `path`.
///
/// # Errors
///
/// Returns an error if the file can't be read, the JSON is malformed, or
/// the schema version differs from [`SCHEMA_VERSION`].
pub fn load_snapshot(path: &Path) -> Result<StrategyRecord> {
    let bytes = std::fs::read(path)?;
    let snapshot: PersistedStrategy = serde_json::from_slice(&bytes)?;

    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(SnapshotError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: snapshot.schema_version,
        });
    }

    Ok(snapshot.strategy)
}

/// Like [`load_snapshot`], but a missing file is `Ok(None)`.
pub fn try_load_snapshot(path: &Path) -> Result<Option<StrategyRecord>> {
    match load_snapshot(path) {
        Ok(record) => Ok(Some(record)),
        Err(SnapshotError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
