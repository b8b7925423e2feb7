//! Snapshot persistence for strategies.
//!
//! The engine only ever asks its host to save; this module is the host's
//! side of that request. A [`SnapshotSink`] receives the strategy's record
//! after each batch of work and decides where it goes.
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/
//!   <strategy-id>.json       # latest snapshot (schema-versioned envelope)
//!   <strategy-id>.json.tmp   # only present while a write is in flight
//! ```
//!
//! # Crash Safety
//!
//! Snapshots are written with write-to-temp-then-rename, and both the file
//! and its directory are fsynced, so a reader sees either the previous or
//! the new snapshot.

pub mod fsync;
pub mod snapshot;

pub use fsync::{fsync_dir, fsync_file};
pub use snapshot::{
    JsonFileSink, MemorySink, PersistedStrategy, SCHEMA_VERSION, SnapshotError, SnapshotSink,
    load_snapshot, save_snapshot_atomic, try_load_snapshot,
};
