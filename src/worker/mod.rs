//! Async driver for a single strategy.
//!
//! The engine itself is synchronous: every operation runs to its next
//! suspension point and returns. This module owns a strategy together with
//! its timer wheel and snapshot sink and runs it as a tokio task, serialising
//! commands, step completions, events and timer expiries.
//!
//! # Event Loop
//!
//! Each iteration waits on one of:
//! - the shutdown [`CancellationToken`](tokio_util::sync::CancellationToken)
//! - the next [`WorkerMessage`]
//! - the earliest armed timer deadline (or the idle wake interval)
//!
//! After every message or timer batch, a strategy that asked to be saved is
//! handed to the [`SnapshotSink`](crate::persistence::SnapshotSink).
//!
//! # Module Structure
//!
//! - [`message`]: messages accepted by the worker
//! - [`config`]: channel capacity and idle wake interval
//! - [`worker`]: the event loop and its handle

mod config;
mod message;
mod worker;

pub use config::WorkerConfig;
pub use message::WorkerMessage;
pub use worker::{StrategyWorker, WorkerError, WorkerHandle, spawn_worker};
