//! Worker configuration.

use std::time::Duration;

/// Default capacity of the worker's message channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default wake interval when no timer is armed (60 seconds).
const DEFAULT_IDLE_WAKE_SECS: u64 = 60;

/// Configuration for a strategy worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Capacity of the bounded message channel.
    ///
    /// Default: 64. Configure via `STRATEGY_WORKER_CHANNEL_CAPACITY`.
    pub channel_capacity: usize,

    /// How long the loop sleeps when no timer is armed.
    ///
    /// Default: 60 seconds. Configure via `STRATEGY_WORKER_IDLE_WAKE_SECS`.
    pub idle_wake: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerConfig {
    /// Creates a `WorkerConfig` with default values.
    pub fn new() -> Self {
        WorkerConfig {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            idle_wake: Duration::from_secs(DEFAULT_IDLE_WAKE_SECS),
        }
    }

    /// Creates a `WorkerConfig` from environment variables.
    ///
    /// Missing, unparseable or zero values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let positive = |key: &str| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .filter(|&n| n > 0)
        };

        let channel_capacity = positive("STRATEGY_WORKER_CHANNEL_CAPACITY")
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let idle_wake_secs =
            positive("STRATEGY_WORKER_IDLE_WAKE_SECS").unwrap_or(DEFAULT_IDLE_WAKE_SECS);

        WorkerConfig {
            channel_capacity,
            idle_wake: Duration::from_secs(idle_wake_secs),
        }
    }
}
