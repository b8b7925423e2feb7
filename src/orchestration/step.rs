//! The step contract consumed by stages.
//!
//! Concrete steps (lock hosts, upgrade, wait for alarms, ...) live with the
//! owner of the engine. A stage only relies on the [`Step`] trait: it
//! applies steps in order, arms their timeouts, routes events to them and
//! collects compensating steps on abort.
//!
//! # Synchronous and asynchronous steps
//!
//! A synchronous step returns its final outcome from [`Step::apply`]. An
//! asynchronous step returns WAIT and later finishes through one of:
//! - the owner calling `step_complete` on the strategy/phase/stage,
//! - an event routed to [`Step::handle_event`] that returns
//!   [`EventDisposition::Completed`],
//! - its timeout firing, which consults [`Step::timeout`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::types::{EventDisposition, Outcome, StrategyResult};

/// An out-of-band notification routed to the current step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    /// Event name, e.g. `host-lock-failed`.
    pub name: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl StepEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        StepEvent {
            name: name.into(),
            data,
        }
    }
}

/// Bookkeeping common to every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    /// Position within the owning stage, assigned by `Stage::add_step`.
    pub id: usize,
    pub name: String,
    pub force_pass: bool,
    /// Zero means the step is never timed out.
    pub timeout: Duration,
    pub max_retries: u32,
    pub outcome: Outcome,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl StepInfo {
    pub fn new(name: impl Into<String>) -> Self {
        StepInfo {
            id: 0,
            name: name.into(),
            force_pass: false,
            timeout: Duration::ZERO,
            max_retries: 1,
            outcome: Outcome::initial(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_force_pass(mut self, force_pass: bool) -> Self {
        self.force_pass = force_pass;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Rebuilds the common fields from a persisted record.
    pub fn from_record(record: &StepRecord) -> Self {
        StepInfo {
            id: record.id,
            name: record.name.clone(),
            force_pass: record.force_pass,
            timeout: Duration::from_secs(record.timeout),
            max_retries: record.max_retries,
            outcome: Outcome::new(record.result, record.result_reason.clone()),
            start_time: record.start_time,
            end_time: record.end_time,
        }
    }

    /// Persisted form of the common fields, with no extra payload.
    pub fn record(&self) -> StepRecord {
        StepRecord {
            id: self.id,
            name: self.name.clone(),
            force_pass: self.force_pass,
            timeout: self.timeout.as_secs(),
            max_retries: self.max_retries,
            result: self.outcome.result,
            result_reason: self.outcome.reason.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            extra: Value::Null,
        }
    }
}

/// Persisted form of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: usize,
    pub name: String,
    pub force_pass: bool,
    /// Seconds.
    pub timeout: u64,
    pub max_retries: u32,
    pub result: StrategyResult,
    pub result_reason: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Step-specific fields (entity lists, retry counters, ...).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

/// A unit of work applied by a stage.
///
/// Every method except the accessors has a default matching a step that
/// succeeds immediately and needs no compensation.
pub trait Step: fmt::Debug + Send {
    fn info(&self) -> &StepInfo;

    fn info_mut(&mut self) -> &mut StepInfo;

    /// Starts the step. Returning WAIT suspends the stage until the step
    /// completes asynchronously.
    fn apply(&mut self) -> Outcome {
        debug!(step = %self.info().name, "default apply");
        Outcome::success()
    }

    /// Called when the step's timer fires. Returning anything other than
    /// TIMED_OUT lets the stage continue as if the step had completed.
    fn timeout(&mut self) -> Outcome {
        Outcome::timed_out("")
    }

    /// Returns the steps that undo this one, in execution order.
    fn abort(&mut self) -> Vec<Box<dyn Step>> {
        Vec::new()
    }

    /// Filters an asynchronous completion before the stage records it.
    fn complete(&mut self, outcome: Outcome) -> Outcome {
        outcome
    }

    fn handle_event(&mut self, _event: &StepEvent) -> EventDisposition {
        EventDisposition::Ignored
    }

    /// Persisted form. Steps with private state override this to fill
    /// [`StepRecord::extra`].
    fn record(&self) -> StepRecord {
        self.info().record()
    }

    fn name(&self) -> &str {
        &self.info().name
    }

    fn outcome(&self) -> &Outcome {
        &self.info().outcome
    }

    fn result(&self) -> StrategyResult {
        self.info().outcome.result
    }

    fn timeout_duration(&self) -> Duration {
        self.info().timeout
    }
}

/// A step with the default behaviour: succeeds on apply.
///
/// Useful as a placeholder and for rebuilding steps whose concrete type has
/// no private state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicStep {
    info: StepInfo,
}

impl BasicStep {
    pub fn new(info: StepInfo) -> Self {
        BasicStep { info }
    }

    pub fn from_record(record: &StepRecord) -> Self {
        BasicStep {
            info: StepInfo::from_record(record),
        }
    }
}

impl Step for BasicStep {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }
}
