//! Result vocabulary shared by every level of the hierarchy.
//!
//! A [`StrategyResult`] is the coarse status of a step, stage, phase or
//! strategy. An [`Outcome`] pairs it with a human-readable reason. How child
//! outcomes fold into an aggregate is defined by the lattice in
//! [`crate::state::lattice`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a unit of work.
///
/// Wire strings are stable: they appear in persisted records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyResult {
    /// Not started.
    #[default]
    Initial,
    /// Started and currently executing.
    #[serde(rename = "inprogress")]
    InProgress,
    /// Suspended, waiting on an external completion signal.
    Wait,
    /// Finished successfully.
    Success,
    /// Finished with a non-fatal problem.
    Degraded,
    /// Finished unsuccessfully.
    Failed,
    /// Did not finish within its time budget.
    TimedOut,
    /// Abort requested, still winding down.
    Aborting,
    /// Aborted.
    Aborted,
}

impl StrategyResult {
    /// Returns the wire name of this result.
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyResult::Initial => "initial",
            StrategyResult::InProgress => "inprogress",
            StrategyResult::Wait => "wait",
            StrategyResult::Success => "success",
            StrategyResult::Degraded => "degraded",
            StrategyResult::Failed => "failed",
            StrategyResult::TimedOut => "timed-out",
            StrategyResult::Aborting => "aborting",
            StrategyResult::Aborted => "aborted",
        }
    }

    /// Returns true for results that describe finished work.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StrategyResult::Success
                | StrategyResult::Degraded
                | StrategyResult::Failed
                | StrategyResult::TimedOut
                | StrategyResult::Aborted
        )
    }

    /// Returns true for results that stop a sequence of siblings.
    pub fn is_failing(self) -> bool {
        matches!(
            self,
            StrategyResult::Failed | StrategyResult::Aborted | StrategyResult::TimedOut
        )
    }

    /// Returns true for step results counted by completion percentages.
    ///
    /// Identical to [`is_terminal`](Self::is_terminal) today; kept separate
    /// because the percentage is a reporting concern.
    pub fn counts_as_completed(self) -> bool {
        self.is_terminal()
    }

    /// Returns true for SUCCESS or DEGRADED.
    pub fn is_success_like(self) -> bool {
        matches!(self, StrategyResult::Success | StrategyResult::Degraded)
    }
}

impl fmt::Display for StrategyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A result paired with its reason.
///
/// The reason is empty for routine transitions and carries the child's
/// explanation whenever an aggregate adopts a child's result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outcome {
    pub result: StrategyResult,
    pub reason: String,
}

impl Outcome {
    /// Creates an outcome from its parts.
    pub fn new(result: StrategyResult, reason: impl Into<String>) -> Self {
        Outcome {
            result,
            reason: reason.into(),
        }
    }

    pub fn initial() -> Self {
        Outcome::new(StrategyResult::Initial, "")
    }

    pub fn in_progress() -> Self {
        Outcome::new(StrategyResult::InProgress, "")
    }

    pub fn wait() -> Self {
        Outcome::new(StrategyResult::Wait, "")
    }

    pub fn success() -> Self {
        Outcome::new(StrategyResult::Success, "")
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Outcome::new(StrategyResult::Degraded, reason)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::new(StrategyResult::Failed, reason)
    }

    pub fn timed_out(reason: impl Into<String>) -> Self {
        Outcome::new(StrategyResult::TimedOut, reason)
    }

    pub fn aborting() -> Self {
        Outcome::new(StrategyResult::Aborting, "")
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Outcome::new(StrategyResult::Aborted, reason)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.result)
        } else {
            write!(f, "{} ({})", self.result, self.reason)
        }
    }
}
