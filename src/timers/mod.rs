//! Timer service abstraction.
//!
//! The orchestration layer arms one-shot-or-periodic timers for phase, stage
//! and step timeouts and identifies them by [`TimerId`]. The driver owns the
//! service, and when a timer expires it hands the id back to
//! [`Strategy::timer_fired`](crate::orchestration::Strategy::timer_fired).
//! Each level compares the id with the ids it armed itself, so ids that
//! were deleted or replaced in the meantime are recognised as stale.
//!
//! # Invariants
//!
//! - Ids are never reused by a service instance.
//! - Deleting an unknown id is a no-op.

pub mod wheel;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::TimerId;

pub use wheel::TimerWheel;

/// Which level of the hierarchy armed a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Whole-phase budget.
    Phase,
    /// A phase's timer on its current stage.
    PhaseStage,
    /// Whole-stage budget.
    Stage,
    /// A stage's timer on its current step.
    Step,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimerKind::Phase => "phase",
            TimerKind::PhaseStage => "phase_stage",
            TimerKind::Stage => "stage",
            TimerKind::Step => "step",
        };
        f.write_str(s)
    }
}

/// A service that arms periodic timers.
///
/// A timer first fires after `initial_delay` and then every `interval`
/// until it is deleted.
pub trait TimerService {
    /// Arms a timer and returns its handle.
    fn create_timer(
        &mut self,
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        kind: TimerKind,
    ) -> TimerId;

    /// Disarms a timer. Unknown ids are ignored.
    fn delete_timer(&mut self, id: TimerId);

    /// Restarts a timer so that it next fires after `delay`, and every
    /// `delay` thereafter.
    fn reschedule_timer(&mut self, id: TimerId, delay: Duration);
}
