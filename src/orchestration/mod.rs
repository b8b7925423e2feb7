//! Hierarchical orchestration: Strategy → Phase → Stage → Step.
//!
//! # Architecture
//!
//! Each level is a state machine that applies its children in order, folds
//! their outcomes into its own through [`crate::state::lattice`], and owns
//! the timers for its current child. Work flows down through `apply`;
//! completion flows back up as return values ([`Progress`], `Option<Outcome>`
//! and [`EventDisposition`]), so a child never holds a reference to its
//! parent.
//!
//! Timers and persistence are not owned by the engine. Every call receives a
//! [`Context`] lending a [`TimerService`](crate::timers::TimerService) and a
//! [`StrategyHost`].
//!
//! # Invariants
//!
//! - Children are applied strictly in index order; a failing child stops the
//!   sequence.
//! - Arming a new timer for a child always deletes the previous one first.
//! - A unit that finalizes has disarmed all of its own timers.
//!
//! [`Progress`]: crate::types::Progress
//! [`EventDisposition`]: crate::types::EventDisposition

pub mod context;
pub mod error;
pub mod phase;
pub mod stage;
pub mod step;
pub mod strategy;

use std::time::Duration;

pub use context::{Context, SaveCounter, StrategyHost};
pub use error::{RecordError, StrategyError};
pub use phase::{Phase, PhaseKind, PhaseRecord};
pub use stage::{Stage, StageRecord};
pub use step::{BasicStep, Step, StepEvent, StepInfo, StepRecord};
pub use strategy::{Strategy, StrategyRecord, StrategyState};

/// Added to every non-zero aggregate budget so that a child's own timer
/// fires before its parent's.
pub const TIMEOUT_SLACK: Duration = Duration::from_secs(1);

/// Sums child budgets and adds [`TIMEOUT_SLACK`] unless the sum is zero.
pub(crate) fn with_slack(budgets: impl Iterator<Item = Duration>) -> Duration {
    let total: Duration = budgets.sum();
    if total.is_zero() {
        total
    } else {
        total + TIMEOUT_SLACK
    }
}
