//! Control-flow values returned by the orchestration entry points.
//!
//! Completion travels upward by return value: a child that finalizes during
//! a call hands its outcome back to the caller, which then runs its own
//! completion logic.

use super::result::Outcome;

/// What happened during an `apply` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Suspended on a child that returned WAIT.
    Waiting,
    /// Returned without finalizing.
    ///
    /// Either the unit was not eligible to run (already started and no longer
    /// in progress), or a partial apply reached its stop boundary.
    Stopped(Outcome),
    /// Finalized during this call.
    Completed(Outcome),
}

impl Progress {
    /// Returns the finalized outcome, if the unit completed.
    pub fn completed(self) -> Option<Outcome> {
        match self {
            Progress::Completed(outcome) => Some(outcome),
            Progress::Waiting | Progress::Stopped(_) => None,
        }
    }

    /// Returns true when the unit is suspended on a child.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Progress::Waiting)
    }
}

/// How an out-of-band event was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// Not relevant to the receiver.
    Ignored,
    /// Consumed, no completion resulted.
    Consumed,
    /// Consumed, and the receiver finalized with this outcome.
    Completed(Outcome),
}

impl EventDisposition {
    /// Returns true unless the event was ignored.
    pub fn is_consumed(&self) -> bool {
        !matches!(self, EventDisposition::Ignored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_extracts_outcome() {
        assert_eq!(
            Progress::Completed(Outcome::success()).completed(),
            Some(Outcome::success())
        );
        assert_eq!(Progress::Waiting.completed(), None);
        assert_eq!(Progress::Stopped(Outcome::in_progress()).completed(), None);
    }

    #[test]
    fn consumed_covers_completed() {
        assert!(!EventDisposition::Ignored.is_consumed());
        assert!(EventDisposition::Consumed.is_consumed());
        assert!(EventDisposition::Completed(Outcome::failed("x")).is_consumed());
    }
}
