//! Result lattice for folding child outcomes into an aggregate.
//!
//! Each level of the hierarchy owns its own table. The three tables are
//! identical today but are kept separate so that one level can change its
//! precedence without touching the others.
//!
//! # Rules
//!
//! - A WAIT aggregate never changes.
//! - Otherwise the aggregate adopts the child's outcome (result and reason)
//!   only when the child is strictly worse, with the order
//!   `INITIAL < IN_PROGRESS < SUCCESS < DEGRADED < {FAILED, TIMED_OUT,
//!   ABORTED, ABORTING}`.
//! - Once FAILED, TIMED_OUT, ABORTING or ABORTED, the aggregate is sticky.
//!
//! A child of WAIT, INITIAL or IN_PROGRESS never overrides a started
//! aggregate, except that an INITIAL aggregate picks up IN_PROGRESS.

use crate::types::{Outcome, StrategyResult};

/// Folds a step outcome into its stage's aggregate.
pub fn merge_into_stage(stage: &Outcome, step: &Outcome) -> Outcome {
    use StrategyResult::*;

    let adopt = match stage.result {
        // === Suspended aggregate ===
        Wait => false,

        // === Open aggregates ===
        Initial => matches!(
            step.result,
            Aborting | Aborted | TimedOut | Failed | Degraded | Success | InProgress
        ),
        InProgress => matches!(
            step.result,
            Aborting | Aborted | TimedOut | Failed | Degraded | Success
        ),
        Success => matches!(step.result, Aborting | Aborted | TimedOut | Failed | Degraded),
        Degraded => matches!(step.result, Aborting | Aborted | TimedOut | Failed),

        // === Sticky aggregates ===
        Failed | TimedOut | Aborting | Aborted => false,
    };

    if adopt { step.clone() } else { stage.clone() }
}

/// Folds a stage outcome into its phase's aggregate.
pub fn merge_into_phase(phase: &Outcome, stage: &Outcome) -> Outcome {
    use StrategyResult::*;

    let adopt = match phase.result {
        // === Suspended aggregate ===
        Wait => false,

        // === Open aggregates ===
        Initial => matches!(
            stage.result,
            Aborting | Aborted | TimedOut | Failed | Degraded | Success | InProgress
        ),
        InProgress => matches!(
            stage.result,
            Aborting | Aborted | TimedOut | Failed | Degraded | Success
        ),
        Success => matches!(stage.result, Aborting | Aborted | TimedOut | Failed | Degraded),
        Degraded => matches!(stage.result, Aborting | Aborted | TimedOut | Failed),

        // === Sticky aggregates ===
        Failed | TimedOut | Aborting | Aborted => false,
    };

    if adopt { stage.clone() } else { phase.clone() }
}

/// Folds a phase outcome into the strategy's aggregate.
///
/// The strategy calls this with an INITIAL aggregate to normalise a phase
/// outcome before driving its own state machine.
pub fn merge_into_strategy(strategy: &Outcome, phase: &Outcome) -> Outcome {
    use StrategyResult::*;

    let adopt = match strategy.result {
        // === Suspended aggregate ===
        Wait => false,

        // === Open aggregates ===
        Initial => matches!(
            phase.result,
            Aborting | Aborted | TimedOut | Failed | Degraded | Success | InProgress
        ),
        InProgress => matches!(
            phase.result,
            Aborting | Aborted | TimedOut | Failed | Degraded | Success
        ),
        Success => matches!(phase.result, Aborting | Aborted | TimedOut | Failed | Degraded),
        Degraded => matches!(phase.result, Aborting | Aborted | TimedOut | Failed),

        // === Sticky aggregates ===
        Failed | TimedOut | Aborting | Aborted => false,
    };

    if adopt { phase.clone() } else { strategy.clone() }
}
