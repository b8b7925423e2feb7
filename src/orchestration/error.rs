//! Errors surfaced by the orchestration API.
//!
//! State transitions themselves never fail: a failed step is an outcome,
//! not an error. These types cover requests the strategy refuses and
//! records that cannot be reassembled.

use thiserror::Error;

/// An apply or abort request the strategy refused.
///
/// The display strings are the reasons reported back to operators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    #[error("strategy has not been built")]
    NotBuilt,

    /// Build did not reach ready-to-apply; carries the build phase reason.
    #[error("{0}")]
    BuildNotReady(String),

    #[error("apply of stage id {stage_id} failed: {reason}")]
    StageApplyBlocked { stage_id: usize, reason: String },

    #[error("invalid stage id {stage_id} for the apply, total-stages are {total_stages}")]
    InvalidStageId { stage_id: usize, total_stages: usize },

    #[error("apply already completed")]
    ApplyCompleted,

    #[error("apply already inprogress")]
    ApplyInProgress,

    #[error("apply already complete for stage id {0}")]
    StageAlreadyApplied(usize),

    #[error("stage id {stage_id} is not the next stage to be applied, next-stage = {next_stage}")]
    NotNextStage { stage_id: usize, next_stage: usize },

    #[error("apply not supported during an abort")]
    ApplyDuringAbort,

    #[error("apply of stage id {0} not supported during an abort")]
    StageApplyDuringAbort(usize),

    #[error("apply not inprogress for stage id {0}")]
    StageNotInProgress(usize),

    #[error("apply not inprogress")]
    ApplyNotInProgress,
}

/// A persisted record that does not fit the children supplied for it.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("{unit} expects {expected} children, got {got}")]
    ChildCountMismatch {
        unit: String,
        expected: usize,
        got: usize,
    },

    #[error("{unit} cursor {cursor} out of range for {len} children")]
    CursorOutOfRange {
        unit: String,
        cursor: usize,
        len: usize,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
