//! Messages accepted by a strategy worker.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::orchestration::{StepEvent, StrategyError, StrategyRecord};
use crate::types::Outcome;

/// Reply to an apply or abort request.
pub type CommandReply = oneshot::Sender<Result<(), StrategyError>>;

/// Messages that can be sent to a strategy worker.
///
/// Workers receive these via `tokio::sync::mpsc` and handle them one at a
/// time, so the strategy never sees two operations interleave.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Start the build phase.
    Build,

    /// Apply all remaining stages, or only the given one.
    Apply {
        stage_id: Option<usize>,
        reply: CommandReply,
    },

    /// Abort the apply phase, optionally naming the running stage.
    Abort {
        stage_id: Option<usize>,
        reply: CommandReply,
    },

    /// The step the strategy is waiting on finished.
    StepComplete(Outcome),

    /// An out-of-band event for the current step.
    Event(StepEvent),

    /// Give the current step a new timeout.
    ExtendStepTimeout(Duration),

    /// Request the current record.
    Snapshot { reply: oneshot::Sender<StrategyRecord> },

    /// Stop the event loop after the current message.
    Shutdown,
}

impl WorkerMessage {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Build => "build",
            WorkerMessage::Apply { .. } => "apply",
            WorkerMessage::Abort { .. } => "abort",
            WorkerMessage::StepComplete(_) => "step_complete",
            WorkerMessage::Event(_) => "event",
            WorkerMessage::ExtendStepTimeout(_) => "extend_step_timeout",
            WorkerMessage::Snapshot { .. } => "snapshot",
            WorkerMessage::Shutdown => "shutdown",
        }
    }
}
