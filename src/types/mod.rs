//! Core domain types for the orchestration engine.
//!
//! This module contains the identifiers, the result vocabulary and the
//! control-flow values shared by the stage, phase and strategy machines.

pub mod ids;
pub mod progress;
pub mod result;

// Re-export commonly used types at the module level
pub use ids::{StrategyId, TimerId};
pub use progress::{EventDisposition, Progress};
pub use result::{Outcome, StrategyResult};
