//! Pure state logic for the orchestration engine.
//!
//! This module contains the functional core shared by every level of the
//! hierarchy: how child outcomes fold into an aggregate. All timer and
//! persistence effects are handled by the orchestration layer.

pub mod lattice;

pub use lattice::{merge_into_phase, merge_into_stage, merge_into_strategy};
