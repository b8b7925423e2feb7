//! Strategy Engine - hierarchical orchestration of long-running rollouts.
//!
//! A [`Strategy`](orchestration::Strategy) owns three phases (build, apply,
//! abort); a phase runs an ordered list of stages; a stage runs an ordered
//! list of steps. Steps may finish synchronously or park the hierarchy until
//! a completion, an event or a timer arrives. Failures and timeouts fold
//! upward through a result lattice, and an aborted apply is undone by the
//! compensating stages its steps provide.
//!
//! The engine is synchronous and single-threaded. [`worker`] runs a strategy
//! as a tokio task, and [`persistence`] stores its records.

pub mod orchestration;
pub mod persistence;
pub mod state;
pub mod timers;
pub mod types;
pub mod worker;

#[cfg(test)]
mod test_utils;
