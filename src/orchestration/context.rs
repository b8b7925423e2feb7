//! Execution context passed down every orchestration call.
//!
//! The engine never owns its timers or its persistence. The driver lends
//! both for the duration of a call through [`Context`], and receives
//! completion notifications through [`StrategyHost`].

use std::time::Duration;

use tracing::info;

use crate::timers::{TimerKind, TimerService};
use crate::types::{Outcome, TimerId};

/// Owner-side hooks: persistence and completion observers.
pub trait StrategyHost {
    /// Requests that the strategy be persisted.
    fn save(&mut self);

    /// The build phase finished.
    fn build_complete(&mut self, _outcome: &Outcome) {}

    /// The apply phase finished.
    fn apply_complete(&mut self, _outcome: &Outcome) {}

    /// The abort finished, either by running the abort phase or directly.
    fn abort_complete(&mut self, _outcome: &Outcome) {}
}

/// A host that counts save requests and records completions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SaveCounter {
    saves: u64,
    pub build_completions: Vec<Outcome>,
    pub apply_completions: Vec<Outcome>,
    pub abort_completions: Vec<Outcome>,
}

impl SaveCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save requests seen since the last [`take_saves`](Self::take_saves).
    pub fn saves(&self) -> u64 {
        self.saves
    }

    /// Returns and resets the pending save count.
    pub fn take_saves(&mut self) -> u64 {
        std::mem::take(&mut self.saves)
    }
}

impl StrategyHost for SaveCounter {
    fn save(&mut self) {
        self.saves += 1;
    }

    fn build_complete(&mut self, outcome: &Outcome) {
        self.build_completions.push(outcome.clone());
    }

    fn apply_complete(&mut self, outcome: &Outcome) {
        self.apply_completions.push(outcome.clone());
    }

    fn abort_complete(&mut self, outcome: &Outcome) {
        self.abort_completions.push(outcome.clone());
    }
}

/// Timer service and host borrowed for one engine call.
pub struct Context<'a> {
    pub timers: &'a mut dyn TimerService,
    pub host: &'a mut dyn StrategyHost,
}

impl<'a> Context<'a> {
    pub fn new(timers: &'a mut dyn TimerService, host: &'a mut dyn StrategyHost) -> Self {
        Context { timers, host }
    }

    /// Arms a periodic timer that first fires after `timeout`.
    pub(crate) fn arm(&mut self, name: &str, timeout: Duration, kind: TimerKind) -> TimerId {
        self.timers.create_timer(name, timeout, timeout, kind)
    }

    /// Deletes the timer in `slot`, if any, leaving the slot empty.
    pub(crate) fn disarm(&mut self, slot: &mut Option<TimerId>) {
        if let Some(id) = slot.take() {
            self.timers.delete_timer(id);
        }
    }

    /// Forwards a save request when the unit has an owner.
    pub(crate) fn save_for(&mut self, unit: &str, owner: Option<&str>) {
        match owner {
            Some(_) => self.host.save(),
            None => info!(unit, "no owner reference, save skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timers::TimerWheel;
    use tokio::time::Instant;

    #[test]
    fn save_without_owner_is_skipped() {
        let mut timers = TimerWheel::new(Instant::now());
        let mut host = SaveCounter::new();
        let mut ctx = Context::new(&mut timers, &mut host);
        ctx.save_for("stage-1", None);
        ctx.save_for("stage-1", Some("apply"));
        assert_eq!(host.saves(), 1);
    }

    #[test]
    fn disarm_clears_slot_and_timer() {
        let mut timers = TimerWheel::new(Instant::now());
        let mut host = SaveCounter::new();
        let mut slot = {
            let mut ctx = Context::new(&mut timers, &mut host);
            let id = ctx.arm("t", Duration::from_secs(5), TimerKind::Stage);
            let mut slot = Some(id);
            ctx.disarm(&mut slot);
            slot
        };
        assert!(slot.take().is_none());
        assert!(timers.is_empty());
    }

    #[test]
    fn take_saves_resets_counter() {
        let mut host = SaveCounter::new();
        host.save();
        host.save();
        assert_eq!(host.take_saves(), 2);
        assert_eq!(host.saves(), 0);
    }
}
