//! In-memory timer service.
//!
//! The wheel does not sleep by itself. The driver asks for
//! [`next_deadline`](TimerWheel::next_deadline), sleeps until then, and
//! calls [`expire`](TimerWheel::expire) to collect the ids that came due.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{TimerKind, TimerService};
use crate::types::TimerId;

#[derive(Debug, Clone)]
struct ArmedTimer {
    name: String,
    kind: TimerKind,
    interval: Duration,
    deadline: Instant,
}

/// Deterministic timer service keyed by deadline.
///
/// Time only moves when [`expire`](Self::expire) is called, which keeps the
/// wheel usable in synchronous tests.
#[derive(Debug)]
pub struct TimerWheel {
    now: Instant,
    last_id: u64,
    armed: BTreeMap<TimerId, ArmedTimer>,
}

impl TimerWheel {
    /// Creates an empty wheel whose clock starts at `now`.
    pub fn new(now: Instant) -> Self {
        TimerWheel {
            now,
            last_id: 0,
            armed: BTreeMap::new(),
        }
    }

    /// The last instant observed by the wheel.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Earliest deadline among the armed timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.values().map(|t| t.deadline).min()
    }

    /// Advances the clock to `now` and returns the ids that came due, in
    /// deadline order.
    ///
    /// Periodic timers are re-armed one interval after `now`; a timer with a
    /// zero interval fires once and is removed.
    pub fn expire(&mut self, now: Instant) -> Vec<TimerId> {
        if now > self.now {
            self.now = now;
        }

        let mut due: Vec<(Instant, TimerId)> = self
            .armed
            .iter()
            .filter(|(_, t)| t.deadline <= self.now)
            .map(|(id, t)| (t.deadline, *id))
            .collect();
        due.sort();

        for (_, id) in &due {
            let rearm = match self.armed.get_mut(id) {
                Some(timer) if !timer.interval.is_zero() => {
                    timer.deadline = self.now + timer.interval;
                    true
                }
                _ => false,
            };
            if !rearm {
                self.armed.remove(id);
            }
        }

        if !due.is_empty() {
            trace!(count = due.len(), "timers expired");
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Returns true if `id` is still armed.
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.armed.contains_key(&id)
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Armed timers with their name, kind and interval, in id order.
    pub fn armed(&self) -> impl Iterator<Item = (TimerId, &str, TimerKind, Duration)> {
        self.armed
            .iter()
            .map(|(id, t)| (*id, t.name.as_str(), t.kind, t.interval))
    }

    /// Armed timers of one kind.
    pub fn armed_of_kind(&self, kind: TimerKind) -> Vec<TimerId> {
        self.armed
            .iter()
            .filter(|(_, t)| t.kind == kind)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Interval of an armed timer.
    pub fn interval(&self, id: TimerId) -> Option<Duration> {
        self.armed.get(&id).map(|t| t.interval)
    }
}

impl TimerService for TimerWheel {
    fn create_timer(
        &mut self,
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        kind: TimerKind,
    ) -> TimerId {
        self.last_id += 1;
        let id = TimerId(self.last_id);
        self.armed.insert(
            id,
            ArmedTimer {
                name: name.to_string(),
                kind,
                interval,
                deadline: self.now + initial_delay,
            },
        );
        debug!(timer = %id, name, %kind, delay_secs = initial_delay.as_secs(), "timer armed");
        id
    }

    fn delete_timer(&mut self, id: TimerId) {
        if self.armed.remove(&id).is_some() {
            debug!(timer = %id, "timer deleted");
        }
    }

    fn reschedule_timer(&mut self, id: TimerId, delay: Duration) {
        match self.armed.get_mut(&id) {
            Some(timer) => {
                timer.interval = delay;
                timer.deadline = self.now + delay;
                debug!(timer = %id, delay_secs = delay.as_secs(), "timer rescheduled");
            }
            None => warn!(timer = %id, "reschedule of unknown timer"),
        }
    }
}
