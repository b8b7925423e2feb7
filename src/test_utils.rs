//! Shared test utilities: scripted steps, a timer/host harness and
//! arbitrary generators for property-based testing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use crate::orchestration::{Context, SaveCounter, Step, StepEvent, StepInfo, StepRecord};
use crate::timers::TimerWheel;
use crate::types::{EventDisposition, Outcome, StrategyResult, TimerId};

/// Installs a `tracing` subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Ordered log of calls made on scripted steps, shared across clones.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries with the given prefix, prefix stripped.
    pub fn calls(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

/// A step whose behaviour is fixed up front.
#[derive(Debug)]
pub struct ScriptedStep {
    info: StepInfo,
    apply_outcome: Outcome,
    timeout_outcome: Outcome,
    compensation: Vec<String>,
    event: Option<(String, EventDisposition)>,
    log: CallLog,
}

impl ScriptedStep {
    pub fn returning(name: &str, outcome: Outcome) -> Self {
        ScriptedStep {
            info: StepInfo::new(name),
            apply_outcome: outcome,
            timeout_outcome: Outcome::timed_out(format!("{name} timed out")),
            compensation: Vec::new(),
            event: None,
            log: CallLog::new(),
        }
    }

    pub fn succeeding(name: &str) -> Self {
        Self::returning(name, Outcome::success())
    }

    pub fn waiting(name: &str) -> Self {
        Self::returning(name, Outcome::wait())
    }

    /// Rebuilds a waiting step from its record.
    pub fn from_record(record: &StepRecord) -> Self {
        let mut step = Self::waiting(&record.name);
        step.info = StepInfo::from_record(record);
        step
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.info.timeout = timeout;
        self
    }

    pub fn with_timeout_outcome(mut self, outcome: Outcome) -> Self {
        self.timeout_outcome = outcome;
        self
    }

    /// On abort, returns succeeding steps with these names.
    pub fn with_compensation(mut self, names: &[&str]) -> Self {
        self.compensation = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Responds to the named event with `disposition`.
    pub fn on_event(mut self, name: &str, disposition: EventDisposition) -> Self {
        self.event = Some((name.to_string(), disposition));
        self
    }

    pub fn with_log(mut self, log: &CallLog) -> Self {
        self.log = log.clone();
        self
    }

    pub fn boxed(self) -> Box<dyn Step> {
        Box::new(self)
    }
}

impl Step for ScriptedStep {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }

    fn apply(&mut self) -> Outcome {
        self.log.push(format!("apply:{}", self.info.name));
        self.apply_outcome.clone()
    }

    fn timeout(&mut self) -> Outcome {
        self.log.push(format!("timeout:{}", self.info.name));
        self.timeout_outcome.clone()
    }

    fn abort(&mut self) -> Vec<Box<dyn Step>> {
        self.log.push(format!("abort:{}", self.info.name));
        self.compensation
            .iter()
            .map(|name| ScriptedStep::succeeding(name).with_log(&self.log).boxed())
            .collect()
    }

    fn handle_event(&mut self, event: &StepEvent) -> EventDisposition {
        match &self.event {
            Some((name, disposition)) if *name == event.name => {
                self.log.push(format!("event:{}", self.info.name));
                disposition.clone()
            }
            _ => EventDisposition::Ignored,
        }
    }
}

/// Owns a timer wheel and a save-counting host, and lends them as a
/// [`Context`].
#[derive(Debug)]
pub struct Harness {
    pub timers: TimerWheel,
    pub host: SaveCounter,
}

impl Harness {
    pub fn new() -> Self {
        Harness {
            timers: TimerWheel::new(Instant::now()),
            host: SaveCounter::new(),
        }
    }

    pub fn ctx(&mut self) -> Context<'_> {
        Context::new(&mut self.timers, &mut self.host)
    }

    /// Advances the wheel clock by `after` and returns the ids that fired.
    pub fn advance(&mut self, after: Duration) -> Vec<TimerId> {
        let now = self.timers.now() + after;
        self.timers.expire(now)
    }
}

pub fn arb_result() -> impl Strategy<Value = StrategyResult> {
    prop_oneof![
        Just(StrategyResult::Initial),
        Just(StrategyResult::InProgress),
        Just(StrategyResult::Wait),
        Just(StrategyResult::Success),
        Just(StrategyResult::Degraded),
        Just(StrategyResult::Failed),
        Just(StrategyResult::TimedOut),
        Just(StrategyResult::Aborting),
        Just(StrategyResult::Aborted),
    ]
}

pub fn arb_outcome() -> impl Strategy<Value = Outcome> {
    (arb_result(), "[a-z ]{0,16}").prop_map(|(result, reason)| Outcome::new(result, reason))
}
