//! Phase: an ordered sequence of stages with an optional stop boundary.
//!
//! # Architecture
//!
//! A phase mirrors a stage one level up. It applies stages in order, arms a
//! phase timer over the stages it is about to run, and arms a timer for the
//! stage it is waiting on. Stage completions arrive by return value from
//! the stage calls routed through the phase.
//!
//! # Partial apply
//!
//! `apply(Some(n))` runs stages `[current, n)` and stops there without
//! finalizing: the phase stays in progress and a later `apply` continues
//! with stage `n`. `apply(None)` runs to the end.
//!
//! # Invariants
//!
//! - `current_stage <= stop_at_stage <= stages.len()` once applied.
//! - Stopping at the boundary disarms the phase timers.
//! - A FAILED, TIMED_OUT or ABORTED aggregate finalizes the phase.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::context::Context;
use super::error::RecordError;
use super::stage::{Stage, StageRecord};
use super::step::StepEvent;
use super::with_slack;
use crate::state::merge_into_phase;
use crate::timers::TimerKind;
use crate::types::{EventDisposition, Outcome, Progress, StrategyResult, TimerId};

/// Persisted form of a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    /// Seconds.
    pub timeout: u64,
    pub in_progress: bool,
    pub completion_percentage: u8,
    pub current_stage: usize,
    pub stop_at_stage: usize,
    pub total_stages: usize,
    pub stages: Vec<StageRecord>,
    pub result: StrategyResult,
    pub result_reason: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// An ordered list of stages applied as one unit.
#[derive(Debug)]
pub struct Phase {
    name: String,
    stages: Vec<Stage>,
    current_stage: usize,
    stop_at_stage: usize,
    outcome: Outcome,
    timeout: Duration,
    in_progress: bool,
    timer_id: Option<TimerId>,
    stage_timer_id: Option<TimerId>,
    /// Name of the owning strategy. Non-owning: only used to decide whether
    /// save requests go anywhere.
    strategy: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Phase {
            name: name.into(),
            stages: Vec::new(),
            current_stage: 0,
            stop_at_stage: 0,
            outcome: Outcome::initial(),
            timeout: Duration::ZERO,
            in_progress: false,
            timer_id: None,
            stage_timer_id: None,
            strategy: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Creates a phase and adds `stages` in order.
    pub fn with_stages(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        let mut phase = Phase::new(name);
        for stage in stages {
            phase.add_stage(stage);
        }
        phase
    }

    /// Appends a stage, assigning its id and attaching it to this phase.
    pub fn add_stage(&mut self, mut stage: Stage) {
        stage.attach(self.stages.len(), &self.name);
        self.stages.push(stage);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn current_stage(&self) -> usize {
        self.current_stage
    }

    pub fn stop_at_stage(&self) -> usize {
        self.stop_at_stage
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn result(&self) -> StrategyResult {
        self.outcome.result
    }

    pub fn reason(&self) -> &str {
        &self.outcome.reason
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Raw in-progress flag. Stays set while paused at a stop boundary.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// True when the phase is in progress and its current stage is running.
    pub fn is_running_stage(&self) -> bool {
        self.in_progress
            && self
                .stages
                .get(self.current_stage)
                .is_some_and(Stage::is_in_progress)
    }

    /// True when a partial apply stopped at its boundary.
    pub fn is_paused(&self) -> bool {
        self.current_stage == self.stop_at_stage
    }

    pub fn is_success(&self) -> bool {
        self.outcome.result == StrategyResult::Success
    }

    pub fn is_degraded(&self) -> bool {
        self.outcome.result == StrategyResult::Degraded
    }

    pub fn is_failed(&self) -> bool {
        self.outcome.result == StrategyResult::Failed
    }

    pub fn is_timed_out(&self) -> bool {
        self.outcome.result == StrategyResult::TimedOut
    }

    pub fn is_aborted(&self) -> bool {
        self.outcome.result == StrategyResult::Aborted
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn strategy(&self) -> Option<&str> {
        self.strategy.as_deref()
    }

    /// Armed phase and stage timers, for inspection.
    pub fn timer_ids(&self) -> (Option<TimerId>, Option<TimerId>) {
        (self.timer_id, self.stage_timer_id)
    }

    pub(crate) fn attach(&mut self, strategy: &str) {
        self.strategy = Some(strategy.to_string());
    }

    /// Share of finished steps across all stages, in percent.
    ///
    /// Only counted while in progress; a phase that is not running, or has
    /// no steps, reports 100.
    pub fn completion_percentage(&self) -> u8 {
        let (completed, total) = if self.in_progress {
            self.stages.iter().fold((0usize, 0usize), |(c, t), stage| {
                (c + stage.completed_steps(), t + stage.steps().len())
            })
        } else {
            (0, 0)
        };

        if total == 0 {
            return 100;
        }
        (completed * 100 / total) as u8
    }

    // ─── Apply ────────────────────────────────────────────────────────────────

    /// Starts or resumes the phase.
    ///
    /// `stop_at_stage` bounds the run to the stages before that index; `None`
    /// runs to the end. An out-of-range boundary is ignored and the previous
    /// boundary kept.
    pub fn apply(&mut self, ctx: &mut Context<'_>, stop_at_stage: Option<usize>) -> Progress {
        match stop_at_stage {
            None => self.stop_at_stage = self.stages.len(),
            Some(stop) if stop <= self.stages.len() => self.stop_at_stage = stop,
            Some(stop) => warn!(
                phase = %self.name,
                stop_at_stage = stop,
                total_stages = self.stages.len(),
                "stop boundary out of range, ignored"
            ),
        }
        self.run(ctx)
    }

    fn run(&mut self, ctx: &mut Context<'_>) -> Progress {
        if !self.in_progress {
            if self.current_stage != 0 {
                debug!(phase = %self.name, result = %self.outcome.result, "phase not in progress");
                return Progress::Stopped(self.outcome.clone());
            }
            self.cleanup(ctx);
            self.in_progress = true;
            self.outcome = Outcome::in_progress();
            self.start_time = Some(Utc::now());
        }

        if self.timer_id.is_none() {
            let start = self.current_stage.min(self.stop_at_stage);
            let budget = with_slack(
                self.stages[start..self.stop_at_stage]
                    .iter()
                    .map(Stage::timeout),
            );
            if !budget.is_zero() {
                self.timeout = budget;
                let name = format!("{} timeout", self.name);
                self.timer_id = Some(ctx.arm(&name, budget, TimerKind::Phase));
            }
        }

        while self.current_stage < self.stop_at_stage {
            ctx.disarm(&mut self.stage_timer_id);

            let stage = &mut self.stages[self.current_stage];
            info!(phase = %self.name, stage = %stage.name(), "applying stage");
            let outcome = match stage.apply(ctx) {
                Progress::Waiting => {
                    let timeout = stage.timeout();
                    if !timeout.is_zero() {
                        let name = format!("{} stage {} timeout", self.name, stage.name());
                        self.stage_timer_id =
                            Some(ctx.arm(&name, timeout, TimerKind::PhaseStage));
                    }
                    debug!(phase = %self.name, stage = %stage.name(), "stage waiting");
                    self.save(ctx);
                    return Progress::Waiting;
                }
                Progress::Stopped(outcome) | Progress::Completed(outcome) => outcome,
            };

            self.outcome = merge_into_phase(&self.outcome, &outcome);
            if let Some(done) = self.settle(ctx) {
                return Progress::Completed(done);
            }
            self.save(ctx);
            self.current_stage += 1;
        }

        if self.stop_at_stage == self.stages.len() {
            if self.stages.is_empty() {
                self.outcome = Outcome::success();
            }
            return Progress::Completed(self.finish(ctx));
        }

        info!(
            phase = %self.name,
            stop_at_stage = self.stop_at_stage,
            "phase stopped at boundary"
        );
        self.cleanup(ctx);
        self.save(ctx);
        Progress::Stopped(self.outcome.clone())
    }

    fn settle(&mut self, ctx: &mut Context<'_>) -> Option<Outcome> {
        match self.outcome.result {
            StrategyResult::Aborting => {
                self.outcome = Outcome::aborted("");
                Some(self.finish(ctx))
            }
            result if result.is_failing() => Some(self.finish(ctx)),
            _ => None,
        }
    }

    fn finish(&mut self, ctx: &mut Context<'_>) -> Outcome {
        self.in_progress = false;
        self.cleanup(ctx);
        self.end_time = Some(Utc::now());
        self.save(ctx);
        info!(
            phase = %self.name,
            result = %self.outcome.result,
            reason = %self.outcome.reason,
            "phase complete"
        );
        self.outcome.clone()
    }

    fn cleanup(&mut self, ctx: &mut Context<'_>) {
        ctx.disarm(&mut self.timer_id);
        ctx.disarm(&mut self.stage_timer_id);
    }

    fn save(&self, ctx: &mut Context<'_>) {
        ctx.save_for(&self.name, self.strategy.as_deref());
    }

    // ─── Asynchronous completion ──────────────────────────────────────────────

    /// Records the completion of the current stage and continues.
    ///
    /// Returns the phase outcome if the phase finalized during this call.
    pub fn stage_complete(&mut self, ctx: &mut Context<'_>, outcome: Outcome) -> Option<Outcome> {
        if !self.in_progress || self.current_stage >= self.stages.len() {
            warn!(
                phase = %self.name,
                stage_index = self.current_stage,
                "stage completion while phase not running, ignored"
            );
            return None;
        }

        debug!(
            phase = %self.name,
            stage_index = self.current_stage,
            result = %outcome.result,
            "stage complete"
        );
        self.outcome = merge_into_phase(&self.outcome, &outcome);
        if let Some(done) = self.settle(ctx) {
            return Some(done);
        }

        self.current_stage += 1;
        match self.run(ctx) {
            Progress::Completed(done) => Some(done),
            Progress::Waiting | Progress::Stopped(_) => None,
        }
    }

    /// Forwards a step completion to the current stage.
    pub fn step_complete(&mut self, ctx: &mut Context<'_>, outcome: Outcome) -> Option<Outcome> {
        if !self.in_progress {
            warn!(phase = %self.name, "step completion while phase not running, ignored");
            return None;
        }
        let Some(stage) = self.stages.get_mut(self.current_stage) else {
            warn!(phase = %self.name, "step completion with no current stage, ignored");
            return None;
        };
        let done = stage.step_complete(ctx, outcome)?;
        self.stage_complete(ctx, done)
    }

    /// Handles a timer armed by this phase or by its current stage.
    pub fn timer_fired(&mut self, ctx: &mut Context<'_>, id: TimerId) -> Option<Outcome> {
        if self.timer_id == Some(id) {
            return self.phase_timer_expired(ctx);
        }
        if self.stage_timer_id == Some(id) {
            return self.stage_timer_expired(ctx);
        }

        let current = self.current_stage;
        match self.stages.get_mut(current) {
            Some(stage) if self.in_progress && stage.owns_timer(id) => {
                let done = stage.timer_fired(ctx, id)?;
                self.stage_complete(ctx, done)
            }
            _ => {
                warn!(phase = %self.name, timer = %id, "stale timer ignored");
                None
            }
        }
    }

    fn phase_timer_expired(&mut self, ctx: &mut Context<'_>) -> Option<Outcome> {
        info!(
            phase = %self.name,
            timeout_secs = self.timeout.as_secs(),
            "phase timer fired"
        );
        if !self.in_progress {
            info!(phase = %self.name, "phase not in progress, timeout ignored");
            return None;
        }

        // the running stage would otherwise keep its timers armed
        if let Some(stage) = self.stages.get_mut(self.current_stage) {
            stage.time_out(ctx);
        }
        self.outcome = Outcome::timed_out("timeout");
        Some(self.finish(ctx))
    }

    fn stage_timer_expired(&mut self, ctx: &mut Context<'_>) -> Option<Outcome> {
        let Some(stage) = self.stages.get_mut(self.current_stage) else {
            error!(
                phase = %self.name,
                stage_index = self.current_stage,
                "stage timer fired with invalid stage index"
            );
            return None;
        };
        if !self.in_progress {
            info!(phase = %self.name, "phase not in progress, stage timeout ignored");
            return None;
        }

        let outcome = stage.time_out(ctx);
        info!(
            phase = %self.name,
            stage = %stage.name(),
            result = %outcome.result,
            "stage timer fired"
        );
        if outcome.result != StrategyResult::TimedOut {
            return self.stage_complete(ctx, outcome);
        }

        self.outcome = if self.outcome.result == StrategyResult::Aborting {
            Outcome::aborted(outcome.reason)
        } else {
            Outcome::timed_out(outcome.reason)
        };
        Some(self.finish(ctx))
    }

    // ─── Abort ────────────────────────────────────────────────────────────────

    /// Marks the phase as aborting and builds the abort phase.
    ///
    /// Stages are visited from the current one back to the first; each
    /// contributes at most one compensating stage.
    pub fn abort(&mut self) -> Phase {
        if self.outcome.result == StrategyResult::Initial {
            self.outcome = Outcome::aborted("");
        } else if self.in_progress {
            self.outcome = Outcome::aborting();
        }

        let mut compensating = Vec::new();
        if !self.stages.is_empty() {
            let last = self.current_stage.min(self.stages.len() - 1);
            for stage in self.stages[..=last].iter_mut().rev() {
                if let Some(undo) = stage.abort() {
                    compensating.push(undo);
                }
                info!(phase = %self.name, stage = %stage.name(), "stage aborted");
            }
        }

        info!(
            phase = %self.name,
            compensating_stages = compensating.len(),
            "phase aborted"
        );
        Phase::with_stages(PhaseKind::Abort.as_str(), compensating)
    }

    // ─── Timeouts ─────────────────────────────────────────────────────────────

    /// Re-arms the phase timer, the current stage timer and the stage's own
    /// timers from the current budgets.
    pub fn refresh_timeouts(&mut self, ctx: &mut Context<'_>) {
        if !self.in_progress {
            return;
        }

        if let Some(stage) = self.stages.get_mut(self.current_stage) {
            stage.refresh_timeouts(ctx);
        }

        ctx.disarm(&mut self.timer_id);
        let start = self.current_stage.min(self.stop_at_stage);
        let budget = with_slack(
            self.stages[start..self.stop_at_stage]
                .iter()
                .map(Stage::timeout),
        );
        if budget.is_zero() {
            return;
        }
        self.timeout = budget;
        let name = format!("{} timeout", self.name);
        self.timer_id = Some(ctx.arm(&name, budget, TimerKind::Phase));

        ctx.disarm(&mut self.stage_timer_id);
        if let Some(stage) = self.stages.get(self.current_stage) {
            let timeout = stage.timeout();
            if !timeout.is_zero() {
                let name = format!("{} stage {} timeout", self.name, stage.name());
                self.stage_timer_id = Some(ctx.arm(&name, timeout, TimerKind::PhaseStage));
            }
        }
        debug!(phase = %self.name, timeout_secs = budget.as_secs(), "timeouts refreshed");
    }

    /// Gives the current step of the current stage a new budget and re-arms
    /// every timer above it.
    pub fn extend_step_timeout(&mut self, ctx: &mut Context<'_>, timeout: Duration) {
        if !self.in_progress {
            return;
        }
        let extended = self
            .stages
            .get_mut(self.current_stage)
            .is_some_and(|stage| stage.set_current_step_timeout(timeout));
        if extended {
            self.refresh_timeouts(ctx);
        }
    }

    // ─── Events ───────────────────────────────────────────────────────────────

    /// Routes an event to the current stage.
    pub fn handle_event(&mut self, ctx: &mut Context<'_>, event: &StepEvent) -> EventDisposition {
        if !self.in_progress {
            debug!(phase = %self.name, event = %event.name, "phase not in progress, event ignored");
            return EventDisposition::Ignored;
        }
        let Some(stage) = self.stages.get_mut(self.current_stage) else {
            return EventDisposition::Ignored;
        };

        match stage.handle_event(ctx, event) {
            EventDisposition::Completed(outcome) => match self.stage_complete(ctx, outcome) {
                Some(done) => EventDisposition::Completed(done),
                None => EventDisposition::Consumed,
            },
            other => other,
        }
    }

    // ─── Records ──────────────────────────────────────────────────────────────

    pub fn record(&self) -> PhaseRecord {
        PhaseRecord {
            name: self.name.clone(),
            timeout: self.timeout.as_secs(),
            in_progress: self.in_progress,
            completion_percentage: self.completion_percentage(),
            current_stage: self.current_stage,
            stop_at_stage: self.stop_at_stage,
            total_stages: self.stages.len(),
            stages: self.stages.iter().map(Stage::record).collect(),
            result: self.outcome.result,
            result_reason: self.outcome.reason.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    /// Rebuilds a phase from its record and its already rebuilt stages.
    ///
    /// A phase recorded in progress on its first stage, where that stage
    /// never started, is reset to not started.
    pub fn from_record(record: &PhaseRecord, stages: Vec<Stage>) -> Result<Phase, RecordError> {
        if stages.len() != record.total_stages {
            return Err(RecordError::ChildCountMismatch {
                unit: record.name.clone(),
                expected: record.total_stages,
                got: stages.len(),
            });
        }
        for cursor in [record.current_stage, record.stop_at_stage] {
            if cursor > stages.len() {
                return Err(RecordError::CursorOutOfRange {
                    unit: record.name.clone(),
                    cursor,
                    len: stages.len(),
                });
            }
        }

        let mut phase = Phase::with_stages(record.name.clone(), stages);
        phase.timeout = Duration::from_secs(record.timeout);
        phase.in_progress = record.in_progress;
        phase.current_stage = record.current_stage;
        phase.stop_at_stage = record.stop_at_stage;
        phase.outcome = Outcome::new(record.result, record.result_reason.clone());
        phase.start_time = record.start_time;
        phase.end_time = record.end_time;

        if phase.in_progress
            && phase.current_stage == 0
            && phase.stages.first().is_some_and(|s| !s.is_in_progress())
        {
            debug!(phase = %phase.name, "phase never started a stage, resetting");
            phase.in_progress = false;
            phase.outcome = Outcome::initial();
        }

        Ok(phase)
    }
}

/// Which of the strategy's phases a phase is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    #[default]
    Initial,
    Build,
    Apply,
    Abort,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Initial => "initial",
            PhaseKind::Build => "build",
            PhaseKind::Apply => "apply",
            PhaseKind::Abort => "abort",
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "phase_tests.rs"]
mod tests;
