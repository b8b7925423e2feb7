//! Stage: an ordered sequence of steps with a shared time budget.
//!
//! # Architecture
//!
//! A stage applies its steps in order. Synchronous steps are merged into the
//! stage outcome immediately; a step returning WAIT suspends the stage until
//! it is completed through [`Stage::step_complete`], an event, or its timer.
//!
//! Two timers may be armed at once: the stage timer (sum of the step
//! budgets plus one second of slack) and a step timer for the step being
//! waited on. A fresh step timer is always armed after the previous one has
//! been deleted.
//!
//! # Invariants
//!
//! - `current_step` indexes a real step while `in_progress`, except at the
//!   moment all steps are exhausted.
//! - A FAILED, TIMED_OUT or ABORTED aggregate finalizes the stage; later
//!   steps are never applied.
//! - Finalizing always disarms both timers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::context::Context;
use super::error::RecordError;
use super::step::{Step, StepEvent, StepRecord};
use super::with_slack;
use crate::state::merge_into_stage;
use crate::timers::TimerKind;
use crate::types::{EventDisposition, Outcome, Progress, StrategyResult, TimerId};

/// Persisted form of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: usize,
    pub name: String,
    /// Seconds.
    pub timeout: u64,
    pub in_progress: bool,
    pub current_step: usize,
    pub total_steps: usize,
    pub steps: Vec<StepRecord>,
    pub result: StrategyResult,
    pub result_reason: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// An ordered list of steps applied as one unit.
#[derive(Debug)]
pub struct Stage {
    id: usize,
    name: String,
    steps: Vec<Box<dyn Step>>,
    current_step: usize,
    outcome: Outcome,
    timeout: Duration,
    in_progress: bool,
    timer_id: Option<TimerId>,
    step_timer_id: Option<TimerId>,
    /// Name of the owning phase. Non-owning: only used to decide whether
    /// save requests go anywhere.
    phase: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Stage {
            id: 0,
            name: name.into(),
            steps: Vec::new(),
            current_step: 0,
            outcome: Outcome::initial(),
            timeout: Duration::ZERO,
            in_progress: false,
            timer_id: None,
            step_timer_id: None,
            phase: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Creates a stage and adds `steps` in order.
    pub fn with_steps(name: impl Into<String>, steps: Vec<Box<dyn Step>>) -> Self {
        let mut stage = Stage::new(name);
        for step in steps {
            stage.add_step(step);
        }
        stage
    }

    /// Appends a step, assigning its id and growing the stage budget.
    pub fn add_step(&mut self, mut step: Box<dyn Step>) {
        step.info_mut().id = self.steps.len();
        self.steps.push(step);
        self.timeout = with_slack(self.steps.iter().map(|s| s.timeout_duration()));
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    pub fn current_step(&self) -> usize {
        self.current_step
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

    /// Current stage budget. Zero means no stage timer is armed.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
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

    /// Name of the owning phase, if attached.
    pub fn phase(&self) -> Option<&str> {
        self.phase.as_deref()
    }

    /// Armed stage and step timers, for inspection.
    pub fn timer_ids(&self) -> (Option<TimerId>, Option<TimerId>) {
        (self.timer_id, self.step_timer_id)
    }

    pub(crate) fn attach(&mut self, id: usize, phase: &str) {
        self.id = id;
        self.phase = Some(phase.to_string());
    }

    pub(crate) fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.result().counts_as_completed())
            .count()
    }

    pub(crate) fn owns_timer(&self, id: TimerId) -> bool {
        self.timer_id == Some(id) || self.step_timer_id == Some(id)
    }

    // ─── Apply ────────────────────────────────────────────────────────────────

    /// Starts the stage, or resumes it at the current step.
    ///
    /// A stage that already ran and is no longer in progress is not
    /// restarted: its existing outcome comes back as [`Progress::Stopped`].
    pub fn apply(&mut self, ctx: &mut Context<'_>) -> Progress {
        if !self.in_progress {
            if self.current_step != 0 {
                debug!(stage = %self.name, result = %self.outcome.result, "stage already applied");
                return Progress::Stopped(self.outcome.clone());
            }

            self.cleanup(ctx);
            self.in_progress = true;
            self.outcome = Outcome::in_progress();
            self.start_time = Some(Utc::now());

            if !self.timeout.is_zero() {
                let name = format!("{} timeout", self.name);
                self.timer_id = Some(ctx.arm(&name, self.timeout, TimerKind::Stage));
            }
        }

        self.run_steps(ctx)
    }

    fn run_steps(&mut self, ctx: &mut Context<'_>) -> Progress {
        while self.current_step < self.steps.len() {
            ctx.disarm(&mut self.step_timer_id);

            let step = &mut self.steps[self.current_step];
            step.info_mut().start_time = Some(Utc::now());
            let outcome = step.apply();
            step.info_mut().outcome = outcome.clone();
            debug!(
                stage = %self.name,
                step = %step.name(),
                result = %outcome.result,
                reason = %outcome.reason,
                "step applied"
            );

            if outcome.result == StrategyResult::Wait {
                let timeout = step.timeout_duration();
                if !timeout.is_zero() {
                    let name = format!("{} step {} timeout", self.name, step.name());
                    self.step_timer_id = Some(ctx.arm(&name, timeout, TimerKind::Step));
                }
                self.save(ctx);
                return Progress::Waiting;
            }

            step.info_mut().end_time = Some(Utc::now());
            self.outcome = merge_into_stage(&self.outcome, &outcome);
            if let Some(done) = self.settle(ctx) {
                return Progress::Completed(done);
            }
            self.save(ctx);
            self.current_step += 1;
        }

        if self.steps.is_empty() {
            self.outcome = Outcome::success();
        }
        Progress::Completed(self.finish(ctx))
    }

    /// Finalizes the stage when the aggregate stops the sequence.
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
            stage = %self.name,
            result = %self.outcome.result,
            reason = %self.outcome.reason,
            "stage complete"
        );
        self.outcome.clone()
    }

    fn cleanup(&mut self, ctx: &mut Context<'_>) {
        ctx.disarm(&mut self.timer_id);
        ctx.disarm(&mut self.step_timer_id);
    }

    fn save(&self, ctx: &mut Context<'_>) {
        ctx.save_for(&self.name, self.phase.as_deref());
    }

    // ─── Asynchronous completion ──────────────────────────────────────────────

    /// Records the completion of the step the stage is waiting on.
    ///
    /// Returns the stage outcome if the stage finalized during this call.
    pub fn step_complete(&mut self, ctx: &mut Context<'_>, outcome: Outcome) -> Option<Outcome> {
        if !self.in_progress || self.current_step >= self.steps.len() {
            warn!(
                stage = %self.name,
                step_index = self.current_step,
                "step completion while stage not running, ignored"
            );
            return None;
        }

        let step = &mut self.steps[self.current_step];
        let recorded = step.complete(outcome);
        step.info_mut().outcome = recorded.clone();
        step.info_mut().end_time = Some(Utc::now());
        debug!(
            stage = %self.name,
            step = %step.name(),
            result = %recorded.result,
            reason = %recorded.reason,
            "step complete"
        );

        self.outcome = merge_into_stage(&self.outcome, &recorded);
        if let Some(done) = self.settle(ctx) {
            return Some(done);
        }

        self.current_step += 1;
        self.run_steps(ctx).completed()
    }

    /// Handles a timer armed by this stage.
    pub fn timer_fired(&mut self, ctx: &mut Context<'_>, id: TimerId) -> Option<Outcome> {
        if self.timer_id == Some(id) {
            self.stage_timer_expired(ctx)
        } else if self.step_timer_id == Some(id) {
            self.step_timer_expired(ctx)
        } else {
            warn!(stage = %self.name, timer = %id, "stale timer ignored");
            None
        }
    }

    fn stage_timer_expired(&mut self, ctx: &mut Context<'_>) -> Option<Outcome> {
        info!(stage = %self.name, "stage timer fired");
        if !self.in_progress {
            info!(stage = %self.name, "stage not in progress, timeout ignored");
            return None;
        }
        self.outcome = Outcome::timed_out("timeout");
        Some(self.finish(ctx))
    }

    fn step_timer_expired(&mut self, ctx: &mut Context<'_>) -> Option<Outcome> {
        let Some(step) = self.steps.get_mut(self.current_step) else {
            error!(
                stage = %self.name,
                step_index = self.current_step,
                "step timer fired with invalid step index"
            );
            return None;
        };
        if !self.in_progress {
            info!(stage = %self.name, "stage not in progress, step timeout ignored");
            return None;
        }

        let outcome = step.timeout();
        info!(
            stage = %self.name,
            step = %step.name(),
            result = %outcome.result,
            "step timer fired"
        );

        if outcome.result != StrategyResult::TimedOut {
            return self.step_complete(ctx, outcome);
        }

        step.info_mut().outcome = outcome.clone();
        step.info_mut().end_time = Some(Utc::now());
        self.outcome = if self.outcome.result == StrategyResult::Aborting {
            Outcome::aborted("")
        } else {
            Outcome::timed_out(outcome.reason)
        };
        Some(self.finish(ctx))
    }

    /// Times the stage out on behalf of its phase.
    ///
    /// Returns the resulting outcome; a stage that is not in progress
    /// reports its existing outcome unchanged.
    pub fn time_out(&mut self, ctx: &mut Context<'_>) -> Outcome {
        if !self.in_progress {
            return self.outcome.clone();
        }
        info!(stage = %self.name, "stage timed out by phase");
        self.outcome = Outcome::timed_out("timeout");
        self.finish(ctx)
    }

    // ─── Abort ────────────────────────────────────────────────────────────────

    /// Marks the stage as aborting and collects compensating steps.
    ///
    /// Steps are visited from the current one back to the first, so undo
    /// happens in reverse. A stage that never started needs no compensation.
    /// Returns a stage of the same name holding the compensating steps, or
    /// `None` when there are none.
    pub fn abort(&mut self) -> Option<Stage> {
        let started = self.outcome.result != StrategyResult::Initial;
        if !started {
            self.outcome = Outcome::aborted("");
        } else if self.in_progress {
            self.outcome = Outcome::aborting();
        }

        let mut compensating: Vec<Box<dyn Step>> = Vec::new();
        if started && !self.steps.is_empty() {
            let last = self.current_step.min(self.steps.len() - 1);
            for step in self.steps[..=last].iter_mut().rev() {
                let undo = step.abort();
                info!(
                    stage = %self.name,
                    step = %step.name(),
                    compensating = undo.len(),
                    "step aborted"
                );
                compensating.extend(undo);
            }
        }

        info!(stage = %self.name, result = %self.outcome.result, "stage aborted");
        if compensating.is_empty() {
            None
        } else {
            Some(Stage::with_steps(self.name.clone(), compensating))
        }
    }

    // ─── Timeouts ─────────────────────────────────────────────────────────────

    /// Re-arms the stage and step timers from the current budgets.
    ///
    /// The stage budget is recomputed over the steps that have not finished
    /// yet. A zero budget arms nothing.
    pub fn refresh_timeouts(&mut self, ctx: &mut Context<'_>) {
        if !self.in_progress {
            return;
        }

        ctx.disarm(&mut self.timer_id);
        let start = self.current_step.min(self.steps.len());
        self.timeout = with_slack(self.steps[start..].iter().map(|s| s.timeout_duration()));
        if !self.timeout.is_zero() {
            let name = format!("{} timeout", self.name);
            self.timer_id = Some(ctx.arm(&name, self.timeout, TimerKind::Stage));
        }

        ctx.disarm(&mut self.step_timer_id);
        if let Some(step) = self.steps.get(self.current_step) {
            let timeout = step.timeout_duration();
            if !timeout.is_zero() {
                let name = format!("{} step {} timeout", self.name, step.name());
                self.step_timer_id = Some(ctx.arm(&name, timeout, TimerKind::Step));
            }
        }
        debug!(stage = %self.name, timeout_secs = self.timeout.as_secs(), "timeouts refreshed");
    }

    /// Replaces the current step's budget. Returns false when there is no
    /// current step.
    pub(crate) fn set_current_step_timeout(&mut self, timeout: Duration) -> bool {
        match self.steps.get_mut(self.current_step) {
            Some(step) => {
                step.info_mut().timeout = timeout;
                true
            }
            None => false,
        }
    }

    /// Gives the current step a new budget and re-arms the timers.
    pub fn extend_step_timeout(&mut self, ctx: &mut Context<'_>, timeout: Duration) {
        if self.in_progress && self.set_current_step_timeout(timeout) {
            self.refresh_timeouts(ctx);
        }
    }

    // ─── Events ───────────────────────────────────────────────────────────────

    /// Routes an event to the current step.
    pub fn handle_event(&mut self, ctx: &mut Context<'_>, event: &StepEvent) -> EventDisposition {
        if !self.in_progress {
            debug!(stage = %self.name, event = %event.name, "stage not in progress, event ignored");
            return EventDisposition::Ignored;
        }
        let Some(step) = self.steps.get_mut(self.current_step) else {
            return EventDisposition::Ignored;
        };

        match step.handle_event(event) {
            EventDisposition::Completed(outcome) => match self.step_complete(ctx, outcome) {
                Some(done) => EventDisposition::Completed(done),
                None => EventDisposition::Consumed,
            },
            other => other,
        }
    }

    // ─── Records ──────────────────────────────────────────────────────────────

    pub fn record(&self) -> StageRecord {
        StageRecord {
            id: self.id,
            name: self.name.clone(),
            timeout: self.timeout.as_secs(),
            in_progress: self.in_progress,
            current_step: self.current_step,
            total_steps: self.steps.len(),
            steps: self.steps.iter().map(|s| s.record()).collect(),
            result: self.outcome.result,
            result_reason: self.outcome.reason.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    /// Rebuilds a stage from its record and its already rebuilt steps.
    ///
    /// Two corrections cover a crash mid-apply: a stage whose first step never
    /// started is reset to not started, and a cursor left on a step that had
    /// already finished is moved past it. Timers are not restored; the owner
    /// calls [`refresh_timeouts`](Self::refresh_timeouts) after loading.
    pub fn from_record(
        record: &StageRecord,
        steps: Vec<Box<dyn Step>>,
    ) -> Result<Stage, RecordError> {
        if steps.len() != record.total_steps {
            return Err(RecordError::ChildCountMismatch {
                unit: record.name.clone(),
                expected: record.total_steps,
                got: steps.len(),
            });
        }
        if record.current_step > steps.len() {
            return Err(RecordError::CursorOutOfRange {
                unit: record.name.clone(),
                cursor: record.current_step,
                len: steps.len(),
            });
        }

        let mut stage = Stage::with_steps(record.name.clone(), steps);
        stage.id = record.id;
        stage.in_progress = record.in_progress;
        stage.current_step = record.current_step;
        stage.outcome = Outcome::new(record.result, record.result_reason.clone());
        stage.start_time = record.start_time;
        stage.end_time = record.end_time;

        if stage.in_progress {
            let cursor = stage.current_step;
            if cursor == 0
                && let Some(first) = stage.steps.first()
                && first.result() == StrategyResult::Initial
            {
                debug!(stage = %stage.name, "stage never started a step, resetting");
                stage.in_progress = false;
                stage.outcome = Outcome::initial();
            } else if let Some(step) = stage.steps.get(cursor)
                && !matches!(
                    step.result(),
                    StrategyResult::Initial | StrategyResult::InProgress | StrategyResult::Wait
                )
            {
                debug!(stage = %stage.name, step = %step.name(), "step already finished, advancing");
                stage.current_step += 1;
            }
        }

        Ok(stage)
    }
}

#[cfg(test)]
#[path = "stage_tests.rs"]
mod tests;
