//! Strategy: the composition root owning the build, apply and abort phases.
//!
//! # State machine
//!
//! ```text
//! initial ─build─▶ building ─▶ ready-to-apply ─apply─▶ applying ─▶ applied
//!                     │                                   │
//!                     ├─▶ build-failed                    ├─▶ apply-failed  ─┐
//!                     └─▶ build-timeout                   ├─▶ apply-timeout ─┤
//!                                                         └─abort─▶ aborting ◀┘
//!                                                                     │
//!                                          aborted / abort-failed / abort-timeout
//! ```
//!
//! A failed or timed-out apply aborts automatically: the apply phase is
//! asked for its compensating stages, which become the abort phase, and
//! the abort phase is applied.
//!
//! # Routing
//!
//! Completions, events and timers are routed to the active phase, chosen
//! from the strategy state and current phase. When a phase finalizes, the
//! strategy runs [`phase_complete`](Strategy::phase_complete).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::context::Context;
use super::error::{RecordError, StrategyError};
use super::phase::{Phase, PhaseKind, PhaseRecord};
use super::step::StepEvent;
use crate::state::merge_into_strategy;
use crate::types::{EventDisposition, Outcome, Progress, StrategyId, StrategyResult, TimerId};

/// Lifecycle state of a strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyState {
    #[default]
    Initial,
    Building,
    BuildFailed,
    BuildTimeout,
    ReadyToApply,
    Applying,
    ApplyFailed,
    ApplyTimeout,
    Applied,
    Aborting,
    AbortFailed,
    AbortTimeout,
    Aborted,
}

impl StrategyState {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyState::Initial => "initial",
            StrategyState::Building => "building",
            StrategyState::BuildFailed => "build-failed",
            StrategyState::BuildTimeout => "build-timeout",
            StrategyState::ReadyToApply => "ready-to-apply",
            StrategyState::Applying => "applying",
            StrategyState::ApplyFailed => "apply-failed",
            StrategyState::ApplyTimeout => "apply-timeout",
            StrategyState::Applied => "applied",
            StrategyState::Aborting => "aborting",
            StrategyState::AbortFailed => "abort-failed",
            StrategyState::AbortTimeout => "abort-timeout",
            StrategyState::Aborted => "aborted",
        }
    }

    /// Returns true for states in which no further phase will run.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            StrategyState::BuildFailed
                | StrategyState::BuildTimeout
                | StrategyState::Applied
                | StrategyState::AbortFailed
                | StrategyState::AbortTimeout
                | StrategyState::Aborted
        )
    }
}

impl std::fmt::Display for StrategyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted form of a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: StrategyId,
    pub name: String,
    pub state: StrategyState,
    pub current_phase: PhaseKind,
    pub current_phase_completion_percentage: u8,
    pub build_phase: PhaseRecord,
    pub apply_phase: PhaseRecord,
    pub abort_phase: PhaseRecord,
}

/// A build/apply/abort orchestration.
#[derive(Debug)]
pub struct Strategy {
    id: StrategyId,
    name: String,
    state: StrategyState,
    current_phase: PhaseKind,
    build_phase: Phase,
    apply_phase: Phase,
    abort_phase: Phase,
}

impl Strategy {
    /// Creates a strategy with empty phases.
    pub fn new(id: StrategyId, name: impl Into<String>) -> Self {
        Strategy::with_phases(
            id,
            name,
            Phase::new(PhaseKind::Build.as_str()),
            Phase::new(PhaseKind::Apply.as_str()),
            Phase::new(PhaseKind::Abort.as_str()),
        )
    }

    /// Creates a strategy from prepared phases.
    pub fn with_phases(
        id: StrategyId,
        name: impl Into<String>,
        mut build_phase: Phase,
        mut apply_phase: Phase,
        mut abort_phase: Phase,
    ) -> Self {
        for phase in [&mut build_phase, &mut apply_phase, &mut abort_phase] {
            phase.attach(id.as_str());
        }
        Strategy {
            id,
            name: name.into(),
            state: StrategyState::Initial,
            current_phase: PhaseKind::Initial,
            build_phase,
            apply_phase,
            abort_phase,
        }
    }

    pub fn id(&self) -> &StrategyId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StrategyState {
        self.state
    }

    pub fn current_phase(&self) -> PhaseKind {
        self.current_phase
    }

    pub fn build_phase(&self) -> &Phase {
        &self.build_phase
    }

    pub fn apply_phase(&self) -> &Phase {
        &self.apply_phase
    }

    pub fn abort_phase(&self) -> &Phase {
        &self.abort_phase
    }

    /// Mutable access for populating the build phase before `build`.
    pub fn build_phase_mut(&mut self) -> &mut Phase {
        &mut self.build_phase
    }

    /// Mutable access for populating the apply phase before `apply`.
    pub fn apply_phase_mut(&mut self) -> &mut Phase {
        &mut self.apply_phase
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&Phase> {
        match kind {
            PhaseKind::Initial => None,
            PhaseKind::Build => Some(&self.build_phase),
            PhaseKind::Apply => Some(&self.apply_phase),
            PhaseKind::Abort => Some(&self.abort_phase),
        }
    }

    fn phase_mut(&mut self, kind: PhaseKind) -> Option<&mut Phase> {
        match kind {
            PhaseKind::Initial => None,
            PhaseKind::Build => Some(&mut self.build_phase),
            PhaseKind::Apply => Some(&mut self.apply_phase),
            PhaseKind::Abort => Some(&mut self.abort_phase),
        }
    }

    pub fn is_building(&self) -> bool {
        self.state == StrategyState::Building
    }

    pub fn is_ready_to_apply(&self) -> bool {
        self.state == StrategyState::ReadyToApply
    }

    pub fn is_applying(&self) -> bool {
        self.state == StrategyState::Applying
    }

    pub fn is_applied(&self) -> bool {
        self.state == StrategyState::Applied
    }

    pub fn is_aborting(&self) -> bool {
        self.state == StrategyState::Aborting
    }

    pub fn is_aborted(&self) -> bool {
        self.state == StrategyState::Aborted
    }

    /// Completion percentage of the current phase; 0 before any phase ran.
    pub fn current_phase_completion_percentage(&self) -> u8 {
        self.phase(self.current_phase)
            .map_or(0, Phase::completion_percentage)
    }

    fn save(&self, ctx: &mut Context<'_>) {
        ctx.host.save();
    }

    // ─── Build ────────────────────────────────────────────────────────────────

    /// Starts the build phase. Ignored unless the strategy is new.
    pub fn build(&mut self, ctx: &mut Context<'_>) {
        if self.current_phase == PhaseKind::Initial && self.state == StrategyState::Initial {
            info!(strategy = %self.id, "building strategy");
            self.state = StrategyState::Building;
            self.current_phase = PhaseKind::Build;
            let progress = self.build_phase.apply(ctx, None);
            self.after_apply(ctx, PhaseKind::Build, progress);
        } else {
            debug!(strategy = %self.id, state = %self.state, "build ignored");
        }
        self.save(ctx);
    }

    // ─── Apply ────────────────────────────────────────────────────────────────

    /// Applies every remaining stage, or only `stage_id` when given.
    ///
    /// Stage-by-stage apply must name the next stage in order.
    pub fn apply(
        &mut self,
        ctx: &mut Context<'_>,
        stage_id: Option<usize>,
    ) -> Result<(), StrategyError> {
        let result = self.try_apply(ctx, stage_id);
        if let Err(e) = &result {
            info!(strategy = %self.id, error = %e, "apply rejected");
        }
        self.save(ctx);
        result
    }

    fn try_apply(
        &mut self,
        ctx: &mut Context<'_>,
        stage_id: Option<usize>,
    ) -> Result<(), StrategyError> {
        let total_stages = self.apply_phase.stages().len();

        match self.current_phase {
            PhaseKind::Initial => Err(StrategyError::NotBuilt),

            PhaseKind::Build => {
                if self.state != StrategyState::ReadyToApply {
                    return Err(match stage_id {
                        None => StrategyError::BuildNotReady(self.build_phase.reason().to_string()),
                        Some(stage_id) => StrategyError::StageApplyBlocked {
                            stage_id,
                            reason: self.build_phase.reason().to_string(),
                        },
                    });
                }
                let stop_at_stage = match stage_id {
                    None => None,
                    Some(0) if total_stages > 0 => Some(1),
                    Some(stage_id) => {
                        return Err(StrategyError::InvalidStageId {
                            stage_id,
                            total_stages,
                        });
                    }
                };
                info!(strategy = %self.id, ?stage_id, "applying strategy");
                self.state = StrategyState::Applying;
                self.current_phase = PhaseKind::Apply;
                let progress = self.apply_phase.apply(ctx, stop_at_stage);
                self.after_apply(ctx, PhaseKind::Apply, progress);
                Ok(())
            }

            PhaseKind::Apply => {
                if matches!(
                    self.state,
                    StrategyState::Applied
                        | StrategyState::ApplyFailed
                        | StrategyState::ApplyTimeout
                        | StrategyState::Aborted
                        | StrategyState::AbortFailed
                        | StrategyState::AbortTimeout
                ) {
                    return Err(StrategyError::ApplyCompleted);
                }

                let current = self.apply_phase.current_stage();
                let stop_at_stage = match stage_id {
                    None if self.apply_phase.is_paused() => None,
                    None => return Err(StrategyError::ApplyInProgress),
                    Some(_) if self.apply_phase.is_running_stage() => {
                        return Err(StrategyError::ApplyInProgress);
                    }
                    Some(stage_id) if stage_id < current => {
                        return Err(StrategyError::StageAlreadyApplied(stage_id));
                    }
                    Some(stage_id) if stage_id >= total_stages => {
                        return Err(StrategyError::InvalidStageId {
                            stage_id,
                            total_stages,
                        });
                    }
                    Some(stage_id) if stage_id != current => {
                        return Err(StrategyError::NotNextStage {
                            stage_id,
                            next_stage: current,
                        });
                    }
                    Some(stage_id) => Some(stage_id + 1),
                };

                info!(strategy = %self.id, ?stage_id, "resuming apply");
                let progress = self.apply_phase.apply(ctx, stop_at_stage);
                self.after_apply(ctx, PhaseKind::Apply, progress);
                Ok(())
            }

            PhaseKind::Abort => Err(match stage_id {
                None => StrategyError::ApplyDuringAbort,
                Some(stage_id) => StrategyError::StageApplyDuringAbort(stage_id),
            }),
        }
    }

    // ─── Abort ────────────────────────────────────────────────────────────────

    /// Aborts the apply phase. With a stage id, that stage must be the one
    /// currently running.
    pub fn abort(
        &mut self,
        ctx: &mut Context<'_>,
        stage_id: Option<usize>,
    ) -> Result<(), StrategyError> {
        let result = self.try_abort(ctx, stage_id);
        if let Err(e) = &result {
            info!(strategy = %self.id, error = %e, "abort rejected");
        }
        self.save(ctx);
        result
    }

    fn try_abort(
        &mut self,
        ctx: &mut Context<'_>,
        stage_id: Option<usize>,
    ) -> Result<(), StrategyError> {
        if self.current_phase != PhaseKind::Apply {
            return Err(StrategyError::ApplyNotInProgress);
        }

        if let Some(stage_id) = stage_id
            && (!self.apply_phase.is_running_stage()
                || self.apply_phase.current_stage() != stage_id)
        {
            return Err(StrategyError::StageNotInProgress(stage_id));
        }

        match self.state {
            StrategyState::Applying | StrategyState::ApplyFailed | StrategyState::ApplyTimeout => {
                info!(strategy = %self.id, "aborting strategy");
                self.state = StrategyState::Aborting;
                let mut abort_phase = self.apply_phase.abort();
                abort_phase.attach(self.id.as_str());
                self.abort_phase = abort_phase;

                // nothing is running, so there is nothing to wind down
                if self.apply_phase.is_paused() {
                    self.state = StrategyState::Aborted;
                    ctx.host.abort_complete(&Outcome::aborted(""));
                }
                Ok(())
            }
            StrategyState::Applied => Err(StrategyError::ApplyNotInProgress),
            _ => {
                self.state = StrategyState::Aborted;
                Ok(())
            }
        }
    }

    // ─── Phase completion ─────────────────────────────────────────────────────

    fn after_apply(&mut self, ctx: &mut Context<'_>, kind: PhaseKind, progress: Progress) {
        if let Progress::Completed(outcome) = progress {
            self.phase_complete(ctx, kind, outcome);
        }
    }

    /// Advances the strategy state after a phase finalized.
    pub fn phase_complete(&mut self, ctx: &mut Context<'_>, kind: PhaseKind, outcome: Outcome) {
        self.save(ctx);

        let outcome = merge_into_strategy(&Outcome::initial(), &outcome);
        info!(
            strategy = %self.id,
            phase = %kind,
            state = %self.state,
            result = %outcome.result,
            reason = %outcome.reason,
            "phase complete"
        );

        match (self.state, kind) {
            // === Build ===
            (StrategyState::Building, PhaseKind::Build) => {
                let next = match outcome.result {
                    r if r.is_success_like() => Some(StrategyState::ReadyToApply),
                    StrategyResult::Failed => Some(StrategyState::BuildFailed),
                    StrategyResult::TimedOut => Some(StrategyState::BuildTimeout),
                    _ => None,
                };
                if let Some(next) = next {
                    self.state = next;
                    ctx.host.build_complete(&outcome);
                }
            }

            // === Apply ===
            (StrategyState::Applying, PhaseKind::Apply) => match outcome.result {
                r if r.is_success_like() => {
                    self.state = StrategyState::Applied;
                    ctx.host.apply_complete(&outcome);
                }
                StrategyResult::Failed | StrategyResult::TimedOut => {
                    self.state = if outcome.result == StrategyResult::Failed {
                        StrategyState::ApplyFailed
                    } else {
                        StrategyState::ApplyTimeout
                    };
                    ctx.host.apply_complete(&outcome);
                    if let Err(e) = self.try_abort(ctx, None) {
                        warn!(strategy = %self.id, error = %e, "automatic abort refused");
                    }
                    self.start_abort_phase(ctx);
                }
                _ => {}
            },

            // === Abort ===
            (StrategyState::Aborting, PhaseKind::Apply) => {
                let next = match outcome.result {
                    r if r.is_success_like() => Some(StrategyState::Applied),
                    StrategyResult::Failed => Some(StrategyState::ApplyFailed),
                    StrategyResult::TimedOut => Some(StrategyState::ApplyTimeout),
                    _ => None,
                };
                if let Some(next) = next {
                    self.state = next;
                    ctx.host.apply_complete(&outcome);
                }
                self.start_abort_phase(ctx);
            }
            (StrategyState::Aborting, PhaseKind::Abort) => {
                let next = match outcome.result {
                    r if r.is_success_like() => Some(StrategyState::Aborted),
                    StrategyResult::Failed => Some(StrategyState::AbortFailed),
                    StrategyResult::TimedOut => Some(StrategyState::AbortTimeout),
                    _ => None,
                };
                if let Some(next) = next {
                    self.state = next;
                    ctx.host.abort_complete(&outcome);
                }
            }

            // === Stale completions ===
            (state, kind) => {
                debug!(strategy = %self.id, %state, phase = %kind, "phase completion ignored");
            }
        }

        self.save(ctx);
    }

    fn start_abort_phase(&mut self, ctx: &mut Context<'_>) {
        self.current_phase = PhaseKind::Abort;
        let progress = self.abort_phase.apply(ctx, None);
        self.after_apply(ctx, PhaseKind::Abort, progress);
    }

    // ─── Routing ──────────────────────────────────────────────────────────────

    /// The phase that currently receives completions, events and timers.
    fn active_phase(&self) -> Option<PhaseKind> {
        match (self.state, self.current_phase) {
            (StrategyState::Building, PhaseKind::Build) => Some(PhaseKind::Build),
            (StrategyState::Applying, PhaseKind::Apply) => Some(PhaseKind::Apply),
            (StrategyState::Aborting, kind @ (PhaseKind::Apply | PhaseKind::Abort)) => Some(kind),
            _ => None,
        }
    }

    /// Routes an event to the active phase. Returns true if it was consumed.
    pub fn handle_event(&mut self, ctx: &mut Context<'_>, event: &StepEvent) -> bool {
        let Some(kind) = self.active_phase() else {
            debug!(strategy = %self.id, event = %event.name, "no active phase, event ignored");
            return false;
        };
        let disposition = match self.phase_mut(kind) {
            Some(phase) => phase.handle_event(ctx, event),
            None => return false,
        };
        let consumed = disposition.is_consumed();
        if let EventDisposition::Completed(outcome) = disposition {
            self.phase_complete(ctx, kind, outcome);
        }
        consumed
    }

    /// Records the completion of the step the active phase is waiting on.
    pub fn step_complete(&mut self, ctx: &mut Context<'_>, outcome: Outcome) {
        let Some(kind) = self.active_phase() else {
            warn!(strategy = %self.id, state = %self.state, "step completion with no active phase");
            return;
        };
        let done = self
            .phase_mut(kind)
            .and_then(|phase| phase.step_complete(ctx, outcome));
        if let Some(done) = done {
            self.phase_complete(ctx, kind, done);
        }
    }

    /// Delivers an expired timer to the current phase.
    pub fn timer_fired(&mut self, ctx: &mut Context<'_>, id: TimerId) {
        let kind = self.current_phase;
        if kind == PhaseKind::Initial {
            warn!(strategy = %self.id, timer = %id, "timer fired before build, ignored");
            return;
        }
        let done = self
            .phase_mut(kind)
            .and_then(|phase| phase.timer_fired(ctx, id));
        if let Some(done) = done {
            self.phase_complete(ctx, kind, done);
        }
    }

    /// Gives the current step a new budget and re-arms the timers above it.
    pub fn extend_step_timeout(&mut self, ctx: &mut Context<'_>, timeout: Duration) {
        match self.active_phase().and_then(|kind| self.phase_mut(kind)) {
            Some(phase) => phase.extend_step_timeout(ctx, timeout),
            None => debug!(strategy = %self.id, "no active phase, timeout extension ignored"),
        }
    }

    /// Re-arms every phase's timers, typically after loading from a record.
    pub fn refresh_timeouts(&mut self, ctx: &mut Context<'_>) {
        self.build_phase.refresh_timeouts(ctx);
        self.apply_phase.refresh_timeouts(ctx);
        self.abort_phase.refresh_timeouts(ctx);
    }

    // ─── Records ──────────────────────────────────────────────────────────────

    pub fn record(&self) -> StrategyRecord {
        StrategyRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            current_phase: self.current_phase,
            current_phase_completion_percentage: self.current_phase_completion_percentage(),
            build_phase: self.build_phase.record(),
            apply_phase: self.apply_phase.record(),
            abort_phase: self.abort_phase.record(),
        }
    }

    pub fn as_json(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(&self.record())?)
    }

    /// Rebuilds a strategy from its record and its already rebuilt phases.
    ///
    /// Timers are not restored; call
    /// [`refresh_timeouts`](Self::refresh_timeouts) once a timer service is
    /// available.
    pub fn from_record(
        record: &StrategyRecord,
        build_phase: Phase,
        apply_phase: Phase,
        abort_phase: Phase,
    ) -> Strategy {
        let mut strategy = Strategy::with_phases(
            record.id.clone(),
            record.name.clone(),
            build_phase,
            apply_phase,
            abort_phase,
        );
        strategy.state = record.state;
        strategy.current_phase = record.current_phase;
        strategy
    }
}

#[cfg(test)]
#[path = "strategy_tests.rs"]
mod tests;
