//! Event loop driving one strategy.
//!
//! # Ordering
//!
//! Timers that came due are always delivered before the next message is
//! handled, so a completion arriving after a deadline cannot overtake the
//! timeout. The wheel's clock is also brought up to date this way, which
//! keeps newly armed deadlines relative to the real current time.
//!
//! # Persistence
//!
//! The engine requests saves through its host. The worker counts them and,
//! once the current message or timer batch is done, writes a single
//! snapshot. Sink failures are logged and never reach the engine.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

use crate::orchestration::{
    Context, SaveCounter, StepEvent, Strategy, StrategyError, StrategyRecord,
};
use crate::persistence::{SnapshotError, SnapshotSink};
use crate::timers::TimerWheel;
use crate::types::Outcome;

use super::config::WorkerConfig;
use super::message::WorkerMessage;

/// Errors that can occur during worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker has stopped and dropped its receiver.
    #[error("worker channel closed")]
    ChannelClosed,

    /// The strategy refused the command.
    #[error("rejected: {0}")]
    Rejected(#[from] StrategyError),

    /// Writing a snapshot failed.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Owns a strategy and everything it needs to run.
pub struct StrategyWorker {
    strategy: Strategy,
    timers: TimerWheel,
    host: SaveCounter,
    sink: Box<dyn SnapshotSink>,
    config: WorkerConfig,
}

impl std::fmt::Debug for StrategyWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyWorker")
            .field("strategy", self.strategy.id())
            .field("state", &self.strategy.state())
            .field("armed_timers", &self.timers.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StrategyWorker {
    /// Creates a worker for `strategy`.
    ///
    /// A strategy rebuilt from a record gets its timers re-armed here, with
    /// fresh budgets measured from now. The strategy must not hold timers
    /// armed on another service.
    pub fn new(
        mut strategy: Strategy,
        sink: impl SnapshotSink + 'static,
        config: WorkerConfig,
    ) -> Self {
        let mut timers = TimerWheel::new(Instant::now());
        let mut host = SaveCounter::new();
        strategy.refresh_timeouts(&mut Context::new(&mut timers, &mut host));
        debug!(
            strategy = %strategy.id(),
            state = %strategy.state(),
            armed_timers = timers.len(),
            "worker created"
        );

        StrategyWorker {
            strategy,
            timers,
            host,
            sink: Box::new(sink),
            config,
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn timers(&self) -> &TimerWheel {
        &self.timers
    }

    /// Consumes the worker, returning the strategy.
    pub fn into_strategy(self) -> Strategy {
        self.strategy
    }

    /// Writes the current record to the sink unconditionally.
    pub fn persist(&mut self) -> Result<()> {
        self.sink.persist(&self.strategy.record())?;
        Ok(())
    }

    /// Runs the event loop until shutdown and returns the strategy.
    #[instrument(skip_all, fields(strategy = %self.strategy.id()))]
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<WorkerMessage>,
        shutdown: CancellationToken,
    ) -> Strategy {
        info!("Worker event loop started");

        loop {
            let wake_at = self
                .timers
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + self.config.idle_wake);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping worker");
                    break;
                }

                msg = rx.recv() => {
                    match msg {
                        Some(WorkerMessage::Shutdown) => {
                            info!("Shutdown message received");
                            break;
                        }
                        Some(msg) => {
                            self.fire_expired_timers();
                            self.handle_message(msg);
                        }
                        None => {
                            info!("Message channel closed");
                            break;
                        }
                    }
                }

                _ = tokio::time::sleep_until(wake_at) => {
                    self.fire_expired_timers();
                }
            }

            self.flush();
        }

        self.flush();
        info!(state = %self.strategy.state(), "Worker event loop stopped");
        self.strategy
    }

    /// Handles a single message. `Shutdown` is handled by the loop.
    fn handle_message(&mut self, msg: WorkerMessage) {
        trace!(message = msg.kind(), "handling message");
        let mut ctx = Context::new(&mut self.timers, &mut self.host);

        match msg {
            WorkerMessage::Build => self.strategy.build(&mut ctx),
            WorkerMessage::Apply { stage_id, reply } => {
                let result = self.strategy.apply(&mut ctx, stage_id);
                if reply.send(result).is_err() {
                    debug!("apply requester went away");
                }
            }
            WorkerMessage::Abort { stage_id, reply } => {
                let result = self.strategy.abort(&mut ctx, stage_id);
                if reply.send(result).is_err() {
                    debug!("abort requester went away");
                }
            }
            WorkerMessage::StepComplete(outcome) => self.strategy.step_complete(&mut ctx, outcome),
            WorkerMessage::Event(event) => {
                if !self.strategy.handle_event(&mut ctx, &event) {
                    debug!(event = %event.name, "event not consumed");
                }
            }
            WorkerMessage::ExtendStepTimeout(timeout) => {
                self.strategy.extend_step_timeout(&mut ctx, timeout)
            }
            WorkerMessage::Snapshot { reply } => {
                if reply.send(self.strategy.record()).is_err() {
                    debug!("snapshot requester went away");
                }
            }
            WorkerMessage::Shutdown => {}
        }
    }

    /// Delivers every timer that came due, in deadline order.
    fn fire_expired_timers(&mut self) {
        let due = self.timers.expire(Instant::now());
        for id in due {
            // disarmed by an earlier timer in this batch
            if !self.timers.is_armed(id) {
                trace!(timer = %id, "timer disarmed before delivery");
                continue;
            }
            let mut ctx = Context::new(&mut self.timers, &mut self.host);
            self.strategy.timer_fired(&mut ctx, id);
        }
    }

    /// Writes a snapshot if the engine asked for a save, and reports
    /// completions collected since the last flush.
    fn flush(&mut self) {
        for outcome in std::mem::take(&mut self.host.build_completions) {
            info!(result = %outcome.result, reason = %outcome.reason, "build complete");
        }
        for outcome in std::mem::take(&mut self.host.apply_completions) {
            info!(result = %outcome.result, reason = %outcome.reason, "apply complete");
        }
        for outcome in std::mem::take(&mut self.host.abort_completions) {
            info!(result = %outcome.result, reason = %outcome.reason, "abort complete");
        }

        let saves = self.host.take_saves();
        if saves == 0 {
            return;
        }
        trace!(saves, "flushing snapshot");
        if let Err(e) = self.persist() {
            error!(error = %e, "Failed to persist strategy snapshot");
        }
    }
}

/// Cloneable sender side of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerMessage>,
}

impl WorkerHandle {
    pub fn new(tx: mpsc::Sender<WorkerMessage>) -> Self {
        WorkerHandle { tx }
    }

    async fn send(&self, msg: WorkerMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| WorkerError::ChannelClosed)
    }

    async fn command(
        &self,
        make: impl FnOnce(oneshot::Sender<std::result::Result<(), StrategyError>>) -> WorkerMessage,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| WorkerError::ChannelClosed)??;
        Ok(())
    }

    pub async fn build(&self) -> Result<()> {
        self.send(WorkerMessage::Build).await
    }

    /// Applies all remaining stages, or only `stage_id`.
    pub async fn apply(&self, stage_id: Option<usize>) -> Result<()> {
        self.command(|reply| WorkerMessage::Apply { stage_id, reply })
            .await
    }

    pub async fn abort(&self, stage_id: Option<usize>) -> Result<()> {
        self.command(|reply| WorkerMessage::Abort { stage_id, reply })
            .await
    }

    pub async fn step_complete(&self, outcome: Outcome) -> Result<()> {
        self.send(WorkerMessage::StepComplete(outcome)).await
    }

    pub async fn send_event(&self, event: StepEvent) -> Result<()> {
        self.send(WorkerMessage::Event(event)).await
    }

    pub async fn extend_step_timeout(&self, timeout: Duration) -> Result<()> {
        self.send(WorkerMessage::ExtendStepTimeout(timeout)).await
    }

    /// Returns the strategy's record as of the time the message is handled.
    pub async fn snapshot(&self) -> Result<StrategyRecord> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerMessage::Snapshot { reply }).await?;
        rx.await.map_err(|_| WorkerError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(WorkerMessage::Shutdown).await
    }
}

/// Spawns `worker` on the current runtime.
///
/// The task ends on a `Shutdown` message, when `shutdown` is cancelled, or
/// when every handle is dropped, and yields the strategy.
pub fn spawn_worker(
    worker: StrategyWorker,
    shutdown: CancellationToken,
) -> (WorkerHandle, JoinHandle<Strategy>) {
    let capacity = worker.config.channel_capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let task = tokio::spawn(worker.run(rx, shutdown));
    (WorkerHandle::new(tx), task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::orchestration::{Phase, PhaseRecord, Stage, StrategyState};
    use crate::persistence::MemorySink;
    use crate::test_utils::{ScriptedStep, init_tracing, secs};
    use crate::types::{EventDisposition, StrategyId};

    /// Records the state of every persisted snapshot.
    #[derive(Debug, Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<StrategyState>>>);

    impl SharedSink {
        fn states(&self) -> Vec<StrategyState> {
            self.0.lock().unwrap().clone()
        }
    }

    impl SnapshotSink for SharedSink {
        fn persist(&mut self, record: &StrategyRecord) -> crate::persistence::snapshot::Result<()> {
            self.0.lock().unwrap().push(record.state);
            Ok(())
        }
    }

    fn waiting_strategy(timeout: Duration) -> Strategy {
        let mut strategy = Strategy::new(StrategyId::new("kube-upgrade"), "kube-upgrade");
        strategy.apply_phase_mut().add_stage(Stage::with_steps(
            "control-plane",
            vec![
                ScriptedStep::succeeding("drain").boxed(),
                ScriptedStep::waiting("upgrade")
                    .with_timeout(timeout)
                    .on_event(
                        "upgrade-done",
                        EventDisposition::Completed(Outcome::success()),
                    )
                    .boxed(),
            ],
        ));
        strategy
    }

    #[tokio::test(start_paused = true)]
    async fn drives_strategy_to_applied() {
        init_tracing();
        let sink = SharedSink::default();
        let worker = StrategyWorker::new(waiting_strategy(secs(60)), sink.clone(), WorkerConfig::new());
        let (handle, task) = spawn_worker(worker, CancellationToken::new());

        handle.build().await.unwrap();
        handle.apply(None).await.unwrap();
        let record = handle.snapshot().await.unwrap();
        assert_eq!(record.state, StrategyState::Applying);
        assert_eq!(record.current_phase_completion_percentage, 50);

        handle.step_complete(Outcome::success()).await.unwrap();
        handle.shutdown().await.unwrap();

        let strategy = task.await.unwrap();
        assert!(strategy.is_applied());
        let states = sink.states();
        assert!(states.contains(&StrategyState::ReadyToApply));
        assert_eq!(states.last(), Some(&StrategyState::Applied));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_command_is_returned_to_caller() {
        let worker = StrategyWorker::new(waiting_strategy(secs(60)), MemorySink::new(), WorkerConfig::new());
        let (handle, task) = spawn_worker(worker, CancellationToken::new());

        let err = handle.apply(None).await.unwrap_err();
        assert!(matches!(err, WorkerError::Rejected(StrategyError::NotBuilt)));

        handle.build().await.unwrap();
        let err = handle.abort(None).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Rejected(StrategyError::ApplyNotInProgress)
        ));

        handle.shutdown().await.unwrap();
        assert!(task.await.unwrap().is_ready_to_apply());
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_fires_and_aborts() {
        let worker = StrategyWorker::new(waiting_strategy(secs(30)), MemorySink::new(), WorkerConfig::new());
        let (handle, task) = spawn_worker(worker, CancellationToken::new());

        handle.build().await.unwrap();
        handle.apply(None).await.unwrap();
        tokio::time::sleep(secs(31)).await;

        let record = handle.snapshot().await.unwrap();
        assert_eq!(record.state, StrategyState::Aborted);
        assert_eq!(record.apply_phase.result_reason, "upgrade timed out");

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn extended_timeout_postpones_expiry() {
        let worker = StrategyWorker::new(waiting_strategy(secs(30)), MemorySink::new(), WorkerConfig::new());
        let (handle, task) = spawn_worker(worker, CancellationToken::new());

        handle.build().await.unwrap();
        handle.apply(None).await.unwrap();
        tokio::time::sleep(secs(20)).await;
        handle.extend_step_timeout(secs(120)).await.unwrap();
        tokio::time::sleep(secs(60)).await;

        assert_eq!(
            handle.snapshot().await.unwrap().state,
            StrategyState::Applying
        );

        handle
            .send_event(StepEvent::new("upgrade-done", Default::default()))
            .await
            .unwrap();
        handle.shutdown().await.unwrap();
        assert!(task.await.unwrap().is_applied());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let shutdown = CancellationToken::new();
        let worker = StrategyWorker::new(waiting_strategy(secs(30)), MemorySink::new(), WorkerConfig::new());
        let (handle, task) = spawn_worker(worker, shutdown.clone());

        handle.build().await.unwrap();
        handle.snapshot().await.unwrap();
        shutdown.cancel();

        let strategy = task.await.unwrap();
        assert!(strategy.is_ready_to_apply());
        assert!(matches!(
            handle.snapshot().await,
            Err(WorkerError::ChannelClosed)
        ));
    }

    fn restore(record: &StrategyRecord) -> Strategy {
        let phase = |record: &PhaseRecord| {
            let stages = record
                .stages
                .iter()
                .map(|sr| {
                    let steps = sr
                        .steps
                        .iter()
                        .map(|r| ScriptedStep::from_record(r).boxed())
                        .collect();
                    Stage::from_record(sr, steps).unwrap()
                })
                .collect();
            Phase::from_record(record, stages).unwrap()
        };
        Strategy::from_record(
            record,
            phase(&record.build_phase),
            phase(&record.apply_phase),
            phase(&record.abort_phase),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_strategy_rearms_timers() {
        let mut first = StrategyWorker::new(waiting_strategy(secs(30)), MemorySink::new(), WorkerConfig::new());
        first.handle_message(WorkerMessage::Build);
        let (reply, _rx) = oneshot::channel();
        first.handle_message(WorkerMessage::Apply {
            stage_id: None,
            reply,
        });
        // phase, phase-stage, stage and step
        assert_eq!(first.timers().len(), 4);

        let record = first.strategy().record();
        let resumed = StrategyWorker::new(restore(&record), MemorySink::new(), WorkerConfig::new());
        assert_eq!(resumed.timers().len(), 4);
        assert_eq!(resumed.strategy().record(), record);

        let (handle, task) = spawn_worker(resumed, CancellationToken::new());
        tokio::time::sleep(secs(31)).await;
        handle.shutdown().await.unwrap();
        assert!(task.await.unwrap().is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handles_end_the_loop() {
        let worker = StrategyWorker::new(waiting_strategy(secs(30)), MemorySink::new(), WorkerConfig::new());
        let (handle, task) = spawn_worker(worker, CancellationToken::new());
        drop(handle);

        assert_eq!(task.await.unwrap().state(), StrategyState::Initial);
    }
}
