use super::*;
use crate::orchestration::stage::Stage;
use crate::test_utils::{CallLog, Harness, ScriptedStep, init_tracing, secs};

fn stage_of(name: &str, steps: Vec<ScriptedStep>) -> Stage {
    Stage::with_steps(name, steps.into_iter().map(ScriptedStep::boxed).collect())
}

/// A strategy whose apply phase holds `stages`, already built.
fn built(stages: Vec<Stage>, h: &mut Harness) -> Strategy {
    let mut strategy = Strategy::new(StrategyId::new("sw-upgrade"), "sw-upgrade");
    for stage in stages {
        strategy.apply_phase_mut().add_stage(stage);
    }
    strategy.build(&mut h.ctx());
    assert_eq!(strategy.state(), StrategyState::ReadyToApply);
    strategy
}

fn sync_stages(n: usize, log: &CallLog) -> Vec<Stage> {
    (0..n)
        .map(|i| {
            let name = format!("stage-{i}");
            stage_of(&name, vec![ScriptedStep::succeeding(&name).with_log(log)])
        })
        .collect()
}

fn rebuild_phase(record: &PhaseRecord) -> Phase {
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
}

mod build_tests {
    use super::*;

    #[test]
    fn empty_build_phase_is_ready_to_apply() {
        init_tracing();
        let mut h = Harness::new();
        let mut strategy = Strategy::new(StrategyId::new("s"), "patch");

        strategy.build(&mut h.ctx());

        assert_eq!(strategy.state(), StrategyState::ReadyToApply);
        assert_eq!(strategy.current_phase(), PhaseKind::Build);
        assert_eq!(h.host.build_completions, vec![Outcome::success()]);
        assert!(h.host.saves() > 0);
    }

    #[test]
    fn failed_build_blocks_apply() {
        let mut h = Harness::new();
        let mut strategy = Strategy::new(StrategyId::new("s"), "patch");
        strategy.build_phase_mut().add_stage(stage_of(
            "query",
            vec![ScriptedStep::returning("query-hosts", Outcome::failed("no hosts"))],
        ));

        strategy.build(&mut h.ctx());

        assert_eq!(strategy.state(), StrategyState::BuildFailed);
        assert_eq!(
            strategy.apply(&mut h.ctx(), None),
            Err(StrategyError::BuildNotReady("no hosts".into()))
        );
        assert_eq!(
            strategy.apply(&mut h.ctx(), Some(0)),
            Err(StrategyError::StageApplyBlocked {
                stage_id: 0,
                reason: "no hosts".into()
            })
        );
    }

    #[test]
    fn build_timeout_is_reported() {
        let mut h = Harness::new();
        let mut strategy = Strategy::new(StrategyId::new("s"), "patch");
        strategy.build_phase_mut().add_stage(stage_of(
            "query",
            vec![ScriptedStep::waiting("query-hosts").with_timeout(secs(5))],
        ));
        strategy.build(&mut h.ctx());
        assert!(strategy.is_building());

        for id in h.advance(secs(5)) {
            strategy.timer_fired(&mut h.ctx(), id);
        }

        assert_eq!(strategy.state(), StrategyState::BuildTimeout);
        assert!(h.timers.is_empty());
    }

    #[test]
    fn second_build_is_ignored() {
        let mut h = Harness::new();
        let mut strategy = built(Vec::new(), &mut h);
        strategy.build(&mut h.ctx());
        assert_eq!(h.host.build_completions.len(), 1);
    }

    #[test]
    fn apply_before_build_is_rejected() {
        let mut h = Harness::new();
        let mut strategy = Strategy::new(StrategyId::new("s"), "patch");
        assert_eq!(strategy.apply(&mut h.ctx(), None), Err(StrategyError::NotBuilt));
    }
}

mod apply_tests {
    use super::*;

    #[test]
    fn apply_all_reaches_applied() {
        let mut h = Harness::new();
        let log = CallLog::new();
        let mut strategy = built(sync_stages(3, &log), &mut h);

        strategy.apply(&mut h.ctx(), None).unwrap();

        assert!(strategy.is_applied());
        assert_eq!(log.calls("apply:").len(), 3);
        assert_eq!(h.host.apply_completions, vec![Outcome::success()]);
        assert_eq!(
            strategy.apply(&mut h.ctx(), None),
            Err(StrategyError::ApplyCompleted)
        );
    }

    #[test]
    fn stage_by_stage_apply_enforces_order() {
        let mut h = Harness::new();
        let log = CallLog::new();
        let mut strategy = built(sync_stages(3, &log), &mut h);

        strategy.apply(&mut h.ctx(), Some(0)).unwrap();
        assert_eq!(log.calls("apply:"), vec!["stage-0"]);
        assert!(strategy.is_applying());

        assert_eq!(
            strategy.apply(&mut h.ctx(), Some(2)),
            Err(StrategyError::NotNextStage {
                stage_id: 2,
                next_stage: 1
            })
        );
        assert_eq!(
            strategy.apply(&mut h.ctx(), Some(0)),
            Err(StrategyError::StageAlreadyApplied(0))
        );
        assert_eq!(
            strategy.apply(&mut h.ctx(), Some(7)),
            Err(StrategyError::InvalidStageId {
                stage_id: 7,
                total_stages: 3
            })
        );

        strategy.apply(&mut h.ctx(), Some(1)).unwrap();
        assert_eq!(log.calls("apply:"), vec!["stage-0", "stage-1"]);

        strategy.apply(&mut h.ctx(), None).unwrap();
        assert!(strategy.is_applied());
        assert_eq!(log.calls("apply:").len(), 3);
    }

    #[test]
    fn first_stage_apply_requires_stage_zero() {
        let mut h = Harness::new();
        let mut strategy = built(sync_stages(2, &CallLog::new()), &mut h);
        assert_eq!(
            strategy.apply(&mut h.ctx(), Some(1)),
            Err(StrategyError::InvalidStageId {
                stage_id: 1,
                total_stages: 2
            })
        );
        assert_eq!(strategy.state(), StrategyState::ReadyToApply);
    }

    #[test]
    fn apply_while_running_is_rejected() {
        let mut h = Harness::new();
        let mut strategy = built(
            vec![stage_of("s0", vec![ScriptedStep::waiting("lock")])],
            &mut h,
        );
        strategy.apply(&mut h.ctx(), None).unwrap();

        assert_eq!(
            strategy.apply(&mut h.ctx(), None),
            Err(StrategyError::ApplyInProgress)
        );
        assert_eq!(
            strategy.apply(&mut h.ctx(), Some(0)),
            Err(StrategyError::ApplyInProgress)
        );
    }

    #[test]
    fn asynchronous_apply_completes_through_step_complete() {
        let mut h = Harness::new();
        let mut strategy = built(
            vec![stage_of("s0", vec![ScriptedStep::waiting("lock")])],
            &mut h,
        );
        strategy.apply(&mut h.ctx(), None).unwrap();
        assert_eq!(strategy.current_phase_completion_percentage(), 0);

        strategy.step_complete(&mut h.ctx(), Outcome::degraded("alarm"));

        assert!(strategy.is_applied());
        assert_eq!(h.host.apply_completions, vec![Outcome::degraded("alarm")]);
        assert_eq!(strategy.current_phase_completion_percentage(), 100);
    }

    #[test]
    fn events_route_to_the_apply_phase() {
        let mut h = Harness::new();
        let mut strategy = built(
            vec![stage_of(
                "s0",
                vec![ScriptedStep::waiting("lock").on_event(
                    "host-locked",
                    EventDisposition::Completed(Outcome::success()),
                )],
            )],
            &mut h,
        );
        let event = StepEvent::new("host-locked", Default::default());
        assert!(!strategy.handle_event(&mut h.ctx(), &event));

        strategy.apply(&mut h.ctx(), None).unwrap();
        assert!(strategy.handle_event(&mut h.ctx(), &event));

        assert!(strategy.is_applied());
    }
}

mod abort_tests {
    use super::*;

    #[test]
    fn failed_apply_aborts_automatically() {
        let mut h = Harness::new();
        let log = CallLog::new();
        let mut strategy = built(
            vec![
                stage_of(
                    "s0",
                    vec![ScriptedStep::succeeding("lock").with_log(&log).with_compensation(&["unlock"])],
                ),
                stage_of(
                    "s1",
                    vec![ScriptedStep::returning("upgrade", Outcome::failed("upgrade failed")).with_log(&log)],
                ),
                stage_of("s2", vec![ScriptedStep::succeeding("never").with_log(&log)]),
            ],
            &mut h,
        );

        strategy.apply(&mut h.ctx(), None).unwrap();

        assert_eq!(strategy.state(), StrategyState::Aborted);
        assert_eq!(strategy.current_phase(), PhaseKind::Abort);
        assert_eq!(log.calls("apply:"), vec!["lock", "upgrade", "unlock"]);
        assert_eq!(h.host.apply_completions, vec![Outcome::failed("upgrade failed")]);
        assert_eq!(h.host.abort_completions, vec![Outcome::success()]);
        assert_eq!(strategy.abort_phase().name(), "abort");
    }

    #[test]
    fn apply_timeout_aborts_automatically() {
        let mut h = Harness::new();
        let mut strategy = built(
            vec![stage_of("s0", vec![ScriptedStep::waiting("lock").with_timeout(secs(5))])],
            &mut h,
        );
        strategy.apply(&mut h.ctx(), None).unwrap();

        for id in h.advance(secs(5)) {
            strategy.timer_fired(&mut h.ctx(), id);
        }

        assert_eq!(strategy.state(), StrategyState::Aborted);
        assert_eq!(
            h.host.apply_completions,
            vec![Outcome::timed_out("lock timed out")]
        );
        assert!(h.timers.is_empty());
    }

    #[test]
    fn user_abort_winds_down_then_compensates() {
        let mut h = Harness::new();
        let log = CallLog::new();
        let mut strategy = built(
            vec![
                stage_of(
                    "s0",
                    vec![ScriptedStep::waiting("lock").with_log(&log).with_compensation(&["unlock"])],
                ),
                stage_of("s1", vec![ScriptedStep::succeeding("never").with_log(&log)]),
            ],
            &mut h,
        );
        strategy.apply(&mut h.ctx(), None).unwrap();

        strategy.abort(&mut h.ctx(), None).unwrap();
        assert!(strategy.is_aborting());
        assert_eq!(strategy.current_phase(), PhaseKind::Apply);
        assert_eq!(
            strategy.apply(&mut h.ctx(), None),
            Err(StrategyError::ApplyInProgress)
        );

        strategy.step_complete(&mut h.ctx(), Outcome::success());

        assert!(strategy.is_aborted());
        assert_eq!(log.calls("apply:"), vec!["lock", "unlock"]);
        assert!(strategy.apply_phase().is_aborted());
        assert_eq!(h.host.abort_completions, vec![Outcome::success()]);
        assert_eq!(
            strategy.apply(&mut h.ctx(), None),
            Err(StrategyError::ApplyDuringAbort)
        );
    }

    #[test]
    fn abort_of_wrong_stage_is_rejected() {
        let mut h = Harness::new();
        let mut strategy = built(
            vec![stage_of("s0", vec![ScriptedStep::waiting("lock")])],
            &mut h,
        );
        strategy.apply(&mut h.ctx(), None).unwrap();

        assert_eq!(
            strategy.abort(&mut h.ctx(), Some(1)),
            Err(StrategyError::StageNotInProgress(1))
        );
        strategy.abort(&mut h.ctx(), Some(0)).unwrap();
        assert!(strategy.is_aborting());
    }

    #[test]
    fn abort_while_paused_completes_immediately() {
        let mut h = Harness::new();
        let log = CallLog::new();
        let mut strategy = built(sync_stages(3, &log), &mut h);
        strategy.apply(&mut h.ctx(), Some(0)).unwrap();

        strategy.abort(&mut h.ctx(), None).unwrap();

        assert!(strategy.is_aborted());
        assert_eq!(h.host.abort_completions, vec![Outcome::aborted("")]);
    }

    #[test]
    fn abort_is_rejected_outside_apply() {
        let mut h = Harness::new();
        let mut strategy = built(sync_stages(1, &CallLog::new()), &mut h);
        assert_eq!(
            strategy.abort(&mut h.ctx(), None),
            Err(StrategyError::ApplyNotInProgress)
        );

        strategy.apply(&mut h.ctx(), None).unwrap();
        assert_eq!(
            strategy.abort(&mut h.ctx(), None),
            Err(StrategyError::ApplyNotInProgress)
        );
    }
}

mod record_tests {
    use super::*;

    #[test]
    fn waiting_strategy_round_trips_and_rearms_timers() {
        let mut h = Harness::new();
        let mut strategy = built(
            vec![
                stage_of("s0", vec![ScriptedStep::succeeding("a")]),
                stage_of("s1", vec![ScriptedStep::waiting("b").with_timeout(secs(30))]),
            ],
            &mut h,
        );
        strategy.apply(&mut h.ctx(), None).unwrap();

        let json = strategy.as_json().unwrap();
        let record: StrategyRecord = serde_json::from_str(&json).unwrap();
        let mut restored = Strategy::from_record(
            &record,
            rebuild_phase(&record.build_phase),
            rebuild_phase(&record.apply_phase),
            rebuild_phase(&record.abort_phase),
        );
        assert_eq!(restored.record(), strategy.record());

        let mut fresh = Harness::new();
        restored.refresh_timeouts(&mut fresh.ctx());
        // phase, phase-stage, stage and step timers
        assert_eq!(fresh.timers.len(), 4);

        restored.step_complete(&mut fresh.ctx(), Outcome::success());
        assert!(restored.is_applied());
        assert!(fresh.timers.is_empty());
    }

    #[test]
    fn json_uses_wire_names() {
        let mut h = Harness::new();
        let strategy = built(Vec::new(), &mut h);
        let json: serde_json::Value = serde_json::from_str(&strategy.as_json().unwrap()).unwrap();
        assert_eq!(json["state"], "ready-to-apply");
        assert_eq!(json["current_phase"], "build");
        assert_eq!(json["id"], "sw-upgrade");
        assert_eq!(json["build_phase"]["result"], "success");
    }

    #[test]
    fn initial_phase_reports_zero_percent() {
        let strategy = Strategy::new(StrategyId::new("s"), "patch");
        assert_eq!(strategy.current_phase_completion_percentage(), 0);
        assert_eq!(strategy.record().current_phase_completion_percentage, 0);
    }
}
