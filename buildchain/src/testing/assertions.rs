//! Test assertions for runs and stage instances.

use crate::core::{RunStatus, StageStatus};
use crate::events::{CollectingEventSink, PipelineEvent};
use crate::run::Run;

/// Asserts that every instance's history follows the stage state machine
/// and ends in its current status.
pub fn assert_valid_history(run: &Run) {
    for (stage_id, instance) in &run.instances {
        let path = instance.status_path();
        assert_eq!(
            path.first(),
            Some(&StageStatus::Pending),
            "Stage '{stage_id}' did not start pending: {path:?}"
        );
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1], instance.kind),
                "Stage '{stage_id}' made an illegal transition {} -> {}: {path:?}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(
            path.last(),
            Some(&instance.status),
            "Stage '{stage_id}' history does not end in its status"
        );
    }
}

/// Asserts the status of one stage instance.
pub fn assert_stage_status(run: &Run, stage_id: &str, expected: StageStatus) {
    let actual = run.stage_status(stage_id);
    assert_eq!(
        actual,
        Some(expected),
        "Expected stage '{stage_id}' to be {expected}, got {actual:?}"
    );
}

/// Asserts the status of several stage instances.
pub fn assert_stage_statuses(run: &Run, expected: &[(&str, StageStatus)]) {
    for (stage_id, status) in expected {
        assert_stage_status(run, stage_id, *status);
    }
}

/// Asserts the run's terminal status and that it has a finish time.
pub fn assert_run_status(run: &Run, expected: RunStatus) {
    assert_eq!(
        run.status, expected,
        "Expected run {} to be {expected}, got {}",
        run.id, run.status
    );
    if expected.is_terminal() {
        assert!(run.finished_at.is_some(), "Terminal run {} has no finish time", run.id);
    }
}

/// Asserts that `upstream` reached a terminal status before `downstream`
/// started running, according to the emitted events.
pub fn assert_finished_before_started(events: &CollectingEventSink, upstream: &str, downstream: &str) {
    let events = events.events();
    let position = |stage: &str, pred: fn(StageStatus) -> bool| {
        events.iter().position(|e| {
            matches!(e, PipelineEvent::StageTransitioned { stage_id, to, .. }
                if stage_id == stage && pred(*to))
        })
    };
    let done = position(upstream, |s| s.is_terminal());
    let started = position(downstream, |s| s == StageStatus::Running);
    match (done, started) {
        (Some(done), Some(started)) => assert!(
            done < started,
            "Stage '{downstream}' started before '{upstream}' finished"
        ),
        _ => panic!(
            "Missing events: '{upstream}' terminal at {done:?}, '{downstream}' running at {started:?}"
        ),
    }
}
