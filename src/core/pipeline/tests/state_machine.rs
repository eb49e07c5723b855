use crate::core::pipeline::{AttemptMap, RunState, Stage, StageAttempts, can_transition};

#[test]
fn happy_path_with_patch_is_allowed() {
    let path = [
        (RunState::Received, RunState::Extracting),
        (RunState::Extracting, RunState::Diagnosing),
        (RunState::Diagnosing, RunState::Patching),
        (RunState::Patching, RunState::Delivering),
        (RunState::Delivering, RunState::Done),
    ];
    for (from, to) in path {
        assert!(
            can_transition(from, to),
            "expected transition {:?} -> {:?} to be allowed",
            from,
            to
        );
    }
}

#[test]
fn low_confidence_route_bypasses_patching() {
    assert!(can_transition(
        RunState::Diagnosing,
        RunState::SkippedLowConfidence
    ));
    assert!(can_transition(
        RunState::SkippedLowConfidence,
        RunState::Delivering
    ));
    assert!(!can_transition(
        RunState::SkippedLowConfidence,
        RunState::Patching
    ));
}

#[test]
fn stages_cannot_be_skipped() {
    assert!(!can_transition(RunState::Received, RunState::Diagnosing));
    assert!(!can_transition(RunState::Extracting, RunState::Delivering));
    assert!(!can_transition(RunState::Diagnosing, RunState::Done));
}

#[test]
fn failed_states_only_reach_abandoned() {
    for failed in [
        RunState::ExtractingFailed,
        RunState::DiagnosingFailed,
        RunState::PatchingFailed,
        RunState::DeliveringFailed,
    ] {
        assert!(can_transition(failed, RunState::Abandoned));
        assert!(!can_transition(failed, RunState::Extracting));
        assert!(!can_transition(failed, RunState::Done));
        assert!(failed.is_terminal());
        assert!(failed.needs_intervention());
    }
}

#[test]
fn done_and_abandoned_are_dead_ends() {
    for terminal in [RunState::Done, RunState::Abandoned] {
        for to in [
            RunState::Received,
            RunState::Extracting,
            RunState::Delivering,
            RunState::Abandoned,
        ] {
            if terminal == to {
                continue;
            }
            assert!(!can_transition(terminal, to));
        }
        assert!(terminal.is_terminal());
        assert!(!terminal.needs_intervention());
    }
}

#[test]
fn abandon_is_reachable_from_active_states() {
    for from in [
        RunState::Received,
        RunState::Extracting,
        RunState::Diagnosing,
        RunState::Patching,
        RunState::SkippedLowConfidence,
        RunState::Delivering,
    ] {
        assert!(
            can_transition(from, RunState::Abandoned),
            "expected abandon from {:?}",
            from
        );
    }
}

#[test]
fn state_names_round_trip() {
    for state in [
        RunState::Received,
        RunState::Extracting,
        RunState::Diagnosing,
        RunState::Patching,
        RunState::SkippedLowConfidence,
        RunState::Delivering,
        RunState::Done,
        RunState::ExtractingFailed,
        RunState::DiagnosingFailed,
        RunState::PatchingFailed,
        RunState::DeliveringFailed,
        RunState::Abandoned,
    ] {
        assert_eq!(RunState::from_str(state.as_str()), Some(state));
    }
    assert_eq!(RunState::from_str("nonsense"), None);
}

#[test]
fn attempt_map_round_trips_through_json() {
    let mut attempts = AttemptMap::new();
    attempts.insert(
        Stage::Diagnosing,
        StageAttempts {
            transient: 2,
            schema: 1,
        },
    );
    let json = serde_json::to_string(&attempts).unwrap();
    let back: AttemptMap = serde_json::from_str(&json).unwrap();
    assert_eq!(back.get(&Stage::Diagnosing).unwrap().transient, 2);
    assert_eq!(back.get(&Stage::Diagnosing).unwrap().schema, 1);
}
