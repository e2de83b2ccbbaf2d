use chrono::Duration;
use phasegate::core::error::PhasegateError;
use phasegate::core::models::{PhaseArtifact, WorkflowState};
use phasegate::core::state::StateManager;
use serde_json::{Map, json};
use std::fs;
use tempfile::TempDir;

fn manager(days: i64) -> (TempDir, StateManager) {
    let tmp = TempDir::new().expect("tempdir");
    let manager = StateManager::new(&tmp.path().join("state"), days).expect("state manager");
    (tmp, manager)
}

#[test]
fn created_session_round_trips_through_disk() {
    let (_tmp, manager) = manager(7);
    let options = json!({"spec_path": "specs/feature"}).as_object().cloned().unwrap();
    let mut state = manager
        .create_session("demo_v1", "src/app.py", options, 3)
        .expect("create");
    assert_eq!(state.starting_phase, 1);
    assert_eq!(state.final_phase, 3);
    assert!(manager.state_dir().join(format!("{}.json", state.session_id)).is_file());

    state.complete_phase(1, PhaseArtifact::from_evidence(1, &Map::new()));
    let before = state.updated_at;
    manager.save_state(&mut state).expect("save");
    assert!(state.updated_at >= before);

    let loaded = manager
        .load_state(&state.session_id)
        .expect("load")
        .expect("present");
    assert_eq!(loaded, state);
    assert_eq!(loaded.metadata["spec_path"], "specs/feature");
    assert_eq!(loaded.current_phase, 2);
}

#[test]
fn missing_session_loads_as_none_and_bad_ids_are_rejected() {
    let (_tmp, manager) = manager(7);
    assert!(manager.load_state("01HZZZZZZZZZZZZZZZZZZZZZZZ").expect("load").is_none());
    assert!(matches!(
        manager.load_state("../../etc/passwd"),
        Err(PhasegateError::ValidationError(_))
    ));
    assert!(!manager.delete_session("01NOTHERE").expect("delete"));
}

#[test]
fn corrupted_state_file_is_reported_and_skipped_in_listings() {
    let (_tmp, manager) = manager(7);
    let good = manager
        .create_session("demo_v1", "a.py", Map::new(), 2)
        .expect("create");
    fs::write(manager.state_dir().join("broken.json"), "{ not json").expect("write");

    let err = manager.load_state("broken").expect_err("corrupt");
    assert!(err.to_string().contains("Corrupted state file"));

    let listed = manager.list_sessions(None, false).expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_id, good.session_id);
}

#[test]
fn listing_filters_by_type_and_activity_newest_first() {
    let (_tmp, manager) = manager(7);
    let first = manager
        .create_session("demo_v1", "a.py", Map::new(), 1)
        .expect("create");
    let mut second = manager
        .create_session("demo_v1", "b.py", Map::new(), 1)
        .expect("create");
    manager
        .create_session("other_v1", "c.py", Map::new(), 1)
        .expect("create");

    second.complete_phase(1, PhaseArtifact::from_evidence(1, &Map::new()));
    manager.save_state(&mut second).expect("save");

    let demo = manager.list_sessions(Some("demo_v1"), false).expect("list");
    assert_eq!(demo.len(), 2);
    assert_eq!(demo[0].session_id, second.session_id);

    let active = manager.list_sessions(Some("demo_v1"), true).expect("active");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_id, first.session_id);

    assert_eq!(
        manager
            .get_active_session("demo_v1", "a.py")
            .expect("active")
            .map(|s| s.session_id),
        Some(first.session_id.clone())
    );
    assert!(manager.get_active_session("demo_v1", "b.py").expect("done").is_none());

    let stats = manager.get_statistics().expect("stats");
    assert_eq!(stats.total_sessions, 3);
    assert_eq!(stats.completed_sessions, 1);
    assert_eq!(stats.active_sessions, 2);
    assert_eq!(stats.workflow_type_counts["demo_v1"], 2);
}

#[test]
fn cleanup_removes_only_sessions_older_than_retention() {
    let (_tmp, manager) = manager(7);
    let mut stale = manager
        .create_session("demo_v1", "old.py", Map::new(), 1)
        .expect("create");
    stale.created_at = stale.created_at - Duration::days(10);
    stale.updated_at = stale.created_at;
    manager.write_state(&stale).expect("backdate");
    let fresh = manager
        .create_session("demo_v1", "new.py", Map::new(), 1)
        .expect("create");

    assert_eq!(manager.cleanup_old_sessions().expect("cleanup"), 1);
    assert!(manager.load_state(&stale.session_id).expect("load").is_none());
    assert!(manager.load_state(&fresh.session_id).expect("load").is_some());
}

#[test]
fn recover_repairs_inconsistent_phase_bookkeeping() {
    let (_tmp, manager) = manager(7);
    let mut state = WorkflowState::new("01RECOVER", "demo_v1", "a.py", 1, 5, Map::new());
    state.completed_phases = vec![2, 1, 1];
    state.current_phase = 7;
    manager.write_state(&state).expect("write");

    let (valid, issues) = manager.validate_state(&state);
    assert!(!valid);
    assert!(issues.iter().any(|i| i.contains("not sequential")));
    assert!(issues.iter().any(|i| i.contains("does not follow")));

    assert!(manager.recover_corrupted_state("01RECOVER").expect("recover"));
    let repaired = manager.load_state("01RECOVER").expect("load").expect("present");
    assert_eq!(repaired.completed_phases, vec![1, 2]);
    assert_eq!(repaired.current_phase, 3);
    assert!(manager.validate_state(&repaired).0);

    assert!(matches!(
        manager.recover_corrupted_state("01MISSING"),
        Err(PhasegateError::NotFound(_))
    ));
}

#[test]
fn recover_refuses_gaps_it_cannot_fill() {
    let (_tmp, manager) = manager(7);
    let mut state = WorkflowState::new("01GAPPED", "demo_v1", "a.py", 1, 5, Map::new());
    state.completed_phases = vec![1, 3];
    state.current_phase = 4;
    manager.write_state(&state).expect("write");

    assert!(!manager.recover_corrupted_state("01GAPPED").expect("recover"));
    let untouched = manager.load_state("01GAPPED").expect("load").expect("present");
    assert_eq!(untouched.completed_phases, vec![1, 3]);
}

#[test]
fn workflows_with_phase_zero_start_there() {
    let tmp = TempDir::new().expect("tempdir");
    let workflows = tmp.path().join("workflows");
    fs::create_dir_all(workflows.join("zero_v1/phases/0")).expect("mkdir");
    let manager = StateManager::new(&tmp.path().join("state"), 7)
        .expect("state manager")
        .with_workflows_path(&workflows);

    let state = manager
        .create_session("zero_v1", "a.py", Map::new(), 4)
        .expect("create");
    assert_eq!(state.starting_phase, 0);
    assert_eq!(state.current_phase, 0);
    assert_eq!(state.final_phase, 3);
}
