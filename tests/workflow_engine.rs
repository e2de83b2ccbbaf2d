use phasegate::core::config::ServerConfig;
use phasegate::core::engine::{GUIDANCE_MODE_KEY, WorkflowEngine};
use phasegate::core::error::PhasegateError;
use phasegate::core::index::IndexBuilder;
use phasegate::core::rag::RagEngine;
use phasegate::core::state::StateManager;
use serde_json::{Map, Value as JsonValue, json};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const TASKS_MD: &str = "# Tasks

## Phase 1: Foundation

**Objective:** Build the data layer
**Estimated Duration:** 2 days

- [ ] **Task 1.1: Create models**
  - **Estimated Time:** 2h
  - **Dependencies:** None
  - **Acceptance Criteria:**
    - [ ] Models compile
    - [ ] Fields documented

- [ ] **Task 1.2: Add storage**
  - **Estimated Time:** 3h
  - **Dependencies:** Task 1.1

**Validation Gate:**
- [ ] All models tested

## Phase 2: Polish

**Objective:** Tidy up

- [ ] **Task 2.1: Write docs**
  - **Dependencies:** 1.1, 1.2
";

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    fs::write(path, content).expect("write fixture");
}

fn fixture() -> (TempDir, ServerConfig) {
    let tmp = TempDir::new().expect("tempdir");
    let base = tmp.path().join(".agent-os");
    write(
        &base.join("standards/testing.md"),
        "# Testing Standards\n\n## Mocking\nPrefer mocking at the boundary.\n",
    );
    write(&base.join("usage/guide.md"), "# Usage\n\nCall search_standards first.\n");

    let demo = base.join("workflows/demo_v1");
    write(
        &demo.join("metadata.json"),
        &json!({
            "workflow_type": "demo_v1",
            "version": "1.0.0",
            "description": "Demo workflow",
            "total_phases": 2,
            "phases": [
                {"phase_number": 1, "phase_name": "Analysis"},
                {"phase_number": 2, "phase_name": "Generation"}
            ]
        })
        .to_string(),
    );
    write(
        &demo.join("phases/1/phase.md"),
        "# Phase 1: Analysis\n\nInspect the target file.\n\n## Checkpoint\n\n- Must provide `functions_count` (total number, at least one)\n",
    );
    write(
        &demo.join("phases/1/task-1-analyze.md"),
        "# Task 1: Analyze Functions\n\n🛑 EXECUTE-NOW: Count functions\n```bash\ngrep -c 'def ' target.py\n```\n📊 COUNT-AND-DOCUMENT: number of functions\n",
    );
    write(
        &demo.join("phases/2/phase.md"),
        "# Phase 2: Generation\n\nWrite the tests.\n\n## Checkpoint\n\n- Evidence: `tests_written` count of test cases, at least one\n",
    );
    write(
        &demo.join("phases/2/task-1-generate.md"),
        "# Task 1: Generate Tests\n\n🔍 QUERY-AND-DECIDE: which fixtures to reuse\n",
    );

    let spec_exec = base.join("workflows/spec_exec_v1");
    write(
        &spec_exec.join("metadata.json"),
        &json!({
            "workflow_type": "spec_exec_v1",
            "total_phases": 1,
            "dynamic_phases": true,
            "dynamic_config": {"source_type": "spec_tasks_md"}
        })
        .to_string(),
    );
    write(
        &spec_exec.join("phases/0/phase.md"),
        "# Phase 0: Orientation\n\nRead the spec before starting.\n",
    );
    write(&tmp.path().join("spec/tasks.md"), TASKS_MD);

    (tmp, ServerConfig::with_defaults(&base))
}

fn engine(config: &ServerConfig) -> WorkflowEngine {
    let paths = config.resolved_paths();
    IndexBuilder::new(&paths.index_path, config.content_roots())
        .build_index(true, false)
        .expect("build index");
    let rag = Arc::new(RagEngine::open(&paths.index_path).expect("open rag"));
    let state_manager = StateManager::new(&paths.state_dir, 7)
        .expect("state manager")
        .with_workflows_path(&paths.workflows_path);
    WorkflowEngine::new(state_manager, rag, &paths.workflows_path)
}

fn obj(value: JsonValue) -> Map<String, JsonValue> {
    value.as_object().cloned().expect("object")
}

fn session_id(response: &JsonValue) -> String {
    response["session_id"].as_str().expect("session_id").to_string()
}

#[test]
fn start_workflow_serves_first_phase_with_guidance_and_task_listing() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);

    let response = engine
        .start_workflow("demo_v1", "src/app.py", Map::new())
        .expect("start");

    let first_key = response.as_object().expect("object").keys().next().cloned();
    assert_eq!(first_key.as_deref(), Some(GUIDANCE_MODE_KEY));
    assert_eq!(response["current_phase"], 1);
    assert_eq!(response["workflow_overview"]["total_phases"], 2);
    assert_eq!(response["phase_content"]["phase_name"], "Analysis");
    let tasks = response["phase_content"]["tasks"].as_array().expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["task_number"], 1);
    assert_eq!(tasks[0]["task_name"], "Task 1: Analyze Functions");
    assert_eq!(response["is_complete"], false);
}

#[test]
fn requesting_a_future_phase_returns_sequence_violation_with_current_content() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);
    let id = session_id(&engine.start_workflow("demo_v1", "src/app.py", Map::new()).expect("start"));

    let response = engine.get_phase_content(&id, 2).expect("phase content");
    assert_eq!(response["error"], "Phase sequence violation");
    assert_eq!(response["violation_type"], "attempted_skip");
    assert_eq!(response["requested_phase"], 2);
    assert_eq!(response["current_phase"], 1);
    assert_eq!(response["phase_gating_enforced"], true);
    assert_eq!(response["current_phase_content"]["phase_number"], 1);

    let task = engine.get_task(&id, 2, 1).expect("task");
    assert_eq!(task["error"], "Phase sequence violation");
}

#[test]
fn get_task_extracts_command_language_steps() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);
    let id = session_id(&engine.start_workflow("demo_v1", "src/app.py", Map::new()).expect("start"));

    let task = engine.get_task(&id, 1, 1).expect("task");
    assert_eq!(task["session_id"], id.as_str());
    assert_eq!(task["task_name"], "Task 1: Analyze Functions");
    assert_eq!(task["task_file"], "workflows/demo_v1/phases/1/task-1-analyze.md");
    let steps = task["steps"].as_array().expect("steps");
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["command"], "grep -c 'def ' target.py");
    assert_eq!(steps[0]["evidence_required"], "number of functions");

    let missing = engine.get_task(&id, 1, 9).expect("missing task");
    assert_eq!(missing["error"], "Task 9 not found in Phase 1");
}

#[test]
fn checkpoint_rejects_missing_and_mistyped_evidence_then_advances() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);
    let id = session_id(&engine.start_workflow("demo_v1", "src/app.py", Map::new()).expect("start"));

    let failed = engine.complete_phase(&id, 1, &Map::new()).expect("complete");
    assert_eq!(failed["checkpoint_passed"], false);
    assert_eq!(failed["current_phase"], 1);
    let missing = failed["missing_evidence"].as_array().expect("missing");
    assert_eq!(missing.len(), 1);
    assert!(missing[0].as_str().unwrap().starts_with("functions_count (required:"));

    let wrong_type = engine
        .complete_phase(&id, 1, &obj(json!({"functions_count": "many"})))
        .expect("complete");
    assert_eq!(wrong_type["checkpoint_passed"], false);
    assert!(
        wrong_type["missing_evidence"][0]
            .as_str()
            .unwrap()
            .contains("wrong type: expected int, got str")
    );

    let zero = engine
        .complete_phase(&id, 1, &obj(json!({"functions_count": 0})))
        .expect("complete");
    assert_eq!(zero["checkpoint_passed"], false);

    let state = engine.get_workflow_state(&id).expect("state");
    assert_eq!(state["checkpoints"]["1"], "failed");

    let passed = engine
        .complete_phase(&id, 1, &obj(json!({"functions_count": 4})))
        .expect("complete");
    assert_eq!(passed["checkpoint_passed"], true);
    assert_eq!(passed["workflow_complete"], false);
    assert_eq!(passed["next_phase"], 2);
    assert_eq!(passed["next_phase_content"]["phase_name"], "Generation");

    let state = engine.get_workflow_state(&id).expect("state");
    assert_eq!(state["current_phase"], 2);
    assert_eq!(state["completed_phases"], json!([1]));
    assert_eq!(state["checkpoints"]["1"], "passed");
    assert_eq!(state["artifacts"]["1"]["evidence_fields"], json!(["functions_count"]));

    // Completed phases stay readable.
    let review = engine.get_phase_content(&id, 1).expect("phase 1");
    assert_eq!(review["requested_phase"], 1);
    assert!(review.get("error").is_none());
}

#[test]
fn completing_a_phase_other_than_current_is_an_error() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);
    let id = session_id(&engine.start_workflow("demo_v1", "src/app.py", Map::new()).expect("start"));

    let err = engine
        .complete_phase(&id, 2, &obj(json!({"tests_written": 3})))
        .expect_err("skip must fail");
    assert!(matches!(err, PhasegateError::ValidationError(_)));
    assert!(err.to_string().contains("current phase is 1"));
}

#[test]
fn final_checkpoint_completes_workflow_and_releases_session() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);
    let id = session_id(&engine.start_workflow("demo_v1", "src/app.py", Map::new()).expect("start"));

    engine
        .complete_phase(&id, 1, &obj(json!({"functions_count": 2})))
        .expect("phase 1");
    let done = engine
        .complete_phase(&id, 2, &obj(json!({"tests_written": 5})))
        .expect("phase 2");
    assert_eq!(done["checkpoint_passed"], true);
    assert_eq!(done["workflow_complete"], true);
    assert_eq!(done["completed_phases"], json!([1, 2]));

    let state = engine.get_workflow_state(&id).expect("state from disk");
    assert_eq!(state["is_complete"], true);
    assert_eq!(state["current_phase"], 3);

    let after = engine.get_current_phase(&id).expect("current");
    assert_eq!(after["phase_content"]["message"], "All phases complete");

    let fresh = engine
        .start_workflow("demo_v1", "src/app.py", Map::new())
        .expect("restart");
    assert_ne!(session_id(&fresh), id);
    assert!(fresh.get("resumed").is_none());
}

#[test]
fn finished_workflow_rejects_further_completions() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);
    let id = session_id(&engine.start_workflow("demo_v1", "src/app.py", Map::new()).expect("start"));
    engine
        .complete_phase(&id, 1, &obj(json!({"functions_count": 2})))
        .expect("phase 1");
    engine
        .complete_phase(&id, 2, &obj(json!({"tests_written": 5})))
        .expect("phase 2");

    let err = engine
        .complete_phase(&id, 3, &Map::new())
        .expect_err("past the final phase");
    assert!(matches!(err, PhasegateError::ValidationError(_)));
    assert!(err.to_string().contains("already complete"));

    let state = engine
        .state_manager()
        .load_state(&id)
        .expect("load")
        .expect("present");
    assert_eq!(state.current_phase, 3);
    assert_eq!(state.completed_phases, vec![1, 2]);
    assert!(engine.state_manager().validate_state(&state).0);

    let mut overrun = state.clone();
    overrun.completed_phases.push(3);
    overrun.current_phase = 4;
    let (valid, issues) = engine.state_manager().validate_state(&overrun);
    assert!(!valid);
    assert!(issues.iter().any(|i| i.contains("exceed")));
    assert!(issues.iter().any(|i| i.contains("past the final phase")));
}

#[test]
fn custom_workflows_directory_keeps_tasks_and_checkpoints() {
    let (_tmp, mut config) = fixture();
    fs::rename(config.base_path.join("workflows"), config.base_path.join("flows")).expect("rename");
    config.rag.workflows_path = "flows".to_string();
    let mut engine = engine(&config);

    let start = engine
        .start_workflow("demo_v1", "src/app.py", Map::new())
        .expect("start");
    let tasks = start["phase_content"]["tasks"].as_array().expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["task_file"], "workflows/demo_v1/phases/1/task-1-analyze.md");

    let rejected = engine
        .complete_phase(&session_id(&start), 1, &Map::new())
        .expect("complete");
    assert_eq!(rejected["checkpoint_passed"], false);
    assert!(rejected["missing_evidence"].to_string().contains("functions_count"));
}

#[test]
fn reindex_refreshes_metadata_of_cached_sessions() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);
    let id = session_id(&engine.start_workflow("demo_v1", "src/app.py", Map::new()).expect("start"));
    let before = engine.get_current_phase(&id).expect("current");
    assert_eq!(before["phase_content"]["phase_name"], "Analysis");

    let paths = config.resolved_paths();
    write(
        &paths.workflows_path.join("demo_v1/metadata.json"),
        &json!({
            "workflow_type": "demo_v1",
            "total_phases": 2,
            "phases": [
                {"phase_number": 1, "phase_name": "Discovery"},
                {"phase_number": 2, "phase_name": "Generation"}
            ]
        })
        .to_string(),
    );
    IndexBuilder::new(&paths.index_path, config.content_roots())
        .build_index(false, true)
        .expect("reindex");
    engine.rag().reload_index().expect("reload");

    let after = engine.get_current_phase(&id).expect("current");
    assert_eq!(after["phase_content"]["phase_name"], "Discovery");
    assert_eq!(after["current_phase"], 1);
}

#[test]
fn workflow_types_that_escape_the_workflows_directory_are_rejected() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);
    for bad in ["../../x", "demo_v1/../demo_v1", "a b"] {
        let err = engine
            .start_workflow(bad, "src/app.py", Map::new())
            .expect_err("invalid workflow type");
        assert!(matches!(err, PhasegateError::ValidationError(_)), "{bad}");
    }
    assert!(engine.state_manager().list_sessions(None, false).expect("list").is_empty());
}

#[test]
fn starting_again_for_same_target_resumes_active_session() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);
    let first = engine
        .start_workflow("demo_v1", "src/app.py", Map::new())
        .expect("start");
    let id = session_id(&first);
    engine
        .complete_phase(&id, 1, &obj(json!({"functions_count": 1})))
        .expect("phase 1");

    let resumed = engine
        .start_workflow("demo_v1", "src/app.py", Map::new())
        .expect("resume");
    assert_eq!(session_id(&resumed), id);
    assert_eq!(resumed["resumed"], true);
    assert_eq!(resumed["current_phase"], 2);

    let other = engine
        .start_workflow("demo_v1", "src/other.py", Map::new())
        .expect("other target");
    assert_ne!(session_id(&other), id);
}

#[test]
fn sessions_survive_engine_restart() {
    let (_tmp, config) = fixture();
    let id = {
        let mut engine = engine(&config);
        let id = session_id(&engine.start_workflow("demo_v1", "src/app.py", Map::new()).expect("start"));
        engine
            .complete_phase(&id, 1, &obj(json!({"functions_count": 3})))
            .expect("phase 1");
        id
    };

    let mut restarted = engine(&config);
    let current = restarted.get_current_phase(&id).expect("current");
    assert_eq!(current["current_phase"], 2);
    assert_eq!(current["completed_phases"], json!([1]));
}

#[test]
fn unknown_session_is_not_found() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);
    let err = engine.get_current_phase("01UNKNOWN").expect_err("unknown");
    assert!(matches!(err, PhasegateError::NotFound(_)));

    let err = engine.get_current_phase("../escape").expect_err("traversal");
    assert!(matches!(err, PhasegateError::ValidationError(_)));
}

#[test]
fn missing_metadata_falls_back_to_synthesized_phases() {
    let (_tmp, config) = fixture();
    let mut engine = engine(&config);
    let metadata = engine.load_workflow_metadata("test_generation_v9");
    assert_eq!(metadata.total_phases, 8);
    assert_eq!(metadata.version, "unknown");

    let response = engine
        .start_workflow("test_generation_v9", "src/app.py", Map::new())
        .expect("start");
    assert_eq!(response["workflow_overview"]["total_phases"], 8);
}

#[test]
fn dynamic_workflow_serves_phases_parsed_from_spec_tasks() {
    let (tmp, config) = fixture();
    let mut engine = engine(&config);
    let spec_path = tmp.path().join("spec");
    let options = obj(json!({"spec_path": spec_path.display().to_string()}));

    let start = engine
        .start_workflow("spec_exec_v1", "specs/feature", options)
        .expect("start");
    let id = session_id(&start);
    assert_eq!(start["current_phase"], 0);
    assert_eq!(start["dynamic"], true);

    let state = engine.get_workflow_state(&id).expect("state");
    assert_eq!(state["total_phases"], 3);

    let advanced = engine.complete_phase(&id, 0, &Map::new()).expect("phase 0");
    assert_eq!(advanced["checkpoint_passed"], true);
    assert_eq!(advanced["next_phase"], 1);
    let content = &advanced["next_phase_content"];
    assert_eq!(content["phase_name"], "Foundation");
    assert_eq!(content["description"], "Build the data layer");
    assert_eq!(content["estimated_duration"], "2 days");
    assert_eq!(content["validation_gate"], json!(["All models tested"]));
    assert_eq!(content["tasks"][1]["task_id"], "1.2");
    assert_eq!(content["tasks"][1]["dependencies"], json!(["1.1"]));

    let task = engine.get_task(&id, 1, 1).expect("task");
    assert_eq!(task["task_id"], "1.1");
    assert_eq!(task["estimated_time"], "2h");
    assert_eq!(task["acceptance_criteria"], json!(["Models compile", "Fields documented"]));
    let body = task["content"].as_str().expect("content");
    assert!(body.starts_with("# Task 1.1: Create models"));
    assert!(body.contains("- [ ] Models compile"));
}
