use phasegate::core::checkpoint::{self, FieldType, Validator};
use phasegate::core::config::ServerConfig;
use phasegate::core::engine::WorkflowEngine;
use phasegate::core::error::PhasegateError;
use phasegate::core::generator::{ENTRY_POINT, FrameworkGenerator};
use phasegate::core::index::IndexBuilder;
use phasegate::core::models::WorkflowMetadata;
use phasegate::core::rag::RagEngine;
use phasegate::core::state::StateManager;
use phasegate::core::validator;
use serde_json::{Map, json};
use std::sync::Arc;
use tempfile::TempDir;

fn phases(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[test]
fn quick_start_generates_one_task_per_phase() {
    let generator = FrameworkGenerator::new();
    let fw = generator
        .generate_framework("api_docs_v1", "documentation", &phases(&["Survey", "Draft", "Review"]), "rust", true)
        .expect("generate");

    assert_eq!(fw.files.len(), 8);
    assert!(fw.files.contains_key(ENTRY_POINT));
    assert!(fw.files.contains_key("phases/2/task-1-execute.md"));

    let metadata: WorkflowMetadata =
        serde_json::from_str(&fw.files["metadata.json"]).expect("metadata");
    assert_eq!(metadata.workflow_type, "api_docs_v1");
    assert_eq!(metadata.total_phases, 3);
    assert_eq!(metadata.phases[0].phase_number, 0);
    assert_eq!(metadata.phases[2].phase_name, "Review");

    let compliance = generator.validate_compliance(&fw);
    assert_eq!(compliance["compliant"], true);
    assert_eq!(compliance["overall_score"], 100);
    assert_eq!(compliance["task_files"], 3);
}

#[test]
fn full_mode_generates_analyze_implement_verify_tasks() {
    let generator = FrameworkGenerator::new();
    let fw = generator
        .generate_framework("refactor_v1", "refactoring", &phases(&["Plan", "Apply"]), "python", false)
        .expect("generate");

    assert_eq!(fw.files.len(), 10);
    for slug in ["task-1-analyze.md", "task-2-implement.md", "task-3-verify.md"] {
        assert!(fw.files.contains_key(&format!("phases/1/{slug}")), "missing {slug}");
    }
    let task = &fw.files["phases/0/task-2-implement.md"];
    assert!(task.contains("🛑 EXECUTE-NOW"));
    assert!(task.contains("📊 COUNT-AND-DOCUMENT"));
    assert!(task.contains("🔍 QUERY-AND-DECIDE"));
}

#[test]
fn compliance_drops_when_rules_are_broken() {
    let generator = FrameworkGenerator::new();
    let mut fw = generator
        .generate_framework("wf_v1", "testing", &phases(&["Only"]), "go", true)
        .expect("generate");
    fw.files.remove(ENTRY_POINT);
    fw.files
        .insert("phases/0/task-1-execute.md".to_string(), "plain prose\n".repeat(150));

    let compliance = generator.validate_compliance(&fw);
    assert_eq!(compliance["compliant"], false);
    assert_eq!(compliance["checks"]["entry_point"], false);
    assert_eq!(compliance["checks"]["task_size"], false);
    assert_eq!(compliance["checks"]["command_language"], false);
    assert_eq!(compliance["checks"]["metadata"], true);
    assert_eq!(compliance["overall_score"], 50);
}

#[test]
fn invalid_requests_are_rejected() {
    let generator = FrameworkGenerator::new();
    assert!(matches!(
        generator.generate_framework(" ", "testing", &phases(&["A"]), "go", true),
        Err(PhasegateError::ValidationError(_))
    ));
    assert!(matches!(
        generator.generate_framework("wf", "testing", &[], "go", true),
        Err(PhasegateError::ValidationError(_))
    ));
}

#[test]
fn generated_checkpoints_are_machine_readable() {
    let fw = FrameworkGenerator::new()
        .generate_framework("wf_v1", "testing", &phases(&["Setup"]), "go", true)
        .expect("generate");
    let reqs = checkpoint::parse_requirements([fw.files["phases/0/phase.md"].as_str()]);

    let fields: Vec<&str> = reqs.required_evidence.iter().map(|(f, _)| f.as_str()).collect();
    assert_eq!(fields, vec!["phase_0_complete", "outcome_notes"]);
    assert_eq!(reqs.required_evidence[0].1.field_type, FieldType::Bool);
    assert_eq!(reqs.required_evidence[1].1.field_type, FieldType::Str);
    assert_eq!(reqs.required_evidence[1].1.validator, Validator::NonEmpty);
}

#[test]
fn saved_framework_validates_and_runs_through_the_engine() {
    let tmp = TempDir::new().expect("tempdir");
    let base = tmp.path().join(".agent-os");
    let config = ServerConfig::with_defaults(&base);
    let paths = config.resolved_paths();

    let fw = FrameworkGenerator::new()
        .generate_framework("onboard_v1", "onboarding", &phases(&["Read", "Build", "Ship"]), "rust", true)
        .expect("generate");
    let root = paths.workflows_path.join("onboard_v1");
    fw.save(&root).expect("save");

    let report = validator::validate_workflow(&root);
    assert!(report.compliant, "{:?}", report.issues);
    assert_eq!(report.compliance_score, 100, "{:?}", report.warnings);

    IndexBuilder::new(&paths.index_path, config.content_roots())
        .build_index(true, false)
        .expect("index");
    let rag = Arc::new(RagEngine::open(&paths.index_path).expect("rag"));
    let state_manager = StateManager::new(&paths.state_dir, 7)
        .expect("state")
        .with_workflows_path(&paths.workflows_path);
    let mut engine = WorkflowEngine::new(state_manager, rag, &paths.workflows_path);

    let started = engine
        .start_workflow("onboard_v1", "README.md", Map::new())
        .expect("start");
    assert_eq!(started["current_phase"], 0);
    assert_eq!(started["phase_content"]["phase_name"], "Read");
    let id = started["session_id"].as_str().expect("id").to_string();

    let rejected = engine.complete_phase(&id, 0, &Map::new()).expect("complete");
    assert_eq!(rejected["missing_evidence"].as_array().map(Vec::len), Some(2));

    let evidence = json!({"phase_0_complete": true, "outcome_notes": "read the docs"});
    let accepted = engine
        .complete_phase(&id, 0, evidence.as_object().expect("object"))
        .expect("complete");
    assert_eq!(accepted["checkpoint_passed"], true);
    assert_eq!(accepted["next_phase"], 1);
}
