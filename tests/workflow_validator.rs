use phasegate::core::validator::{self, PHASE_FILE_MAX_LINES, Severity};
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    fs::write(path, content).expect("write fixture");
}

fn compliant_workflow(root: &Path, phases: u32) {
    write(
        &root.join("metadata.json"),
        &json!({"workflow_type": "wf_v1", "total_phases": phases}).to_string(),
    );
    for n in 0..phases {
        write(
            &root.join(format!("phases/{n}/phase.md")),
            &format!("# Phase {n}\n\n## Validation Gate\n- [ ] done\n"),
        );
        write(
            &root.join(format!("phases/{n}/task-1-run-checks.md")),
            "# Task 1\n\n🛑 EXECUTE-NOW\n```bash\nmake check\n```\n",
        );
    }
}

fn kinds(issues: &[validator::ValidationIssue]) -> Vec<&str> {
    issues.iter().map(|i| i.kind.as_str()).collect()
}

#[test]
fn well_formed_workflow_scores_full_marks() {
    let tmp = TempDir::new().expect("tempdir");
    compliant_workflow(tmp.path(), 3);

    let report = validator::validate_workflow(tmp.path());
    assert!(report.compliant, "{:?}", report.issues);
    assert_eq!(report.compliance_score, 100);
    assert!(report.issues.is_empty());
    assert!(report.warnings.is_empty());
    assert!(report.summary.starts_with('✅'));
}

#[test]
fn missing_directory_is_critical() {
    let tmp = TempDir::new().expect("tempdir");
    let report = validator::validate_workflow(&tmp.path().join("nope"));
    assert!(!report.compliant);
    assert_eq!(kinds(&report.issues), vec!["missing_directory"]);
    assert_eq!(report.issues[0].severity, Severity::Critical);
    assert_eq!(report.compliance_score, 75);
}

#[test]
fn missing_metadata_and_phases_are_both_reported() {
    let tmp = TempDir::new().expect("tempdir");
    let report = validator::validate_workflow(tmp.path());
    assert_eq!(
        kinds(&report.issues),
        vec!["missing_metadata", "missing_phases_directory"]
    );
    assert_eq!(report.compliance_score, 50);

    write(&tmp.path().join("metadata.json"), "{\"total_phases\": ");
    let report = validator::validate_workflow(tmp.path());
    assert_eq!(kinds(&report.issues)[0], "invalid_metadata");
}

#[test]
fn readme_instead_of_phase_file_breaks_naming_convention() {
    let tmp = TempDir::new().expect("tempdir");
    compliant_workflow(tmp.path(), 2);
    fs::remove_file(tmp.path().join("phases/1/phase.md")).expect("remove");
    write(&tmp.path().join("phases/1/README.md"), "# Phase 1\n");

    let report = validator::validate_workflow(tmp.path());
    assert!(!report.compliant);
    assert_eq!(kinds(&report.issues), vec!["naming_convention"]);
    assert_eq!(report.issues[0].file.as_deref(), Some("phases/1/README.md"));
    assert_eq!(report.compliance_score, 90);
}

#[test]
fn structural_warnings_keep_workflow_compliant() {
    let tmp = TempDir::new().expect("tempdir");
    compliant_workflow(tmp.path(), 2);
    let long_phase = "line\n".repeat(PHASE_FILE_MAX_LINES + 20);
    write(&tmp.path().join("phases/0/phase.md"), &long_phase);
    write(&tmp.path().join("phases/1/task_two.md"), "# Task\n");
    write(&tmp.path().join("phases/2/phase.md"), "# Phase 2\n");

    let report = validator::validate_workflow(tmp.path());
    assert!(report.compliant, "{:?}", report.issues);
    let warnings = kinds(&report.warnings);
    assert!(warnings.contains(&"phase_file_too_long"));
    assert!(warnings.contains(&"task_naming"));
    assert!(warnings.contains(&"no_task_files"));
    assert!(warnings.contains(&"phase_count_mismatch"));
    assert_eq!(report.compliance_score, 100 - 2 * report.warnings.len() as u32);
    assert!(report.summary.contains("warning"));
}

#[test]
fn non_numeric_phase_directory_is_an_error() {
    let tmp = TempDir::new().expect("tempdir");
    compliant_workflow(tmp.path(), 1);
    fs::create_dir_all(tmp.path().join("phases/setup")).expect("mkdir");

    let report = validator::validate_workflow(tmp.path());
    assert!(!report.compliant);
    assert_eq!(kinds(&report.issues), vec!["invalid_phase_directory"]);
    assert!(report.warnings.is_empty(), "non-numeric dirs do not count as phases");
}
