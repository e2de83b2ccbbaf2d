use phasegate::core::error::PhasegateError;
use phasegate::core::parsers::{SourceParser, SpecTasksParser, WorkflowDefinitionParser, parser_for};
use phasegate::core::session::DynamicRegistry;
use std::fs;
use tempfile::TempDir;

const TASKS_MD: &str = "# Implementation Tasks

## Phase 1: Foundation

**Goal:** Stand up the storage layer
**Estimated Effort:** 1 day

- [ ] **Task 1.1: Create schema**
  - **Estimated Time:** 1h
  - **Dependencies:** None
  - **Acceptance Criteria:**
    - [ ] Tables created
    - [ ] Migrations idempotent

- [ ] **Task 1.2: Repository layer**
  - **Dependencies:** 1.1

**Validation Gate:**
- [ ] Schema reviewed
- [ ] Tests pass

### Phase 2: API

- [ ] **Task 2.1: Endpoints**
  - **Estimated Time:** 4h
  - **Dependencies:** Task 1.1, Task 1.2

```markdown
## Phase 9: Example only
```
";

const DEFINITION_YAML: &str = "name: release_v1
phases:
  - number: 0
    name: Setup
    purpose: Prepare the environment
    estimated_duration: 10m
    tasks:
      - number: 1
        name: install
        purpose: Install dependencies
        estimated_time: 5m
        dependencies: []
        validation_criteria:
          - dependencies installed
      - number: 2
        purpose: Verify toolchain
        dependencies: [1]
    validation_gate:
      evidence_required:
        deps_installed:
          type: bool
          validator: is_true
          description: Dependencies installed
  - number: 1
    purpose: Ship it
";

#[test]
fn spec_tasks_markdown_parses_phases_tasks_and_gates() {
    let phases = SpecTasksParser.parse_content(TASKS_MD);
    assert_eq!(phases.len(), 2, "headings inside fences are ignored");

    let p1 = &phases[0];
    assert_eq!(p1.phase_number, 1);
    assert_eq!(p1.phase_name, "Foundation");
    assert_eq!(p1.description, "Stand up the storage layer");
    assert_eq!(p1.estimated_duration, "1 day");
    assert_eq!(p1.tasks.len(), 2);
    assert_eq!(p1.tasks[0].task_id, "1.1");
    assert_eq!(p1.tasks[0].task_name, "Create schema");
    assert_eq!(p1.tasks[0].estimated_time, "1h");
    assert!(p1.tasks[0].dependencies.is_empty());
    assert_eq!(
        p1.tasks[0].acceptance_criteria,
        vec!["Tables created", "Migrations idempotent"]
    );
    assert_eq!(p1.tasks[1].dependencies, vec!["1.1"]);
    assert_eq!(p1.tasks[1].estimated_time, "Not specified");
    assert_eq!(p1.validation_gate, vec!["Schema reviewed", "Tests pass"]);

    let p2 = &phases[1];
    assert_eq!(p2.phase_name, "API");
    assert_eq!(p2.description, "Phase 2 objectives");
    assert_eq!(p2.estimated_duration, "Variable");
    assert_eq!(p2.tasks[0].dependencies, vec!["1.1", "1.2"]);
}

#[test]
fn phase_heading_with_out_of_range_number_is_skipped() {
    let content = "## Phase 99999999999: Too big

- [ ] **Task 1.1: Ghost**

## Phase 1: Real

- [ ] **Task 1.1: Build**
";
    let phases = SpecTasksParser.parse_content(content);
    assert_eq!(phases.len(), 1);
    assert_eq!(phases[0].phase_number, 1);
    assert_eq!(phases[0].phase_name, "Real");
    assert_eq!(phases[0].tasks.len(), 1);
    assert_eq!(phases[0].tasks[0].task_name, "Build");
}

#[test]
fn spec_tasks_parser_reads_directory_or_file() {
    let tmp = TempDir::new().expect("tempdir");
    fs::write(tmp.path().join("tasks.md"), TASKS_MD).expect("write");

    let from_dir = SpecTasksParser.parse(tmp.path()).expect("dir");
    let from_file = SpecTasksParser.parse(&tmp.path().join("tasks.md")).expect("file");
    assert_eq!(from_dir, from_file);
}

#[test]
fn spec_tasks_parser_errors_are_parse_errors() {
    let tmp = TempDir::new().expect("tempdir");

    let missing = SpecTasksParser.parse(&tmp.path().join("nope.md"));
    assert!(matches!(missing, Err(PhasegateError::ParseError(_))));

    let no_tasks_md = SpecTasksParser.parse(tmp.path()).expect_err("no tasks.md");
    assert!(no_tasks_md.to_string().contains("tasks.md not found"));

    let empty = tmp.path().join("empty.md");
    fs::write(&empty, "  \n").expect("write");
    assert!(SpecTasksParser.parse(&empty).expect_err("empty").to_string().contains("empty"));

    let no_phases = tmp.path().join("plain.md");
    fs::write(&no_phases, "# Notes\n\nNothing to do.\n").expect("write");
    assert!(
        SpecTasksParser
            .parse(&no_phases)
            .expect_err("no phases")
            .to_string()
            .contains("No phases found")
    );
}

#[test]
fn workflow_definition_yaml_maps_to_dynamic_phases() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("definition.yaml");
    fs::write(&path, DEFINITION_YAML).expect("write");

    let phases = WorkflowDefinitionParser.parse(&path).expect("parse");
    assert_eq!(phases.len(), 2);

    let setup = &phases[0];
    assert_eq!(setup.phase_number, 0);
    assert_eq!(setup.phase_name, "Setup");
    assert_eq!(setup.description, "Prepare the environment");
    assert_eq!(setup.estimated_duration, "10m");
    assert_eq!(setup.tasks[0].task_id, "0.1");
    assert_eq!(setup.tasks[0].task_name, "install");
    assert_eq!(setup.tasks[0].acceptance_criteria, vec!["dependencies installed"]);
    assert_eq!(setup.tasks[1].task_name, "task-2");
    assert_eq!(setup.tasks[1].estimated_time, "Variable");
    assert_eq!(setup.tasks[1].dependencies, vec!["1"]);
    assert_eq!(
        setup.validation_gate,
        vec!["deps_installed (bool, is_true): Dependencies installed"]
    );

    assert_eq!(phases[1].phase_name, "Phase 1");
    assert!(phases[1].tasks.is_empty());
}

#[test]
fn workflow_definition_rejects_bad_input() {
    let tmp = TempDir::new().expect("tempdir");

    let broken = tmp.path().join("broken.yaml");
    fs::write(&broken, "phases: [unclosed").expect("write");
    assert!(matches!(
        WorkflowDefinitionParser.parse(&broken),
        Err(PhasegateError::ParseError(_))
    ));

    let no_phases = tmp.path().join("none.yaml");
    fs::write(&no_phases, "name: nothing\n").expect("write");
    assert!(
        WorkflowDefinitionParser
            .parse(&no_phases)
            .expect_err("no phases")
            .to_string()
            .contains("No phases found")
    );
}

#[test]
fn parser_selection_and_registry_lookup() {
    assert!(parser_for("spec_tasks_md").is_some());
    assert!(parser_for("workflow_definition").is_some());
    assert!(parser_for("jira").is_none());

    let tmp = TempDir::new().expect("tempdir");
    fs::write(tmp.path().join("tasks.md"), TASKS_MD).expect("write");
    let registry = DynamicRegistry::load("spec_tasks_md", tmp.path()).expect("load");
    assert_eq!(registry.phase_count(), 2);
    assert_eq!(registry.last_phase(), Some(2));
    assert!(registry.phase(9).is_none());

    assert!(matches!(
        DynamicRegistry::load("jira", tmp.path()),
        Err(PhasegateError::ValidationError(_))
    ));
}
