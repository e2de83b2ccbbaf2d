//! Workflow framework scaffolding.
//!
//! Generates a workflow tree that the validator accepts and the checkpoint
//! loader can read: an entry point, `metadata.json`, and per-phase
//! `phase.md` plus small command-language task files.

use crate::core::error;
use crate::core::models::{PhaseMetadata, WorkflowMetadata};
use crate::core::state;
use crate::core::validator::PHASE_FILE_MAX_LINES;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

pub const ENTRY_POINT: &str = "FRAMEWORK_ENTRY_POINT.md";
pub const TASK_FILE_MAX_LINES: usize = 100;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GeneratedFramework {
    pub name: String,
    pub workflow_type: String,
    /// Relative path → file content.
    pub files: BTreeMap<String, String>,
}

impl GeneratedFramework {
    pub fn save(&self, output: &Path) -> Result<(), error::PhasegateError> {
        for (rel, content) in &self.files {
            let path = output.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(error::PhasegateError::IoError)?;
            }
            fs::write(&path, content).map_err(error::PhasegateError::IoError)?;
        }
        info!(name = %self.name, files = self.files.len(), output = %output.display(), "Framework saved");
        Ok(())
    }
}

pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() { "step".to_string() } else { slug }
}

struct TaskTemplate {
    title: &'static str,
    purpose: &'static str,
}

const QUICK_TASKS: &[TaskTemplate] = &[TaskTemplate {
    title: "Execute",
    purpose: "Carry out the phase objective and record the results",
}];

const FULL_TASKS: &[TaskTemplate] = &[
    TaskTemplate {
        title: "Analyze",
        purpose: "Inspect the target and record what this phase must change",
    },
    TaskTemplate {
        title: "Implement",
        purpose: "Apply the changes planned during analysis",
    },
    TaskTemplate {
        title: "Verify",
        purpose: "Run checks and record evidence that the phase objective is met",
    },
];

#[derive(Default)]
pub struct FrameworkGenerator;

impl FrameworkGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate_framework(
        &self,
        name: &str,
        workflow_type: &str,
        phases: &[String],
        target_language: &str,
        quick_start: bool,
    ) -> Result<GeneratedFramework, error::PhasegateError> {
        state::validate_workflow_type(name)?;
        if phases.is_empty() {
            return Err(error::PhasegateError::ValidationError(
                "at least one phase is required".to_string(),
            ));
        }
        let tasks = if quick_start { QUICK_TASKS } else { FULL_TASKS };
        let mut files = BTreeMap::new();

        let metadata = WorkflowMetadata {
            workflow_type: name.to_string(),
            version: "1.0.0".to_string(),
            description: format!("{} workflow for {}", workflow_type, target_language),
            total_phases: phases.len() as u32,
            estimated_duration: format!("{}-{} hours", phases.len(), phases.len() * 2),
            primary_outputs: vec![format!("{} deliverables", workflow_type)],
            phases: phases
                .iter()
                .enumerate()
                .map(|(i, phase)| PhaseMetadata {
                    phase_number: i as u32,
                    phase_name: phase.clone(),
                    purpose: format!("{} phase of {}", phase, name),
                    estimated_effort: if quick_start { "15 minutes" } else { "30-45 minutes" }.to_string(),
                    key_deliverables: vec![format!("{} evidence", phase)],
                    validation_criteria: vec![format!("phase_{}_complete is true", i)],
                })
                .collect(),
            dynamic_phases: false,
            dynamic_config: None,
        };
        files.insert("metadata.json".to_string(), serde_json::to_string_pretty(&metadata)?);
        files.insert(ENTRY_POINT.to_string(), entry_point(name, workflow_type, target_language, phases));

        for (i, phase) in phases.iter().enumerate() {
            files.insert(format!("phases/{}/phase.md", i), phase_file(i, phase, tasks));
            for (k, task) in tasks.iter().enumerate() {
                files.insert(
                    format!("phases/{}/task-{}-{}.md", i, k + 1, slugify(task.title)),
                    task_file(i, phase, k + 1, task, target_language),
                );
            }
        }

        info!(name, workflow_type, phases = phases.len(), files = files.len(), "Generated framework");
        Ok(GeneratedFramework {
            name: name.to_string(),
            workflow_type: workflow_type.to_string(),
            files,
        })
    }

    /// Scores a generated framework against the construction rules.
    pub fn validate_compliance(&self, framework: &GeneratedFramework) -> JsonValue {
        let files = &framework.files;
        let has_entry = files.contains_key(ENTRY_POINT);
        let metadata_valid = files
            .get("metadata.json")
            .is_some_and(|m| serde_json::from_str::<WorkflowMetadata>(m).is_ok());
        let phase_files: Vec<&String> = files.keys().filter(|k| k.ends_with("/phase.md")).collect();
        let task_files: Vec<(&String, &String)> = files
            .iter()
            .filter(|(k, _)| k.contains("/task-"))
            .collect();

        let phase_files_ok = !phase_files.is_empty()
            && phase_files
                .iter()
                .all(|k| files[*k].lines().count() <= PHASE_FILE_MAX_LINES);
        let task_size_ok = task_files
            .iter()
            .all(|(_, c)| c.lines().count() <= TASK_FILE_MAX_LINES);
        let command_language = task_files
            .iter()
            .all(|(_, c)| c.contains("🛑 EXECUTE-NOW") && c.contains("📊 COUNT-AND-DOCUMENT"));
        let validation_gates = phase_files
            .iter()
            .all(|k| files[*k].contains("Validation Gate"));

        let checks = [
            ("entry_point", has_entry),
            ("metadata", metadata_valid),
            ("phase_files", phase_files_ok),
            ("task_size", task_size_ok),
            ("command_language", command_language),
            ("validation_gates", validation_gates),
        ];
        let passed = checks.iter().filter(|(_, ok)| *ok).count();
        let score = (passed * 100) / checks.len();
        let mut checks_json = serde_json::Map::new();
        for (name, ok) in checks {
            checks_json.insert(name.to_string(), json!(ok));
        }
        json!({
            "overall_score": score,
            "compliant": passed == checks.len(),
            "checks": checks_json,
            "task_files": task_files.len(),
            "phase_files": phase_files.len(),
        })
    }
}

fn entry_point(name: &str, workflow_type: &str, language: &str, phases: &[String]) -> String {
    let mut out = format!("# {} Framework\n\n", name);
    out.push_str(&format!(
        "**Type:** {}  \n**Target language:** {}\n\n",
        workflow_type, language
    ));
    out.push_str("## How to run\n\n");
    out.push_str(&format!(
        "Start with `start_workflow(\"{}\", <target_file>)`. The server serves one phase at a time; \
         submit evidence with `complete_phase` to advance.\n\n",
        name
    ));
    out.push_str("## Phases\n\n");
    for (i, phase) in phases.iter().enumerate() {
        out.push_str(&format!("{}. Phase {}: {} (`phases/{}/phase.md`)\n", i + 1, i, phase, i));
    }
    out
}

fn phase_file(number: usize, phase: &str, tasks: &[TaskTemplate]) -> String {
    let mut out = format!("# Phase {}: {}\n\n", number, phase);
    out.push_str(&format!("**Objective:** Complete the {} phase.\n\n", phase.to_lowercase()));
    out.push_str("## Tasks\n\n");
    for (k, task) in tasks.iter().enumerate() {
        out.push_str(&format!(
            "- Task {}: {} (`task-{}-{}.md`)\n",
            k + 1,
            task.title,
            k + 1,
            slugify(task.title)
        ));
    }
    out.push_str("\n## Checkpoint\n\n");
    out.push_str(&format!(
        "- Must provide `phase_{}_complete` flag set to true\n",
        number
    ));
    out.push_str("- Evidence: `outcome_notes` text describing the outcome, non-empty\n");
    out.push_str("\n## Validation Gate\n\n");
    out.push_str("- [ ] Every task in this phase executed\n");
    out.push_str("- [ ] Evidence recorded for each COUNT-AND-DOCUMENT step\n");
    out
}

fn task_file(phase_number: usize, phase: &str, task_number: usize, task: &TaskTemplate, language: &str) -> String {
    let mut out = format!("# Task {}: {}\n\n", task_number, task.title);
    out.push_str(&format!("**Phase:** {} ({})  \n", phase_number, phase));
    out.push_str(&format!("**Purpose:** {}\n\n", task.purpose));
    out.push_str("## Steps\n\n");
    out.push_str(&format!("🛑 EXECUTE-NOW: {} the {} target\n", task.title, language));
    out.push_str("```bash\n");
    out.push_str("echo \"replace with the command for this step\"\n");
    out.push_str("```\n\n");
    out.push_str("📊 COUNT-AND-DOCUMENT: results of the command above\n\n");
    out.push_str("🔍 QUERY-AND-DECIDE: is the output sufficient to continue?\n\n");
    out.push_str("## Done when\n\n");
    out.push_str(&format!("- [ ] {} finished and evidence recorded\n", task.title));
    out
}
