//! Source parsers for dynamic workflow content.
//!
//! A dynamic workflow takes its phases from an external document instead of
//! the indexed `phases/N/` tree. Two formats are understood: a spec's
//! `tasks.md` (markdown) and a workflow definition (YAML).

use crate::core::error;
use crate::core::models::{DynamicPhase, DynamicTask};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

pub trait SourceParser {
    fn parse(&self, source: &Path) -> Result<Vec<DynamicPhase>, error::PhasegateError>;
}

/// Picks a parser for the `source_type` declared in workflow metadata.
pub fn parser_for(source_type: &str) -> Option<Box<dyn SourceParser>> {
    match source_type {
        "spec_tasks_md" => Some(Box::new(SpecTasksParser)),
        "workflow_definition" => Some(Box::new(WorkflowDefinitionParser)),
        _ => None,
    }
}

fn parse_err(msg: String) -> error::PhasegateError {
    error::PhasegateError::ParseError(msg)
}

fn phase_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#{2,3}\s+Phase (\d+):\s*(.+?)\s*$").expect("valid regex"))
}

fn task_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Task (\d+)\.(\d+):\s*([^\n]+)").expect("valid regex"))
}

fn task_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d+\.\d+)\b").expect("valid regex"))
}

fn list_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:[-*+]|\d+\.)\s+").expect("valid regex"))
}

/// Drops markdown emphasis markers.
fn plain(text: &str) -> String {
    text.replace("**", "").replace("__", "").trim().to_string()
}

/// Value following `label` on the same line, e.g. `Goal:` in `**Goal:** ship it`.
fn labeled_value(text: &str, labels: &[&str]) -> Option<String> {
    for line in text.lines() {
        let line = plain(line);
        for label in labels {
            if let Some(idx) = line.find(label) {
                let value = line[idx + label.len()..].trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn checklist_item(line: &str) -> Option<String> {
    let stripped = line.trim();
    let rest = stripped
        .strip_prefix("- [ ]")
        .or_else(|| stripped.strip_prefix("* [ ]"))
        .or_else(|| stripped.strip_prefix("[ ]"))?;
    let item = plain(rest);
    if item.is_empty() { None } else { Some(item) }
}

#[derive(Debug)]
enum Block {
    Paragraph(String),
    ListItem(String),
}

struct PhaseDraft {
    number: u32,
    name: String,
    lines: Vec<String>,
}

/// Parser for a spec's `tasks.md`.
///
/// Accepted layout:
///
/// ```text
/// ## Phase 1: Foundation
/// **Objective:** Build the base
/// **Estimated Duration:** 2 days
///
/// - [ ] **Task 1.1: Create models**
///   - **Estimated Time:** 2h
///   - **Dependencies:** None
///   - **Acceptance Criteria:**
///     - [ ] Models compile
///
/// **Validation Gate:**
/// - [ ] All models tested
/// ```
pub struct SpecTasksParser;

impl SourceParser for SpecTasksParser {
    fn parse(&self, source: &Path) -> Result<Vec<DynamicPhase>, error::PhasegateError> {
        if !source.exists() {
            return Err(parse_err(format!(
                "Source file not found: {}",
                source.display()
            )));
        }
        let path: PathBuf = if source.is_dir() {
            let candidate = source.join("tasks.md");
            if !candidate.exists() {
                return Err(parse_err(format!(
                    "tasks.md not found in directory: {}",
                    source.display()
                )));
            }
            candidate
        } else {
            source.to_path_buf()
        };

        let content = fs::read_to_string(&path)
            .map_err(|e| parse_err(format!("Failed to read {}: {}", path.display(), e)))?;
        if content.trim().is_empty() {
            return Err(parse_err(format!(
                "Source file is empty: {}",
                path.display()
            )));
        }

        let phases = self.parse_content(&content);
        if phases.is_empty() {
            return Err(parse_err(format!("No phases found in {}", path.display())));
        }
        Ok(phases)
    }
}

impl SpecTasksParser {
    pub fn parse_content(&self, content: &str) -> Vec<DynamicPhase> {
        let mut drafts: Vec<PhaseDraft> = Vec::new();
        let mut in_fence = false;

        for line in content.lines() {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            if !in_fence {
                if let Some(caps) = phase_heading_re().captures(line.trim_end()) {
                    match caps[1].parse::<u32>() {
                        Ok(number) => {
                            drafts.push(PhaseDraft {
                                number,
                                name: plain(&caps[2]),
                                lines: Vec::new(),
                            });
                            continue;
                        }
                        Err(e) => warn!(heading = line.trim(), error = %e, "Skipping phase heading"),
                    }
                }
            }
            if let Some(draft) = drafts.last_mut() {
                draft.lines.push(line.to_string());
            }
        }

        drafts.into_iter().map(|d| self.build_phase(d)).collect()
    }

    fn split_blocks(lines: &[String]) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut current: Option<Block> = None;

        for line in lines {
            if line.trim().is_empty() {
                if let Some(Block::Paragraph(_)) = current {
                    blocks.extend(current.take());
                }
                continue;
            }
            if line.trim_start().starts_with('#') {
                blocks.extend(current.take());
                continue;
            }
            let indented = line.starts_with(' ') || line.starts_with('\t');
            if !indented && list_marker_re().is_match(line) {
                blocks.extend(current.take());
                let body = list_marker_re().replace(line, "").to_string();
                current = Some(Block::ListItem(body));
                continue;
            }
            match current.as_mut() {
                Some(Block::ListItem(text)) if indented => {
                    text.push('\n');
                    text.push_str(line);
                }
                Some(Block::Paragraph(text)) => {
                    text.push('\n');
                    text.push_str(line);
                }
                _ => {
                    blocks.extend(current.take());
                    current = Some(Block::Paragraph(line.to_string()));
                }
            }
        }
        blocks.extend(current);
        blocks
    }

    fn build_phase(&self, draft: PhaseDraft) -> DynamicPhase {
        let mut description = String::new();
        let mut estimated_duration = "Variable".to_string();
        let mut tasks = Vec::new();
        let mut validation_gate = Vec::new();
        let mut in_gate = false;

        for block in Self::split_blocks(&draft.lines) {
            match block {
                Block::Paragraph(text) => {
                    if let Some(desc) = labeled_value(&text, &["Objective:", "Goal:"]) {
                        description = desc;
                    }
                    if let Some(dur) =
                        labeled_value(&text, &["Estimated Duration:", "Estimated Effort:"])
                    {
                        estimated_duration = dur;
                    }
                    in_gate = text.contains("Validation Gate:");
                    if in_gate {
                        validation_gate.extend(text.lines().filter_map(checklist_item));
                    }
                }
                Block::ListItem(text) => {
                    let plain_text = plain(&text);
                    if task_re().is_match(&plain_text) {
                        in_gate = false;
                        if let Some(task) = self.parse_task(&text) {
                            tasks.push(task);
                        }
                        continue;
                    }
                    let head_mentions_validation = text
                        .lines()
                        .take(2)
                        .any(|l| l.to_lowercase().contains("validation"));
                    if in_gate || text.contains("Validation Gate:") || head_mentions_validation {
                        in_gate = true;
                        let mut lines = text.lines();
                        let head = lines.next().unwrap_or_default();
                        let head_item = checklist_item(head).or_else(|| {
                            let h = plain(head);
                            (!h.is_empty() && !h.contains("Validation Gate:")).then_some(h)
                        });
                        validation_gate.extend(head_item);
                        validation_gate.extend(lines.filter_map(checklist_item));
                    }
                }
            }
        }

        if description.is_empty() {
            description = format!("Phase {} objectives", draft.number);
        }

        DynamicPhase {
            phase_number: draft.number,
            phase_name: draft.name,
            description,
            estimated_duration,
            tasks,
            validation_gate,
        }
    }

    fn parse_task(&self, text: &str) -> Option<DynamicTask> {
        let plain_text = plain(text);
        let caps = task_re().captures(&plain_text)?;
        let task_id = format!("{}.{}", &caps[1], &caps[2]);
        let task_name = caps[3].trim().to_string();

        let estimated_time = labeled_value(text, &["Estimated Time:", "Estimated Duration:"])
            .unwrap_or_else(|| "Not specified".to_string());

        let dependencies = match labeled_value(text, &["Dependencies:"]) {
            None => Vec::new(),
            Some(deps) if deps.eq_ignore_ascii_case("none") => Vec::new(),
            Some(deps) => {
                let refs: Vec<String> = task_ref_re()
                    .captures_iter(&deps)
                    .map(|c| c[1].to_string())
                    .collect();
                if refs.is_empty() {
                    deps.split(',')
                        .map(|d| d.trim().to_string())
                        .filter(|d| !d.is_empty())
                        .collect()
                } else {
                    refs
                }
            }
        };

        Some(DynamicTask {
            task_id,
            description: task_name.clone(),
            task_name,
            estimated_time,
            dependencies,
            acceptance_criteria: acceptance_criteria(text),
        })
    }
}

fn acceptance_criteria(text: &str) -> Vec<String> {
    let mut criteria = Vec::new();
    let mut in_criteria = false;
    for line in text.lines() {
        if line.contains("Acceptance Criteria:") {
            in_criteria = true;
            continue;
        }
        if !in_criteria {
            continue;
        }
        let stripped = line.trim();
        if let Some(item) = checklist_item(stripped) {
            criteria.push(item);
        } else if !stripped.is_empty() && !stripped.starts_with('-') && !stripped.starts_with('[') {
            break;
        }
    }
    criteria
}

#[derive(Debug, Deserialize)]
struct DefinitionDoc {
    #[serde(default)]
    phases: Vec<DefinitionPhase>,
}

#[derive(Debug, Deserialize)]
struct DefinitionPhase {
    #[serde(default)]
    number: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    purpose: String,
    #[serde(default)]
    estimated_duration: Option<String>,
    #[serde(default)]
    tasks: Vec<DefinitionTask>,
    #[serde(default)]
    validation_gate: DefinitionGate,
}

#[derive(Debug, Deserialize)]
struct DefinitionTask {
    #[serde(default = "default_task_number")]
    number: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    purpose: String,
    #[serde(default)]
    estimated_time: Option<String>,
    #[serde(default)]
    dependencies: Vec<JsonValue>,
    #[serde(default)]
    validation_criteria: Vec<String>,
}

fn default_task_number() -> u32 {
    1
}

#[derive(Debug, Default, Deserialize)]
struct DefinitionGate {
    #[serde(default)]
    evidence_required: Map<String, JsonValue>,
}

/// Parser for workflow definition YAML files.
pub struct WorkflowDefinitionParser;

impl SourceParser for WorkflowDefinitionParser {
    fn parse(&self, source: &Path) -> Result<Vec<DynamicPhase>, error::PhasegateError> {
        if !source.exists() {
            return Err(parse_err(format!(
                "Definition file not found: {}",
                source.display()
            )));
        }
        let content = fs::read_to_string(source)
            .map_err(|e| parse_err(format!("Failed to read YAML: {}", e)))?;
        if content.trim().is_empty() {
            return Err(parse_err(format!(
                "Definition file is empty: {}",
                source.display()
            )));
        }
        let doc: DefinitionDoc = serde_yaml_bw::from_str(&content)
            .map_err(|e| parse_err(format!("Failed to read YAML: {}", e)))?;
        if doc.phases.is_empty() {
            return Err(parse_err("No phases found in definition".to_string()));
        }
        Ok(doc.phases.into_iter().map(build_definition_phase).collect())
    }
}

fn build_definition_phase(phase: DefinitionPhase) -> DynamicPhase {
    let number = phase.number;
    let tasks = phase
        .tasks
        .into_iter()
        .map(|task| DynamicTask {
            task_id: format!("{}.{}", number, task.number),
            task_name: task
                .name
                .unwrap_or_else(|| format!("task-{}", task.number)),
            description: task.purpose,
            estimated_time: task.estimated_time.unwrap_or_else(|| "Variable".to_string()),
            dependencies: task
                .dependencies
                .iter()
                .map(|d| match d {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            acceptance_criteria: task.validation_criteria,
        })
        .collect();

    let validation_gate = phase
        .validation_gate
        .evidence_required
        .iter()
        .map(|(field, spec)| match spec {
            JsonValue::Object(obj) => {
                let text = |key: &str, default: &str| {
                    obj.get(key)
                        .and_then(JsonValue::as_str)
                        .unwrap_or(default)
                        .to_string()
                };
                format!(
                    "{} ({}, {}): {}",
                    field,
                    text("type", "unknown"),
                    text("validator", ""),
                    text("description", field)
                )
            }
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();

    DynamicPhase {
        phase_number: number,
        phase_name: phase.name.unwrap_or_else(|| format!("Phase {}", number)),
        description: phase.purpose,
        estimated_duration: phase
            .estimated_duration
            .unwrap_or_else(|| "Variable".to_string()),
        tasks,
        validation_gate,
    }
}
