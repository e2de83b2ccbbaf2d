//! Session-scoped workflow execution.
//!
//! A session renders phase and task content either from the document index
//! (static workflows) or from a parsed source document (dynamic workflows),
//! and advances its state when a checkpoint passes.

use crate::core::checkpoint::CheckpointLoader;
use crate::core::error;
use crate::core::models::{DynamicPhase, PhaseArtifact, WorkflowMetadata, WorkflowState};
use crate::core::parsers;
use crate::core::rag::{RagEngine, ScoredChunk, SearchFilters};
use crate::core::state::StateManager;
use regex::Regex;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

const GENERAL_RESULTS: usize = 3;
const TASK_DISCOVERY_RESULTS: usize = 200;
const TASK_CHUNK_RESULTS: usize = 200;
const EVIDENCE_LOOKAHEAD: usize = 500;

pub const GET_TASK_HINT: &str = "Use get_task(session_id, phase, task_number) to retrieve full task content";

/// Source of phase overviews and task bodies.
pub trait PhaseContent {
    fn phase_overview(&self, phase: u32) -> JsonValue;
    fn task(&self, phase: u32, task_number: u32) -> JsonValue;
}

fn execute_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)🛑\s*EXECUTE-NOW[:\s]*([^\n]*)\n```(?:bash|shell)?\n(.*?)\n```")
            .expect("valid regex")
    })
}

fn evidence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"📊\s*COUNT-AND-DOCUMENT[:\s]*([^\n]*)").expect("valid regex"))
}

fn decide_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"🔍\s*QUERY-AND-DECIDE[:\s]*([^\n]*)").expect("valid regex"))
}

fn task_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"task-(\d+)-").expect("valid regex"))
}

/// Pulls command-language steps out of task markdown.
pub fn extract_steps(content: &str) -> Vec<JsonValue> {
    let mut steps = Vec::new();
    for caps in execute_re().captures_iter(content) {
        let whole = caps.get(0).map(|m| m.end()).unwrap_or(0);
        let mut stop = (whole + EVIDENCE_LOOKAHEAD).min(content.len());
        while !content.is_char_boundary(stop) {
            stop -= 1;
        }
        let evidence = evidence_re()
            .captures(&content[whole..stop])
            .map(|c| c[1].trim().to_string());
        let description = match caps[1].trim() {
            "" => "Execute command",
            d => d,
        };
        steps.push(json!({
            "description": description,
            "type": "execute_command",
            "command": caps[2].trim(),
            "evidence_required": evidence,
        }));
    }
    for caps in decide_re().captures_iter(content) {
        steps.push(json!({
            "description": caps[1].trim(),
            "type": "decision_point",
            "requires_analysis": true,
        }));
    }
    steps
}

fn task_name_from(header: &str, content: &str, task_number: u32) -> String {
    if !header.is_empty() {
        return header.to_string();
    }
    let first = content
        .lines()
        .next()
        .unwrap_or_default()
        .trim_matches('#')
        .trim();
    if first.is_empty() {
        format!("Task {}", task_number)
    } else {
        first.to_string()
    }
}

/// Index-backed content for static workflows.
pub struct IndexContent<'a> {
    pub rag: &'a RagEngine,
    pub workflow_type: &'a str,
    pub metadata: &'a WorkflowMetadata,
}

impl IndexContent<'_> {
    fn phase_name(&self, phase: u32) -> String {
        self.metadata
            .phase(phase)
            .map(|p| p.phase_name.clone())
            .unwrap_or_else(|| format!("Phase {}", phase))
    }

    fn task_metadata(chunks: &[ScoredChunk]) -> Vec<JsonValue> {
        let mut by_file: BTreeMap<String, (u32, String)> = BTreeMap::new();
        for sc in chunks {
            let c = &sc.chunk;
            if !c.file_path.contains("task-") || !c.file_path.ends_with(".md") {
                continue;
            }
            if by_file.contains_key(&c.file_path) {
                continue;
            }
            let number = task_file_re()
                .captures(&c.file_path)
                .and_then(|caps| caps[1].parse().ok())
                .unwrap_or(0);
            let name = task_name_from(&c.section_header, &c.content, number);
            by_file.insert(c.file_path.clone(), (number, name));
        }
        let mut tasks: Vec<(String, u32, String)> = by_file
            .into_iter()
            .map(|(file, (number, name))| (file, number, name))
            .collect();
        tasks.sort_by_key(|t| t.1);
        tasks
            .into_iter()
            .map(|(file, number, name)| {
                json!({"task_number": number, "task_name": name, "task_file": file})
            })
            .collect()
    }

    fn filters(&self, phase: u32) -> SearchFilters {
        SearchFilters::for_workflow(self.workflow_type, phase)
    }
}

impl PhaseContent for IndexContent<'_> {
    fn phase_overview(&self, phase: u32) -> JsonValue {
        let general_query = format!(
            "{} Phase {} requirements instructions methodology",
            self.workflow_type, phase
        );
        let task_query = format!("{} Phase {} task list files", self.workflow_type, phase);
        let general = self.rag.search(&general_query, GENERAL_RESULTS, &self.filters(phase));
        let listing = self.rag.search(&task_query, TASK_DISCOVERY_RESULTS, &self.filters(phase));

        match (general, listing) {
            (Ok(general), Ok(listing)) => {
                let tasks = Self::task_metadata(&listing.chunks);
                info!(workflow_type = self.workflow_type, phase, tasks = tasks.len(), "Rendered phase overview");
                json!({
                    "phase_number": phase,
                    "phase_name": self.phase_name(phase),
                    "content_chunks": general.chunks,
                    "tasks": tasks,
                    "total_tokens": general.total_tokens,
                    "retrieval_method": general.retrieval_method,
                    "message": GET_TASK_HINT,
                })
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to retrieve phase content");
                json!({
                    "phase_number": phase,
                    "phase_name": self.phase_name(phase),
                    "error": e.to_string(),
                    "content_chunks": [],
                    "tasks": [],
                })
            }
        }
    }

    fn task(&self, phase: u32, task_number: u32) -> JsonValue {
        let query = format!(
            "{} Phase {} task {} task-{}- EXECUTE-NOW commands steps",
            self.workflow_type, phase, task_number, task_number
        );
        let result = match self.rag.search(&query, TASK_CHUNK_RESULTS, &self.filters(phase)) {
            Ok(result) => result,
            Err(e) => {
                return json!({
                    "phase": phase,
                    "task_number": task_number,
                    "error": e.to_string(),
                    "content": "",
                    "steps": [],
                });
            }
        };

        let pattern = format!("task-{}-", task_number);
        let mut chunks: Vec<&ScoredChunk> = result
            .chunks
            .iter()
            .filter(|c| c.chunk.file_path.contains(&pattern))
            .collect();
        if chunks.is_empty() {
            return json!({
                "phase": phase,
                "task_number": task_number,
                "error": format!("Task {} not found in Phase {}", task_number, phase),
                "content": "",
                "steps": [],
            });
        }
        chunks.sort_by_key(|c| c.chunk.start_line);

        let content = chunks
            .iter()
            .map(|c| c.chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let name = task_name_from(&chunks[0].chunk.section_header, &content, task_number);
        let steps = extract_steps(&content);
        info!(
            workflow_type = self.workflow_type,
            phase,
            task_number,
            chunks = chunks.len(),
            steps = steps.len(),
            "Retrieved task"
        );
        json!({
            "phase": phase,
            "task_number": task_number,
            "task_name": name,
            "task_file": chunks[0].chunk.file_path,
            "content": content,
            "steps": steps,
            "chunks_retrieved": chunks.len(),
            "total_tokens": chunks.iter().map(|c| c.chunk.tokens).sum::<usize>(),
            "retrieval_method": result.retrieval_method,
        })
    }
}

/// Phases parsed from a dynamic workflow's source document.
#[derive(Debug, Clone)]
pub struct DynamicRegistry {
    source: PathBuf,
    phases: Vec<DynamicPhase>,
}

impl DynamicRegistry {
    pub fn load(source_type: &str, source: &Path) -> Result<Self, error::PhasegateError> {
        let parser = parsers::parser_for(source_type).ok_or_else(|| {
            error::PhasegateError::ValidationError(format!(
                "unknown dynamic source_type '{}'",
                source_type
            ))
        })?;
        let phases = parser.parse(source)?;
        info!(source = %source.display(), phases = phases.len(), "Loaded dynamic workflow source");
        Ok(Self {
            source: source.to_path_buf(),
            phases,
        })
    }

    pub fn phase(&self, number: u32) -> Option<&DynamicPhase> {
        self.phases.iter().find(|p| p.phase_number == number)
    }

    pub fn last_phase(&self) -> Option<u32> {
        self.phases.iter().map(|p| p.phase_number).max()
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }
}

impl PhaseContent for DynamicRegistry {
    fn phase_overview(&self, phase: u32) -> JsonValue {
        let Some(p) = self.phase(phase) else {
            return json!({
                "phase_number": phase,
                "error": format!("Phase {} not found in {}", phase, self.source.display()),
                "tasks": [],
            });
        };
        let tasks: Vec<JsonValue> = p
            .tasks
            .iter()
            .map(|t| {
                json!({
                    "task_number": t.task_number(),
                    "task_id": t.task_id,
                    "task_name": t.task_name,
                    "estimated_time": t.estimated_time,
                    "dependencies": t.dependencies,
                })
            })
            .collect();
        json!({
            "phase_number": p.phase_number,
            "phase_name": p.phase_name,
            "description": p.description,
            "estimated_duration": p.estimated_duration,
            "tasks": tasks,
            "validation_gate": p.validation_gate,
            "source": self.source.display().to_string(),
            "message": GET_TASK_HINT,
        })
    }

    fn task(&self, phase: u32, task_number: u32) -> JsonValue {
        let task = self
            .phase(phase)
            .and_then(|p| p.tasks.iter().find(|t| t.task_number() == Some(task_number)));
        let Some(t) = task else {
            return json!({
                "phase": phase,
                "task_number": task_number,
                "error": format!("Task {} not found in Phase {}", task_number, phase),
                "content": "",
                "steps": [],
            });
        };

        let mut content = format!("# Task {}: {}\n\n", t.task_id, t.task_name);
        if !t.description.is_empty() && t.description != t.task_name {
            content.push_str(&format!("{}\n\n", t.description));
        }
        content.push_str(&format!("**Estimated Time:** {}\n", t.estimated_time));
        let deps = if t.dependencies.is_empty() {
            "None".to_string()
        } else {
            t.dependencies.join(", ")
        };
        content.push_str(&format!("**Dependencies:** {}\n", deps));
        if !t.acceptance_criteria.is_empty() {
            content.push_str("\n## Acceptance Criteria\n");
            for c in &t.acceptance_criteria {
                content.push_str(&format!("- [ ] {}\n", c));
            }
        }

        json!({
            "phase": phase,
            "task_number": task_number,
            "task_id": t.task_id,
            "task_name": t.task_name,
            "description": t.description,
            "estimated_time": t.estimated_time,
            "dependencies": t.dependencies,
            "acceptance_criteria": t.acceptance_criteria,
            "content": content,
            "steps": extract_steps(&content),
            "source": self.source.display().to_string(),
        })
    }
}

pub struct WorkflowSession {
    pub state: WorkflowState,
    pub metadata: WorkflowMetadata,
    registry: Option<DynamicRegistry>,
}

impl WorkflowSession {
    /// Dynamic workflows read their source path from the session options
    /// stored in `state.metadata`.
    pub fn new(state: WorkflowState, metadata: WorkflowMetadata) -> Self {
        let registry = match (&metadata.dynamic_config, metadata.dynamic_phases) {
            (Some(cfg), true) => match state.metadata.get(&cfg.source_option).and_then(JsonValue::as_str) {
                Some(path) => match DynamicRegistry::load(&cfg.source_type, Path::new(path)) {
                    Ok(registry) => Some(registry),
                    Err(e) => {
                        warn!(session_id = %state.session_id, error = %e, "Dynamic source unusable, using static content");
                        None
                    }
                },
                None => {
                    warn!(
                        session_id = %state.session_id,
                        option = %cfg.source_option,
                        "Dynamic workflow started without source option, using static content"
                    );
                    None
                }
            },
            _ => None,
        };
        Self {
            state,
            metadata,
            registry,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.registry.is_some()
    }

    pub fn dynamic_last_phase(&self) -> Option<u32> {
        self.registry.as_ref().and_then(DynamicRegistry::last_phase)
    }

    fn with_content<R>(&self, rag: &RagEngine, phase: u32, f: impl FnOnce(&dyn PhaseContent) -> R) -> R {
        match &self.registry {
            Some(registry) if registry.phase(phase).is_some() => f(registry),
            _ => f(&IndexContent {
                rag,
                workflow_type: &self.state.workflow_type,
                metadata: &self.metadata,
            }),
        }
    }

    pub fn phase_content(&self, rag: &RagEngine, phase: u32) -> JsonValue {
        if phase > self.state.final_phase {
            return json!({
                "phase_number": phase,
                "message": "All phases complete",
                "tasks": [],
            });
        }
        self.with_content(rag, phase, |c| c.phase_overview(phase))
    }

    pub fn task_content(&self, rag: &RagEngine, phase: u32, task_number: u32) -> JsonValue {
        self.with_content(rag, phase, |c| c.task(phase, task_number))
    }

    pub fn phase_response(&self, rag: &RagEngine, phase: u32) -> JsonValue {
        json!({
            "session_id": self.state.session_id,
            "workflow_type": self.state.workflow_type,
            "target_file": self.state.target_file,
            "current_phase": self.state.current_phase,
            "requested_phase": phase,
            "phase_content": self.phase_content(rag, phase),
            "artifacts_available": self.state.artifacts_summary(),
            "completed_phases": self.state.completed_phases,
            "is_complete": self.state.is_complete(),
            "dynamic": self.is_dynamic(),
        })
    }

    pub fn current_phase_response(&self, rag: &RagEngine) -> JsonValue {
        self.phase_response(rag, self.state.current_phase)
    }

    pub fn complete_phase(
        &mut self,
        rag: &RagEngine,
        checkpoints: &mut CheckpointLoader,
        state_manager: &StateManager,
        phase: u32,
        evidence: &Map<String, JsonValue>,
    ) -> Result<JsonValue, error::PhasegateError> {
        if self.state.is_complete() || phase > self.state.final_phase {
            return Err(error::PhasegateError::ValidationError(format!(
                "Cannot complete phase {}: workflow {} ends at phase {}{}",
                phase,
                self.state.session_id,
                self.state.final_phase,
                if self.state.is_complete() { " and is already complete" } else { "" }
            )));
        }
        if phase != self.state.current_phase {
            return Err(error::PhasegateError::ValidationError(format!(
                "Cannot complete phase {}: current phase is {}",
                phase, self.state.current_phase
            )));
        }

        let (passed, missing) = checkpoints.validate(rag, &self.state.workflow_type, phase, evidence);
        if !passed {
            self.state.fail_checkpoint(phase);
            state_manager.save_state(&mut self.state)?;
            warn!(session_id = %self.state.session_id, phase, missing = missing.len(), "Checkpoint failed");
            return Ok(json!({
                "checkpoint_passed": false,
                "session_id": self.state.session_id,
                "phase": phase,
                "missing_evidence": missing,
                "current_phase": self.state.current_phase,
                "current_phase_content": self.phase_content(rag, phase),
                "message": "Checkpoint validation failed. Provide the missing evidence to advance.",
            }));
        }

        self.state
            .complete_phase(phase, PhaseArtifact::from_evidence(phase, evidence));
        state_manager.save_state(&mut self.state)?;
        info!(session_id = %self.state.session_id, phase, "Phase completed");

        if self.state.is_complete() {
            return Ok(json!({
                "checkpoint_passed": true,
                "session_id": self.state.session_id,
                "completed_phase": phase,
                "workflow_complete": true,
                "completed_phases": self.state.completed_phases,
                "message": "Workflow complete. All phases passed their checkpoints.",
            }));
        }

        let next = self.state.current_phase;
        Ok(json!({
            "checkpoint_passed": true,
            "session_id": self.state.session_id,
            "completed_phase": phase,
            "workflow_complete": false,
            "next_phase": next,
            "next_phase_content": self.phase_content(rag, next),
            "message": format!("Phase {} complete. Advanced to phase {}.", phase, next),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_steps_finds_commands_and_evidence() {
        let content = "## Step\n🛑 EXECUTE-NOW: Count functions\n```bash\ngrep -c 'fn ' src/lib.rs\n```\n📊 COUNT-AND-DOCUMENT: number of functions\n\n🔍 QUERY-AND-DECIDE: pick mocking strategy\n";
        let steps = extract_steps(content);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0]["type"], "execute_command");
        assert_eq!(steps[0]["description"], "Count functions");
        assert_eq!(steps[0]["command"], "grep -c 'fn ' src/lib.rs");
        assert_eq!(steps[0]["evidence_required"], "number of functions");
        assert_eq!(steps[1]["type"], "decision_point");
        assert_eq!(steps[1]["description"], "pick mocking strategy");
    }

    #[test]
    fn test_execute_without_description_gets_default() {
        let content = "🛑 EXECUTE-NOW\n```shell\nls\n```\n";
        let steps = extract_steps(content);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0]["description"], "Execute command");
        assert!(steps[0]["evidence_required"].is_null());
    }

    #[test]
    fn test_task_name_fallbacks() {
        assert_eq!(task_name_from("Header", "# body", 1), "Header");
        assert_eq!(task_name_from("", "# Scan Code\nmore", 1), "Scan Code");
        assert_eq!(task_name_from("", "", 4), "Task 4");
    }
}
