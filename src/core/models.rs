//! Workflow data model: session state, artifacts, metadata and parsed phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

use crate::core::time;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    #[default]
    Pending,
    Passed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Passed => "passed",
            CheckpointStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandExecution {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<String>,
}

impl CommandExecution {
    /// Accepts either a bare command string or an object with a `command` key.
    pub fn from_evidence(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(cmd) => Some(Self {
                command: cmd.clone(),
                exit_code: None,
                output: None,
                duration_ms: None,
                executed_at: None,
            }),
            JsonValue::Object(obj) => {
                let command = obj.get("command")?.as_str()?.to_string();
                Some(Self {
                    command,
                    exit_code: obj.get("exit_code").and_then(JsonValue::as_i64),
                    output: obj
                        .get("output")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                    duration_ms: obj.get("duration_ms").and_then(JsonValue::as_u64),
                    executed_at: obj
                        .get("executed_at")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseArtifact {
    pub phase_number: u32,
    #[serde(default)]
    pub evidence: Map<String, JsonValue>,
    #[serde(default)]
    pub outputs: Map<String, JsonValue>,
    #[serde(default)]
    pub commands_executed: Vec<CommandExecution>,
    pub timestamp: DateTime<Utc>,
}

impl PhaseArtifact {
    pub fn from_evidence(phase_number: u32, evidence: &Map<String, JsonValue>) -> Self {
        let commands_executed = evidence
            .get("commands_executed")
            .and_then(JsonValue::as_array)
            .map(|cmds| cmds.iter().filter_map(CommandExecution::from_evidence).collect())
            .unwrap_or_default();
        let outputs = evidence
            .get("outputs")
            .and_then(JsonValue::as_object)
            .cloned()
            .unwrap_or_default();
        Self {
            phase_number,
            evidence: evidence.clone(),
            outputs,
            commands_executed,
            timestamp: time::now_utc(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub session_id: String,
    pub workflow_type: String,
    pub target_file: String,
    #[serde(default = "default_starting_phase")]
    pub starting_phase: u32,
    pub final_phase: u32,
    pub current_phase: u32,
    #[serde(default)]
    pub completed_phases: Vec<u32>,
    #[serde(default)]
    pub phase_artifacts: BTreeMap<u32, PhaseArtifact>,
    #[serde(default)]
    pub checkpoints: BTreeMap<u32, CheckpointStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

fn default_starting_phase() -> u32 {
    1
}

impl WorkflowState {
    pub fn new(
        session_id: &str,
        workflow_type: &str,
        target_file: &str,
        starting_phase: u32,
        total_phases: u32,
        metadata: Map<String, JsonValue>,
    ) -> Self {
        let now = time::now_utc();
        Self {
            session_id: session_id.to_string(),
            workflow_type: workflow_type.to_string(),
            target_file: target_file.to_string(),
            starting_phase,
            final_phase: starting_phase + total_phases.max(1) - 1,
            current_phase: starting_phase,
            completed_phases: Vec::new(),
            phase_artifacts: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            metadata,
        }
    }

    /// Only the current phase and phases already completed are reachable.
    pub fn can_access_phase(&self, phase: u32) -> bool {
        phase == self.current_phase || self.completed_phases.contains(&phase)
    }

    pub fn is_complete(&self) -> bool {
        self.current_phase > self.final_phase
    }

    pub fn total_phases(&self) -> u32 {
        self.final_phase.saturating_add(1).saturating_sub(self.starting_phase)
    }

    pub fn complete_phase(&mut self, phase: u32, artifact: PhaseArtifact) {
        self.phase_artifacts.insert(phase, artifact);
        self.checkpoints.insert(phase, CheckpointStatus::Passed);
        if !self.completed_phases.contains(&phase) {
            self.completed_phases.push(phase);
        }
        self.current_phase = phase + 1;
    }

    pub fn fail_checkpoint(&mut self, phase: u32) {
        self.checkpoints.insert(phase, CheckpointStatus::Failed);
    }

    pub fn checkpoint_status(&self, phase: u32) -> CheckpointStatus {
        self.checkpoints.get(&phase).copied().unwrap_or_default()
    }

    /// Evidence keys and outputs per completed phase, without the raw payloads.
    pub fn artifacts_summary(&self) -> BTreeMap<String, JsonValue> {
        self.phase_artifacts
            .iter()
            .map(|(phase, artifact)| {
                (
                    phase.to_string(),
                    serde_json::json!({
                        "phase": phase,
                        "evidence_fields": artifact.evidence.keys().collect::<Vec<_>>(),
                        "outputs": artifact.outputs,
                        "commands_executed": artifact.commands_executed.len(),
                        "timestamp": artifact.timestamp.to_rfc3339(),
                    }),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseMetadata {
    pub phase_number: u32,
    pub phase_name: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub estimated_effort: String,
    #[serde(default)]
    pub key_deliverables: Vec<String>,
    #[serde(default)]
    pub validation_criteria: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DynamicConfig {
    /// `spec_tasks_md` or `workflow_definition`.
    pub source_type: String,
    /// Name of the start option carrying the source path.
    #[serde(default = "default_source_option")]
    pub source_option: String,
}

fn default_source_option() -> String {
    "spec_path".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowMetadata {
    pub workflow_type: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub total_phases: u32,
    #[serde(default)]
    pub estimated_duration: String,
    #[serde(default)]
    pub primary_outputs: Vec<String>,
    #[serde(default)]
    pub phases: Vec<PhaseMetadata>,
    #[serde(default)]
    pub dynamic_phases: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_config: Option<DynamicConfig>,
}

fn default_version() -> String {
    "unknown".to_string()
}

impl WorkflowMetadata {
    /// Metadata synthesized when a workflow ships without `metadata.json`.
    pub fn fallback(workflow_type: &str) -> Self {
        let is_test = workflow_type.contains("test");
        let (total, description, duration, outputs) = if is_test {
            (
                8,
                "Test generation workflow (auto-generated metadata)",
                "2-3 hours",
                vec!["test files", "coverage report"],
            )
        } else {
            (
                6,
                "Production code workflow (auto-generated metadata)",
                "1-2 hours",
                vec!["production code", "documentation"],
            )
        };
        Self {
            workflow_type: workflow_type.to_string(),
            version: default_version(),
            description: description.to_string(),
            total_phases: total,
            estimated_duration: duration.to_string(),
            primary_outputs: outputs.into_iter().map(str::to_string).collect(),
            phases: (0..total)
                .map(|i| PhaseMetadata {
                    phase_number: i,
                    phase_name: format!("Phase {}", i),
                    purpose: format!("Phase {} tasks", i),
                    estimated_effort: "Variable".to_string(),
                    key_deliverables: Vec::new(),
                    validation_criteria: Vec::new(),
                })
                .collect(),
            dynamic_phases: false,
            dynamic_config: None,
        }
    }

    pub fn phase(&self, number: u32) -> Option<&PhaseMetadata> {
        self.phases.iter().find(|p| p.phase_number == number)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DynamicTask {
    pub task_id: String,
    pub task_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub estimated_time: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl DynamicTask {
    /// Task ordinal within its phase (`2` for `3.2`).
    pub fn task_number(&self) -> Option<u32> {
        self.task_id.rsplit('.').next()?.parse().ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DynamicPhase {
    pub phase_number: u32,
    pub phase_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub estimated_duration: String,
    #[serde(default)]
    pub tasks: Vec<DynamicTask>,
    #[serde(default)]
    pub validation_gate: Vec<String>,
}
