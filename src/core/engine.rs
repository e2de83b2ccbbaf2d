//! Workflow engine with phase gating and checkpoint validation.
//!
//! The engine hands out one phase at a time. Requests for phases beyond the
//! current one are answered with a sequence-violation payload that carries the
//! current phase instead, and advancing requires evidence that satisfies the
//! phase checkpoint.

use crate::core::checkpoint::CheckpointLoader;
use crate::core::error;
use crate::core::models::WorkflowMetadata;
use crate::core::rag::RagEngine;
use crate::core::session::WorkflowSession;
use crate::core::state::{self, StateManager};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const GUIDANCE_MODE_KEY: &str = "⚠️_WORKFLOW_EXECUTION_MODE";
pub const GUIDANCE_TASKS_KEY: &str = "🛑_DO_NOT_USE_EXTERNAL_TASK_TOOLS";
pub const GUIDANCE_MODEL_KEY: &str = "execution_model";

/// Puts the workflow guidance fields ahead of the response body.
pub fn add_workflow_guidance(response: JsonValue) -> JsonValue {
    let mut out = Map::new();
    out.insert(GUIDANCE_MODE_KEY.to_string(), json!("ACTIVE"));
    out.insert(
        GUIDANCE_TASKS_KEY.to_string(),
        json!(
            "This workflow manages ALL tasks. DO NOT use todo_write or external task lists. \
             The workflow IS your task tracker."
        ),
    );
    out.insert(
        GUIDANCE_MODEL_KEY.to_string(),
        json!("Complete task → Submit evidence → Advance phase"),
    );
    match response {
        JsonValue::Object(body) => out.extend(body),
        other => {
            out.insert("result".to_string(), other);
        }
    }
    JsonValue::Object(out)
}

pub struct WorkflowEngine {
    state_manager: StateManager,
    rag: Arc<RagEngine>,
    workflows_path: PathBuf,
    checkpoints: CheckpointLoader,
    metadata_cache: HashMap<String, WorkflowMetadata>,
    sessions: HashMap<String, WorkflowSession>,
    seen_generation: u64,
}

impl WorkflowEngine {
    pub fn new(state_manager: StateManager, rag: Arc<RagEngine>, workflows_path: &Path) -> Self {
        let seen_generation = rag.generation();
        Self {
            state_manager,
            rag,
            workflows_path: workflows_path.to_path_buf(),
            checkpoints: CheckpointLoader::new(),
            metadata_cache: HashMap::new(),
            sessions: HashMap::new(),
            seen_generation,
        }
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state_manager
    }

    pub fn rag(&self) -> &Arc<RagEngine> {
        &self.rag
    }

    /// Index reloads invalidate anything derived from workflow documents.
    /// Session state is always on disk, so cached sessions are simply rebuilt.
    fn refresh_caches(&mut self) {
        let generation = self.rag.generation();
        if generation != self.seen_generation {
            debug!(generation, "Index changed, dropping derived caches");
            self.metadata_cache.clear();
            self.checkpoints.clear();
            self.sessions.clear();
            self.seen_generation = generation;
        }
    }

    pub fn load_workflow_metadata(&mut self, workflow_type: &str) -> WorkflowMetadata {
        self.refresh_caches();
        if let Some(hit) = self.metadata_cache.get(workflow_type) {
            return hit.clone();
        }
        if let Err(e) = state::validate_workflow_type(workflow_type) {
            warn!(error = %e, "Refusing to read metadata for invalid workflow type");
            return WorkflowMetadata::fallback(workflow_type);
        }
        let path = self.workflows_path.join(workflow_type).join("metadata.json");
        let metadata = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<WorkflowMetadata>(&raw) {
                Ok(m) => {
                    info!(workflow_type, phases = m.total_phases, "Loaded workflow metadata");
                    m
                }
                Err(e) => {
                    warn!(workflow_type, error = %e, "Invalid metadata.json, using fallback");
                    WorkflowMetadata::fallback(workflow_type)
                }
            },
            Err(_) => {
                debug!(workflow_type, "No metadata.json, using fallback");
                WorkflowMetadata::fallback(workflow_type)
            }
        };
        self.metadata_cache
            .insert(workflow_type.to_string(), metadata.clone());
        metadata
    }

    fn ensure_session(&mut self, session_id: &str) -> Result<(), error::PhasegateError> {
        self.refresh_caches();
        if self.sessions.contains_key(session_id) {
            return Ok(());
        }
        let state = self
            .state_manager
            .load_state(session_id)?
            .ok_or_else(|| error::PhasegateError::NotFound(format!("Session {} not found", session_id)))?;
        let metadata = self.load_workflow_metadata(&state.workflow_type);
        self.sessions
            .insert(session_id.to_string(), WorkflowSession::new(state, metadata));
        Ok(())
    }

    fn session(&mut self, session_id: &str) -> Result<&mut WorkflowSession, error::PhasegateError> {
        self.ensure_session(session_id)?;
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| error::PhasegateError::NotFound(format!("Session {} not found", session_id)))
    }

    pub fn start_workflow(
        &mut self,
        workflow_type: &str,
        target_file: &str,
        options: Map<String, JsonValue>,
    ) -> Result<JsonValue, error::PhasegateError> {
        if workflow_type.trim().is_empty() || target_file.trim().is_empty() {
            return Err(error::PhasegateError::ValidationError(
                "workflow_type and target_file are required".to_string(),
            ));
        }
        state::validate_workflow_type(workflow_type)?;
        let metadata = self.load_workflow_metadata(workflow_type);
        let overview = serde_json::to_value(&metadata)?;
        let rag = Arc::clone(&self.rag);

        if let Some(existing) = self
            .state_manager
            .get_active_session(workflow_type, target_file)?
        {
            info!(session_id = %existing.session_id, target_file, "Resuming existing session");
            let session = self.session(&existing.session_id)?;
            let mut response = session.current_phase_response(&rag);
            response["workflow_overview"] = overview;
            response["resumed"] = json!(true);
            return Ok(add_workflow_guidance(response));
        }

        let state = self.state_manager.create_session(
            workflow_type,
            target_file,
            options,
            metadata.total_phases,
        )?;
        let mut session = WorkflowSession::new(state, metadata);
        if let Some(last) = session.dynamic_last_phase() {
            if last > session.state.final_phase {
                session.state.final_phase = last;
                self.state_manager.save_state(&mut session.state)?;
            }
        }
        info!(
            session_id = %session.state.session_id,
            workflow_type,
            phase = session.state.current_phase,
            dynamic = session.is_dynamic(),
            "Started workflow"
        );

        let mut response = session.current_phase_response(&rag);
        response["workflow_overview"] = overview;
        self.sessions
            .insert(session.state.session_id.clone(), session);
        Ok(add_workflow_guidance(response))
    }

    pub fn get_current_phase(&mut self, session_id: &str) -> Result<JsonValue, error::PhasegateError> {
        let rag = Arc::clone(&self.rag);
        let session = self.session(session_id)?;
        Ok(add_workflow_guidance(session.current_phase_response(&rag)))
    }

    fn sequence_violation(session: &WorkflowSession, rag: &RagEngine, requested: u32) -> JsonValue {
        let current = session.state.current_phase;
        json!({
            "error": "Phase sequence violation",
            "message": format!(
                "Cannot access phase {}. Complete phase {} first.",
                requested, current
            ),
            "violation_type": "attempted_skip",
            "requested_phase": requested,
            "current_phase": current,
            "current_phase_content": session.phase_content(rag, current),
            "phase_gating_enforced": true,
        })
    }

    pub fn get_phase_content(
        &mut self,
        session_id: &str,
        requested_phase: u32,
    ) -> Result<JsonValue, error::PhasegateError> {
        let rag = Arc::clone(&self.rag);
        let session = self.session(session_id)?;
        if !session.state.can_access_phase(requested_phase) {
            warn!(session_id, requested_phase, current = session.state.current_phase, "Phase gating denied access");
            return Ok(add_workflow_guidance(Self::sequence_violation(session, &rag, requested_phase)));
        }
        Ok(add_workflow_guidance(session.phase_response(&rag, requested_phase)))
    }

    pub fn get_task(
        &mut self,
        session_id: &str,
        phase: u32,
        task_number: u32,
    ) -> Result<JsonValue, error::PhasegateError> {
        let rag = Arc::clone(&self.rag);
        let session = self.session(session_id)?;
        if !session.state.can_access_phase(phase) {
            warn!(session_id, phase, task_number, "Phase gating denied task access");
            return Ok(add_workflow_guidance(Self::sequence_violation(session, &rag, phase)));
        }
        let mut response = session.task_content(&rag, phase, task_number);
        response["session_id"] = json!(session_id);
        Ok(add_workflow_guidance(response))
    }

    pub fn complete_phase(
        &mut self,
        session_id: &str,
        phase: u32,
        evidence: &Map<String, JsonValue>,
    ) -> Result<JsonValue, error::PhasegateError> {
        self.refresh_caches();
        self.ensure_session(session_id)?;
        let rag = Arc::clone(&self.rag);
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| error::PhasegateError::NotFound(format!("Session {} not found", session_id)))?;
        let response = session.complete_phase(
            &rag,
            &mut self.checkpoints,
            &self.state_manager,
            phase,
            evidence,
        )?;
        if response["workflow_complete"] == json!(true) {
            self.sessions.remove(session_id);
            info!(session_id, "Workflow complete, session released");
        }
        Ok(add_workflow_guidance(response))
    }

    pub fn get_workflow_state(&mut self, session_id: &str) -> Result<JsonValue, error::PhasegateError> {
        let session = self.session(session_id)?;
        let state = &session.state;
        let checkpoints: Map<String, JsonValue> = state
            .checkpoints
            .iter()
            .map(|(phase, status)| (phase.to_string(), json!(status.as_str())))
            .collect();
        Ok(add_workflow_guidance(json!({
            "session_id": state.session_id,
            "workflow_type": state.workflow_type,
            "target_file": state.target_file,
            "current_phase": state.current_phase,
            "completed_phases": state.completed_phases,
            "total_phases": state.total_phases(),
            "is_complete": state.is_complete(),
            "checkpoints": checkpoints,
            "artifacts": state.artifacts_summary(),
            "dynamic": session.is_dynamic(),
            "created_at": state.created_at.to_rfc3339(),
            "updated_at": state.updated_at.to_rfc3339(),
        })))
    }
}
