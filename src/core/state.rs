//! Workflow session persistence.
//!
//! One JSON document per session under the state directory. Writes go through
//! a temp file and an atomic rename while holding a process-wide lock, so a
//! reader never observes a half-written session.

use crate::core::error;
use crate::core::models::WorkflowState;
use crate::core::time;
use chrono::Duration;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

static STATE_LOCK: Mutex<()> = Mutex::new(());

pub struct StateManager {
    state_dir: PathBuf,
    cleanup_days: i64,
    workflows_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StateStatistics {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub completed_sessions: usize,
    pub workflow_type_counts: BTreeMap<String, usize>,
    pub state_directory: String,
    pub cleanup_days: i64,
}

/// Identifiers that end up as path components: session ids, workflow types
/// and generated workflow names.
fn validate_path_component(kind: &str, value: &str) -> Result<(), error::PhasegateError> {
    if value.is_empty() {
        return Err(error::PhasegateError::ValidationError(format!(
            "{} cannot be empty",
            kind
        )));
    }
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        Err(error::PhasegateError::ValidationError(format!(
            "invalid {} '{}': only [A-Za-z0-9_-] allowed",
            kind, value
        )))
    }
}

pub fn validate_session_id(session_id: &str) -> Result<(), error::PhasegateError> {
    validate_path_component("session_id", session_id)
}

pub fn validate_workflow_type(workflow_type: &str) -> Result<(), error::PhasegateError> {
    validate_path_component("workflow_type", workflow_type)
}

impl StateManager {
    pub fn new(state_dir: &Path, cleanup_days: i64) -> Result<Self, error::PhasegateError> {
        fs::create_dir_all(state_dir).map_err(error::PhasegateError::IoError)?;
        info!(dir = %state_dir.display(), "State manager initialized");
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            cleanup_days,
            workflows_path: None,
        })
    }

    /// Enables starting-phase detection against workflow directories.
    pub fn with_workflows_path(mut self, workflows_path: &Path) -> Self {
        self.workflows_path = Some(workflows_path.to_path_buf());
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn state_file(&self, session_id: &str) -> Result<PathBuf, error::PhasegateError> {
        validate_session_id(session_id)?;
        Ok(self.state_dir.join(format!("{}.json", session_id)))
    }

    /// Workflows that ship a `phases/0` directory start at phase 0, others at 1.
    pub fn starting_phase(&self, workflow_type: &str) -> u32 {
        if validate_workflow_type(workflow_type).is_err() {
            return 1;
        }
        match &self.workflows_path {
            Some(base) if base.join(workflow_type).join("phases").join("0").is_dir() => 0,
            _ => 1,
        }
    }

    pub fn create_session(
        &self,
        workflow_type: &str,
        target_file: &str,
        metadata: Map<String, JsonValue>,
        total_phases: u32,
    ) -> Result<WorkflowState, error::PhasegateError> {
        validate_workflow_type(workflow_type)?;
        let session_id = time::new_session_id();
        let starting = self.starting_phase(workflow_type);
        let state = WorkflowState::new(
            &session_id,
            workflow_type,
            target_file,
            starting,
            total_phases,
            metadata,
        );
        self.write_state(&state)?;
        info!(
            session_id = %session_id,
            workflow_type,
            target_file,
            starting_phase = starting,
            "Created workflow session"
        );
        Ok(state)
    }

    /// Stamps `updated_at` and persists.
    pub fn save_state(&self, state: &mut WorkflowState) -> Result<(), error::PhasegateError> {
        state.updated_at = time::now_utc();
        self.write_state(state)
    }

    /// Persists the state exactly as given.
    pub fn write_state(&self, state: &WorkflowState) -> Result<(), error::PhasegateError> {
        let path = self.state_file(&state.session_id)?;
        let body = serde_json::to_vec_pretty(state)?;

        let _lock = STATE_LOCK
            .lock()
            .map_err(|_| error::PhasegateError::ValidationError("state lock poisoned".to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(error::PhasegateError::IoError)?;
        fs::rename(&tmp, &path).map_err(error::PhasegateError::IoError)?;
        debug!(session_id = %state.session_id, "Saved state");
        Ok(())
    }

    pub fn load_state(&self, session_id: &str) -> Result<Option<WorkflowState>, error::PhasegateError> {
        let path = self.state_file(session_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(error::PhasegateError::IoError)?;
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            error::PhasegateError::ValidationError(format!(
                "Corrupted state file for session {}: {}",
                session_id, e
            ))
        })
    }

    pub fn delete_session(&self, session_id: &str) -> Result<bool, error::PhasegateError> {
        let path = self.state_file(session_id)?;
        if !path.exists() {
            return Ok(false);
        }
        let _lock = STATE_LOCK
            .lock()
            .map_err(|_| error::PhasegateError::ValidationError("state lock poisoned".to_string()))?;
        fs::remove_file(&path).map_err(error::PhasegateError::IoError)?;
        info!(session_id, "Deleted session");
        Ok(true)
    }

    fn session_files(&self) -> Result<Vec<PathBuf>, error::PhasegateError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.state_dir).map_err(error::PhasegateError::IoError)? {
            let path = entry.map_err(error::PhasegateError::IoError)?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_all(&self) -> Result<Vec<WorkflowState>, error::PhasegateError> {
        let mut states = Vec::new();
        for path in self.session_files()? {
            let parsed = fs::read_to_string(&path)
                .map_err(error::PhasegateError::from)
                .and_then(|raw| serde_json::from_str::<WorkflowState>(&raw).map_err(Into::into));
            match parsed {
                Ok(state) => states.push(state),
                Err(e) => warn!(file = %path.display(), error = %e, "Skipping unreadable session"),
            }
        }
        Ok(states)
    }

    pub fn list_sessions(
        &self,
        workflow_type: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<WorkflowState>, error::PhasegateError> {
        let mut sessions: Vec<WorkflowState> = self
            .read_all()?
            .into_iter()
            .filter(|s| workflow_type.is_none_or(|wt| s.workflow_type == wt))
            .filter(|s| !active_only || !s.is_complete())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Most recently updated incomplete session for this workflow and target.
    pub fn get_active_session(
        &self,
        workflow_type: &str,
        target_file: &str,
    ) -> Result<Option<WorkflowState>, error::PhasegateError> {
        Ok(self
            .list_sessions(Some(workflow_type), true)?
            .into_iter()
            .find(|s| s.target_file == target_file))
    }

    pub fn cleanup_old_sessions(&self) -> Result<usize, error::PhasegateError> {
        let cutoff = time::now_utc() - Duration::days(self.cleanup_days);
        let mut removed = 0;
        for state in self.read_all()? {
            if state.updated_at < cutoff && self.delete_session(&state.session_id)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, cleanup_days = self.cleanup_days, "Cleaned up old sessions");
        }
        Ok(removed)
    }

    pub fn validate_state(&self, state: &WorkflowState) -> (bool, Vec<String>) {
        let mut issues = Vec::new();
        if state.session_id.is_empty() {
            issues.push("Missing session_id".to_string());
        }
        if state.workflow_type.is_empty() {
            issues.push("Missing workflow_type".to_string());
        }
        if state.target_file.is_empty() {
            issues.push("Missing target_file".to_string());
        }

        let mut sorted = state.completed_phases.clone();
        sorted.sort_unstable();
        let expected: Vec<u32> =
            (state.starting_phase..state.starting_phase + sorted.len() as u32).collect();
        if sorted != expected {
            issues.push(format!(
                "Completed phases not sequential from phase {}: {:?}",
                state.starting_phase, state.completed_phases
            ));
        }

        match sorted.last() {
            Some(&max) if state.current_phase != max + 1 => issues.push(format!(
                "Current phase {} does not follow last completed phase {}",
                state.current_phase, max
            )),
            None if state.current_phase < state.starting_phase => issues.push(format!(
                "Invalid current_phase {} (< {})",
                state.current_phase, state.starting_phase
            )),
            _ => {}
        }

        if sorted.len() as u32 > state.total_phases() {
            issues.push(format!(
                "{} completed phases exceed the workflow's {} phases",
                sorted.len(),
                state.total_phases()
            ));
        }
        if state.current_phase > state.final_phase.saturating_add(1) {
            issues.push(format!(
                "Current phase {} is past the final phase {}",
                state.current_phase, state.final_phase
            ));
        }

        if state.updated_at < state.created_at {
            issues.push("updated_at is before created_at".to_string());
        }

        (issues.is_empty(), issues)
    }

    /// Repairs phase bookkeeping and timestamps. Saves only when the result validates.
    pub fn recover_corrupted_state(&self, session_id: &str) -> Result<bool, error::PhasegateError> {
        let Some(mut state) = self.load_state(session_id)? else {
            return Err(error::PhasegateError::NotFound(format!(
                "session {}",
                session_id
            )));
        };

        state.completed_phases.sort_unstable();
        state.completed_phases.dedup();
        state.current_phase = match state.completed_phases.last() {
            Some(&max) => max + 1,
            None => state.current_phase.max(state.starting_phase),
        };

        if state.updated_at < state.created_at {
            state.updated_at = state.created_at;
        }

        let (valid, issues) = self.validate_state(&state);
        if !valid {
            warn!(session_id, ?issues, "State could not be recovered");
            return Ok(false);
        }
        self.save_state(&mut state)?;
        info!(session_id, "Recovered session state");
        Ok(true)
    }

    pub fn get_statistics(&self) -> Result<StateStatistics, error::PhasegateError> {
        let sessions = self.read_all()?;
        let mut workflow_type_counts = BTreeMap::new();
        let mut completed = 0;
        for s in &sessions {
            *workflow_type_counts.entry(s.workflow_type.clone()).or_insert(0) += 1;
            if s.is_complete() {
                completed += 1;
            }
        }
        Ok(StateStatistics {
            total_sessions: sessions.len(),
            active_sessions: sessions.len() - completed,
            completed_sessions: completed,
            workflow_type_counts,
            state_directory: self.state_dir.display().to_string(),
            cleanup_days: self.cleanup_days,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_rejects_traversal() {
        assert!(validate_session_id("01HZX-abc_1").is_ok());
        assert!(validate_session_id("../etc/passwd").is_err());
        assert!(validate_session_id("").is_err());
        assert!(validate_workflow_type("test_generation_v3").is_ok());
        assert!(validate_workflow_type("../../x").is_err());
    }

    #[test]
    fn test_starting_phase_detects_phase_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let workflows = tmp.path().join("workflows");
        fs::create_dir_all(workflows.join("with_zero/phases/0")).unwrap();
        fs::create_dir_all(workflows.join("from_one/phases/1")).unwrap();
        let manager = StateManager::new(&tmp.path().join("state"), 7)
            .unwrap()
            .with_workflows_path(&workflows);
        assert_eq!(manager.starting_phase("with_zero"), 0);
        assert_eq!(manager.starting_phase("from_one"), 1);
        assert_eq!(manager.starting_phase("missing"), 1);
    }
}
