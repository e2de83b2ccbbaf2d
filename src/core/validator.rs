//! Workflow directory compliance checks.
//!
//! Expected layout:
//!
//! ```text
//! <workflow>/
//!   metadata.json
//!   phases/
//!     0/phase.md
//!     0/task-1-<slug>.md
//!     1/...
//! ```

use crate::core::models::WorkflowMetadata;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;

pub const PHASE_FILE_TARGET_LINES: usize = 80;
pub const PHASE_FILE_MAX_LINES: usize = 100;
pub const TASK_FILE_MAX_LINES: usize = 170;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationIssue {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub workflow_path: String,
    pub compliant: bool,
    pub compliance_score: u32,
    pub issues: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub summary: String,
}

fn task_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^task-\d+-[a-z0-9][a-z0-9-]*\.md$").expect("valid regex"))
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
}

pub struct WorkflowValidator {
    root: PathBuf,
    issues: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

impl WorkflowValidator {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            issues: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn rel(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn issue(&mut self, kind: &str, severity: Severity, message: String, file: Option<String>) {
        self.issues.push(ValidationIssue {
            kind: kind.to_string(),
            severity,
            message,
            file,
        });
    }

    fn warn(&mut self, kind: &str, message: String, file: Option<String>) {
        self.warnings.push(ValidationIssue {
            kind: kind.to_string(),
            severity: Severity::Warning,
            message,
            file,
        });
    }

    pub fn validate(mut self) -> ValidationReport {
        if !self.root.is_dir() {
            let msg = format!("Workflow directory not found: {}", self.root.display());
            self.issue("missing_directory", Severity::Critical, msg, None);
            return self.finish();
        }

        let metadata = self.check_metadata();
        let phase_count = self.check_phases();

        if let (Some(meta), Some(count)) = (metadata, phase_count) {
            if meta.total_phases as usize != count {
                self.warn(
                    "phase_count_mismatch",
                    format!(
                        "metadata.json declares {} phases but {} phase directories exist",
                        meta.total_phases, count
                    ),
                    Some("metadata.json".to_string()),
                );
            }
        }
        self.finish()
    }

    fn check_metadata(&mut self) -> Option<WorkflowMetadata> {
        let path = self.root.join("metadata.json");
        if !path.exists() {
            self.issue(
                "missing_metadata",
                Severity::Critical,
                "metadata.json is required".to_string(),
                Some("metadata.json".to_string()),
            );
            return None;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<WorkflowMetadata>(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(meta) => Some(meta),
            Err(e) => {
                self.issue(
                    "invalid_metadata",
                    Severity::Critical,
                    format!("metadata.json is invalid: {}", e),
                    Some("metadata.json".to_string()),
                );
                None
            }
        }
    }

    /// Returns the number of numeric phase directories, or `None` without `phases/`.
    fn check_phases(&mut self) -> Option<usize> {
        let phases_dir = self.root.join("phases");
        if !phases_dir.is_dir() {
            self.issue(
                "missing_phases_directory",
                Severity::Critical,
                "phases/ directory is required".to_string(),
                Some("phases".to_string()),
            );
            return None;
        }

        let mut dirs: Vec<PathBuf> = fs::read_dir(&phases_dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect()
            })
            .unwrap_or_default();
        dirs.sort();

        let mut count = 0;
        for dir in dirs {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if name.parse::<u32>().is_err() {
                let file = self.rel(&dir);
                self.issue(
                    "invalid_phase_directory",
                    Severity::Error,
                    format!("Phase directory '{}' must be numeric", name),
                    Some(file),
                );
                continue;
            }
            count += 1;
            self.check_phase_dir(&dir);
        }
        Some(count)
    }

    fn check_phase_dir(&mut self, dir: &Path) {
        let phase_file = dir.join("phase.md");
        let readme = dir.join("README.md");
        if phase_file.exists() {
            let lines = line_count(&phase_file);
            if lines > PHASE_FILE_MAX_LINES {
                let file = self.rel(&phase_file);
                self.warn(
                    "phase_file_too_long",
                    format!(
                        "phase.md has {} lines (target ~{}, max {})",
                        lines, PHASE_FILE_TARGET_LINES, PHASE_FILE_MAX_LINES
                    ),
                    Some(file),
                );
            }
        } else if readme.exists() {
            let file = self.rel(&readme);
            self.issue(
                "naming_convention",
                Severity::Error,
                "Use phase.md instead of README.md".to_string(),
                Some(file),
            );
        } else {
            let file = self.rel(dir);
            self.issue(
                "missing_phase_file",
                Severity::Error,
                "Phase directory has no phase.md".to_string(),
                Some(file),
            );
        }

        let mut task_files = 0;
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .map(|it| it.filter_map(Result::ok).map(|e| e.path()).collect())
            .unwrap_or_default();
        entries.sort();
        for path in entries {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !name.starts_with("task") || !name.ends_with(".md") {
                continue;
            }
            task_files += 1;
            let file = self.rel(&path);
            if !task_name_re().is_match(&name) {
                self.warn(
                    "task_naming",
                    format!("Task file '{}' should match task-<n>-<slug>.md", name),
                    Some(file.clone()),
                );
            }
            let lines = line_count(&path);
            if lines > TASK_FILE_MAX_LINES {
                self.warn(
                    "task_file_too_long",
                    format!("{} has {} lines (max {})", name, lines, TASK_FILE_MAX_LINES),
                    Some(file),
                );
            }
        }
        if task_files == 0 {
            let file = self.rel(dir);
            self.warn("no_task_files", "Phase has no task files".to_string(), Some(file));
        }
    }

    fn finish(self) -> ValidationReport {
        let critical = self
            .issues
            .iter()
            .filter(|i| i.severity == Severity::Critical)
            .count() as i64;
        let errors = self
            .issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .count() as i64;
        let warnings = self.warnings.len() as i64;
        let score = (100 - 25 * critical - 10 * errors - 2 * warnings).max(0) as u32;
        let compliant = critical == 0 && errors == 0;

        let summary = if compliant && warnings == 0 {
            "✅ Workflow is fully compliant".to_string()
        } else if compliant {
            format!("⚠️ Workflow is compliant with {} warning(s)", warnings)
        } else {
            format!(
                "❌ Workflow is not compliant: {} critical, {} error(s), {} warning(s)",
                critical, errors, warnings
            )
        };
        info!(
            path = %self.root.display(),
            compliant,
            score,
            "Workflow validation finished"
        );

        ValidationReport {
            workflow_path: self.root.display().to_string(),
            compliant,
            compliance_score: score,
            issues: self.issues,
            warnings: self.warnings,
            summary,
        }
    }
}

pub fn validate_workflow(path: &Path) -> ValidationReport {
    WorkflowValidator::new(path).validate()
}
