//! Upgrade pre-flight and post-flight checks.
//!
//! Each check returns a serializable report instead of failing, so callers can
//! show every problem at once.

use crate::core::error;
use clap::Subcommand;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const UPGRADE_WORKFLOW_TYPE: &str = "agent_os_upgrade_v1";
/// Phase at which an upgrade session no longer blocks another upgrade.
pub const UPGRADE_SETTLED_PHASE: u64 = 5;
pub const LOCK_FILE_NAME: &str = ".upgrade-lock";
pub const REQUIRED_TARGET_DIRS: &[&str] = &["mcp_server", "standards", "usage", "workflows"];
pub const REQUIRED_TARGET_FILES: &[&str] = &["config.json"];

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SourceRepoReport {
    pub valid: bool,
    pub path_exists: bool,
    pub is_agent_os_repo: bool,
    pub git_clean: bool,
    pub version: Option<String>,
    pub commit: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TargetStructureReport {
    pub valid: bool,
    pub target_exists: bool,
    pub required_dirs: BTreeMap<String, bool>,
    pub required_files: BTreeMap<String, bool>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ChecksumReport {
    pub verified: bool,
    pub files_checked: usize,
    pub mismatches: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LockReport {
    pub no_concurrent_workflows: bool,
    pub lock_exists: bool,
    pub lock_info: Option<JsonValue>,
}

#[derive(clap::Args, Debug)]
pub struct UpgradeCli {
    #[clap(subcommand)]
    pub command: UpgradeCommand,
}

#[derive(Subcommand, Debug)]
pub enum UpgradeCommand {
    /// Validate an upgrade source repository (clean git tree, expected layout).
    Source { path: PathBuf },
    /// Validate the installed directory structure (defaults to the base directory).
    Target { path: Option<PathBuf> },
    /// Compare SHA-256 checksums of every file under SOURCE with TARGET.
    Checksums { source: PathBuf, target: PathBuf },
    /// Report upgrade locks and upgrade sessions still in progress.
    Lock {
        /// Lock file (defaults to `<base>/.upgrade-lock`).
        #[clap(long)]
        lock_file: Option<PathBuf>,
    },
}

/// Runs one upgrade check. Returns the command name, whether it passed, and its report.
pub fn run_upgrade_cli(
    base_path: &Path,
    state_dir: &Path,
    cli: UpgradeCli,
) -> Result<(&'static str, bool, JsonValue), error::PhasegateError> {
    Ok(match cli.command {
        UpgradeCommand::Source { path } => {
            let report = validate_source_repo(&path);
            ("upgrade.source", report.valid, serde_json::to_value(report)?)
        }
        UpgradeCommand::Target { path } => {
            let target = path.unwrap_or_else(|| base_path.to_path_buf());
            let report = validate_target_structure(&target);
            ("upgrade.target", report.valid, serde_json::to_value(report)?)
        }
        UpgradeCommand::Checksums { source, target } => {
            let report = verify_checksums(&source, &target)?;
            ("upgrade.checksums", report.verified, serde_json::to_value(report)?)
        }
        UpgradeCommand::Lock { lock_file } => {
            let lock_file = lock_file.unwrap_or_else(|| base_path.join(LOCK_FILE_NAME));
            let lock = check_for_concurrent_upgrades(&lock_file);
            let idle = validate_workflow_not_in_progress(state_dir);
            let ok = lock.no_concurrent_workflows && idle;
            let mut payload = serde_json::to_value(lock)?;
            payload["no_upgrade_in_progress"] = JsonValue::Bool(idle);
            ("upgrade.lock", ok, payload)
        }
    })
}

pub fn run_git(repo_root: &Path, args: &[&str]) -> Result<String, String> {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .map_err(|e| format!("git failed: {}", e))?;

    if !output.status.success() {
        return Err(format!(
            "git failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn validate_source_repo(source: &Path) -> SourceRepoReport {
    info!(source = %source.display(), "Validating source repository");
    let mut report = SourceRepoReport::default();

    if !source.exists() {
        report
            .errors
            .push(format!("Path does not exist: {}", source.display()));
        return report;
    }
    report.path_exists = true;

    if !source.join("mcp_server").is_dir() {
        report.errors.push("Not an agent-os-enhanced repository".to_string());
        return report;
    }
    if !source.join("universal").is_dir() {
        report.errors.push("Missing universal/ directory".to_string());
        return report;
    }
    report.is_agent_os_repo = true;

    match run_git(source, &["status", "--porcelain"]) {
        Ok(out) if out.is_empty() => report.git_clean = true,
        Ok(_) => report
            .errors
            .push("Git repository has uncommitted changes".to_string()),
        Err(e) => {
            report.errors.push(format!("Git check failed: {}", e));
            return report;
        }
    }

    report.version = fs::read_to_string(source.join("VERSION.txt"))
        .ok()
        .map(|v| v.trim().to_string());
    match run_git(source, &["rev-parse", "HEAD"]) {
        Ok(sha) => report.commit = Some(sha.chars().take(10).collect()),
        Err(e) => warn!(error = %e, "Failed to read commit hash"),
    }

    report.valid = report.errors.is_empty() && report.git_clean;
    if report.valid {
        info!(version = ?report.version, commit = ?report.commit, "Source repository validated");
    } else {
        warn!(errors = ?report.errors, "Source validation failed");
    }
    report
}

pub fn validate_target_structure(target: &Path) -> TargetStructureReport {
    info!(target = %target.display(), "Validating target structure");
    let mut report = TargetStructureReport {
        target_exists: target.exists(),
        ..Default::default()
    };
    if !report.target_exists {
        report
            .errors
            .push(format!("Target path does not exist: {}", target.display()));
        return report;
    }

    for dir in REQUIRED_TARGET_DIRS {
        let exists = target.join(dir).is_dir();
        report.required_dirs.insert(dir.to_string(), exists);
        if !exists {
            report.errors.push(format!("Missing directory: {}/", dir));
        }
    }
    for file in REQUIRED_TARGET_FILES {
        let exists = target.join(file).is_file();
        report.required_files.insert(file.to_string(), exists);
        if !exists {
            report.errors.push(format!("Missing file: {}", file));
        }
    }
    report.valid = report.errors.is_empty();
    report
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), error::PhasegateError> {
    for entry in fs::read_dir(dir).map_err(error::PhasegateError::IoError)? {
        let path = entry.map_err(error::PhasegateError::IoError)?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, error::PhasegateError> {
    let bytes = fs::read(path).map_err(error::PhasegateError::IoError)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Compares every file under `source` with its counterpart under `target`.
pub fn verify_checksums(source: &Path, target: &Path) -> Result<ChecksumReport, error::PhasegateError> {
    let mut report = ChecksumReport::default();
    if !source.is_dir() || !target.is_dir() {
        warn!("Source or target directory does not exist");
        return Ok(report);
    }

    let mut files = Vec::new();
    collect_files(source, &mut files)?;
    files.sort();
    for file in files {
        let rel = file.strip_prefix(source).unwrap_or(&file);
        let rel_display = rel.to_string_lossy().replace('\\', "/");
        let counterpart = target.join(rel);
        if !counterpart.is_file() {
            report.missing.push(rel_display);
            continue;
        }
        report.files_checked += 1;
        if sha256_file(&file)? != sha256_file(&counterpart)? {
            report.mismatches.push(rel_display);
        }
    }

    report.verified = report.mismatches.is_empty() && report.missing.is_empty();
    if report.verified {
        info!(files = report.files_checked, "Checksums verified");
    } else {
        warn!(
            mismatches = report.mismatches.len(),
            missing = report.missing.len(),
            "Checksum verification failed"
        );
    }
    Ok(report)
}

pub fn check_for_concurrent_upgrades(lock_file: &Path) -> LockReport {
    let lock_exists = lock_file.exists();
    let lock_info = if lock_exists {
        match fs::read_to_string(lock_file)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<JsonValue>(&raw).map_err(|e| e.to_string()))
        {
            Ok(info) => {
                warn!(lock = %info, "Upgrade lock exists");
                Some(info)
            }
            Err(e) => {
                warn!(error = %e, "Failed to read lock file");
                None
            }
        }
    } else {
        None
    };
    LockReport {
        no_concurrent_workflows: !lock_exists,
        lock_exists,
        lock_info,
    }
}

/// False when an upgrade session exists that has not reached its settled phase.
pub fn validate_workflow_not_in_progress(state_dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(state_dir) else {
        return true;
    };
    for path in entries.filter_map(Result::ok).map(|e| e.path()) {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(state) = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<JsonValue>(&raw).ok())
        else {
            continue;
        };
        let current = state["current_phase"].as_u64().unwrap_or(0);
        if state["workflow_type"] == UPGRADE_WORKFLOW_TYPE && current < UPGRADE_SETTLED_PHASE {
            warn!(session_id = %state["session_id"], "Active upgrade workflow found");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_source_stops_early() {
        let tmp = tempfile::tempdir().unwrap();
        let report = validate_source_repo(&tmp.path().join("nope"));
        assert!(!report.valid);
        assert!(!report.path_exists);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn test_non_agent_os_source() {
        let tmp = tempfile::tempdir().unwrap();
        let report = validate_source_repo(tmp.path());
        assert!(report.path_exists);
        assert!(!report.is_agent_os_repo);
        assert_eq!(report.errors[0], "Not an agent-os-enhanced repository");
    }
}
