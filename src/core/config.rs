//! Server configuration.
//!
//! `config.json` lives at the root of the `.agent-os` base directory. Each
//! section (`rag`, `mcp`, `server`) falls back to defaults independently, so a
//! broken section never takes the others down with it.

use crate::core::error;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const BASE_DIR_NAME: &str = ".agent-os";
pub const KNOWN_TOOL_GROUPS: &[&str] = &["rag", "workflow"];
pub const EMBEDDING_PROVIDERS: &[&str] = &["local", "openai"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RagConfig {
    pub standards_path: String,
    pub usage_path: String,
    pub workflows_path: String,
    pub index_path: String,
    pub embedding_provider: String,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            standards_path: "standards".to_string(),
            usage_path: "usage".to_string(),
            workflows_path: "workflows".to_string(),
            index_path: ".cache/index".to_string(),
            embedding_provider: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct McpConfig {
    pub enabled_tool_groups: Vec<String>,
    pub max_tools_warning: usize,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled_tool_groups: vec!["rag".to_string(), "workflow".to_string()],
            max_tools_warning: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSettings {
    pub watch: bool,
    pub debounce_seconds: u64,
    pub session_cleanup_days: i64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            watch: true,
            debounce_seconds: 5,
            session_cleanup_days: 7,
        }
    }
}

/// Fully loaded configuration anchored at a base directory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub base_path: PathBuf,
    pub rag: RagConfig,
    pub mcp: McpConfig,
    pub server: ServerSettings,
}

/// Absolute locations derived from a `ServerConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub standards_path: PathBuf,
    pub usage_path: PathBuf,
    pub workflows_path: PathBuf,
    pub index_path: PathBuf,
    pub state_dir: PathBuf,
}

impl ServerConfig {
    pub fn with_defaults(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            rag: RagConfig::default(),
            mcp: McpConfig::default(),
            server: ServerSettings::default(),
        }
    }

    pub fn resolved_paths(&self) -> ResolvedPaths {
        let resolve = |rel: &str| {
            let p = Path::new(rel);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                self.base_path.join(p)
            }
        };
        let index_path = resolve(&self.rag.index_path);
        let state_dir = index_path
            .parent()
            .map(|p| p.join("state"))
            .unwrap_or_else(|| self.base_path.join("state"));
        ResolvedPaths {
            standards_path: resolve(&self.rag.standards_path),
            usage_path: resolve(&self.rag.usage_path),
            workflows_path: resolve(&self.rag.workflows_path),
            index_path,
            state_dir,
        }
    }

    /// Directories whose markdown feeds the index, paired with their source label.
    pub fn content_roots(&self) -> Vec<(String, PathBuf)> {
        let paths = self.resolved_paths();
        vec![
            ("standards".to_string(), paths.standards_path),
            ("usage".to_string(), paths.usage_path),
            ("workflows".to_string(), paths.workflows_path),
        ]
    }
}

/// Locates the base directory: explicit flag, then `./.agent-os`, then `$HOME/.agent-os`.
pub fn discover_base_path(explicit: Option<&Path>) -> Result<PathBuf, error::PhasegateError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().map_err(error::PhasegateError::IoError)?;
    let local = cwd.join(BASE_DIR_NAME);
    if local.is_dir() {
        return Ok(local);
    }
    if let Ok(home) = env::var("HOME") {
        let home_base = PathBuf::from(home).join(BASE_DIR_NAME);
        if home_base.is_dir() {
            return Ok(home_base);
        }
    }
    Err(error::PhasegateError::ConfigError(format!(
        "Could not find {} in {} or the home directory",
        BASE_DIR_NAME,
        cwd.display()
    )))
}

/// Loads `config.json` from `base_path`, falling back to defaults where needed.
///
/// The base path itself must exist and be a directory.
pub fn load_config(base_path: &Path) -> Result<ServerConfig, error::PhasegateError> {
    if !base_path.exists() {
        return Err(error::PhasegateError::ConfigError(format!(
            "Base path does not exist: {}",
            base_path.display()
        )));
    }
    if !base_path.is_dir() {
        return Err(error::PhasegateError::ConfigError(format!(
            "Base path is not a directory: {}",
            base_path.display()
        )));
    }

    let mut config = ServerConfig::with_defaults(base_path);
    let config_path = base_path.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        info!(path = %config_path.display(), "No config.json found, using defaults");
        return Ok(config);
    }

    let raw = match fs::read_to_string(&config_path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "Could not read config.json, using defaults");
            return Ok(config);
        }
    };
    let doc: JsonValue = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(error = %e, "Malformed config.json, using defaults");
            return Ok(config);
        }
    };

    config.rag = section_or_default(&doc, "rag");
    config.mcp = section_or_default(&doc, "mcp");
    config.server = section_or_default(&doc, "server");
    info!(path = %config_path.display(), "Loaded configuration");
    Ok(config)
}

fn section_or_default<T>(doc: &JsonValue, key: &str) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match doc.get(key) {
        None => T::default(),
        Some(section) => serde_json::from_value(section.clone()).unwrap_or_else(|e| {
            warn!(section = key, error = %e, "Invalid config section, using defaults");
            T::default()
        }),
    }
}

/// Returns every problem found in `config`. Empty means valid.
pub fn validate_config(config: &ServerConfig) -> Vec<String> {
    let mut errors = Vec::new();
    let paths = config.resolved_paths();

    for (name, path) in [
        ("standards_path", &paths.standards_path),
        ("usage_path", &paths.usage_path),
        ("workflows_path", &paths.workflows_path),
    ] {
        if !path.exists() {
            errors.push(format!("{} does not exist: {}", name, path.display()));
        } else if !path.is_dir() {
            errors.push(format!("{} is not a directory: {}", name, path.display()));
        }
    }

    match paths.index_path.parent() {
        Some(parent) if parent.exists() => {}
        Some(parent) => errors.push(format!(
            "index_path parent does not exist: {}",
            parent.display()
        )),
        None => errors.push("index_path has no parent directory".to_string()),
    }

    if !EMBEDDING_PROVIDERS.contains(&config.rag.embedding_provider.as_str()) {
        errors.push(format!(
            "Invalid embedding_provider: {} (expected one of: {})",
            config.rag.embedding_provider,
            EMBEDDING_PROVIDERS.join(", ")
        ));
    }

    if config.mcp.max_tools_warning < 1 {
        errors.push("max_tools_warning must be >= 1".to_string());
    }
    if config.mcp.enabled_tool_groups.is_empty() {
        errors.push("At least one tool group must be enabled".to_string());
    }

    errors
}
