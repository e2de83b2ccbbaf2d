//! MCP tool registry.
//!
//! Tools are registered by group so a deployment can keep the advertised tool
//! count small. `get_server_info` is always available.

use crate::core::config::{KNOWN_TOOL_GROUPS, ServerConfig};
use crate::core::engine::WorkflowEngine;
use crate::core::error;
use crate::core::generator::FrameworkGenerator;
use crate::core::rag::SearchFilters;
use crate::core::validator;
use chrono::{Datelike, Local};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const GROUP_RAG: &str = "rag";
pub const GROUP_WORKFLOW: &str = "workflow";
pub const GROUP_CORE: &str = "core";
pub const DEFAULT_N_RESULTS: usize = 5;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: JsonValue,
    #[serde(skip)]
    pub group: String,
}

impl ToolDefinition {
    fn new(group: &str, name: &str, description: &str, input_schema: JsonValue) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            group: group.to_string(),
        }
    }

    fn required_args(&self) -> Vec<&str> {
        self.input_schema["required"]
            .as_array()
            .map(|r| r.iter().filter_map(JsonValue::as_str).collect())
            .unwrap_or_default()
    }
}

/// Payload of a tool call plus whether the call failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub payload: JsonValue,
    pub is_error: bool,
}

impl ToolResult {
    fn ok(payload: JsonValue) -> Self {
        Self {
            payload,
            is_error: false,
        }
    }

    fn error(message: String) -> Self {
        Self {
            payload: json!({ "error": message }),
            is_error: true,
        }
    }
}

fn object_schema(properties: JsonValue, required: &[&str]) -> JsonValue {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn group_tools(group: &str) -> Vec<ToolDefinition> {
    match group {
        GROUP_RAG => vec![ToolDefinition::new(
            GROUP_RAG,
            "search_standards",
            "Semantic search over Agent OS standards, usage guides and workflows. \
             Returns relevant chunks instead of whole files.",
            object_schema(
                json!({
                    "query": {"type": "string", "description": "Natural language question or topic"},
                    "n_results": {"type": "integer", "minimum": 1, "default": DEFAULT_N_RESULTS},
                    "filter_phase": {"type": "integer", "description": "Only return chunks from this phase"},
                    "workflow_type": {"type": "string", "description": "Only return chunks from this workflow"},
                }),
                &["query"],
            ),
        )],
        GROUP_WORKFLOW => vec![
            ToolDefinition::new(
                GROUP_WORKFLOW,
                "start_workflow",
                "Start a phase-gated workflow session for a target file, or resume the active one.",
                object_schema(
                    json!({
                        "workflow_type": {"type": "string"},
                        "target_file": {"type": "string"},
                        "options": {"type": "object", "description": "Workflow options such as spec_path for dynamic workflows"},
                    }),
                    &["workflow_type", "target_file"],
                ),
            ),
            ToolDefinition::new(
                GROUP_WORKFLOW,
                "get_current_phase",
                "Get the content of the session's current phase.",
                object_schema(json!({"session_id": {"type": "string"}}), &["session_id"]),
            ),
            ToolDefinition::new(
                GROUP_WORKFLOW,
                "get_task",
                "Get the full content of one task, including execution steps.",
                object_schema(
                    json!({
                        "session_id": {"type": "string"},
                        "phase": {"type": "integer", "minimum": 0},
                        "task_number": {"type": "integer", "minimum": 1},
                    }),
                    &["session_id", "phase", "task_number"],
                ),
            ),
            ToolDefinition::new(
                GROUP_WORKFLOW,
                "complete_phase",
                "Submit evidence for a phase checkpoint and advance when it passes.",
                object_schema(
                    json!({
                        "session_id": {"type": "string"},
                        "phase": {"type": "integer", "minimum": 0},
                        "evidence": {"type": "object"},
                    }),
                    &["session_id", "phase", "evidence"],
                ),
            ),
            ToolDefinition::new(
                GROUP_WORKFLOW,
                "get_workflow_state",
                "Get the full state of a workflow session.",
                object_schema(json!({"session_id": {"type": "string"}}), &["session_id"]),
            ),
            ToolDefinition::new(
                GROUP_WORKFLOW,
                "create_workflow",
                "Create a compliant workflow framework with phase files, command-language \
                 task files and validation gates.",
                object_schema(
                    json!({
                        "name": {"type": "string"},
                        "workflow_type": {"type": "string"},
                        "phases": {"type": "array", "items": {"type": "string"}},
                        "target_language": {"type": "string", "default": "python"},
                        "quick_start": {"type": "boolean", "default": true},
                        "output_path": {"type": "string"},
                    }),
                    &["name", "workflow_type", "phases"],
                ),
            ),
            ToolDefinition::new(
                GROUP_WORKFLOW,
                "validate_workflow",
                "Validate a workflow directory against the construction rules.",
                object_schema(json!({"workflow_path": {"type": "string"}}), &["workflow_path"]),
            ),
            ToolDefinition::new(
                GROUP_WORKFLOW,
                "current_date",
                "Get the current date and time for dating specs and documents.",
                object_schema(json!({}), &[]),
            ),
        ],
        _ => Vec::new(),
    }
}

fn server_info_tool() -> ToolDefinition {
    ToolDefinition::new(
        GROUP_CORE,
        "get_server_info",
        "Get server version, enabled tools, index size and session statistics.",
        object_schema(json!({}), &[]),
    )
}

fn arg_str<'a>(args: &'a Map<String, JsonValue>, key: &str) -> Result<&'a str, error::PhasegateError> {
    args.get(key).and_then(JsonValue::as_str).ok_or_else(|| {
        error::PhasegateError::ValidationError(format!("Argument '{}' must be a string", key))
    })
}

fn arg_u32(args: &Map<String, JsonValue>, key: &str) -> Result<u32, error::PhasegateError> {
    args.get(key)
        .and_then(JsonValue::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            error::PhasegateError::ValidationError(format!(
                "Argument '{}' must be a non-negative integer",
                key
            ))
        })
}

fn arg_object(args: &Map<String, JsonValue>, key: &str) -> Result<Map<String, JsonValue>, error::PhasegateError> {
    match args.get(key) {
        None | Some(JsonValue::Null) => Ok(Map::new()),
        Some(JsonValue::Object(obj)) => Ok(obj.clone()),
        Some(_) => Err(error::PhasegateError::ValidationError(format!(
            "Argument '{}' must be an object",
            key
        ))),
    }
}

/// Date payload used by `current_date` and the `date` command.
pub fn current_date_payload() -> JsonValue {
    let now = Local::now();
    let iso_date = now.format("%Y-%m-%d").to_string();
    json!({
        "iso_date": iso_date,
        "iso_datetime": now.to_rfc3339(),
        "day_of_week": now.format("%A").to_string(),
        "month": now.format("%B").to_string(),
        "year": now.year(),
        "unix_timestamp": now.timestamp(),
        "formatted": {
            "spec_directory": format!("{}-", iso_date),
            "header": format!("**Date**: {}", iso_date),
            "full_readable": now.format("%A, %B %-d, %Y").to_string(),
        },
        "usage_note": "Use iso_date for spec directories and document headers; do not guess dates.",
    })
}

pub struct ToolRegistry {
    config: ServerConfig,
    engine: WorkflowEngine,
    generator: FrameworkGenerator,
    tools: Vec<ToolDefinition>,
}

impl ToolRegistry {
    pub fn new(config: ServerConfig, engine: WorkflowEngine) -> Self {
        Self {
            config,
            engine,
            generator: FrameworkGenerator::new(),
            tools: vec![server_info_tool()],
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Registers the tools of each enabled group and returns the total count.
    pub fn register_all(&mut self, enabled_groups: &[String], max_tools_warning: usize) -> usize {
        self.tools.retain(|t| t.group == GROUP_CORE);
        for group in enabled_groups {
            if !KNOWN_TOOL_GROUPS.contains(&group.as_str()) {
                warn!(group = %group, "Unknown tool group requested, skipping");
                continue;
            }
            if self.tools.iter().any(|t| t.group == *group) {
                continue;
            }
            let tools = group_tools(group);
            info!(group = %group, count = tools.len(), "Registered tool group");
            self.tools.extend(tools);
        }

        let count = self.tools.len();
        info!(count, "Total MCP tools registered");
        if count > max_tools_warning {
            warn!(
                count,
                limit = max_tools_warning,
                "Tool count exceeds recommended limit; agent performance may degrade. \
                 Narrow mcp.enabled_tool_groups in config.json"
            );
        }
        count
    }

    pub fn list(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn call(&mut self, name: &str, args: &JsonValue) -> ToolResult {
        let Some(tool) = self.tools.iter().find(|t| t.name == name) else {
            warn!(tool = name, "Call to unknown or disabled tool");
            return ToolResult::error(format!("Unknown tool: {}", name));
        };
        let empty = Map::new();
        let args = match args {
            JsonValue::Object(obj) => obj,
            JsonValue::Null => &empty,
            _ => return ToolResult::error("Tool arguments must be a JSON object".to_string()),
        };
        let missing: Vec<&str> = tool
            .required_args()
            .into_iter()
            .filter(|k| args.get(*k).is_none_or(JsonValue::is_null))
            .collect();
        if !missing.is_empty() {
            return ToolResult::error(format!("Missing required argument(s): {}", missing.join(", ")));
        }

        let outcome = match name {
            "search_standards" => self.search_standards(args),
            "start_workflow" => self.start_workflow(args),
            "get_current_phase" => arg_str(args, "session_id").and_then(|id| self.engine.get_current_phase(id)),
            "get_task" => self.get_task(args),
            "complete_phase" => self.complete_phase(args),
            "get_workflow_state" => arg_str(args, "session_id").and_then(|id| self.engine.get_workflow_state(id)),
            "create_workflow" => self.create_workflow(args),
            "validate_workflow" => self.validate_workflow(args),
            "current_date" => Ok(current_date_payload()),
            "get_server_info" => self.server_info(),
            _ => Err(error::PhasegateError::NotFound(format!("Unknown tool: {}", name))),
        };

        match outcome {
            Ok(payload) => ToolResult::ok(payload),
            Err(e) => {
                warn!(tool = name, error = %e, "Tool call failed");
                let mut result = ToolResult::error(e.to_string());
                if name == "complete_phase" {
                    result.payload["checkpoint_passed"] = json!(false);
                }
                result
            }
        }
    }

    fn search_standards(&self, args: &Map<String, JsonValue>) -> Result<JsonValue, error::PhasegateError> {
        let query = arg_str(args, "query")?;
        let n_results = args
            .get("n_results")
            .and_then(JsonValue::as_u64)
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_N_RESULTS);
        let filters = SearchFilters {
            phase: args
                .get("filter_phase")
                .and_then(JsonValue::as_u64)
                .and_then(|n| u32::try_from(n).ok()),
            workflow_type: args
                .get("workflow_type")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
        };
        let result = self.engine.rag().search(query, n_results, &filters)?;
        let results: Vec<JsonValue> = result
            .chunks
            .iter()
            .map(|c| {
                json!({
                    "content": c.chunk.content,
                    "file": c.chunk.file_path,
                    "section": c.chunk.section_header,
                    "relevance_score": c.relevance_score,
                    "tokens": c.chunk.tokens,
                })
            })
            .collect();
        info!(query, results = results.len(), "search_standards");
        Ok(json!({
            "results": results,
            "total_tokens": result.total_tokens,
            "retrieval_method": result.retrieval_method,
            "query_time_ms": result.query_time_ms,
        }))
    }

    fn start_workflow(&mut self, args: &Map<String, JsonValue>) -> Result<JsonValue, error::PhasegateError> {
        let workflow_type = arg_str(args, "workflow_type")?;
        let target_file = arg_str(args, "target_file")?;
        let options = arg_object(args, "options")?;
        self.engine.start_workflow(workflow_type, target_file, options)
    }

    fn get_task(&mut self, args: &Map<String, JsonValue>) -> Result<JsonValue, error::PhasegateError> {
        let session_id = arg_str(args, "session_id")?;
        let phase = arg_u32(args, "phase")?;
        let task_number = arg_u32(args, "task_number")?;
        self.engine.get_task(session_id, phase, task_number)
    }

    fn complete_phase(&mut self, args: &Map<String, JsonValue>) -> Result<JsonValue, error::PhasegateError> {
        let session_id = arg_str(args, "session_id")?;
        let phase = arg_u32(args, "phase")?;
        let evidence = arg_object(args, "evidence")?;
        self.engine.complete_phase(session_id, phase, &evidence)
    }

    fn create_workflow(&self, args: &Map<String, JsonValue>) -> Result<JsonValue, error::PhasegateError> {
        let name = arg_str(args, "name")?;
        let workflow_type = arg_str(args, "workflow_type")?;
        let phases: Vec<String> = args
            .get("phases")
            .and_then(JsonValue::as_array)
            .map(|a| a.iter().filter_map(JsonValue::as_str).map(str::to_string).collect())
            .ok_or_else(|| {
                error::PhasegateError::ValidationError("Argument 'phases' must be a list of strings".to_string())
            })?;
        let target_language = args
            .get("target_language")
            .and_then(JsonValue::as_str)
            .unwrap_or("python");
        let quick_start = args.get("quick_start").and_then(JsonValue::as_bool).unwrap_or(true);
        let output: PathBuf = match args.get("output_path").and_then(JsonValue::as_str) {
            Some(p) => PathBuf::from(p),
            None => self.config.resolved_paths().workflows_path.join(name),
        };

        let framework = self
            .generator
            .generate_framework(name, workflow_type, &phases, target_language, quick_start)?;
        framework.save(&output)?;
        let compliance = self.generator.validate_compliance(&framework);
        let file_list: Vec<&String> = framework.files.keys().collect();

        Ok(json!({
            "status": "success",
            "name": name,
            "workflow_type": workflow_type,
            "phases": phases.len(),
            "output_path": output.display().to_string(),
            "files_created": file_list.len(),
            "file_list": file_list,
            "compliance": compliance,
            "next_steps": [
                "Replace the placeholder commands in each task file",
                "Add phase-specific evidence lines to each phase.md checkpoint",
                format!("Run validate_workflow on {}", output.display()),
                format!("Start it with start_workflow(\"{}\", <target_file>)", name),
            ],
        }))
    }

    fn resolve_workflow_path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let under_workflows = self.config.resolved_paths().workflows_path.join(path);
        if under_workflows.exists() {
            under_workflows
        } else {
            self.config.base_path.join(path)
        }
    }

    fn validate_workflow(&self, args: &Map<String, JsonValue>) -> Result<JsonValue, error::PhasegateError> {
        let path = self.resolve_workflow_path(arg_str(args, "workflow_path")?);
        let report = validator::validate_workflow(&path);
        Ok(serde_json::to_value(report)?)
    }

    fn server_info(&self) -> Result<JsonValue, error::PhasegateError> {
        let stats = self.engine.state_manager().get_statistics()?;
        let paths = self.config.resolved_paths();
        let mut groups: Vec<&str> = self
            .tools
            .iter()
            .map(|t| t.group.as_str())
            .filter(|g| *g != GROUP_CORE)
            .collect();
        groups.dedup();
        Ok(json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "base_path": self.config.base_path.display().to_string(),
            "tool_groups": groups,
            "tools": self.tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "tool_count": self.tools.len(),
            "index": {
                "path": paths.index_path.display().to_string(),
                "chunks": self.engine.rag().chunk_count(),
                "generation": self.engine.rag().generation(),
                "retrieval_method": "lexical",
                "embedding_provider": self.config.rag.embedding_provider,
            },
            "sessions": stats,
        }))
    }
}
