//! Phasegate: phase-gated workflows for AI coding agents
//!
//! **Phasegate is a local MCP server that hands agents one workflow phase at a
//! time and advances only on evidence.**
//!
//! Agents talk to it over JSON-RPC on stdio. It answers from a local index of
//! the Agent OS content directory (`.agent-os/`), so an agent pulls the few
//! chunks it needs instead of whole documents.
//!
//! # Core Principles
//!
//! - **Local-first**: Index, sessions and config live under `.agent-os/`
//! - **Phase-gated**: Requests for future phases return the current phase instead
//! - **Evidence-driven**: Checkpoints are mined from the workflow documents themselves
//! - **Resumable**: Sessions persist as JSON and resume across restarts
//!
//! # Architecture
//!
//! ## Content
//!
//! - `standards/`, `usage/`, `workflows/`: markdown sources
//! - `.cache/index/chunks.db`: SQLite chunk index, rebuilt incrementally
//! - `.cache/state/<session>.json`: one file per workflow session
//!
//! ## Workflows
//!
//! - `workflows/<type>/metadata.json`: phase overview
//! - `workflows/<type>/phases/<n>/phase.md` and `task-<k>-<slug>.md`: phase content
//! - Dynamic workflows render phases parsed from a spec's `tasks.md`
//!
//! ## Subsystems (Plugins)
//!
//! - `watcher`: Debounced hot reindex on content changes
//! - `upgrade`: Upgrade pre-flight and post-flight checks
//!
//! # Examples
//!
//! ```bash
//! # Serve MCP on stdio (what the editor launches)
//! phasegate serve
//!
//! # Rebuild the index and try a query
//! phasegate index build
//! phasegate index search "testing standards"
//!
//! # Call a tool directly
//! phasegate tool start_workflow '{"workflow_type":"test_generation_v3","target_file":"src/app.py"}'
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: Index, retrieval, sessions, workflow engine and MCP surface
//! - [`plugins`]: File watching and upgrade checks

mod cli;
pub mod core;
pub mod plugins;

use cli::{
    Cli, Command, ConfigCommand, IndexCommand, OutputFormat, SessionCommand, WorkflowCommand,
};
use crate::core::{
    config::{self, ServerConfig},
    error,
    generator::FrameworkGenerator,
    rag::{RagEngine, SearchFilters},
    server::{self, ServerFactory},
    state::StateManager,
    time, tools, validator,
};
use crate::plugins::upgrade;

use clap::Parser;
use colored::Colorize;
use serde_json::{Value as JsonValue, json};
use std::io;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Logs go to stderr; stdout carries the protocol.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "phasegate=debug" } else { "phasegate=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .without_time(),
        )
        .with(filter)
        .try_init();
}

fn load_server_config(base: Option<&std::path::Path>) -> Result<ServerConfig, error::PhasegateError> {
    let base_path = config::discover_base_path(base)?;
    config::load_config(&base_path)
}

fn state_manager(config: &ServerConfig) -> Result<StateManager, error::PhasegateError> {
    let paths = config.resolved_paths();
    Ok(
        StateManager::new(&paths.state_dir, config.server.session_cleanup_days)?
            .with_workflows_path(&paths.workflows_path),
    )
}

/// Prints a command result as an envelope (json) or as colored key/value text.
fn emit(format: OutputFormat, cmd: &str, ok: bool, payload: JsonValue) -> Result<(), error::PhasegateError> {
    let status = if ok { "ok" } else { "error" };
    match format {
        OutputFormat::Json => {
            let envelope = time::command_envelope(cmd, status, json!({ "result": payload }));
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        OutputFormat::Text => {
            let headline = if ok {
                format!("✓ {}", cmd).green().bold()
            } else {
                format!("✗ {}", cmd).red().bold()
            };
            println!("{}", headline);
            match &payload {
                JsonValue::Object(map) => {
                    for (key, value) in map {
                        match value {
                            JsonValue::Object(_) | JsonValue::Array(_) => {
                                println!("  {}:", key.cyan());
                                for line in serde_json::to_string_pretty(value)?.lines() {
                                    println!("    {}", line);
                                }
                            }
                            JsonValue::String(s) => println!("  {}: {}", key.cyan(), s),
                            other => println!("  {}: {}", key.cyan(), other),
                        }
                    }
                }
                other => println!("{}", serde_json::to_string_pretty(other)?),
            }
        }
    }
    Ok(())
}

fn fail(cmd: &str, message: String) -> error::PhasegateError {
    error::PhasegateError::ValidationError(format!("{} failed: {}", cmd, message))
}

pub fn run() -> Result<(), error::PhasegateError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let format = cli.format;
    let base = cli.base.as_deref();

    match cli.command {
        Command::Serve => {
            let config = load_server_config(base)?;
            let errors = config::validate_config(&config);
            if !errors.is_empty() {
                for e in &errors {
                    tracing::error!("{}", e);
                }
                return Err(error::PhasegateError::ConfigError(format!(
                    "Configuration validation failed: {}",
                    errors.join("; ")
                )));
            }
            let mut factory = ServerFactory::new(config);
            let mut registry = factory.create_server()?;
            let outcome = server::serve(io::stdin().lock(), io::stdout().lock(), &mut registry);
            factory.shutdown();
            outcome?;
        }
        Command::Index(index_cli) => {
            let config = load_server_config(base)?;
            let factory = ServerFactory::new(config);
            match index_cli.command {
                IndexCommand::Build { force } => {
                    let report = factory.index_builder().build_index(force, !force)?;
                    let ok = report.status == "success";
                    emit(format, "index.build", ok, serde_json::to_value(report)?)?;
                }
                IndexCommand::Search {
                    query,
                    n_results,
                    phase,
                    workflow_type,
                } => {
                    let builder = factory.index_builder();
                    if !builder.index_exists() {
                        return Err(error::PhasegateError::NotFound(
                            "Index not built; run `phasegate index build` first".to_string(),
                        ));
                    }
                    let rag = RagEngine::open(builder.index_path())?;
                    let filters = SearchFilters {
                        phase,
                        workflow_type,
                    };
                    let result = rag.search(&query, n_results.max(1), &filters)?;
                    emit(format, "index.search", true, serde_json::to_value(result)?)?;
                }
            }
        }
        Command::Tool { name, args } => {
            let args: JsonValue = serde_json::from_str(&args)
                .map_err(|e| error::PhasegateError::ValidationError(format!("Invalid JSON arguments: {}", e)))?;
            let mut config = load_server_config(base)?;
            config.server.watch = false;
            let mut factory = ServerFactory::new(config);
            let mut registry = factory.create_server()?;
            let result = registry.call(&name, &args);
            factory.shutdown();
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result.payload)?),
                OutputFormat::Text => emit(format, &name, !result.is_error, result.payload)?,
            }
            if result.is_error {
                return Err(fail(&name, "tool reported an error".to_string()));
            }
        }
        Command::Tools => {
            let mut config = load_server_config(base)?;
            config.server.watch = false;
            let mut factory = ServerFactory::new(config);
            let registry = factory.create_server()?;
            factory.shutdown();
            match format {
                OutputFormat::Json => {
                    let envelope = time::command_envelope("tools", "ok", json!({ "tools": registry.list() }));
                    println!("{}", serde_json::to_string_pretty(&envelope)?);
                }
                OutputFormat::Text => {
                    for tool in registry.list() {
                        println!("{} {}", tool.name.bold(), format!("[{}]", tool.group).dimmed());
                        println!("    {}", tool.description);
                    }
                }
            }
        }
        Command::Config(config_cli) => {
            let config = load_server_config(base)?;
            match config_cli.command {
                ConfigCommand::Show => {
                    let paths = config.resolved_paths();
                    let payload = json!({
                        "config": config,
                        "resolved_paths": {
                            "standards_path": paths.standards_path.display().to_string(),
                            "usage_path": paths.usage_path.display().to_string(),
                            "workflows_path": paths.workflows_path.display().to_string(),
                            "index_path": paths.index_path.display().to_string(),
                            "state_dir": paths.state_dir.display().to_string(),
                        },
                    });
                    emit(format, "config.show", true, payload)?;
                }
                ConfigCommand::Validate => {
                    let errors = config::validate_config(&config);
                    let ok = errors.is_empty();
                    emit(format, "config.validate", ok, json!({ "valid": ok, "errors": errors }))?;
                    if !ok {
                        return Err(fail("config.validate", format!("{} problem(s)", errors.len())));
                    }
                }
            }
        }
        Command::Session(session_cli) => {
            let config = load_server_config(base)?;
            let manager = state_manager(&config)?;
            match session_cli.command {
                SessionCommand::List {
                    workflow_type,
                    active,
                } => {
                    let sessions = manager.list_sessions(workflow_type.as_deref(), active)?;
                    let rows: Vec<JsonValue> = sessions
                        .iter()
                        .map(|s| {
                            json!({
                                "session_id": s.session_id,
                                "workflow_type": s.workflow_type,
                                "target_file": s.target_file,
                                "current_phase": s.current_phase,
                                "is_complete": s.is_complete(),
                                "updated_at": s.updated_at.to_rfc3339(),
                            })
                        })
                        .collect();
                    emit(format, "session.list", true, json!({ "count": rows.len(), "sessions": rows }))?;
                }
                SessionCommand::Show { session_id } => {
                    let state = manager.load_state(&session_id)?.ok_or_else(|| {
                        error::PhasegateError::NotFound(format!("Session {} not found", session_id))
                    })?;
                    let (valid, issues) = manager.validate_state(&state);
                    let mut payload = serde_json::to_value(&state)?;
                    payload["valid"] = json!(valid);
                    payload["issues"] = json!(issues);
                    emit(format, "session.show", valid, payload)?;
                }
                SessionCommand::Delete { session_id } => {
                    let deleted = manager.delete_session(&session_id)?;
                    emit(format, "session.delete", deleted, json!({ "session_id": session_id, "deleted": deleted }))?;
                }
                SessionCommand::Cleanup => {
                    let removed = manager.cleanup_old_sessions()?;
                    emit(format, "session.cleanup", true, json!({ "removed": removed }))?;
                }
                SessionCommand::Stats => {
                    let stats = manager.get_statistics()?;
                    emit(format, "session.stats", true, serde_json::to_value(stats)?)?;
                }
                SessionCommand::Recover { session_id } => {
                    let recovered = manager.recover_corrupted_state(&session_id)?;
                    emit(
                        format,
                        "session.recover",
                        recovered,
                        json!({ "session_id": session_id, "recovered": recovered }),
                    )?;
                }
            }
        }
        Command::Workflow(workflow_cli) => match workflow_cli.command {
            WorkflowCommand::Validate { path } => {
                let report = validator::validate_workflow(&path);
                let ok = report.compliant;
                emit(format, "workflow.validate", ok, serde_json::to_value(report)?)?;
            }
            WorkflowCommand::Create {
                name,
                workflow_type,
                phases,
                target_language,
                full,
                output,
            } => {
                let output = match output {
                    Some(o) => o,
                    None => load_server_config(base)?
                        .resolved_paths()
                        .workflows_path
                        .join(&name),
                };
                let generator = FrameworkGenerator::new();
                let framework =
                    generator.generate_framework(&name, &workflow_type, &phases, &target_language, !full)?;
                framework.save(&output)?;
                let compliance = generator.validate_compliance(&framework);
                emit(
                    format,
                    "workflow.create",
                    true,
                    json!({
                        "name": name,
                        "output_path": output.display().to_string(),
                        "files_created": framework.files.len(),
                        "compliance": compliance,
                    }),
                )?;
            }
        },
        Command::Upgrade(upgrade_cli) => {
            // Upgrades may target a directory that does not exist yet.
            let base_path = match config::discover_base_path(base) {
                Ok(found) => found,
                Err(_) => std::env::current_dir()
                    .map_err(error::PhasegateError::IoError)?
                    .join(config::BASE_DIR_NAME),
            };
            let state_dir = match config::load_config(&base_path) {
                Ok(cfg) => cfg.resolved_paths().state_dir,
                Err(_) => ServerConfig::with_defaults(&base_path).resolved_paths().state_dir,
            };
            let (cmd, ok, payload) = upgrade::run_upgrade_cli(&base_path, &state_dir, upgrade_cli)?;
            emit(format, cmd, ok, payload)?;
            if !ok {
                return Err(fail(cmd, "check did not pass".to_string()));
            }
        }
        Command::Date => {
            emit(format, "date", true, tools::current_date_payload())?;
        }
    }
    Ok(())
}
