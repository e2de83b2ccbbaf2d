//! Server wiring and the stdio message loop.

use crate::core::config::ServerConfig;
use crate::core::engine::WorkflowEngine;
use crate::core::error;
use crate::core::index::IndexBuilder;
use crate::core::rag::RagEngine;
use crate::core::rpc;
use crate::core::state::StateManager;
use crate::core::tools::ToolRegistry;
use crate::plugins::watcher::{ContentWatcher, RebuildScheduler};
use std::fs;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ServerFactory {
    config: ServerConfig,
    watchers: Vec<ContentWatcher>,
}

impl ServerFactory {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            watchers: Vec::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn index_builder(&self) -> IndexBuilder {
        let paths = self.config.resolved_paths();
        IndexBuilder::new(
            &paths.index_path,
            self.config.content_roots(),
        )
    }

    fn ensure_directories(&self) -> Result<(), error::PhasegateError> {
        let paths = self.config.resolved_paths();
        if let Some(cache_dir) = paths.index_path.parent() {
            if !cache_dir.exists() {
                fs::create_dir_all(cache_dir).map_err(error::PhasegateError::IoError)?;
                info!(dir = %cache_dir.display(), "Created cache directory");
            }
        }
        Ok(())
    }

    fn ensure_index(&self) -> Result<(), error::PhasegateError> {
        let builder = self.index_builder();
        if builder.index_exists() {
            info!(index = %builder.index_path().display(), "RAG index found");
            return Ok(());
        }
        info!("RAG index not found, building");
        let report = builder.build_index(true, false)?;
        if report.status == "success" {
            info!(chunks = report.chunks_indexed, "RAG index built");
        } else {
            warn!(message = %report.message, "Index build incomplete");
        }
        Ok(())
    }

    /// Builds every component and registers the enabled tool groups.
    pub fn create_server(&mut self) -> Result<ToolRegistry, error::PhasegateError> {
        info!("Creating MCP server");
        self.ensure_directories()?;
        self.ensure_index()?;

        let paths = self.config.resolved_paths();
        let rag = Arc::new(RagEngine::open(&paths.index_path)?);
        let state_manager = StateManager::new(&paths.state_dir, self.config.server.session_cleanup_days)?
            .with_workflows_path(&paths.workflows_path);
        match state_manager.cleanup_old_sessions() {
            Ok(removed) => info!(removed, "Startup session cleanup"),
            Err(e) => warn!(error = %e, "Startup session cleanup failed"),
        }
        let engine = WorkflowEngine::new(state_manager, Arc::clone(&rag), &paths.workflows_path);

        if self.config.server.watch {
            self.start_watchers(Arc::clone(&rag))?;
        } else {
            debug!("File watching disabled");
        }

        let mut tools = ToolRegistry::new(self.config.clone(), engine);
        let count = tools.register_all(
            &self.config.mcp.enabled_tool_groups,
            self.config.mcp.max_tools_warning,
        );
        info!(tools = count, "MCP server created");
        Ok(tools)
    }

    fn start_watchers(&mut self, rag: Arc<RagEngine>) -> Result<(), error::PhasegateError> {
        let scheduler = Arc::new(RebuildScheduler::new(
            self.index_builder(),
            rag,
            Duration::from_secs(self.config.server.debounce_seconds),
        ));
        let roots: Vec<_> = self
            .config
            .content_roots()
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        self.watchers.push(ContentWatcher::start(&roots, scheduler)?);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down server factory");
        for watcher in self.watchers.drain(..) {
            watcher.stop();
        }
    }
}

/// Reads JSON-RPC lines until EOF, writing one response line per request.
pub fn serve<R: BufRead, W: Write>(
    reader: R,
    mut writer: W,
    tools: &mut ToolRegistry,
) -> Result<(), error::PhasegateError> {
    info!("Serving MCP over stdio");
    for line in reader.lines() {
        let line = line.map_err(error::PhasegateError::IoError)?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some(response) = rpc::handle_line(trimmed, tools) else {
            continue;
        };
        let body = serde_json::to_string(&response)?;
        writer
            .write_all(body.as_bytes())
            .map_err(error::PhasegateError::IoError)?;
        writer
            .write_all(b"\n")
            .map_err(error::PhasegateError::IoError)?;
        writer.flush().map_err(error::PhasegateError::IoError)?;
    }
    info!("Input closed, stopping server");
    Ok(())
}
