//! CLI struct definitions for the Phasegate command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use crate::plugins::upgrade::UpgradeCli;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "phasegate",
    version = env!("CARGO_PKG_VERSION"),
    about = "Phasegate serves Agent OS standards and phase-gated workflows to AI coding agents over MCP. Agents get one phase at a time and advance only by submitting checkpoint evidence."
)]
pub(crate) struct Cli {
    /// Agent OS base directory (defaults to ./.agent-os, then ~/.agent-os).
    #[clap(long, global = true)]
    pub base: Option<PathBuf>,
    /// Debug-level logging on stderr.
    #[clap(long, short = 'v', global = true)]
    pub verbose: bool,
    /// Output format: 'text' or 'json'.
    #[clap(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Run the MCP server on stdin/stdout
    Serve,

    /// Build or query the document index
    Index(IndexCli),

    /// Call one MCP tool and print its JSON result
    Tool {
        /// Tool name, e.g. search_standards
        name: String,
        /// Tool arguments as a JSON object
        #[clap(default_value = "{}")]
        args: String,
    },

    /// List the tools the server would register
    Tools,

    /// Inspect configuration
    Config(ConfigCli),

    /// Inspect and maintain workflow sessions
    Session(SessionCli),

    /// Validate or scaffold workflow directories
    Workflow(WorkflowCli),

    /// Upgrade pre-flight and post-flight checks
    Upgrade(UpgradeCli),

    /// Print the current date in the formats workflows use
    Date,
}

#[derive(clap::Args, Debug)]
pub(crate) struct IndexCli {
    #[clap(subcommand)]
    pub command: IndexCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum IndexCommand {
    /// Build the index (incremental unless --force)
    Build {
        /// Discard the existing index and rebuild everything
        #[clap(long)]
        force: bool,
    },
    /// Search the index
    Search {
        query: String,
        #[clap(long, short = 'n', default_value_t = 5)]
        n_results: usize,
        /// Only chunks from this phase
        #[clap(long)]
        phase: Option<u32>,
        /// Only chunks from this workflow
        #[clap(long)]
        workflow_type: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct ConfigCli {
    #[clap(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ConfigCommand {
    /// Print the effective configuration and resolved paths
    Show,
    /// Validate configuration; exits non-zero on errors
    Validate,
}

#[derive(clap::Args, Debug)]
pub(crate) struct SessionCli {
    #[clap(subcommand)]
    pub command: SessionCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum SessionCommand {
    /// List sessions, most recently updated first
    List {
        #[clap(long)]
        workflow_type: Option<String>,
        /// Only sessions that are not complete
        #[clap(long)]
        active: bool,
    },
    /// Show one session with its validation result
    Show { session_id: String },
    /// Delete one session
    Delete { session_id: String },
    /// Remove sessions not updated within the retention window
    Cleanup,
    /// Session statistics
    Stats,
    /// Repair a session whose phase bookkeeping is inconsistent
    Recover { session_id: String },
}

#[derive(clap::Args, Debug)]
pub(crate) struct WorkflowCli {
    #[clap(subcommand)]
    pub command: WorkflowCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum WorkflowCommand {
    /// Check a workflow directory against the construction rules
    Validate { path: PathBuf },
    /// Scaffold a new workflow framework
    Create {
        name: String,
        #[clap(long)]
        workflow_type: String,
        /// Comma-separated phase names
        #[clap(long, value_delimiter = ',', required = true)]
        phases: Vec<String>,
        #[clap(long, default_value = "python")]
        target_language: String,
        /// Three tasks per phase instead of one
        #[clap(long)]
        full: bool,
        /// Output directory (defaults to <workflows>/<name>)
        #[clap(long)]
        output: Option<PathBuf>,
    },
}
