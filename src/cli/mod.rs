//! CLI definitions.
//!
//! The CLI is a thin consumer of the engine: every handler goes through
//! [`backend::Backend`], which talks to a running daemon over RPC when one
//! is reachable and falls back to direct storage access when not.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod backend;
pub mod commands;

#[derive(Parser, Debug)]
#[command(name = "bd", version, about = "Git-native issue tracker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path override
    #[arg(long, global = true, env = "BEADS_DB")]
    pub db: Option<PathBuf>,

    /// Actor recorded in audit events
    #[arg(long, global = true)]
    pub actor: Option<String>,

    /// Structured JSON output
    #[arg(long, global = true)]
    pub json: bool,

    /// Never talk to (or start) a daemon
    #[arg(long, global = true)]
    pub no_daemon: bool,

    /// Skip the automatic JSONL flush after mutating commands
    #[arg(long, global = true)]
    pub no_auto_flush: bool,

    /// Skip the automatic import into an empty database
    #[arg(long, global = true)]
    pub no_auto_import: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Errors only
    #[arg(long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a .beads workspace in the current directory
    Init {
        /// Issue ID prefix (e.g. "proj" for proj-1, proj-2, …)
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Create an issue
    Create(CreateArgs),

    /// Update fields on an issue
    Update(UpdateArgs),

    /// Close one or more issues
    Close(CloseArgs),

    /// Show an issue in full
    Show {
        id: String,
        /// Include the audit event history
        #[arg(long)]
        events: bool,
    },

    /// List issues
    List(ListArgs),

    /// Manage dependencies
    Dep {
        #[command(subcommand)]
        command: DepCommands,
    },

    /// Manage labels
    Label {
        #[command(subcommand)]
        command: LabelCommands,
    },

    /// Read or write configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Import issues from a JSONL file
    Import(ImportArgs),

    /// Export all issues to JSONL
    Export(ExportArgs),

    /// Run one full sync cycle (export, pull, re-import)
    Sync,

    /// Run health scans over the store and JSONL
    Validate {
        /// Apply safe automatic fixes (orphaned dependencies)
        #[arg(long)]
        fix: bool,
    },

    /// Control the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Issue title
    pub title: String,

    #[arg(short = 'd', long)]
    pub description: Option<String>,

    /// Priority 0-4 (0=critical)
    #[arg(short = 'p', long, default_value = "2")]
    pub priority: String,

    /// Issue type: bug, feature, task, epic, chore
    #[arg(short = 't', long = "type", default_value = "task")]
    pub issue_type: String,

    #[arg(short = 'a', long)]
    pub assignee: Option<String>,

    /// Labels (repeatable)
    #[arg(short = 'l', long = "label")]
    pub labels: Vec<String>,

    /// Explicit ID; minted from the configured prefix when omitted
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct UpdateArgs {
    pub id: String,

    #[arg(long)]
    pub title: Option<String>,

    /// New description; an empty string clears the field
    #[arg(short = 'd', long)]
    pub description: Option<String>,

    #[arg(long)]
    pub design: Option<String>,

    #[arg(long)]
    pub notes: Option<String>,

    #[arg(long)]
    pub status: Option<String>,

    #[arg(short = 'p', long)]
    pub priority: Option<String>,

    #[arg(short = 't', long = "type")]
    pub issue_type: Option<String>,

    /// New assignee; an empty string clears the field
    #[arg(short = 'a', long)]
    pub assignee: Option<String>,
}

#[derive(Args, Debug)]
pub struct CloseArgs {
    /// Issue IDs to close
    #[arg(required = true)]
    pub ids: Vec<String>,

    #[arg(short = 'r', long)]
    pub reason: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// Filter by status (open, in_progress, blocked, closed)
    #[arg(short = 's', long)]
    pub status: Option<String>,

    #[arg(short = 'a', long)]
    pub assignee: Option<String>,

    /// Require these labels (repeatable)
    #[arg(short = 'l', long = "label")]
    pub labels: Vec<String>,

    /// Substring match over title, description and notes
    #[arg(short = 'q', long)]
    pub query: Option<String>,

    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum DepCommands {
    /// Add a dependency edge
    Add {
        issue_id: String,
        depends_on_id: String,
        /// blocks, parent-child, discovered-from, related
        #[arg(short = 't', long = "type", default_value = "blocks")]
        dep_type: String,
    },
    /// Remove a dependency edge
    Remove {
        issue_id: String,
        depends_on_id: String,
        #[arg(short = 't', long = "type", default_value = "blocks")]
        dep_type: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum LabelCommands {
    /// Add a label to an issue
    Add { id: String, label: String },
    /// Remove a label from an issue
    Remove { id: String, label: String },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print one config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// Print every config value
    List,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Input file; defaults to the workspace beads.jsonl
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Remap colliding IDs by content-hash scoring
    #[arg(long)]
    pub resolve_collisions: bool,

    /// Rewrite foreign-prefix IDs to the configured prefix
    #[arg(long)]
    pub rename_on_import: bool,

    /// Leave existing issues untouched
    #[arg(long)]
    pub skip_update: bool,

    /// Dependency problems abort instead of warning
    #[arg(long)]
    pub strict: bool,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Output file; defaults to the workspace beads.jsonl
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Skip the data-loss safety guards
    #[arg(long)]
    pub force: bool,
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Start a daemon in the background
    Start,
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
    /// Run the daemon loop in the foreground
    Run,
}
