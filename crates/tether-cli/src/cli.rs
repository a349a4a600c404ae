use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tether_core::{EntityType, Resolution};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Work offline and sync business entities with a remote API")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to engine config (JSON)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an entity locally and queue it for upload
    #[command(alias = "new")]
    Add {
        #[arg(value_enum)]
        kind: EntityKind,
        /// Field assignments, e.g. title="Ship it" priority=2
        fields: Vec<String>,
        /// Print the created record as JSON
        #[arg(long)]
        json: bool,
    },
    /// List local entities of one type
    List {
        #[arg(value_enum)]
        kind: EntityKind,
        /// Number of entities to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one entity
    Show {
        #[arg(value_enum)]
        kind: EntityKind,
        id: String,
    },
    /// Patch an entity locally and queue the change
    Update {
        #[arg(value_enum)]
        kind: EntityKind,
        id: String,
        /// Field assignments, e.g. status=done
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Delete an entity locally and queue the delete
    Delete {
        #[arg(value_enum)]
        kind: EntityKind,
        id: String,
    },
    /// Run a sync cycle against the configured remote
    Sync {
        /// Keep syncing on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
        /// Park conflicts for `tether resolve` instead of letting the remote win
        #[arg(long)]
        review: bool,
        /// Output the cycle result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show queue, conflict and watermark status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List logged conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve an open conflict by hand
    Resolve {
        /// Conflict id
        change_id: String,
        #[arg(value_enum)]
        resolution: ResolutionArg,
    },
    /// Dead-lettered uploads
    DeadLetters {
        #[command(subcommand)]
        command: Option<DeadLetterCommands>,
        /// Number of dead letters to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum DeadLetterCommands {
    /// Put a dead letter back on the upload queue
    Requeue { id: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum EntityKind {
    Task,
    Project,
    User,
    Workspace,
}

impl From<EntityKind> for EntityType {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Task => Self::Task,
            EntityKind::Project => Self::Project,
            EntityKind::User => Self::User,
            EntityKind::Workspace => Self::Workspace,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolutionArg {
    Local,
    Remote,
    Merge,
}

impl From<ResolutionArg> for Resolution {
    fn from(arg: ResolutionArg) -> Self {
        match arg {
            ResolutionArg::Local => Self::LocalWins,
            ResolutionArg::Remote => Self::RemoteWins,
            ResolutionArg::Merge => Self::Merge,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
