use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pantry")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Distribute cookbooks and converge nodes against them", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Client configuration file (default: ~/.config/pantry/client.toml)
    #[arg(short, long, global = true, env = "PANTRY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the client once: sync cookbooks and converge this node
    Run(RunArgs),

    /// Print the manifest of a cookbook directory as JSON
    Manifest {
        /// Cookbook directory
        dir: PathBuf,

        /// Override the version from metadata.json
        #[arg(long = "cookbook-version", value_name = "VERSION")]
        version: Option<String>,
    },

    /// Print the cookbooks a run list needs
    Deps {
        /// Directory holding one sub-directory per cookbook
        repo: PathBuf,

        /// Run-list items: recipe[x], x::y or bare cookbook names
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Publish cookbooks to a depot
    Upload {
        #[command(flatten)]
        depot: DepotArgs,

        /// Cookbook directories
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
    },

    /// Inspect and edit node records
    Node {
        #[command(flatten)]
        depot: DepotArgs,

        #[command(subcommand)]
        command: NodeCommand,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Run
// ============================================================================

#[derive(Args)]
pub struct RunArgs {
    /// Converge from local cookbook paths without a depot
    #[arg(long)]
    pub solo: bool,

    #[command(flatten)]
    pub depot: DepotArgs,

    /// Node name (default: from config, then fqdn, then hostname)
    #[arg(short = 'N', long)]
    pub node_name: Option<String>,

    /// JSON attributes applied to the node
    #[arg(short = 'j', long)]
    pub json_attribs: Option<PathBuf>,

    /// Cookbook directory for solo runs (repeatable)
    #[arg(long = "cookbook-path")]
    pub cookbook_path: Vec<PathBuf>,

    /// Parallel file downloads during cache sync
    #[arg(long)]
    pub jobs: Option<usize>,
}

/// Where the depot lives.
#[derive(Args, Clone, Default)]
pub struct DepotArgs {
    /// Local depot directory
    #[arg(long)]
    pub repo: Option<PathBuf>,

    /// Depot base URL
    #[arg(long, conflicts_with = "repo")]
    pub server: Option<String>,
}

// ============================================================================
// Node Commands
// ============================================================================

#[derive(Subcommand)]
pub enum NodeCommand {
    /// List every node
    List,

    /// Show a node record as JSON
    Show {
        name: String,
    },

    /// Show or replace a node's run list
    RunList {
        name: String,

        /// New run list; prints the current one when omitted
        #[arg(long, num_args = 1..)]
        set: Option<Vec<String>>,
    },
}
