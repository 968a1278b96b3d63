//! CLI argument definitions using clap

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueHint};

/// Systematic-aware analysis scheduler: deduplicated, cost-ordered lazy action graphs
#[derive(Parser, Debug)]
#[command(name = "cutgraph")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Debug level: -d info, -dd debug, -ddd trace
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub debug: u8,

    /// Project directory for `.cutgraph.toml` (default: cwd)
    #[arg(short = 'C', long, global = true, value_hint = ValueHint::DirPath)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the selection tree
    Tree {
        /// Analysis file
        #[arg(value_hint = ValueHint::FilePath)]
        analysis: PathBuf,
    },

    /// Print the ordered actions and the schedule fingerprint
    Plan {
        /// Analysis file
        #[arg(value_hint = ValueHint::FilePath)]
        analysis: PathBuf,
    },

    /// Write the action graph as DOT
    Graph {
        /// Analysis file
        #[arg(value_hint = ValueHint::FilePath)]
        analysis: PathBuf,
        /// Output file (default: stdout)
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        output: Option<PathBuf>,
    },

    /// Execute the schedule and write all outputs
    Run {
        /// Analysis file
        #[arg(value_hint = ValueHint::FilePath)]
        analysis: PathBuf,
        /// Output directory (default: [output] directory)
        #[arg(short, long, value_hint = ValueHint::DirPath)]
        output: Option<PathBuf>,
        /// Only schedule regions whose name matches this regex
        #[arg(long)]
        only: Option<String>,
    },

    /// Manage settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completions
    Completion {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show merged config
    Show,

    /// Show config paths
    Path,

    /// Print a commented config template
    Template,
}
