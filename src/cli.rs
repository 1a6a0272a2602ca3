//! Command-line interface for routelab
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// routelab - emulated IP network lab
#[derive(Parser)]
#[command(name = "routelab")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Lab manifest path
    #[arg(short, long, default_value = "routelab.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Build the lab, configure routers, run probes, tear down
    Run {
        /// Use the in-memory emulator instead of network namespaces
        #[arg(long)]
        simulate: bool,

        /// Result file (overrides the manifest)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print probe results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the manifest and show the plan
    Check,

    /// Write an example lab manifest
    Init {
        /// Output file path
        #[arg(short, long, default_value = "routelab.toml")]
        file: PathBuf,

        /// Overwrite existing file
        #[arg(short = 'y', long)]
        force: bool,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "routelab", &mut std::io::stdout());
    }
}
