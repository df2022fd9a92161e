use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "llmstack",
    version,
    about = "Bring up a local model runtime, API gateway and UI, and tear them down cleanly"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Use a specific config file
    #[arg(short = 'f', long = "file", global = true)]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start every service in order and keep them running until Ctrl+C
    Up,
    /// Run the dependency checks only
    Check,
    /// Show configured ports and what currently holds them
    Ports,
    /// Free ports held by leftover processes
    Reclaim {
        /// Ports to free
        #[arg(required = true)]
        ports: Vec<u16>,
        /// Also stop processes llmstack did not start
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration file
    Validate,
    /// Generate a starter llmstack.toml
    Init,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}
