//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;
use unspool_config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};

/// Extract finished downloads and clean up after import.
#[derive(Debug, Clone, Parser)]
#[command(name = "unspool", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}
