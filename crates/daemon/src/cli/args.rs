pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dat-share")]
#[command(about = "Share directories as versioned archives over a peer swarm")]
#[command(version)]
pub struct Args {
    /// Path to the config file (defaults to ~/.dat-share/config.toml when present)
    #[arg(long = "config", global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
