use std::path::PathBuf;

use clap::Args;

use dat_share::process::ServiceError;
use dat_share::service_config::load_or_create_node_key;
use dat_share::{spawn_service, ConfigFile, Overrides, ServiceConfig, ServiceConfigError};

#[derive(Args, Debug, Clone)]
pub struct Daemon {
    /// Root directory containing the directories to be shared
    #[arg(short = 'r', long, env = "SWARM_ROOT")]
    pub root_dir: Option<PathBuf>,

    /// Port the swarm binds to [default: 3282]
    #[arg(short = 's', long, env = "SWARM_PORT")]
    pub swarm_port: Option<u16>,

    /// Directory for log files (logs to stdout only if not set)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Default log level, overridden by RUST_LOG [default: info]
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directories to share, relative to the root directory
    pub dirs: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(#[from] ServiceConfigError),

    #[error("daemon failed: {0}")]
    Service(#[from] ServiceError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Daemon {
    type Error = DaemonError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config_path = ConfigFile::locate(ctx.config_path.clone())?;

        let overrides = Overrides {
            root_dir: self.root_dir.clone(),
            swarm_port: self.swarm_port,
            log_dir: self.log_dir.clone(),
            log_level: self.log_level.clone(),
            dirs: self.dirs.clone(),
        };
        let mut config = ServiceConfig::resolve(overrides, config_path)?;

        // keep the node identity stable across restarts when we have a home
        config.node_secret = match ConfigFile::state_dir() {
            Ok(dir) => Some(load_or_create_node_key(&dir)?),
            Err(ServiceConfigError::NoHomeDirectory) => None,
            Err(e) => return Err(e.into()),
        };

        spawn_service(&config).await?;
        Ok("daemon ended".to_string())
    }
}
