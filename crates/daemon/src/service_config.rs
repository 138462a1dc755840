use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use iroh::SecretKey;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "dat-share";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const NODE_KEY_FILE_NAME: &str = "node.key";
pub const DEFAULT_SWARM_PORT: u16 = 3282;

#[derive(Debug, thiserror::Error)]
pub enum ServiceConfigError {
    #[error("The root_dir argument was not supplied and is required")]
    MissingRoot,
    #[error("The directory specified by the root_dir argument ({0}) does not exist")]
    RootNotFound(PathBuf),
    #[error("The value for the root_dir argument ({0}) is not a directory")]
    RootNotDirectory(PathBuf),
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),
    #[error("no home directory found")]
    NoHomeDirectory,
    #[error("invalid node key: {0}")]
    InvalidNodeKey(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Settings read from `config.toml`.
///
/// Every field is optional; command line flags and environment variables
/// take precedence over what is set here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// directory every shared directory lives under
    pub root_dir: Option<PathBuf>,
    /// port the swarm listens on
    pub swarm_port: Option<u16>,
    /// directories to share, relative to the root or absolute under it
    pub dirs: Vec<String>,
    /// directory for log files
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl ConfigFile {
    /// The dat-share state directory, `~/.dat-share`
    pub fn state_dir() -> Result<PathBuf, ServiceConfigError> {
        let home = dirs::home_dir().ok_or(ServiceConfigError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    pub fn default_path() -> Result<PathBuf, ServiceConfigError> {
        Ok(Self::state_dir()?.join(CONFIG_FILE_NAME))
    }

    pub fn load(path: &Path) -> Result<Self, ServiceConfigError> {
        let config_toml = fs::read_to_string(path)?;
        Ok(toml::from_str(&config_toml)?)
    }

    /// Pick the config file to use.
    ///
    /// An explicit path must exist. Without one the default location is
    /// used only when a file is present there.
    pub fn locate(explicit: Option<PathBuf>) -> Result<Option<PathBuf>, ServiceConfigError> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(ServiceConfigError::ConfigNotFound(path));
            }
            return Ok(Some(path));
        }
        let default = match Self::default_path() {
            Ok(path) => path,
            Err(ServiceConfigError::NoHomeDirectory) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(default.is_file().then_some(default))
    }
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub root_dir: Option<PathBuf>,
    pub swarm_port: Option<u16>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub dirs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    // swarm configuration
    /// root directory shared directories are resolved against
    pub root_dir: PathBuf,
    /// port the swarm listens on
    pub swarm_port: u16,
    /// identity of the swarm node,
    ///  if not set then a new one will be generated
    pub node_secret: Option<SecretKey>,

    /// directories to share at startup
    pub dirs: Vec<String>,
    /// config file the settings came from, re-read on reload
    pub config_path: Option<PathBuf>,

    // logging
    pub log_level: tracing::Level,
    /// Directory for log files (optional, logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Merge command line values over the config file at `config_path`.
    pub fn resolve(
        overrides: Overrides,
        config_path: Option<PathBuf>,
    ) -> Result<Self, ServiceConfigError> {
        let file = match &config_path {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        Self::merge(overrides, file, config_path)
    }

    pub fn merge(
        overrides: Overrides,
        file: ConfigFile,
        config_path: Option<PathBuf>,
    ) -> Result<Self, ServiceConfigError> {
        let root_dir = overrides
            .root_dir
            .or(file.root_dir)
            .ok_or(ServiceConfigError::MissingRoot)?;
        validate_root(&root_dir)?;

        let log_level = match overrides.log_level.or(file.log_level) {
            Some(level) => tracing::Level::from_str(&level)
                .map_err(|_| ServiceConfigError::InvalidLogLevel(level))?,
            None => tracing::Level::INFO,
        };

        let dirs = if overrides.dirs.is_empty() {
            file.dirs
        } else {
            overrides.dirs
        };

        Ok(Self {
            root_dir,
            swarm_port: overrides
                .swarm_port
                .or(file.swarm_port)
                .unwrap_or(DEFAULT_SWARM_PORT),
            node_secret: None,
            dirs,
            config_path,
            log_level,
            log_dir: overrides.log_dir.or(file.log_dir),
        })
    }

    /// Directories to share after a reload.
    ///
    /// Re-reads the config file when there is one, otherwise keeps the
    /// startup list.
    pub fn reload_dirs(&self) -> Result<Vec<String>, ServiceConfigError> {
        match &self.config_path {
            Some(path) => Ok(ConfigFile::load(path)?.dirs),
            None => Ok(self.dirs.clone()),
        }
    }
}

/// The root must be supplied, exist and be a directory.
pub fn validate_root(root: &Path) -> Result<(), ServiceConfigError> {
    if root.as_os_str().is_empty() {
        return Err(ServiceConfigError::MissingRoot);
    }
    match fs::metadata(root) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(ServiceConfigError::RootNotDirectory(root.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ServiceConfigError::RootNotFound(root.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Load the node identity from `dir`, generating and saving one if missing.
pub fn load_or_create_node_key(dir: &Path) -> Result<SecretKey, ServiceConfigError> {
    let key_path = dir.join(NODE_KEY_FILE_NAME);
    if key_path.exists() {
        let hex = fs::read_to_string(&key_path)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex.trim(), &mut bytes)
            .map_err(|e| ServiceConfigError::InvalidNodeKey(e.to_string()))?;
        return Ok(SecretKey::from_bytes(&bytes));
    }

    fs::create_dir_all(dir)?;
    let bytes: [u8; 32] = rand::random();
    fs::write(&key_path, hex::encode(bytes))?;
    Ok(SecretKey::from_bytes(&bytes))
}
