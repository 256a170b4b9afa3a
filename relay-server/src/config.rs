//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RELAY_CONFIG or --config)
//! 3. Environment variables

use crate::tables;
use relay_protocol::DEFAULT_PORT;
use relay_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Store configuration.
    pub store: StoreSection,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from an optional file, then applies environment
    /// variable overrides. Without a path, `RELAY_CONFIG` is consulted.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("RELAY_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.store.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let problem = if self.network.outbound_capacity == 0 {
            Some("network.outbound_capacity must be at least 1")
        } else if self.store.database.is_empty() {
            Some("store.database must not be empty")
        } else if self.metrics.enabled && self.metrics.bind_addr == self.network.bind_addr {
            Some("metrics.bind_addr must differ from network.bind_addr")
        } else {
            None
        };
        match problem {
            Some(problem) => Err(ConfigError::Invalid(problem.to_string())),
            None => Ok(()),
        }
    }
}

/// Reads and parses an environment variable. Unset or unparsable values
/// leave the configured value alone.
fn env_value<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to accept WebSocket connections on.
    pub bind_addr: SocketAddr,
    /// Connections beyond this are refused before upgrade.
    pub max_connections: usize,
    /// Per-connection outbound queue capacity, in envelopes.
    pub outbound_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 1000,
            outbound_capacity: 256,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_value("RELAY_BIND") {
            self.bind_addr = addr;
        }
        if let Some(max) = env_value("RELAY_MAX_CONNECTIONS") {
            self.max_connections = max;
        }
    }
}

/// Where the document store lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Database name; also the snapshot file stem.
    pub database: String,
    /// Snapshot directory. Memory only when unset.
    pub data_dir: Option<PathBuf>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            database: "relay".to_string(),
            data_dir: None,
        }
    }
}

impl StoreSection {
    fn apply_env_overrides(&mut self) {
        if let Some(name) = env_value::<String>("RELAY_DATABASE").filter(|n| !n.is_empty()) {
            self.database = name;
        }
        // An empty RELAY_DATA_DIR switches persistence off
        if let Some(dir) = env_value::<String>("RELAY_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir)).filter(|d| !d.as_os_str().is_empty());
        }
    }

    /// Builds the store configuration with the relay's tables.
    pub fn store_config(&self) -> StoreConfig {
        let config = StoreConfig::new(&self.database)
            .with_tables(tables::ALL.iter().copied())
            .with_ephemeral_tables(tables::EPHEMERAL.iter().copied());
        match &self.data_dir {
            Some(dir) => config.with_data_dir(dir),
            None => config,
        }
    }
}

/// Prometheus endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(flag) = env_value::<String>("RELAY_METRICS_ENABLED") {
            self.enabled = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(addr) = env_value("RELAY_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Read { path: PathBuf, source: std::io::Error },
    /// The config file is not valid YAML for `Config`.
    Parse { path: PathBuf, message: String },
    /// Values parsed but do not fit together.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "cannot read config '{}': {}", path.display(), source)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "invalid config '{}': {}", path.display(), message)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}
