//! Node configuration: identity, home directory layout, socket pool
//! sizing, and logging. Loaded from `<home>/config.toml` with environment
//! overrides.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

pub const ENV_NODE_ID: &str = "RINGKV_NODE_ID";
pub const ENV_HOME: &str = "RINGKV_HOME";
pub const ENV_ADMIN_PORT: &str = "RINGKV_ADMIN_PORT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id in cluster.xml.
    pub node_id: u16,
    /// Root of the persisted state layout (`metadata/` and `data/`).
    pub home: PathBuf,
    /// Bind host for the admin listener.
    pub admin_host: String,
    /// Bind port for the admin listener; 0 picks an ephemeral port.
    pub admin_port: u16,
    /// Capacity bound for the cache storage engine, in entries.
    pub cache_capacity: usize,
    pub socket_pool: SocketPoolConfig,
    pub logging: LoggingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: 0,
            home: PathBuf::from("."),
            admin_host: "127.0.0.1".into(),
            admin_port: 0,
            cache_capacity: 16 * 1024,
            socket_pool: SocketPoolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads `<home>/config.toml`, falling back to defaults when absent.
    /// `RINGKV_HOME` relocates the home directory (and with it the config
    /// file lookup); `RINGKV_NODE_ID` and `RINGKV_ADMIN_PORT` override
    /// their fields after the file is read.
    pub fn load(home: &Path) -> Result<NodeConfig> {
        let home = resolve_home(home, std::env::var_os(ENV_HOME));
        let path = home.join("config.toml");
        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            toml::from_str(&contents).map_err(|e| {
                StoreError::InvalidRequest(format!("failed to parse {}: {e}", path.display()))
            })?
        } else {
            NodeConfig::default()
        };
        config.home = home;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(id) = env_parse(ENV_NODE_ID) {
            self.node_id = id;
        }
        if let Some(port) = env_parse(ENV_ADMIN_PORT) {
            self.admin_port = port;
        }
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.home.join("metadata")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }
}

fn resolve_home(cli_home: &Path, env_home: Option<OsString>) -> PathBuf {
    env_home
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| cli_home.to_path_buf())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketPoolConfig {
    pub max_connections_per_node: usize,
    pub max_cached_per_node: usize,
    pub connect_timeout_ms: u64,
    pub socket_timeout_ms: u64,
    /// How long a checkout waits for a free slot before failing.
    pub pool_timeout_ms: u64,
}

impl Default for SocketPoolConfig {
    fn default() -> Self {
        SocketPoolConfig {
            max_connections_per_node: 16,
            max_cached_per_node: 16,
            connect_timeout_ms: 2_000,
            socket_timeout_ms: 10_000,
            pool_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 0 = errors, 1 = info, 2+ = debug.
    pub verbosity: u8,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            verbosity: 1,
            json: false,
        }
    }
}
