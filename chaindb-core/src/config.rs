//! Configuration management for ChainDB
//!
//! Settings live in a TOML file. A missing file is created with the
//! defaults; an existing file is parsed and validated before use.
//! Command line flags are applied on top by the server binary.

use crate::backoff::BackoffConfig;
use crate::protocol::DEFAULT_MAX_FRAME_BYTES;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Connection string selecting the in-process coordination service
pub const MEMORY_COORDINATOR: &str = "memory";

/// ChainDB server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub coordination: CoordinationSettings,
    pub network: NetworkSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    pub host: String,
    /// Listening port (0 picks a free port)
    pub port: u16,
    /// Address other nodes use to reach this server
    pub advertise_host: String,
    /// Number of hash buckets in the table
    pub n_lists: usize,
    /// Maximum concurrent client connections
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 50051,
            advertise_host: "127.0.0.1".to_string(),
            n_lists: 16,
            max_connections: 1024,
        }
    }
}

impl ServerSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationSettings {
    /// `host:port` of the coordination service, or `memory`
    pub connect: String,
    /// Parent path under which chain members register
    pub chain_path: String,
    pub connect_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Connection attempts before giving up
    pub max_attempts: u32,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            connect: "127.0.0.1:2181".to_string(),
            chain_path: "/chain".to_string(),
            connect_timeout_ms: 5000,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
            max_attempts: 5,
        }
    }
}

impl CoordinationSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.initial_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
            multiplier: 2.0,
        }
    }

    pub fn is_memory(&self) -> bool {
        self.connect == MEMORY_COORDINATOR
    }
}

/// Timeouts and limits for table connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            request_timeout_ms: 10_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl NetworkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
    /// Table operations slower than this are logged
    pub slow_op_threshold_us: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            slow_op_threshold_us: 100_000,
        }
    }
}

impl LoggingSettings {
    pub fn slow_op_threshold(&self) -> Duration {
        Duration::from_micros(self.slow_op_threshold_us)
    }
}

/// Loads, validates and persists the configuration file
pub struct ConfigManager {
    config: ServerConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load `path`, writing the defaults there first if it doesn't exist
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = path.into();
        let config = if config_path.exists() {
            Self::load_config(&config_path)?
        } else {
            let default_config = ServerConfig::default();
            Self::save_config(&config_path, &default_config)?;
            info!("Wrote default configuration to {}", config_path.display());
            default_config
        };

        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn into_config(self) -> ServerConfig {
        self.config
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Validate configuration
    pub fn validate_config(config: &ServerConfig) -> Result<()> {
        if config.server.n_lists == 0 {
            return Err(anyhow::anyhow!("n_lists must be at least 1"));
        }

        if config.server.max_connections == 0 {
            return Err(anyhow::anyhow!("Max connections cannot be 0"));
        }

        let chain_path = &config.coordination.chain_path;
        if !chain_path.starts_with('/') || chain_path.len() < 2 {
            return Err(anyhow::anyhow!(
                "Chain path must be an absolute, non-root path: {:?}",
                chain_path
            ));
        }
        if chain_path.ends_with('/') {
            return Err(anyhow::anyhow!("Chain path cannot end with '/': {:?}", chain_path));
        }

        if config.coordination.connect.is_empty() {
            return Err(anyhow::anyhow!("Coordination connection string cannot be empty"));
        }

        if config.coordination.connect_timeout_ms == 0 || config.coordination.max_attempts == 0 {
            return Err(anyhow::anyhow!(
                "Coordination connect timeout and attempts must be positive"
            ));
        }

        if config.network.connect_timeout_ms == 0 || config.network.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Network timeouts cannot be 0"));
        }

        if config.network.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size cannot be 0"));
        }

        Ok(())
    }

    fn load_config(path: &Path) -> Result<ServerConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Self::validate_config(&config)?;

        Ok(config)
    }

    fn save_config(path: &Path, config: &ServerConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }

        let content =
            toml::to_string_pretty(config).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}
