//! Configuration module
//!
//! Handles loading and saving PulseWire configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{DecodeErrorPolicy, NetworkConfig};
use crate::protocol::{DEFAULT_MAX_FRAME_LENGTH, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Server role settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client role settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Wire protocol settings
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Human-readable name for this host
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            name: default_name(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Runtime worker threads (defaults to one per core)
    pub worker_threads: Option<usize>,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Drop clients silent for this many seconds (0 disables)
    #[serde(default = "default_server_reader_idle")]
    pub reader_idle_secs: u64,
    /// Heartbeat clients after this many seconds without writes (0 disables)
    #[serde(default)]
    pub writer_idle_secs: u64,
    /// SO_RCVBUF hint for accepted sockets
    pub recv_buffer_size: Option<u32>,
    /// SO_KEEPALIVE on accepted sockets
    #[serde(default = "default_true")]
    pub keepalive: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_backlog() -> u32 {
    128
}

fn default_server_reader_idle() -> u64 {
    9
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            worker_threads: None,
            backlog: default_backlog(),
            reader_idle_secs: default_server_reader_idle(),
            writer_idle_secs: 0,
            recv_buffer_size: None,
            keepalive: default_true(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Disconnect when the server is silent this many seconds (0 disables)
    #[serde(default)]
    pub reader_idle_secs: u64,
    /// Send a heartbeat after this many seconds without writes (0 disables)
    #[serde(default = "default_client_writer_idle")]
    pub writer_idle_secs: u64,
    /// Heartbeat text (defaults to "heartbeat from <name>")
    pub heartbeat_info: Option<String>,
    /// SO_RCVBUF hint for the client socket
    pub recv_buffer_size: Option<u32>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_client_writer_idle() -> u64 {
    3
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            reader_idle_secs: 0,
            writer_idle_secs: default_client_writer_idle(),
            heartbeat_info: None,
            recv_buffer_size: None,
        }
    }
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Largest accepted frame, header included
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
    /// Bytes reserved per socket read
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// What to do with frames whose payload fails to deserialize
    #[serde(default)]
    pub decode_error_policy: DecodeErrorPolicy,
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

fn default_read_chunk_size() -> usize {
    1024
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_length: default_max_frame_length(),
            read_chunk_size: default_read_chunk_size(),
            decode_error_policy: DecodeErrorPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("pulsewire/config.toml")),
            Some(PathBuf::from("./pulsewire.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Heartbeat text sent by this host
    pub fn heartbeat_info(&self) -> String {
        self.client
            .heartbeat_info
            .clone()
            .unwrap_or_else(|| format!("heartbeat from {}", self.general.name))
    }

    /// Runtime settings for the server role
    pub fn server_network(&self) -> NetworkConfig {
        let mut config = self.with_protocol(NetworkConfig::new(self.server.port));
        config.bind_address = self.server.bind_address.clone();
        config.backlog = self.server.backlog;
        config.recv_buffer_size = self.server.recv_buffer_size;
        config
            .with_keepalive(self.server.keepalive)
            .with_reader_idle(Duration::from_secs(self.server.reader_idle_secs))
            .with_writer_idle(Duration::from_secs(self.server.writer_idle_secs))
    }

    /// Runtime settings for the client role
    pub fn client_network(&self) -> NetworkConfig {
        let mut config = self.with_protocol(NetworkConfig::new(self.client.port));
        config.host = self.client.host.clone();
        config.connect_timeout_ms = self.client.connect_timeout_ms;
        config.recv_buffer_size = self.client.recv_buffer_size;
        config
            .with_reader_idle(Duration::from_secs(self.client.reader_idle_secs))
            .with_writer_idle(Duration::from_secs(self.client.writer_idle_secs))
    }

    fn with_protocol(&self, mut config: NetworkConfig) -> NetworkConfig {
        config.read_chunk_size = self.protocol.read_chunk_size;
        config
            .with_max_frame_length(self.protocol.max_frame_length)
            .with_decode_error_policy(self.protocol.decode_error_policy)
            .with_heartbeat_info(self.heartbeat_info())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            log_level: "info".to_string(),
            name: "edge-node-1".to_string(),
        },
        server: ServerConfig {
            worker_threads: Some(4),
            ..Default::default()
        },
        client: ClientConfig {
            host: "10.0.0.5".to_string(),
            heartbeat_info: Some("edge-node-1 alive".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
