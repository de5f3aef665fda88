//! Configuration management for the share connector.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/share-connector/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::MAX_PAYLOAD_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("queue_size must be between 1 and 1024, got {0}")]
    InvalidQueueSize(usize),

    #[error("{0} must be greater than 0")]
    ZeroBuffer(&'static str),

    #[error("{0} must be at most {max} bytes, got {1}", max = MAX_PAYLOAD_SIZE)]
    BufferTooLarge(&'static str, usize),

    #[error("page_size must be greater than 0")]
    ZeroPageSize,

    #[error("idle_timeout must be greater than 0")]
    ZeroIdleTimeout,

    #[error("op_code must be between 0 and 6, got {0}")]
    InvalidOpCode(u8),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for the session queue capacity.
const MAX_QUEUE_SIZE: usize = 1024;

/// Main configuration structure for the share connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Process-level settings.
    pub connector: ConnectorConfig,

    /// Queue and buffer sizing.
    pub buffers: BufferConfig,

    /// File backend settings (server role).
    pub backend: BackendConfig,

    /// Request parameters (client role).
    pub request: RequestConfig,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Unix socket path shared by server and client.
    pub socket_path: PathBuf,

    /// Seconds without activity before the server exits.
    pub idle_timeout: u64,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log file path. Empty logs to stderr.
    pub log_file: String,

    /// Number of pending connections the server accepts at once.
    pub accept_backlog: u32,
}

/// Queue and buffer sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// Capacity of each session queue.
    pub queue_size: usize,

    /// Socket read chunk and protocol data chunk size.
    pub unix_sock_buffer: usize,

    /// Bytes read from the backend per download step.
    pub backend_read_buffer: usize,

    /// Bytes read from the upload source per step.
    pub backend_write_buffer: usize,
}

/// File backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Directory that holds one subdirectory per server.
    pub root: PathBuf,
}

/// Request parameters used by the client role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    /// Operation: 1 list, 2 download, 3 upload, 4 add-folder, 5 delete,
    /// 6 test-connection. 0 means unset.
    pub op_code: u8,

    /// Request id sent with every packet.
    pub request_id: String,

    /// Target URL, `server/share/path`.
    pub url: String,

    pub workgroup: String,
    pub user_name: String,
    pub password: String,
    pub kerberos: bool,

    /// Entries per listing page.
    pub page_size: u32,

    pub show_only_folders: bool,
    pub show_hidden_files: bool,

    /// First byte to download.
    pub start_offset: u64,

    /// Last byte to download (inclusive). 0 means until end of file.
    pub end_offset: u64,

    /// Download sink.
    pub output_file: PathBuf,

    /// Upload source.
    pub input_file: PathBuf,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            idle_timeout: 300, // 5 minutes
            log_level: "info".to_string(),
            log_file: String::new(),
            accept_backlog: 1,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            queue_size: 10,
            unix_sock_buffer: 61440,
            backend_read_buffer: 364544,
            backend_write_buffer: 61440,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            root: default_backend_root(),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            op_code: 0,
            request_id: "1234".to_string(),
            url: String::new(),
            workgroup: String::new(),
            user_name: String::new(),
            password: String::new(),
            kerberos: false,
            page_size: 5,
            show_only_folders: false,
            show_hidden_files: true,
            start_offset: 0,
            end_offset: 0,
            output_file: PathBuf::from("out"),
            input_file: PathBuf::new(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("share-connector")
        .join("config.toml")
}

/// Returns the default socket path.
///
/// Uses `$XDG_RUNTIME_DIR/share-connector/connector.sock` when a runtime
/// directory is known, `/tmp/share-connector-$UID/connector.sock` otherwise.
#[cfg(unix)]
pub fn default_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("share-connector").join("connector.sock")
    } else {
        let uid = fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0);
        PathBuf::from(format!("/tmp/share-connector-{}", uid)).join("connector.sock")
    }
}

/// Returns the default directory holding the served shares.
fn default_backend_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("share-connector")
        .join("shares")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHARE_CONNECTOR_SOCKET: Override the socket path
    /// - SHARE_CONNECTOR_LOG_LEVEL: Override log level
    /// - SHARE_CONNECTOR_BACKEND_ROOT: Override the backend root directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(socket) = std::env::var("SHARE_CONNECTOR_SOCKET") {
            if !socket.is_empty() {
                tracing::info!("Overriding socket_path from environment: {}", socket);
                self.connector.socket_path = PathBuf::from(socket);
            }
        }

        if let Ok(level) = std::env::var("SHARE_CONNECTOR_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.connector.log_level = level;
            }
        }

        if let Ok(root) = std::env::var("SHARE_CONNECTOR_BACKEND_ROOT") {
            if !root.is_empty() {
                tracing::info!("Overriding backend root from environment: {}", root);
                self.backend.root = PathBuf::from(root);
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffers.queue_size < 1 || self.buffers.queue_size > MAX_QUEUE_SIZE {
            return Err(ConfigError::InvalidQueueSize(self.buffers.queue_size));
        }

        if self.buffers.unix_sock_buffer == 0 {
            return Err(ConfigError::ZeroBuffer("unix_sock_buffer"));
        }
        // Also the data chunk size, which must fit in one packet
        if self.buffers.unix_sock_buffer > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::BufferTooLarge(
                "unix_sock_buffer",
                self.buffers.unix_sock_buffer,
            ));
        }
        if self.buffers.backend_read_buffer == 0 {
            return Err(ConfigError::ZeroBuffer("backend_read_buffer"));
        }
        if self.buffers.backend_write_buffer == 0 {
            return Err(ConfigError::ZeroBuffer("backend_write_buffer"));
        }

        if self.request.page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }

        if self.connector.idle_timeout == 0 {
            return Err(ConfigError::ZeroIdleTimeout);
        }

        if self.request.op_code > 6 {
            return Err(ConfigError::InvalidOpCode(self.request.op_code));
        }

        let level = self.connector.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(
                self.connector.log_level.clone(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
