//! Configuration module for the muxchat server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// I/O backend used by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Readiness-based event loop (epoll/kqueue via mio).
    Mio,
    /// Completion-based event loop (Linux io_uring).
    Uring,
}

/// What happens when a session sends the quit token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuitPolicy {
    /// Forward the quit line to peers like any other frame, then close.
    ForwardThenClose,
    /// Close the sender without forwarding the quit line.
    CloseOnly,
}

/// Command-line arguments for the chat server
#[derive(Parser, Debug)]
#[command(name = "muxchat")]
#[command(author = "muxchat authors")]
#[command(version = "0.1.0")]
#[command(about = "A multiplexed broadcast chat server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8888)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// I/O backend
    #[arg(short = 'b', long, value_enum)]
    pub backend: Option<Backend>,

    /// Completion worker pool size (uring backend)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum line length in bytes before a session is dropped
    #[arg(long)]
    pub max_line: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// I/O backend
    #[serde(default = "default_backend")]
    pub backend: Backend,
    /// Completion worker pool size
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: default_backend(),
            workers: default_workers(),
            backlog: default_backlog(),
        }
    }
}

/// Event loop tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Readiness events processed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// io_uring submission queue entries
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    /// Bytes requested per read
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            ring_size: default_ring_size(),
            read_chunk: default_read_chunk(),
        }
    }
}

/// Wire protocol configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Longest accepted line, delimiter excluded
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    /// Line that ends the sending session
    #[serde(default = "default_quit_token")]
    pub quit_token: String,
    #[serde(default = "default_quit_policy")]
    pub quit_policy: QuitPolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_line_len: default_max_line_len(),
            quit_token: default_quit_token(),
            quit_policy: default_quit_policy(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8888".to_string()
}

fn default_backend() -> Backend {
    Backend::Mio
}

fn default_workers() -> usize {
    8
}

fn default_backlog() -> i32 {
    1024
}

fn default_batch_size() -> usize {
    1024
}

fn default_ring_size() -> u32 {
    256
}

fn default_read_chunk() -> usize {
    1024
}

fn default_max_line_len() -> usize {
    1024
}

fn default_quit_token() -> String {
    "quit".to_string()
}

fn default_quit_policy() -> QuitPolicy {
    QuitPolicy::ForwardThenClose
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backend: Backend,
    pub workers: usize,
    pub backlog: i32,
    pub batch_size: usize,
    pub ring_size: u32,
    pub read_chunk: usize,
    pub max_line_len: usize,
    pub quit_token: String,
    pub quit_policy: QuitPolicy,
    pub log_level: String,
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Self::merge(
            CliArgs {
                config: None,
                listen: None,
                backend: None,
                workers: None,
                max_line: None,
                log_level: default_log_level(),
            },
            TomlConfig::default(),
        )
        .expect("default configuration is valid")
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen))?;

        let config = Config {
            listen,
            backend: cli.backend.unwrap_or(toml_config.server.backend),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            backlog: toml_config.server.backlog,
            batch_size: toml_config.runtime.batch_size,
            ring_size: toml_config.runtime.ring_size,
            read_chunk: toml_config.runtime.read_chunk,
            max_line_len: cli.max_line.unwrap_or(toml_config.protocol.max_line_len),
            quit_token: toml_config.protocol.quit_token,
            quit_policy: toml_config.protocol.quit_policy,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.max_line_len == 0 {
            return Err(ConfigError::Invalid("max_line_len must be at least 1"));
        }
        if self.read_chunk == 0 {
            return Err(ConfigError::Invalid("read_chunk must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1"));
        }
        if self.quit_token.is_empty() || self.quit_token.contains('\n') {
            return Err(ConfigError::Invalid(
                "quit_token must be non-empty and contain no newline",
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{addr}'")
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
