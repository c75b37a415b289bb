//! Configuration for the protonode binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::node::NodeOptions;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which reference protocol the node speaks.
#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Echo,
    Smtp,
    Lmtp,
    Http,
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "protonode")]
#[command(version)]
#[command(about = "Event-driven text protocol node", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run as a server (default is the client role)
    #[arg(short, long)]
    pub server: bool,

    /// Host to bind (server) or connect to (client)
    #[arg(short = 'a', long)]
    pub address: Option<String>,

    /// Port to bind or connect to
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Protocol to speak
    #[arg(long, value_enum)]
    pub protocol: Option<ProtocolKind>,

    /// Fully qualified domain name used in SMTP/LMTP greetings
    #[arg(long)]
    pub fqdn: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Upper bound on unterminated inbound bytes per connection
    #[arg(long)]
    pub max_buffer: Option<usize>,

    /// Idle connection timeout in seconds (0 disables)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Envelope sender for the mail client role
    #[arg(long)]
    pub source: Option<String>,

    /// Envelope recipient for the mail client role (repeatable)
    #[arg(long = "target")]
    pub targets: Vec<String>,

    /// Message body for the mail client role
    #[arg(long)]
    pub message: Option<String>,

    /// AUTH PLAIN credentials for the mail client role, as user:password
    #[arg(long)]
    pub auth: Option<String>,

    /// Request path for the HTTP client role
    #[arg(long)]
    pub path: Option<String>,

    /// Lines to send in the echo client role
    pub lines: Vec<String>,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub protocol: Option<ProtocolKind>,
    pub fqdn: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            protocol: None,
            fqdn: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_buffer: default_max_buffer(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_address() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_buffer() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_idle_timeout() -> u64 {
    300 // seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: bool,
    pub protocol: ProtocolKind,
    pub host: String,
    pub port: u16,
    pub fqdn: String,
    pub log_level: String,
    pub max_buffer: usize,
    pub idle_timeout: Duration,
    pub source: Option<String>,
    pub targets: Vec<String>,
    pub message: Option<String>,
    pub auth: Option<(String, String)>,
    pub path: String,
    pub lines: Vec<String>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Config::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let auth = match cli.auth {
            Some(raw) => match raw.split_once(':') {
                Some((user, pass)) => Some((user.to_string(), pass.to_string())),
                None => return Err(ConfigError::BadAuth(raw)),
            },
            None => None,
        };

        let host = cli.address.unwrap_or(toml_config.node.address);
        Ok(Config {
            server: cli.server,
            protocol: cli
                .protocol
                .or(toml_config.node.protocol)
                .unwrap_or(ProtocolKind::Echo),
            fqdn: cli
                .fqdn
                .or(toml_config.node.fqdn)
                .unwrap_or_else(|| host.clone()),
            host,
            port: cli.port.unwrap_or(toml_config.node.port),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            max_buffer: cli.max_buffer.unwrap_or(toml_config.limits.max_buffer),
            idle_timeout: Duration::from_secs(
                cli.idle_timeout.unwrap_or(toml_config.limits.idle_timeout),
            ),
            source: cli.source,
            targets: cli.targets,
            message: cli.message,
            auth,
            path: cli.path.unwrap_or_else(|| "/".to_string()),
            lines: cli.lines,
        })
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            max_buffer: self.max_buffer,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    BadAuth(String),
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
            ConfigError::BadAuth(raw) => {
                write!(f, "Invalid --auth value '{raw}': expected user:password")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
