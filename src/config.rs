//! Configuration module for hey-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "hey-server")]
#[command(author = "hey-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP acceptor with a bounded worker pool", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:4221)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of connections handled at the same time
    #[arg(short = 'n', long)]
    pub max_concurrency: Option<usize>,

    /// Number of accepted connections allowed to wait for a free handler
    #[arg(short = 'q', long)]
    pub queue_depth: Option<usize>,

    /// Largest accepted request in bytes
    #[arg(short = 's', long)]
    pub max_request_size: Option<usize>,

    /// Deadline for each read from a client, in milliseconds
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Simulated work before responding, in milliseconds
    #[arg(short = 'd', long)]
    pub delay_ms: Option<u64>,

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
    pub limits: LimitsConfig,
    #[serde(default)]
    pub work: WorkConfig,
    #[serde(default)]
    pub response: ResponseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of runtime worker threads
    pub workers: Option<usize>,
    /// Size of the handler pool
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Capacity of the queue in front of the handler pool
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// How long shutdown waits for in-flight connections
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_concurrency: default_max_concurrency(),
            queue_depth: default_queue_depth(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_work_timeout_ms")]
    pub work_timeout_ms: u64,
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_size: default_max_request_size(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            work_timeout_ms: default_work_timeout_ms(),
            handler_timeout_ms: default_handler_timeout_ms(),
        }
    }
}

/// Simulated work configuration
#[derive(Debug, Deserialize, Default)]
pub struct WorkConfig {
    /// Delay before the response is produced
    #[serde(default)]
    pub delay_ms: u64,
}

/// Response configuration
#[derive(Debug, Deserialize)]
pub struct ResponseConfig {
    /// Body of the 200 response
    #[serde(default = "default_body")]
    pub body: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            body: default_body(),
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
    "0.0.0.0:4221".to_string()
}

fn default_max_concurrency() -> usize {
    100
}

fn default_queue_depth() -> usize {
    1024
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_max_request_size() -> usize {
    1024
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_work_timeout_ms() -> u64 {
    30_000
}

fn default_handler_timeout_ms() -> u64 {
    60_000
}

fn default_body() -> String {
    "Hey Client!".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub workers: Option<usize>,
    pub max_concurrency: usize,
    pub queue_depth: usize,
    pub shutdown_grace: Duration,
    pub max_request_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub work_timeout: Duration,
    pub handler_timeout: Duration,
    pub work_delay: Duration,
    pub body: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let toml_config = TomlConfig::default();
        Config {
            listen: SocketAddr::from(([0, 0, 0, 0], 4221)),
            workers: None,
            max_concurrency: toml_config.server.max_concurrency,
            queue_depth: toml_config.server.queue_depth,
            shutdown_grace: Duration::from_millis(toml_config.server.shutdown_grace_ms),
            max_request_size: toml_config.limits.max_request_size,
            read_timeout: Duration::from_millis(toml_config.limits.read_timeout_ms),
            write_timeout: Duration::from_millis(toml_config.limits.write_timeout_ms),
            work_timeout: Duration::from_millis(toml_config.limits.work_timeout_ms),
            handler_timeout: Duration::from_millis(toml_config.limits.handler_timeout_ms),
            work_delay: Duration::ZERO,
            body: toml_config.response.body,
            log_level: toml_config.logging.level,
        }
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

        let config = Self::merge(cli, toml_config)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;

        let level_given = !cli.log_level.is_empty() && cli.log_level != "info";

        Ok(Config {
            listen,
            workers: cli.workers.or(toml_config.server.workers),
            max_concurrency: cli
                .max_concurrency
                .unwrap_or(toml_config.server.max_concurrency),
            queue_depth: cli.queue_depth.unwrap_or(toml_config.server.queue_depth),
            shutdown_grace: Duration::from_millis(toml_config.server.shutdown_grace_ms),
            max_request_size: cli
                .max_request_size
                .unwrap_or(toml_config.limits.max_request_size),
            read_timeout: Duration::from_millis(
                cli.read_timeout_ms
                    .unwrap_or(toml_config.limits.read_timeout_ms),
            ),
            write_timeout: Duration::from_millis(toml_config.limits.write_timeout_ms),
            work_timeout: Duration::from_millis(toml_config.limits.work_timeout_ms),
            handler_timeout: Duration::from_millis(toml_config.limits.handler_timeout_ms),
            work_delay: Duration::from_millis(cli.delay_ms.unwrap_or(toml_config.work.delay_ms)),
            body: toml_config.response.body,
            log_level: if level_given {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1"));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be at least 1"));
        }
        if self.max_request_size == 0 {
            return Err(ConfigError::Invalid("max_request_size must be at least 1"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        let deadlines = [
            self.read_timeout,
            self.write_timeout,
            self.work_timeout,
            self.handler_timeout,
        ];
        if deadlines.iter().any(Duration::is_zero) {
            return Err(ConfigError::Invalid("timeouts must be non-zero"));
        }
        if self.work_delay >= self.work_timeout {
            return Err(ConfigError::Invalid(
                "work delay must be shorter than the work timeout",
            ));
        }
        // The work deadline must fire before the handler deadline.
        if self.work_timeout >= self.handler_timeout {
            return Err(ConfigError::Invalid(
                "work timeout must be shorter than the handler timeout",
            ));
        }
        if self.work_delay >= self.handler_timeout {
            return Err(ConfigError::Invalid(
                "work delay must be shorter than the handler timeout",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:4221");
        assert_eq!(config.server.max_concurrency, 100);
        assert_eq!(config.limits.max_request_size, 1024);
        assert_eq!(config.work.delay_ms, 0);
        assert_eq!(config.response.body, "Hey Client!");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9000"
            workers = 4
            max_concurrency = 8
            queue_depth = 16

            [limits]
            max_request_size = 4096
            read_timeout_ms = 250

            [work]
            delay_ms = 100

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_concurrency, 8);
        assert_eq!(config.server.queue_depth, 16);
        assert_eq!(config.limits.max_request_size, 4096);
        assert_eq!(config.limits.read_timeout_ms, 250);
        assert_eq!(config.limits.write_timeout_ms, 5_000);
        assert_eq!(config.work.delay_ms, 100);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            max_concurrency = 8
            [work]
            delay_ms = 100
        "#,
        )
        .unwrap();
        let cli = CliArgs {
            listen: Some("127.0.0.1:5000".to_string()),
            max_concurrency: Some(2),
            log_level: "info".to_string(),
            ..CliArgs::default()
        };

        let config = Config::merge(cli, toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.work_delay, Duration::from_millis(100));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_invalid_listen() {
        let cli = CliArgs {
            listen: Some("not-an-address".to_string()),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::InvalidListen(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let config = Config {
            max_concurrency: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            read_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            work_delay: Duration::from_secs(8),
            work_timeout: Duration::from_secs(8),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            work_delay: Duration::from_secs(10),
            work_timeout: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            work_timeout: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(60),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            work_delay: Duration::from_secs(10),
            work_timeout: Duration::from_secs(20),
            handler_timeout: Duration::from_secs(30),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }
}
