//! Server Configuration
//!
//! [`ServerConfig`] carries everything the server needs to start. The binary
//! builds one from command-line flags with [`parse_args`]; tests and
//! embedders construct it directly.

use crate::storage::ExpiryConfig;
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default snapshot file, relative to the working directory
pub const DEFAULT_SNAPSHOT_PATH: &str = "dump.my_rdb";

/// Default time between periodic snapshots (5 minutes)
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Where snapshots are written and loaded from
    pub snapshot_path: PathBuf,

    /// Time between periodic snapshots; zero disables them (the final
    /// snapshot at shutdown is still taken)
    pub snapshot_interval: Duration,

    pub expiry: ExpiryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            expiry: ExpiryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Returns the bind address as `host:port`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Run(ServerConfig),
    Help,
    Version,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("invalid value '{value}' for {flag}")]
    InvalidValue { flag: String, value: String },

    #[error("unknown argument: {0}")]
    UnknownArgument(String),
}

/// Parses command-line arguments (without the program name).
///
/// ```
/// use snapkv::config::{parse_args, CliCommand};
///
/// let args = ["--port", "6380", "--dump-file", "/tmp/kv.my_rdb"].map(String::from);
/// match parse_args(args).unwrap() {
///     CliCommand::Run(config) => {
///         assert_eq!(config.port, 6380);
///         assert_eq!(config.snapshot_path.to_str(), Some("/tmp/kv.my_rdb"));
///     }
///     other => panic!("unexpected {:?}", other),
/// }
/// ```
pub fn parse_args<I>(args: I) -> Result<CliCommand, ConfigError>
where
    I: IntoIterator<Item = String>,
{
    let mut config = ServerConfig::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let mut value = || args.next().ok_or_else(|| ConfigError::MissingValue(arg.clone()));

        match arg.as_str() {
            "--host" | "-h" => config.host = value()?,
            "--port" | "-p" => config.port = parse_number(&arg, value()?)?,
            "--dump-file" | "-f" => config.snapshot_path = PathBuf::from(value()?),
            "--save-interval" | "-s" => {
                config.snapshot_interval = Duration::from_secs(parse_number(&arg, value()?)?)
            }
            "--help" => return Ok(CliCommand::Help),
            "--version" | "-v" => return Ok(CliCommand::Version),
            _ => return Err(ConfigError::UnknownArgument(arg)),
        }
    }

    Ok(CliCommand::Run(config))
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliCommand, ConfigError> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address(), "127.0.0.1:6379");
        assert_eq!(config.snapshot_path, PathBuf::from("dump.my_rdb"));
        assert_eq!(config.snapshot_interval, Duration::from_secs(300));

        assert_eq!(parse(&[]), Ok(CliCommand::Run(config)));
    }

    #[test]
    fn test_all_flags() {
        let command = parse(&[
            "-h", "0.0.0.0", "-p", "7000", "-f", "data.my_rdb", "-s", "60",
        ])
        .unwrap();

        let CliCommand::Run(config) = command else {
            panic!("expected run, got {:?}", command);
        };
        assert_eq!(config.bind_address(), "0.0.0.0:7000");
        assert_eq!(config.snapshot_path, PathBuf::from("data.my_rdb"));
        assert_eq!(config.snapshot_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_help_and_version() {
        assert_eq!(parse(&["--help"]), Ok(CliCommand::Help));
        assert_eq!(parse(&["--port", "1", "-v"]), Ok(CliCommand::Version));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            parse(&["--port"]),
            Err(ConfigError::MissingValue("--port".to_string()))
        );
        assert_eq!(
            parse(&["--port", "http"]),
            Err(ConfigError::InvalidValue {
                flag: "--port".to_string(),
                value: "http".to_string(),
            })
        );
        assert_eq!(
            parse(&["--verbose"]),
            Err(ConfigError::UnknownArgument("--verbose".to_string()))
        );
    }
}
