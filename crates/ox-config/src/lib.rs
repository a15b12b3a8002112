#![forbid(unsafe_code)]

//! Server configuration from command-line flags.

use std::fmt;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 6380;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub idle_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl Config {
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What the argument list asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cli {
    Run(Config),
    Help,
    Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingValue(String),
    InvalidValue(String, String),
    UnknownFlag(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingValue(flag) => write!(f, "{flag} requires a value"),
            Self::InvalidValue(flag, value) => write!(f, "invalid value {value:?} for {flag}"),
            Self::UnknownFlag(flag) => write!(f, "unknown flag {flag}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parse the argument list (without the program name).
pub fn parse_args(args: &[String]) -> Result<Cli, ConfigError> {
    let mut config = Config::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--host" | "-h" => {
                config.host = iter
                    .next()
                    .ok_or_else(|| ConfigError::MissingValue(arg.clone()))?
                    .clone();
            }
            "--port" | "-p" => {
                let raw = iter
                    .next()
                    .ok_or_else(|| ConfigError::MissingValue(arg.clone()))?;
                config.port = raw
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(arg.clone(), raw.clone()))?;
            }
            "--idle-timeout-ms" => {
                let raw = iter
                    .next()
                    .ok_or_else(|| ConfigError::MissingValue(arg.clone()))?;
                config.idle_timeout_ms = raw
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(arg.clone(), raw.clone()))?;
            }
            "--help" => return Ok(Cli::Help),
            "--version" | "-v" => return Ok(Cli::Version),
            other => return Err(ConfigError::UnknownFlag(other.to_string())),
        }
    }
    Ok(Cli::Run(config))
}
