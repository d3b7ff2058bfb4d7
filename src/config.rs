//! Configuration loading from a TOML file with environment overrides.

use std::{env, fs, path::Path};

use serde::Deserialize;
use thiserror::Error;

const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "error"];
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_REJECT_FUTURE_SECONDS: u64 = 900;

/// Failures while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("storage.uri is required")]
    MissingStorageUri,

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Http {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Log {
    pub level: String,
    pub log_file_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Storage {
    pub uri: String,
    /// Passed through to backends that dial TLS; the bundled schemes do not.
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Ingest {
    /// Ceiling in seconds for future-dated `created_at` values; `0` disables.
    pub reject_future_seconds: Option<u64>,
}

/// Runtime configuration assembled from file and environment.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub http: Http,
    pub log: Log,
    pub storage: Storage,
    pub ingest: Ingest,
}

impl Config {
    /// Read the TOML file at `path`, apply environment overrides and
    /// validate. Environment variables win over file values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let mut cfg: Config = toml::from_str(&raw)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlay `HTTP_*`, `LOG_*`, `STORAGE_*` and `INGEST_*` variables.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = env::var("HTTP_HOST") {
            self.http.host = host;
        }
        if let Ok(port) = env::var("HTTP_PORT") {
            self.http.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "HTTP_PORT",
                value: port,
            })?;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Ok(path) = env::var("LOG_FILE_PATH") {
            self.log.log_file_path = Some(path);
        }
        if let Ok(uri) = env::var("STORAGE_URI") {
            self.storage.uri = uri;
        }
        if let Ok(skip) = env::var("STORAGE_SKIP_TLS_VERIFY") {
            self.storage.skip_tls_verify =
                skip.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "STORAGE_SKIP_TLS_VERIFY",
                    value: skip,
                })?;
        }
        if let Ok(secs) = env::var("INGEST_REJECT_FUTURE_SECONDS") {
            self.ingest.reject_future_seconds =
                Some(secs.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "INGEST_REJECT_FUTURE_SECONDS",
                    value: secs,
                })?);
        }
        Ok(())
    }

    /// Fill defaults and reject invalid values.
    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.log.level.is_empty() {
            self.log.level = DEFAULT_LOG_LEVEL.into();
        }
        if !VALID_LOG_LEVELS.contains(&self.log.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }
        if self.http.host.is_empty() {
            self.http.host = DEFAULT_HOST.into();
        }
        if self.http.port == 0 {
            self.http.port = DEFAULT_PORT;
        }
        if self.storage.uri.is_empty() {
            return Err(ConfigError::MissingStorageUri);
        }
        if self.ingest.reject_future_seconds.is_none() {
            self.ingest.reject_future_seconds = Some(DEFAULT_REJECT_FUTURE_SECONDS);
        }
        Ok(())
    }

    /// The `host:port` string the hub binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http.host, self.http.port)
    }

    /// Effective future-dating ceiling; `0` disables the check.
    pub fn reject_future_seconds(&self) -> u64 {
        self.ingest
            .reject_future_seconds
            .unwrap_or(DEFAULT_REJECT_FUTURE_SECONDS)
    }
}
