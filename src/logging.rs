//! Logging setup: stderr output plus an optional duplicate file sink.

use std::fs::OpenOptions;
use std::sync::Mutex;

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::Log;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file: {0}")]
    OpenFile(#[from] std::io::Error),

    #[error("failed to install logger: {0}")]
    Init(String),
}

/// Map a configured level onto a tracing filter.
pub fn level_filter(level: &str) -> LevelFilter {
    match level {
        "debug" => LevelFilter::DEBUG,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Install the global subscriber: stderr always, plus a duplicate sink at
/// `log_file_path` when configured.
pub fn init(cfg: &Log) -> Result<(), LoggingError> {
    let filter = level_filter(&cfg.level);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);
    let registry = tracing_subscriber::registry().with(stderr_layer);
    match &cfg.log_file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(filter);
            registry
                .with(file_layer)
                .try_init()
                .map_err(|e| LoggingError::Init(e.to_string()))
        }
        None => registry
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string())),
    }
}
