//! Tracing setup: console output plus an optional daily-rolling log file

use std::path::Path;

use thiserror::Error;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::archive::config_loader::AppConfig;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tracing initialization error: {0}")]
    Init(String),
}

pub type LoggerResult<T> = Result<T, LoggerError>;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &AppConfig) -> LoggerResult<()> {
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.log_level))
        .map_err(|e| LoggerError::Init(e.to_string()))?;

    let console_layer = fmt::layer().with_target(false);

    let file_layer = if config.logging.log_to_file {
        let log_dir = Path::new(&config.paths.log_directory);
        std::fs::create_dir_all(log_dir)?;
        let file_appender = tracing_appender::rolling::daily(log_dir, "booru_archive.log");
        Some(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::Init(e.to_string()))?;

    Ok(())
}
