//! Structured logging.
//!
//! Diagnostics go through `tracing` and are written to stderr, either as
//! human-readable lines or as JSON objects. Command results stay on stdout.
//!
//! `RUST_LOG` overrides the configured level, e.g.
//! `RUST_LOG=config_advisor=debug cfa scan`.
//!
//! Events carry these fields where they apply: `run_id`, `proposal_id`,
//! `path`, `chunk`.

use std::sync::OnceLock;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log filter '{0}'")]
    InvalidFilter(String),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|_| LogError::InvalidFilter(config.level.clone()))?,
    };

    match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_span_events(FmtSpan::NONE)
                    .with_ansi(atty::is(atty::Stream::Stderr)),
            )
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init()?,
    }

    let _ = LOGGING_INITIALIZED.set(());
    Ok(())
}
