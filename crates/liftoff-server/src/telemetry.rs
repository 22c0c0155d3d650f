//! Process logging.
//!
//! Installs the global `tracing` subscriber from `log.*` settings: an
//! `EnvFilter` (with `RUST_LOG` taking precedence over `log.level`), a
//! console layer in text or JSON format, and an optional append-only file
//! layer under `log.dir`.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use liftoff_common::{LogFormat, LogSettings};

/// Logging setup errors.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The level directive could not be parsed.
    #[error("Invalid log level '{level}': {reason}")]
    InvalidLevel {
        /// The rejected directive.
        level: String,
        /// Parse failure description.
        reason: String,
    },

    /// The log directory or file could not be opened.
    #[error("Cannot open log file {path}: {source}")]
    File {
        /// Target path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result of [`init_logging`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerHandle {
    /// Whether this call installed the global subscriber. `false` when one
    /// was already set, which is expected in tests.
    pub installed: bool,
    /// Log file, when file output is enabled.
    pub file: Option<PathBuf>,
}

/// Build the level filter: `RUST_LOG` if set, `level` otherwise.
pub fn build_filter(level: &str) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| TelemetryError::InvalidLevel {
        level: level.to_string(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error for an unparsable level or an unwritable log file. An
/// already installed subscriber is not an error.
pub fn init_logging(settings: &LogSettings) -> Result<LoggerHandle, TelemetryError> {
    let filter = build_filter(&settings.level)?;

    let (text, json) = match settings.format {
        LogFormat::Text => (Some(fmt::layer().with_target(true)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_current_span(false))),
    };

    let file = settings.file_path();
    let file_layer = match &file {
        Some(path) => {
            let writer = open_log_file(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(writer)))
        }
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        info!(
            level = %settings.level,
            format = ?settings.format,
            file = ?file,
            "Logging initialized"
        );
    } else {
        debug!("Global subscriber already installed, keeping it");
    }

    Ok(LoggerHandle { installed, file })
}

fn open_log_file(path: &Path) -> Result<fs::File, TelemetryError> {
    let to_error = |source| TelemetryError::File {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(to_error)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(to_error)
}
