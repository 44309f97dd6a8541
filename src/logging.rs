//! Logging setup for the parent process and worker processes.
//!
//! The parent logs to the console and, optionally, to a plain-text file.
//! Worker processes log JSON lines to stderr so the parent can relay them.
//! `RUST_LOG` takes priority over the configured level in both cases.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Where and how to log.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Level directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Optional file receiving a copy of the console output.
    pub file: Option<PathBuf>,
    /// Log JSON lines to stderr, as worker processes do.
    pub worker: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            worker: false,
        }
    }
}

impl LoggingOptions {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    pub fn with_file(mut self, file: Option<PathBuf>) -> Self {
        self.file = file;
        self
    }

    pub fn for_worker(mut self, worker: bool) -> Self {
        self.worker = worker;
        self
    }
}

/// Filter from `RUST_LOG`, falling back to `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber.
pub fn init_logging(options: &LoggingOptions) -> Result<(), LoggingError> {
    let filter = env_filter(&options.level);

    let result = if options.worker {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()
    } else {
        let file_layer = match &options.file {
            Some(path) => Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(open_log_file(path)?)),
            ),
            None => None,
        };
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(file_layer)
            .with(filter)
            .try_init()
    };

    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

/// Opens `path` for appending, creating missing parent directories.
pub fn open_log_file(path: &Path) -> Result<fs::File, LoggingError> {
    let open = || -> std::io::Result<fs::File> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)
    };
    open().map_err(|source| LoggingError::LogFile {
        path: path.to_path_buf(),
        source,
    })
}
