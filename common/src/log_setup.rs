use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Crates whose events follow the requested level. Everything else,
/// including the tokio and rayon internals, only logs warnings.
const VIEWER_TARGETS: [&str; 2] = ["skyview", "common"];

#[derive(Debug, thiserror::Error)]
pub enum LogSetupError {
    #[error("Invalid log filter '{directives}': {source}")]
    Filter {
        directives: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("Failed to create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to create log file appender: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),
    #[error("Logging already initialized")]
    AlreadyInitialized,
}

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Level for the viewer crates, e.g. `"info"` or `"debug"`.
    pub level: String,
    pub directory: PathBuf,
    pub file_prefix: String,
    /// Daily files kept before the oldest is removed.
    pub max_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: PathBuf::from("logs"),
            file_prefix: "skyview".to_string(),
            max_files: 5,
        }
    }
}

/// Filter directives for `level`: warnings from everything, `level` from
/// the viewer crates.
pub fn filter_directives(level: &str) -> String {
    let mut directives = String::from("warn");
    for target in VIEWER_TARGETS {
        directives.push_str(&format!(",{target}={level}"));
    }
    directives
}

/// `RUST_LOG` when set, otherwise [`filter_directives`] for `level`.
pub fn build_filter(level: &str) -> Result<EnvFilter, LogSetupError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = filter_directives(level);
    EnvFilter::try_new(&directives).map_err(|source| LogSetupError::Filter {
        directives,
        source,
    })
}

/// Installs console logging (warnings and errors to stderr) and a daily
/// rolling file under `logs/` at `base_level`.
pub fn setup_logging(base_level: &str) -> Result<(), LogSetupError> {
    setup_logging_with(&LogOptions {
        level: base_level.to_string(),
        ..LogOptions::default()
    })
}

pub fn setup_logging_with(options: &LogOptions) -> Result<(), LogSetupError> {
    if LOG_GUARD.get().is_some() {
        return Err(LogSetupError::AlreadyInitialized);
    }
    let env_filter = build_filter(&options.level)?;

    std::fs::create_dir_all(&options.directory).map_err(|source| LogSetupError::Directory {
        path: options.directory.clone(),
        source,
    })?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&options.file_prefix)
        .filename_suffix("log")
        .max_log_files(options.max_files)
        .build(&options.directory)?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console_writer = std::io::stdout.and(std::io::stderr.with_min_level(Level::WARN));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(true)
        .with_writer(console_writer);

    // Tile and worker events come from tokio worker threads.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LogSetupError::AlreadyInitialized)?;

    LOG_GUARD
        .set(guard)
        .map_err(|_| LogSetupError::AlreadyInitialized)?;
    tracing::info!(directory = %options.directory.display(), level = %options.level, "logging initialized");
    Ok(())
}
