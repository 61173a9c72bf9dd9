//! Logging initialization.
//!
//! Every binary in the workspace logs through `tracing`. This module installs
//! the subscriber once at startup: structured JSONL appended to
//! `~/.appmarket/logs/appmarket.jsonl`, plus an optional human-readable stderr
//! stream. `RUST_LOG` takes precedence over the configured level.

use crate::Paths;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, written once at startup for filtering.
    pub service_name: String,
    /// Default log level filter (e.g., "debug", "info", "warn").
    pub default_level: String,
    /// JSONL log file. `None` disables file output.
    pub log_path: Option<PathBuf>,
    /// Also emit logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "appmarket".into(),
            default_level: "info".into(),
            log_path: Paths::new().ok().map(|paths| paths.log_file()),
            also_stderr: false,
        }
    }
}

/// Initialize logging with a custom service name. `APPMARKET_LOG_STDERR=1`
/// mirrors the log to stderr.
///
/// # Example
///
/// ```ignore
/// init_logging_for_service("cli", "info");
/// tracing::info!("client started");
/// ```
pub fn init_logging_for_service(service_name: &str, level: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        default_level: level.into(),
        also_stderr: std::env::var("APPMARKET_LOG_STDERR")
            .map(|raw| matches!(raw.trim(), "1" | "true" | "yes"))
            .unwrap_or(false),
        ..Default::default()
    });
}

/// Install the global subscriber. Calling this twice is harmless: the second
/// call leaves the first subscriber in place.
pub fn init_with_config(config: LogConfig) {
    let default_directive = parse_level(&config.default_level)
        .as_str()
        .to_ascii_lowercase();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let file_layer = config.log_path.as_ref().and_then(|path| {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok()?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()?;
        Some(
            fmt::layer()
                .json()
                .with_current_span(false)
                .with_writer(Mutex::new(file)),
        )
    });

    let stderr_layer = config
        .also_stderr
        .then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(service = %config.service_name, "logging initialized");
    }
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
