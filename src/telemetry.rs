//! Tracing subscriber setup.
//!
//! Stdout layer in one of four formats plus an optional non-blocking rolling
//! file layer. The `LOG` environment variable overrides the configured
//! filter.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};

const LOG_FILE_PREFIX: &str = "starling.log";

/// Keeps the non-blocking appender workers alive; drop to flush.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(logging: &LoggingConfig) -> TelemetryGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::metadata::LevelFilter::INFO.into())
        .with_env_var("LOG")
        .from_env_lossy();
    let filter = match &logging.filter {
        Some(directives) if std::env::var_os("LOG").is_none() => {
            EnvFilter::try_new(directives).unwrap_or(filter)
        }
        _ => filter,
    };

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if logging.stdout {
        layers.push(build_stdout_layer(logging.stdout_format));
    }

    let mut file_setup_error = None;
    if logging.file.enabled {
        let dir = resolve_log_dir(&logging.file);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                let (layer, guard) = build_file_layer(&logging.file, &dir);
                layers.push(layer);
                guards.push(guard);
            }
            Err(err) => {
                file_setup_error =
                    Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));
    Registry::default().with(layers).init();

    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _guards: guards }
}

fn build_stdout_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Tree => Box::new(tracing_tree::HierarchicalLayer::new(2)),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true),
        ),
    }
}

fn build_file_layer(
    config: &FileLoggingConfig,
    dir: &Path,
) -> (
    Box<dyn Layer<Registry> + Send + Sync>,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let rotation = match config.rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    };
    let appender =
        tracing_appender::rolling::RollingFileAppender::new(rotation, dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(false)
                .with_writer(writer),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_current_span(true),
        ),
    };
    (layer, guard)
}

fn resolve_log_dir(config: &FileLoggingConfig) -> PathBuf {
    config
        .dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("./logs"))
}
