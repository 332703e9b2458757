use crate::domain::settings::LogSettings;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub struct LoggingGuard {
    // Keep alive so buffered file logs are flushed on exit
    _guards: Vec<WorkerGuard>,
}

fn rotation(settings: &LogSettings) -> Rotation {
    match settings.rotation.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// Relative log directories live under the per-user data directory.
fn log_directory(settings: &LogSettings) -> PathBuf {
    let dir = PathBuf::from(&settings.log_dir);
    if dir.is_absolute() {
        return dir;
    }
    match dirs::data_local_dir() {
        Some(base) => base.join("ride_remote_control").join(dir),
        None => dir,
    }
}

fn level_filter(settings: &LogSettings) -> EnvFilter {
    // RUST_LOG wins over the persisted level
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    // stdout belongs to the console, so diagnostics go to stderr
    let console_layer = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let directory = log_directory(settings);
    let file_layer = if settings.file_logging_enabled {
        std::fs::create_dir_all(&directory)?;
        let appender =
            RollingFileAppender::new(rotation(settings), &directory, &settings.file_name_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(level_filter(settings))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if settings.file_logging_enabled {
        tracing::info!("Logging to {}", directory.display());
    } else {
        tracing::info!("Logging initialized (console only)");
    }

    Ok(LoggingGuard { _guards: guards })
}
