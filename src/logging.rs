use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

/// Rotation named in config; anything unrecognised means a single file
fn rotation(name: &str) -> Rotation {
    match name {
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// Default directives when `RUST_LOG` is unset.
///
/// sqlx logs every statement at info, so it is held at warn.
fn default_directives(config: &AppConfig) -> String {
    format!("{},sqlx=warn", config.log_level)
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process or buffered file
/// output is lost.
pub fn init_logging(config: &AppConfig) -> anyhow::Result<WorkerGuard> {
    let file_appender = RollingFileAppender::builder()
        .rotation(rotation(&config.rotation))
        .filename_prefix(&config.log_file)
        .build(&config.log_dir)
        .with_context(|| format!("Failed to open log directory: {}", config.log_dir))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        // Transfer ids and keys are event fields; keep them top-level for log queries
        let file_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry
            .with(file_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry
            .with(file_layer)
            .with(stdout_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("hourly"), Rotation::HOURLY);
        assert_eq!(rotation("daily"), Rotation::DAILY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("weekly"), Rotation::NEVER);
    }

    #[test]
    fn test_default_directives_quiet_sqlx() {
        let config = AppConfig {
            log_level: "debug".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(default_directives(&config), "debug,sqlx=warn");
        assert!(EnvFilter::try_new(default_directives(&config)).is_ok());
    }
}
