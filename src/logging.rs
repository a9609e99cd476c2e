//! Tracing subscriber setup
//!
//! Console output always; an optional daily-rotated file when a log directory
//! is configured and writable. Worker processes log to stderr only because
//! their stdout carries the health channel.

use crate::config::LoggingConfig;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_FILE_NAME: &str = "dexsup.log";

/// Where console output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Supervisor: stdout, plus the optional file
    Supervisor,
    /// Worker: stderr only
    Worker,
}

/// Keeps the non-blocking file writer flushing; hold it until exit
#[must_use]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(format!("{},dexsup=debug", config.level))
            .unwrap_or_else(|_| EnvFilter::new("info,dexsup=debug"))
    })
}

/// Check the directory can hold a log file before handing it to the appender
fn writable_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".dexsup_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Install the global subscriber; repeated calls are no-ops
pub fn init_logging(config: &LoggingConfig, target: LogTarget) -> LogGuard {
    let filter = env_filter(config);

    let console_layer = match (target, config.json) {
        (LogTarget::Worker, true) => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        (LogTarget::Worker, false) => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(true)
            .boxed(),
        (LogTarget::Supervisor, true) => tracing_subscriber::fmt::layer().json().boxed(),
        (LogTarget::Supervisor, false) => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
    };

    let mut guard = None;
    let file_layer = match (target, config.dir.as_deref()) {
        (LogTarget::Supervisor, Some(dir)) => match writable_dir(Path::new(dir)) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
                let (writer, file_guard) = tracing_appender::non_blocking(appender);
                guard = Some(file_guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!("Warning: cannot write to log directory {dir} ({e}), file logging disabled");
                None
            }
        },
        _ => None,
    };

    let file_logging = file_layer.is_some();
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed && file_logging {
        if let Some(dir) = &config.dir {
            tracing::info!(path = %Path::new(dir).join(LOG_FILE_NAME).display(), "File logging enabled");
        }
    }

    LogGuard { _file: guard }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writable_dir_creates_missing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("logs").join("dexsup");
        writable_dir(&nested).unwrap();
        assert!(nested.is_dir());
        assert!(!nested.join(".dexsup_write_test").exists());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let tmp = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            level: "warn".to_string(),
            json: false,
            dir: Some(tmp.path().display().to_string()),
        };
        let _first = init_logging(&config, LogTarget::Supervisor);
        let _second = init_logging(&config, LogTarget::Worker);
    }
}
