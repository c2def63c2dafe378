use std::path::PathBuf;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "roundtable.log";

/// Process-wide log output
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset, e.g. `info` or `roundtable_core=debug`
    pub level: String,
    pub json: bool,
    /// Write to a daily-rolling file here instead of stderr
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

impl LoggingConfig {
    /// Reads `ROUNDTABLE_LOG_LEVEL`, `ROUNDTABLE_LOG_JSON` and `ROUNDTABLE_LOG_DIR`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(level) = lookup("ROUNDTABLE_LOG_LEVEL").filter(|v| !v.trim().is_empty()) {
            config.level = level.trim().to_string();
        }
        if let Some(json) = lookup("ROUNDTABLE_LOG_JSON") {
            config.json = matches!(json.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        config.directory = lookup("ROUNDTABLE_LOG_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        config
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for as long as the process logs to a file;
/// dropping it flushes and stops the background writer.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid log filter '{}'", config.level))?,
    };

    let (writer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {:?}", dir))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let output = if config.json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer()
            .with_ansi(config.directory.is_none())
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(guard)
}
