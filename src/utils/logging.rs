use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use time::format_description::well_known::Rfc2822;
use tracing::metadata::LevelFilter;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

pub(crate) struct LoggerConfig {
    pub(crate) print_level: LevelFilter,
    pub(crate) logfile_level: LevelFilter,
    pub(crate) stdout_log: Option<bool>,
    pub(crate) log_path: Option<PathBuf>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        let level = std::env::var("RUSTY_DUCT_LOG_LEVEL").ok()
            .map(|s| LevelFilter::from_str(s.as_str())).and_then(|sr| sr.ok())
            .unwrap_or(
                if cfg!(debug_assertions) {
                    LevelFilter::TRACE
                } else {
                    LevelFilter::INFO
                }
            );
        LoggerConfig {
            print_level: level,
            logfile_level: level,
            stdout_log: None,
            log_path: None,
        }
    }
}

/// Keeps the non-blocking writers alive; dropping it flushes and stops them.
pub(crate) struct LoggerGuard {
    stdout_guard: Option<WorkerGuard>,
    stderr_guard: Option<WorkerGuard>,
    logfile_guard: Option<WorkerGuard>,
}

pub(crate) fn init_logger(config: LoggerConfig) -> Result<LoggerGuard> {
    let mut logger_guard = LoggerGuard {
        stdout_guard: None,
        stderr_guard: None,
        logfile_guard: None,
    };
    // Print to stdout/stderr unless a log file was configured and printing
    // wasn't asked for explicitly
    let stdout_stderr_layer = config.stdout_log.unwrap_or(config.log_path.is_none()).then(|| {
        let time_offset =
            time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
        let timer = fmt::time::OffsetTime::new(time_offset, Rfc2822);
        let (stdout_non_blocking, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
        let (stderr_non_blocking, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
        logger_guard.stdout_guard = Option::from(stdout_guard);
        logger_guard.stderr_guard = Option::from(stderr_guard);
        let stdout_layer = fmt::layer()
            .compact()
            .with_timer(timer.clone())
            .with_writer(stdout_non_blocking.with_min_level(Level::INFO));
        let stderr_layer = fmt::layer()
            .compact()
            .with_timer(timer)
            .with_writer(stderr_non_blocking.with_max_level(Level::WARN));
        stdout_layer.and_then(stderr_layer)
    });
    // A layer that logs events to a file
    let logfile_layer = config.log_path.and_then(|path| {
        let fa = if path.is_dir() {
            rolling::daily(path, "log")
        } else {
            let basename = path.file_name()
                .ok_or(anyhow!("couldn't get basename from: {}", path.display())).ok()?;
            let dirname = path.parent()
                .ok_or(anyhow!("couldn't get dirname from: {}", path.display())).ok()?;
            rolling::never(dirname, basename)
        };
        let (non_blocking_appender, guard) = tracing_appender::non_blocking(fa);
        logger_guard.logfile_guard = Option::from(guard);
        let layer = fmt::layer().compact().with_ansi(false)
            .with_writer(non_blocking_appender);
        Some(layer)
    });

    tracing_subscriber::registry()
        .with(logfile_layer.with_filter(config.logfile_level))
        .with(stdout_stderr_layer.with_filter(config.print_level))
        .init();
    Ok(logger_guard)
}

impl Drop for LoggerGuard {
    fn drop(&mut self) {
        if let Some(g) = self.stdout_guard.take() {
            drop(g);
        }
        if let Some(g) = self.stderr_guard.take() {
            drop(g);
        }
        if let Some(g) = self.logfile_guard.take() {
            drop(g);
        }
    }
}
