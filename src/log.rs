//! Leveled file logging for polyphon.
//!
//! Log levels:
//! - ERROR: Failures the caller will see (transport errors, halted chains)
//! - WARN: Recoverable conditions (watchdog recoveries, stalls, stale tickets)
//! - INFO: Session and turn lifecycle, group runs, reflection outcomes
//! - DEBUG: Per-event detail (tool counters, queue drains, parser results)
//! - TRACE: Streaming chunks
//!
//! The level comes from `POLYPHON_LOG` (`error`, `warn`, `info`, `debug` or
//! `trace`). `POLYPHON_DEBUG=1` is shorthand for `debug`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::Error;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Resolve the level from `POLYPHON_LOG` and `POLYPHON_DEBUG`.
    fn from_env() -> Self {
        // Unparseable values fall through to the debug switch
        if let Some(level) = std::env::var("POLYPHON_LOG").ok().and_then(|v| v.parse().ok()) {
            return level;
        }
        let debug = std::env::var("POLYPHON_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(Error::Validation(format!("unknown log level '{}'", other))),
        }
    }
}

/// Log to `~/.polyphon/polyphon.log` at the level chosen by the environment.
/// The file is truncated on startup.
pub fn init() {
    match dirs::home_dir() {
        Some(home) => init_at(&home.join(".polyphon").join("polyphon.log"), LogLevel::from_env()),
        None => LOG_LEVEL.store(LogLevel::from_env() as u8, Ordering::SeqCst),
    }
}

/// Log to `path` at `level`. Only the first call picks the file; later calls
/// only change the level.
pub fn init_at(path: &Path, level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
    if LOG_PATH.get().is_some() {
        return;
    }
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let _ = std::fs::write(path, "");
    LOG_PATH.set(path.to_path_buf()).ok();
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Write `msg` if `level` passes the current filter.
///
/// Messages are dropped until [`init`] or [`init_at`] has chosen a file.
pub fn log_at(level_of_msg: LogLevel, msg: &str) {
    if level_of_msg > level() {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level_of_msg.as_str(), msg);
        }
    }
}

#[macro_export]
macro_rules! plog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! plog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! plog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Per-event detail. Written only at `debug` or `trace`.
#[macro_export]
macro_rules! plog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

/// Streaming chunks. Written only at `trace`.
#[macro_export]
macro_rules! plog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
    };
}
