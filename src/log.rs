//! Structured file logging for cadence sessions.
//!
//! Log levels:
//! - ERROR: Failures that stop a session operation (store writes, merges)
//! - WARN: Surfaced blockers (aborted tasks, merge conflicts, breaker trips)
//! - INFO: Session lifecycle, dispatches, verdicts, escalations
//! - DEBUG: Policy decisions, workspace operations, replay details
//! - TRACE: Raw worker and validator payloads
//!
//! Debug mode can be enabled with `--debug` flag or `CADENCE_DEBUG=1` env var.
//! While a session is attached, lines carry its short id and are copied to
//! the session's own `session.log`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::session::SessionId;

/// Per-session log file, kept in the session's store directory.
pub const SESSION_LOG: &str = "session.log";

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static SESSION: Mutex<Option<SessionLog>> = Mutex::new(None);

struct SessionLog {
    tag: String,
    path: PathBuf,
}

/// Log levels for filtering messages.
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
}

/// Initialize logging to ~/.cadence/cadence.log.
pub fn init(debug: bool) {
    let env_debug = std::env::var("CADENCE_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let level = if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".cadence")) {
        let _ = std::fs::create_dir_all(&dir);
        LOG_PATH.set(dir.join("cadence.log")).ok();
    }
}

/// Tag every following line with the session and copy it to
/// `<dir>/session.log`.
pub fn attach_session(id: &SessionId, dir: &Path) {
    if let Ok(mut session) = SESSION.lock() {
        *session = Some(SessionLog {
            tag: id.short(),
            path: dir.join(SESSION_LOG),
        });
    }
}

pub fn detach_session() {
    if let Ok(mut session) = SESSION.lock() {
        *session = None;
    }
}

fn threshold() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

fn append(path: &Path, line: &str) {
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", line);
    }
}

/// Write `msg` if `level` passes the filter.
pub fn log_at(level: LogLevel, msg: &str) {
    if level > threshold() {
        return;
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let session = SESSION
        .lock()
        .ok()
        .and_then(|s| s.as_ref().map(|s| (s.tag.clone(), s.path.clone())));
    let line = match &session {
        Some((tag, _)) => format!("[{}] [{}] [{}] {}", timestamp, level.as_str(), tag, msg),
        None => format!("[{}] [{}] {}", timestamp, level.as_str(), msg),
    };

    if let Some(path) = LOG_PATH.get() {
        append(path, &line);
    }
    if let Some((_, path)) = &session {
        append(path, &line);
    }
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

/// Log macro for ERROR level.
#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Log macro for DEBUG level (only logs when debug mode is enabled).
#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

/// Log macro for TRACE level.
#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
    };
}
