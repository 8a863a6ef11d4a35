//! Leveled file logging for warden.
//!
//! Log levels:
//! - ERROR: failures that stop an operation (delivery given up, state not saved)
//! - WARN: recoverable surprises (source degraded, instruction not delivered)
//! - INFO: lifecycle lines (startup, each tick, escalations, completions)
//! - DEBUG: per-envelope and per-pass detail
//! - TRACE: per-poll chatter
//!
//! `--debug` or `WARDEN_DEBUG=1` selects DEBUG. `WARDEN_LOG_LEVEL` names any
//! level and wins over both. The loop runs for days, so lines carry the date.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);
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
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Level chosen by the debug switch, unless `WARDEN_LOG_LEVEL` names one.
fn initial_level(debug: bool, env_level: Option<&str>) -> LogLevel {
    if let Some(level) = env_level.and_then(|v| v.parse().ok()) {
        return level;
    }
    if debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Initialize logging to `~/.warden/warden.log`, truncating it.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_flag("WARDEN_DEBUG");
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let env_level = std::env::var("WARDEN_LOG_LEVEL").ok();
    set_level(initial_level(debug_enabled, env_level.as_deref()));

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".warden")) {
        let _ = std::fs::create_dir_all(&dir);
        init_at(dir.join("warden.log"));
    }
}

/// Point logging at an explicit file, truncating it. Only the first call wins.
pub fn init_at(path: PathBuf) {
    let _ = std::fs::write(&path, "");
    LOG_PATH.set(path).ok();
}

pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Whether a line at `level` would be written. The macros check this before
/// formatting their arguments.
pub fn enabled(level: LogLevel) -> bool {
    level <= get_level() && LOG_PATH.get().is_some()
}

/// Append one line at `level`.
pub fn write_line(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __wlog_at {
    ($level:expr, $($arg:tt)*) => {
        if $crate::log::enabled($level) {
            $crate::log::write_line($level, &format!($($arg)*));
        }
    };
}

/// Log at INFO level.
#[macro_export]
macro_rules! wlog {
    ($($arg:tt)*) => { $crate::__wlog_at!($crate::log::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! wlog_error {
    ($($arg:tt)*) => { $crate::__wlog_at!($crate::log::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! wlog_warn {
    ($($arg:tt)*) => { $crate::__wlog_at!($crate::log::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! wlog_debug {
    ($($arg:tt)*) => { $crate::__wlog_at!($crate::log::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! wlog_trace {
    ($($arg:tt)*) => { $crate::__wlog_at!($crate::log::LogLevel::Trace, $($arg)*) };
}
