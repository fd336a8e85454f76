//! Level-filtered structured log sink (§4.1).
//!
//! A single process-wide threshold gates emission across every [`Logger`]
//! instance; individual loggers only carry a `tag` used in the output line.
//! Formatted lines are handed to `tracing` so they compose with whatever
//! subscriber the binary installs (see `services/node/src/main.rs`), the
//! same layering `rt_ui_log::UiLogger` used for its buffered sink.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU8, Ordering};

/// `ERROR > WARN > INFO > DEBUG > TRACE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Level {
        match v {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

static THRESHOLD: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Set the process-wide emission threshold. Messages above this level
/// (i.e. more verbose) are dropped by every existing and future [`Logger`].
pub fn set_level(level: Level) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

/// Current process-wide threshold.
pub fn level() -> Level {
    Level::from_u8(THRESHOLD.load(Ordering::Relaxed))
}

/// A tagged sink over the process-wide threshold. Cheap to construct; create
/// one per component (`Logger::new("cluster")`, `Logger::new("wire")`, ...).
#[derive(Debug, Clone)]
pub struct Logger {
    tag: String,
}

impl Logger {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn error(&self, message: impl std::fmt::Display) {
        self.log(Level::Error, message);
    }

    pub fn warn(&self, message: impl std::fmt::Display) {
        self.log(Level::Warn, message);
    }

    pub fn info(&self, message: impl std::fmt::Display) {
        self.log(Level::Info, message);
    }

    pub fn debug(&self, message: impl std::fmt::Display) {
        self.log(Level::Debug, message);
    }

    pub fn trace(&self, message: impl std::fmt::Display) {
        self.log(Level::Trace, message);
    }

    /// Emit at `level`, gated by the process-wide threshold.
    pub fn log(&self, level: Level, message: impl std::fmt::Display) {
        if level > level_threshold() {
            return;
        }
        let line = self.format_line(level, &message);
        emit(level, &line);
    }

    /// Emit at `level` with a non-scalar payload rendered as a separate
    /// structured dump, per §4.1 ("non-scalar arguments are rendered
    /// separately").
    pub fn log_value(&self, level: Level, message: &str, value: &impl Debug) {
        if level > level_threshold() {
            return;
        }
        let line = self.format_line(level, &message);
        emit(level, &line);
        emit(level, &format!("{line} :: {value:?}"));
    }

    fn format_line(&self, level: Level, message: &dyn std::fmt::Display) -> String {
        let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        format!("[{}] [{}] [{}] {}", self.tag, ts, level.as_str(), message)
    }
}

fn level_threshold() -> Level {
    level()
}

fn emit(level: Level, line: &str) {
    match level {
        Level::Error => tracing::error!("{line}"),
        Level::Warn => tracing::warn!("{line}"),
        Level::Info => tracing::info!("{line}"),
        Level::Debug => tracing::debug!("{line}"),
        Level::Trace => tracing::trace!("{line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_matches_spec_shape() {
        let logger = Logger::new("cluster");
        let line = logger.format_line(Level::Info, &"hello");
        assert!(line.starts_with("[cluster] ["));
        assert!(line.contains("] [INFO] hello"));
    }

    #[test]
    fn threshold_gates_emission() {
        set_level(Level::Warn);
        assert!(Level::Error <= level());
        assert!(Level::Info > level());
        set_level(Level::Trace);
        assert!(Level::Trace <= level());
        set_level(Level::Info);
    }

    #[test]
    fn level_ordering_matches_spec() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }
}
