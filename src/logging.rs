//! User-facing log collaborator.
//!
//! Library code reports progress through [`LogSink`] so the host can show
//! messages in its console. Every sink also forwards to `tracing`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Severity of a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Receives `(message, level)` pairs from the pipeline.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// Strips trailing whitespace and control characters (driver logs often end
/// in a NUL byte).
pub fn sanitize_diagnostic(raw: &str) -> String {
    raw.trim_end_matches(|c: char| c.is_whitespace() || c.is_control())
        .trim_start()
        .to_string()
}

fn forward(level: LogLevel, message: &str) {
    match level {
        LogLevel::Info => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}

/// Sink that only forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        forward(level, &sanitize_diagnostic(message));
    }
}

/// A single console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Bounded in-memory console, newest entry first.
pub struct ConsoleLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl ConsoleLog {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot of the console, newest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Number of entries logged at `level`.
    pub fn count(&self, level: LogLevel) -> usize {
        self.entries().iter().filter(|e| e.level == level).count()
    }

    /// The newest entry, if any.
    pub fn latest(&self) -> Option<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.front().cloned(),
            Err(poisoned) => poisoned.into_inner().front().cloned(),
        }
    }
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for ConsoleLog {
    fn log(&self, level: LogLevel, message: &str) {
        let message = sanitize_diagnostic(message);
        forward(level, &message);

        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push_front(LogEntry { level, message });
        entries.truncate(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_trailing_nul() {
        let raw = "ERROR: 0:3: 'oColor' : undeclared identifier\n\u{0}";
        assert_eq!(
            sanitize_diagnostic(raw),
            "ERROR: 0:3: 'oColor' : undeclared identifier"
        );
    }

    #[test]
    fn test_console_keeps_newest_first() {
        let console = ConsoleLog::new();
        console.info("first");
        console.warn("second");

        let entries = console.entries();
        assert_eq!(entries[0].message, "second");
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert_eq!(entries[1].message, "first");
        assert_eq!(console.latest(), Some(entries[0].clone()));
    }

    #[test]
    fn test_console_is_bounded() {
        let console = ConsoleLog::with_capacity(3);
        for i in 0..10 {
            console.info(&format!("line {}", i));
        }

        let entries = console.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "line 9");
        assert_eq!(entries[2].message, "line 7");
    }
}
