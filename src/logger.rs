//! Harness logger with verbosity levels and in-memory capture
//!
//! Replay diagnostics are written through a `HarnessLogger` so that tests can
//! capture them instead of scraping stdout. Errors always go to stderr when
//! output is enabled.

use std::cell::{Ref, RefCell};
use std::ops::Deref;

/// Verbosity level for harness output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum VerbosityLevel {
    /// Silent - nothing but the exit code
    Silent = 0,
    /// Minimal - failures and summary statistics
    Minimal = 1,
    /// Normal - one line per replay (default)
    #[default]
    Normal = 2,
    /// Verbose - every action as it is replayed
    Verbose = 3,
}

/// Output destination for log messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Output only to stdout/stderr (default)
    #[default]
    Stdout,
    /// Capture only to in-memory buffer
    Memory,
    /// Both console and in-memory buffer
    Both,
}

/// A captured log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: VerbosityLevel,
    pub message: String,
    /// True for error diagnostics
    pub error: bool,
}

/// Guard type that provides read-only access to captured entries
pub struct LogGuard<'a> {
    guard: Ref<'a, Vec<LogEntry>>,
}

impl<'a> Deref for LogGuard<'a> {
    type Target = [LogEntry];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

pub struct HarnessLogger {
    verbosity: VerbosityLevel,
    output_mode: OutputMode,
    log_buffer: RefCell<Vec<LogEntry>>,
}

impl HarnessLogger {
    /// Create a new logger with default verbosity (Normal)
    pub fn new() -> Self {
        Self::with_verbosity(VerbosityLevel::default())
    }

    pub fn with_verbosity(verbosity: VerbosityLevel) -> Self {
        HarnessLogger {
            verbosity,
            output_mode: OutputMode::default(),
            log_buffer: RefCell::new(Vec::new()),
        }
    }

    /// Logger that only records into memory, used by tests
    pub fn capturing() -> Self {
        let mut logger = Self::with_verbosity(VerbosityLevel::Verbose);
        logger.output_mode = OutputMode::Memory;
        logger
    }

    pub fn set_output_mode(&mut self, mode: OutputMode) {
        self.output_mode = mode;
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        self.verbosity
    }

    pub fn set_verbosity(&mut self, verbosity: VerbosityLevel) {
        self.verbosity = verbosity;
    }

    /// Captured entries
    ///
    /// Returns a guard that derefs to `[LogEntry]`.
    pub fn logs(&self) -> LogGuard<'_> {
        LogGuard {
            guard: self.log_buffer.borrow(),
        }
    }

    /// True if any captured message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.log_buffer
            .borrow()
            .iter()
            .any(|entry| entry.message.contains(needle))
    }

    pub fn clear_logs(&self) {
        self.log_buffer.borrow_mut().clear();
    }

    /// Error diagnostic, shown at Minimal verbosity and above
    pub fn error(&self, message: &str) {
        self.emit(VerbosityLevel::Minimal, message, true);
    }

    #[inline]
    pub fn minimal(&self, message: &str) {
        self.emit(VerbosityLevel::Minimal, message, false);
    }

    #[inline]
    pub fn normal(&self, message: &str) {
        self.emit(VerbosityLevel::Normal, message, false);
    }

    #[inline]
    pub fn verbose(&self, message: &str) {
        self.emit(VerbosityLevel::Verbose, message, false);
    }

    fn emit(&self, level: VerbosityLevel, message: &str, error: bool) {
        let should_capture = matches!(self.output_mode, OutputMode::Memory | OutputMode::Both);
        let should_output = matches!(self.output_mode, OutputMode::Stdout | OutputMode::Both);

        if level > self.verbosity && !should_capture {
            return;
        }

        if should_capture {
            self.log_buffer.borrow_mut().push(LogEntry {
                level,
                message: message.to_string(),
                error,
            });
        }

        if should_output && level <= self.verbosity {
            if error {
                eprintln!("{}", message);
            } else {
                println!("{}", message);
            }
        }
    }
}

impl Default for HarnessLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HarnessLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessLogger")
            .field("verbosity", &self.verbosity)
            .field("output_mode", &self.output_mode)
            .field("log_count", &self.log_buffer.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_creation() {
        let logger = HarnessLogger::new();
        assert_eq!(logger.verbosity(), VerbosityLevel::Normal);
        assert_eq!(logger.output_mode(), OutputMode::Stdout);
    }

    #[test]
    fn test_log_capture() {
        let logger = HarnessLogger::capturing();

        logger.normal("Testing a.json");
        logger.error("[3]: Packets have different lengths: 4 vs 5");

        let logs = logger.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "Testing a.json");
        assert!(!logs[0].error);
        assert!(logs[1].error);
        assert_eq!(logs[1].level, VerbosityLevel::Minimal);
    }

    #[test]
    fn test_capture_ignores_verbosity() {
        let mut logger = HarnessLogger::capturing();
        logger.set_verbosity(VerbosityLevel::Silent);

        logger.verbose("[0]: send 4 bytes to player 1");
        assert!(logger.contains("send 4 bytes"));
    }

    #[test]
    fn test_clear_logs() {
        let logger = HarnessLogger::capturing();
        logger.minimal("Passed: 1/1");
        assert_eq!(logger.logs().len(), 1);

        logger.clear_logs();
        assert!(logger.logs().is_empty());
    }
}
