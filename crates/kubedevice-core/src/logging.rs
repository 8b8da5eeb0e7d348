//! Injectable leveled logging
//!
//! Components that report diagnostics (allocation failures, ledger
//! violations, plugin lifecycle) receive a [`Logger`] at construction instead
//! of reaching for process-wide log functions. [`TracingLogger`] forwards to
//! `tracing`; [`CapturingLogger`] keeps records in memory.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Severity of a captured record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Leveled logging capability
pub trait Logger: Send + Sync {
    /// Whether messages at this verbosity are emitted
    fn enabled(&self, verbosity: u32) -> bool;

    /// Informational message, dropped above the configured verbosity
    fn log(&self, verbosity: u32, args: fmt::Arguments<'_>);

    fn warn(&self, args: fmt::Arguments<'_>);

    fn error(&self, args: fmt::Arguments<'_>);
}

/// Logger shared between the coordinator and the plugins it hosts
pub type SharedLogger = Arc<dyn Logger>;

/// Forwards leveled messages to `tracing`
///
/// Verbosity 0-2 maps to `info`, 3-4 to `debug` and anything higher to `trace`.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    max_verbosity: u32,
}

impl TracingLogger {
    pub fn new(max_verbosity: u32) -> Self {
        Self { max_verbosity }
    }

    pub fn shared(max_verbosity: u32) -> SharedLogger {
        Arc::new(Self::new(max_verbosity))
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(2)
    }
}

impl Logger for TracingLogger {
    fn enabled(&self, verbosity: u32) -> bool {
        verbosity <= self.max_verbosity
    }

    fn log(&self, verbosity: u32, args: fmt::Arguments<'_>) {
        if !self.enabled(verbosity) {
            return;
        }
        match verbosity {
            0..=2 => tracing::info!("{}", args),
            3 | 4 => tracing::debug!("{}", args),
            _ => tracing::trace!("{}", args),
        }
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!("{}", args);
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!("{}", args);
    }
}

/// A single captured message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub verbosity: u32,
    pub message: String,
}

/// Keeps every emitted message in memory
#[derive(Debug, Default)]
pub struct CapturingLogger {
    max_verbosity: u32,
    records: Mutex<Vec<LogRecord>>,
}

impl CapturingLogger {
    pub fn new(max_verbosity: u32) -> Self {
        Self {
            max_verbosity,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.lock().clone()
    }

    /// Messages recorded at the given level
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|r| r.level == level)
            .map(|r| r.message.clone())
            .collect()
    }

    /// Whether some record at `level` contains `needle`
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.lock()
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }

    fn push(&self, level: LogLevel, verbosity: u32, args: fmt::Arguments<'_>) {
        self.lock().push(LogRecord {
            level,
            verbosity,
            message: args.to_string(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Logger for CapturingLogger {
    fn enabled(&self, verbosity: u32) -> bool {
        verbosity <= self.max_verbosity
    }

    fn log(&self, verbosity: u32, args: fmt::Arguments<'_>) {
        if self.enabled(verbosity) {
            self.push(LogLevel::Info, verbosity, args);
        }
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        self.push(LogLevel::Warning, 0, args);
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        self.push(LogLevel::Error, 0, args);
    }
}
