//! Tagged leveled logger (C9, §4.9).
//!
//! Log lines carry `(timestamp, tag, level, message)`. The level filter is
//! runtime-settable; below it, a log call costs nothing beyond the
//! comparison. At or above it, formatting reuses one internal buffer per
//! `Logger` rather than allocating per call.

use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Success,
    Warn,
    Error,
}

impl Level {
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Success => "SUCCESS",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    /// Lenient parse, falling back to `Info` on anything unrecognized —
    /// the same loose, env-driven parsing style the runtime mode switch
    /// uses elsewhere in this stack.
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Level::Debug,
            "warn" | "warning" => Level::Warn,
            "error" | "err" => Level::Error,
            "success" | "ok" => Level::Success,
            _ => Level::Info,
        }
    }
}

/// Where formatted lines go. Production uses [`StderrSink`]; tests use a
/// buffer so emitted lines can be asserted on.
pub trait LogSink {
    fn write_line(&mut self, line: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&mut self, line: &str) {
        eprintln!("{line}");
    }
}

#[derive(Debug, Default)]
pub struct BufferSink {
    pub lines: Vec<String>,
}

impl LogSink for BufferSink {
    fn write_line(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }
}

pub struct Logger<S: LogSink> {
    filter: Level,
    sink: S,
    scratch: String,
}

impl<S: LogSink> Logger<S> {
    pub fn new(filter: Level, sink: S) -> Self {
        Self { filter, sink, scratch: String::with_capacity(128) }
    }

    pub fn set_filter(&mut self, filter: Level) {
        self.filter = filter;
    }

    pub fn filter(&self) -> Level {
        self.filter
    }

    pub fn log(&mut self, tag: &str, level: Level, message: std::fmt::Arguments<'_>) {
        if level < self.filter {
            return;
        }
        self.scratch.clear();
        use std::fmt::Write;
        let _ = write!(self.scratch, "[{}] {:>5} {tag}: {message}", now_ms(), level.as_str());
        self.sink.write_line(&self.scratch);
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Shorthand macros mirroring the component's own call sites
/// (`log_debug!(logger, "acq", "polling {n} registers", n = selection.len())`).
#[macro_export]
macro_rules! log_at {
    ($logger:expr, $level:expr, $tag:expr, $($arg:tt)*) => {
        $logger.log($tag, $level, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_below_threshold() {
        let mut logger = Logger::new(Level::Warn, BufferSink::default());
        log_at!(logger, Level::Info, "acq", "ignored");
        log_at!(logger, Level::Error, "acq", "kept");
        assert_eq!(logger.sink.lines.len(), 1);
        assert!(logger.sink.lines[0].contains("kept"));
    }

    #[test]
    fn filter_is_runtime_settable() {
        let mut logger = Logger::new(Level::Error, BufferSink::default());
        log_at!(logger, Level::Info, "ota", "still ignored");
        logger.set_filter(Level::Debug);
        log_at!(logger, Level::Info, "ota", "now kept");
        assert_eq!(logger.sink.lines.len(), 1);
    }

    #[test]
    fn loose_parsing_falls_back_to_info() {
        assert_eq!(Level::from_str_loose("WARN"), Level::Warn);
        assert_eq!(Level::from_str_loose("bogus"), Level::Info);
    }
}
