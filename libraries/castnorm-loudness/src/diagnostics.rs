//! Diagnostic channel capture
//!
//! The engine reports its loudness summary only as diagnostic text. A
//! [`DiagnosticsSink`] receives every diagnostic line; while a [`Capture`] is
//! active the lines are also buffered so the summary can be recovered.
//!
//! The sink is an explicit object owned by one normaliser rather than a
//! process-wide hook, so independent runs never share a capture buffer.
//!
//! # Example
//!
//! ```
//! use castnorm_loudness::{DiagnosticsSink, LogLevel};
//!
//! let sink = DiagnosticsSink::new(LogLevel::Warning);
//! let capture = sink.begin_capture();
//! sink.log(LogLevel::Info, "captured while armed");
//! let text = capture.finish();
//!
//! assert!(text.contains("captured while armed"));
//! assert_eq!(sink.level(), LogLevel::Warning);
//! ```

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, trace, warn};

/// Verbosity of engine diagnostics, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Quiet,
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
}

impl LogLevel {
    /// Parse from string (for settings persistence)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "quiet" | "off" | "none" => Some(Self::Quiet),
            "error" => Some(Self::Error),
            "warning" | "warn" => Some(Self::Warning),
            "info" => Some(Self::Info),
            "verbose" => Some(Self::Verbose),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct CaptureState {
    buffer: String,
    capturing: bool,
    level: LogLevel,
    saved_level: Option<LogLevel>,
}

/// Receiver for engine diagnostics with scoped capture
///
/// Cloning yields another handle to the same sink.
#[derive(Debug, Clone)]
pub struct DiagnosticsSink {
    state: Arc<Mutex<CaptureState>>,
}

impl DiagnosticsSink {
    pub fn new(level: LogLevel) -> Self {
        Self {
            state: Arc::new(Mutex::new(CaptureState {
                buffer: String::new(),
                capturing: false,
                level,
                saved_level: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current verbosity
    pub fn level(&self) -> LogLevel {
        self.lock().level
    }

    /// Change verbosity, returning the previous level
    pub fn set_level(&self, level: LogLevel) -> LogLevel {
        std::mem::replace(&mut self.lock().level, level)
    }

    /// Whether a capture is currently armed
    pub fn is_capturing(&self) -> bool {
        self.lock().capturing
    }

    /// Record one diagnostic message
    ///
    /// Messages more verbose than the current level are dropped. Accepted
    /// messages are buffered while capturing and always forwarded to tracing.
    pub fn log(&self, level: LogLevel, message: &str) {
        if level == LogLevel::Quiet {
            return;
        }

        {
            let mut state = self.lock();
            if level > state.level {
                return;
            }
            if state.capturing {
                state.buffer.push_str(message);
                if !message.ends_with('\n') {
                    state.buffer.push('\n');
                }
            }
        }

        let message = message.trim_end();
        match level {
            LogLevel::Quiet => {}
            LogLevel::Error => error!(target: "castnorm_loudness::engine", "{}", message),
            LogLevel::Warning => warn!(target: "castnorm_loudness::engine", "{}", message),
            LogLevel::Info | LogLevel::Verbose => {
                debug!(target: "castnorm_loudness::engine", "{}", message)
            }
            LogLevel::Debug => trace!(target: "castnorm_loudness::engine", "{}", message),
        }
    }

    /// Reset and arm the capture buffer, raising verbosity to at least Info
    ///
    /// The previous verbosity is restored when the returned guard is finished
    /// or dropped.
    pub fn begin_capture(&self) -> Capture<'_> {
        let mut state = self.lock();
        state.buffer.clear();
        if !state.capturing {
            state.saved_level = Some(state.level);
        }
        state.capturing = true;
        state.level = state.level.max(LogLevel::Info);
        drop(state);

        Capture {
            sink: self,
            finished: false,
        }
    }

    fn end_capture(&self) -> String {
        let mut state = self.lock();
        state.capturing = false;
        if let Some(level) = state.saved_level.take() {
            state.level = level;
        }
        std::mem::take(&mut state.buffer)
    }
}

impl Default for DiagnosticsSink {
    fn default() -> Self {
        Self::new(LogLevel::Warning)
    }
}

/// An armed capture; disarms and restores verbosity on finish or drop
#[must_use = "dropping a capture discards the captured diagnostics"]
pub struct Capture<'a> {
    sink: &'a DiagnosticsSink,
    finished: bool,
}

impl Capture<'_> {
    /// Disarm, restore verbosity and return the captured text
    pub fn finish(mut self) -> String {
        self.finished = true;
        self.sink.end_capture()
    }
}

impl Drop for Capture<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.sink.end_capture();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_outside_capture_are_not_buffered() {
        let sink = DiagnosticsSink::new(LogLevel::Info);
        sink.log(LogLevel::Info, "before");

        let capture = sink.begin_capture();
        sink.log(LogLevel::Info, "during");
        let text = capture.finish();

        assert_eq!(text, "during\n");
    }

    #[test]
    fn test_capture_raises_and_restores_level() {
        let sink = DiagnosticsSink::new(LogLevel::Error);
        let capture = sink.begin_capture();
        assert_eq!(sink.level(), LogLevel::Info);
        assert!(sink.is_capturing());

        sink.log(LogLevel::Debug, "too verbose");
        let text = capture.finish();

        assert!(text.is_empty());
        assert_eq!(sink.level(), LogLevel::Error);
        assert!(!sink.is_capturing());
    }

    #[test]
    fn test_capture_keeps_higher_verbosity() {
        let sink = DiagnosticsSink::new(LogLevel::Debug);
        let capture = sink.begin_capture();
        assert_eq!(sink.level(), LogLevel::Debug);
        drop(capture);
        assert_eq!(sink.level(), LogLevel::Debug);
    }

    #[test]
    fn test_drop_restores_on_early_return() {
        fn failing_pass(sink: &DiagnosticsSink) -> Result<(), &'static str> {
            let _capture = sink.begin_capture();
            sink.log(LogLevel::Info, "partial");
            Err("engine failed")
        }

        let sink = DiagnosticsSink::new(LogLevel::Quiet);
        assert!(failing_pass(&sink).is_err());
        assert_eq!(sink.level(), LogLevel::Quiet);
        assert!(!sink.is_capturing());

        // Next capture starts from an empty buffer
        let text = sink.begin_capture().finish();
        assert!(text.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let sink = DiagnosticsSink::new(LogLevel::Warning);
        let engine_side = sink.clone();

        let capture = sink.begin_capture();
        engine_side.log(LogLevel::Info, "{\"x\": 1}");
        assert!(capture.finish().contains("\"x\""));
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(LogLevel::from_str("WARN"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::from_str("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("loud"), None);
        assert!(LogLevel::Error < LogLevel::Info);
    }
}
