//! Error types for loudness normalisation

use thiserror::Error;

/// Result type for normalisation operations
pub type Result<T> = std::result::Result<T, NormaliseError>;

/// Errors that terminate a normalisation run
#[derive(Error, Debug)]
pub enum NormaliseError {
    /// Measured loudness is `-inf` or below the silence floor
    #[error("Audio is silent or below the -70 LUFS floor (measured {loudness} LUFS)")]
    SilentAudio { loudness: f64 },

    /// The measurement pass produced no usable loudness summary
    #[error("Loudness measurement failed: {0}")]
    Measurement(String),

    /// The apply pass failed; any partial output has been discarded
    #[error("Failed to apply normalisation: {0}")]
    Apply(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// A target value is outside the range the engine accepts
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for NormaliseError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Errors raised by an audio filtering engine or its frame sources and sinks
#[derive(Error, Debug)]
pub enum EngineError {
    /// The filter-chain text could not be parsed
    #[error("Invalid filter chain '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    /// The chain names a filter the engine does not provide
    #[error("Unknown filter: {0}")]
    UnknownFilter(String),

    /// A filter failed while processing frames
    #[error("Filter graph error: {0}")]
    Graph(String),

    /// A frame did not match the format the graph was opened with
    #[error("Frame format mismatch: expected {expected}, got {actual}")]
    FormatMismatch { expected: String, actual: String },

    /// Reading or writing audio failed
    #[error("Engine IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for a graph failure
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph(message.into())
    }
}
