//! Two-pass loudness normalisation for spoken-word audio
//!
//! This crate provides:
//! - Gain, linear-mode target and limiter ceiling calculators
//! - Limiter tuning from spectral statistics
//! - A typed filter-chain description and its textual rendering
//! - Diagnostic capture for recovering the engine's loudness summary
//! - The measure / decide / apply / validate orchestrator
//!
//! Audio processing itself is delegated to a [`FilterEngine`]; the
//! `castnorm-engine` crate provides a native one.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌───────────────┐
//! │ AudioSource │ ──► │ Measure pass │ ──► │  Snapshot     │
//! └─────────────┘     └──────────────┘     └───────────────┘
//!                                                 │
//!                                                 ▼
//!                     ┌──────────────┐     ┌───────────────┐
//!                     │ Tuner        │ ◄── │  Calculators  │
//!                     └──────────────┘     └───────────────┘
//!                            │
//!                            ▼
//! ┌─────────────┐     ┌──────────────┐     ┌───────────────┐
//! │ AudioSource │ ──► │ Apply pass   │ ──► │  AudioSink    │
//! └─────────────┘     └──────────────┘     └───────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use castnorm_loudness::{NormalisationConfig, Normaliser};
//!
//! let config = NormalisationConfig::load(None)?;
//! let mut normaliser = Normaliser::new(engine, config);
//! let result = normaliser.normalise(&mut source, &mut sink, None)?;
//!
//! println!("Output: {:.2} LUFS ({:+.2} dB)", result.output_i, result.gain_applied_db);
//! ```

#![deny(unsafe_code)]

pub mod calculator;
pub mod config;
pub mod diagnostics;
pub mod engine;
mod error;
pub mod filter_spec;
pub mod normaliser;
pub mod snapshot;
pub mod tuner;

pub use calculator::{
    calculate_gain, calculate_limiter_ceiling, calculate_linear_mode_target, max_linear_target,
    GainDecision, LimiterDecision, LinearModeDecision, LIMITER_FLOOR_DBTP,
    LIMITER_SAFETY_MARGIN_DB, LINEAR_SAFETY_MARGIN_DB,
};
pub use config::{LimiterSettings, NormalisationConfig, NormalisationTargets, OutputSettings};
pub use diagnostics::{Capture, DiagnosticsSink, LogLevel};
pub use engine::{
    AudioFormat, AudioFrame, AudioSink, AudioSource, EngineResult, FilterEngine, FilterGraph,
    FrameMetadata,
};
pub use error::{EngineError, NormaliseError, Result};
pub use filter_spec::{FilterChain, FilterStage};
pub use normaliser::{NormalisationResult, NormaliseState, Normaliser, Progress};
pub use snapshot::{
    LoudnormSummary, MeasurementSnapshot, MetadataAccumulator, SpectralSnapshot,
    SILENCE_FLOOR_LUFS,
};
pub use tuner::{tune_limiter, LimiterParams};
