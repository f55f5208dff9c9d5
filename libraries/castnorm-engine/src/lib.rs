//! Native filter-chain engine for castnorm
//!
//! Implements [`castnorm_loudness::FilterEngine`] in-process:
//! - `loudnorm`: EBU R128 loudness normalisation (linear or dynamic)
//! - `limiter`: lookahead peak limiter with auto soft-clip
//! - `meter`: EBU R128, amplitude and spectral instrumentation
//! - `aformat`: channel mixing and resampling
//!
//! Frame I/O lives in [`io`]: in-memory buffers and WAV files.
//!
//! # Architecture
//!
//! ```text
//! "limiter=...,loudnorm=...,meter=..."
//!        │ parse_chain
//!        ▼
//! ┌─────────────┐     ┌──────────────┐     ┌───────────────┐
//! │ AudioFrame  │ ──► │ Filter 1..N  │ ──► │ AudioFrame +  │
//! └─────────────┘     └──────────────┘     │ FrameMetadata │
//!                            │             └───────────────┘
//!                            ▼
//!                     DiagnosticsSink (loudnorm summary)
//! ```
//!
//! # Example
//!
//! ```
//! use castnorm_engine::NativeEngine;
//! use castnorm_loudness::{AudioFormat, AudioFrame, DiagnosticsSink, FilterEngine};
//!
//! let engine = NativeEngine::new();
//! let format = AudioFormat::new(48000, 1);
//! let mut graph = engine
//!     .open("meter=peak=true:astats=1:spectral=0", format, DiagnosticsSink::default())
//!     .unwrap();
//!
//! let out = graph.push(Some(AudioFrame::new(format, vec![0.25; 4800]))).unwrap();
//! assert!(out[0].metadata.sample_peak_dbfs.is_some());
//! ```

#![deny(unsafe_code)]

pub mod format;
pub mod io;
pub mod limiter;
pub mod loudnorm;
pub mod meter;

use castnorm_loudness::filter_spec::{parse_chain, FilterNode};
use castnorm_loudness::{
    AudioFormat, AudioFrame, DiagnosticsSink, EngineError, EngineResult, FilterEngine,
    FilterGraph, LogLevel,
};
use std::fmt::Display;
use std::str::FromStr;
use tracing::debug;

pub use format::FormatFilter;
pub use io::{MemorySink, MemorySource, WavEncoding, WavSink, WavSource};
pub use limiter::{LimiterFilter, PeakLimiter};
pub use loudnorm::LoudnormFilter;
pub use meter::MeterFilter;

/// One stage of a native filter graph
pub trait Filter {
    /// Format of the frames this filter emits
    fn output_format(&self) -> AudioFormat;

    /// Process one frame; buffering filters may emit fewer or more frames
    fn process(&mut self, frame: AudioFrame) -> EngineResult<Vec<AudioFrame>>;

    /// Emit everything still buffered at end of stream
    fn flush(&mut self) -> EngineResult<Vec<AudioFrame>>;
}

/// In-process [`FilterEngine`]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeEngine;

impl NativeEngine {
    pub fn new() -> Self {
        Self
    }
}

impl FilterEngine for NativeEngine {
    fn open(
        &self,
        spec: &str,
        input: AudioFormat,
        diagnostics: DiagnosticsSink,
    ) -> EngineResult<Box<dyn FilterGraph>> {
        if input.sample_rate == 0 || input.channels == 0 {
            return Err(EngineError::graph(format!(
                "unsupported input format {}",
                input
            )));
        }

        let nodes = parse_chain(spec)?;
        let mut filters: Vec<Box<dyn Filter>> = Vec::with_capacity(nodes.len());
        let mut format = input;
        for node in &nodes {
            let filter = build_filter(node, format, &diagnostics)?;
            format = filter.output_format();
            filters.push(filter);
        }

        debug!("Opened native graph ({} filters): {}", filters.len(), spec);
        diagnostics.log(
            LogLevel::Verbose,
            &format!("[graph] {} -> {}: {}", input, format, spec),
        );

        Ok(Box::new(NativeGraph {
            input,
            filters,
            flushed: false,
        }))
    }
}

fn build_filter(
    node: &FilterNode,
    input: AudioFormat,
    diagnostics: &DiagnosticsSink,
) -> EngineResult<Box<dyn Filter>> {
    match node.name.as_str() {
        "limiter" => Ok(Box::new(LimiterFilter::from_node(node, input)?)),
        "loudnorm" => Ok(Box::new(LoudnormFilter::from_node(
            node,
            input,
            diagnostics.clone(),
        )?)),
        "meter" => Ok(Box::new(MeterFilter::from_node(node, input)?)),
        "aformat" => Ok(Box::new(FormatFilter::from_node(node, input)?)),
        other => Err(EngineError::UnknownFilter(other.to_string())),
    }
}

/// A chain of native filters fed one frame at a time
struct NativeGraph {
    input: AudioFormat,
    filters: Vec<Box<dyn Filter>>,
    flushed: bool,
}

impl FilterGraph for NativeGraph {
    fn push(&mut self, frame: Option<AudioFrame>) -> EngineResult<Vec<AudioFrame>> {
        if self.flushed {
            return Err(EngineError::graph("graph already flushed"));
        }

        let Some(frame) = frame else {
            self.flushed = true;
            // Each filter sees the tail of its predecessors before its own flush
            let mut pending = Vec::new();
            for filter in &mut self.filters {
                let mut next = Vec::new();
                for frame in pending {
                    next.extend(filter.process(frame)?);
                }
                next.extend(filter.flush()?);
                pending = next;
            }
            return Ok(pending);
        };

        if frame.format != self.input {
            return Err(EngineError::FormatMismatch {
                expected: self.input.to_string(),
                actual: frame.format.to_string(),
            });
        }

        let mut pending = vec![frame];
        for filter in &mut self.filters {
            let mut next = Vec::with_capacity(pending.len());
            for frame in pending {
                next.extend(filter.process(frame)?);
            }
            pending = next;
        }
        Ok(pending)
    }
}

/// Parse an optional typed option of `node`
pub(crate) fn parse_option<T>(node: &FilterNode, key: &str) -> EngineResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    node.option(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| EngineError::InvalidSpec {
                spec: node.name.clone(),
                reason: format!("option {}={}: {}", key, raw, e),
            })
        })
        .transpose()
}

/// Reject `value` unless it lies within `range`
pub(crate) fn check_range(
    node: &FilterNode,
    key: &str,
    value: f64,
    range: std::ops::RangeInclusive<f64>,
) -> EngineResult<f64> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(EngineError::InvalidSpec {
            spec: node.name.clone(),
            reason: format!(
                "{}={} is outside {}..{}",
                key,
                value,
                range.start(),
                range.end()
            ),
        })
    }
}

/// Reject options the filter does not understand
pub(crate) fn check_known_options(node: &FilterNode, known: &[&str]) -> EngineResult<()> {
    match node.options.iter().find(|(k, _)| !known.contains(&k.as_str())) {
        Some((key, _)) => Err(EngineError::InvalidSpec {
            spec: node.name.clone(),
            reason: format!("unknown option '{}'", key),
        }),
        None => Ok(()),
    }
}

pub(crate) fn meter_error(err: ebur128::Error) -> EngineError {
    EngineError::graph(format!("EBU R128 meter failed: {:?}", err))
}

/// Linear amplitude to dB (`-inf` for zero)
pub(crate) fn to_db(linear: f64) -> f64 {
    if linear > 0.0 {
        20.0 * linear.log10()
    } else {
        f64::NEG_INFINITY
    }
}

pub(crate) fn db_to_linear(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}
