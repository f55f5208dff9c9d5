//! Audio filtering engine interface
//!
//! The normaliser never touches samples itself. It hands a textual filter
//! chain (see [`crate::filter_spec`]) and a frame stream to a [`FilterEngine`],
//! and reads back filtered frames carrying per-frame measurement metadata.
//!
//! ```text
//! AudioSource ──► FilterGraph::push(Some(frame)) ──► AudioSink
//!                 FilterGraph::push(None)   (flush lookahead state)
//!                        │
//!                        ▼
//!                 DiagnosticsSink (loudness summary on completion)
//! ```

use crate::diagnostics::DiagnosticsSink;
use crate::error::EngineError;
use crate::snapshot::SpectralSnapshot;
use std::fmt;

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Sample rate and channel layout of a frame stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz, {} ch", self.sample_rate, self.channels)
    }
}

/// Measurement values attached to a frame by instrumentation filters
///
/// Loudness values are cumulative from the start of the stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    pub momentary_lufs: Option<f64>,
    pub shortterm_lufs: Option<f64>,
    pub integrated_lufs: Option<f64>,
    pub loudness_range_lu: Option<f64>,
    pub threshold_lufs: Option<f64>,
    pub true_peak_dbtp: Option<f64>,
    pub sample_peak_dbfs: Option<f64>,
    pub rms_dbfs: Option<f64>,
    pub dynamic_range_db: Option<f64>,
    pub noise_floor_db: Option<f64>,
    pub spectral: Option<SpectralSnapshot>,
}

/// A block of interleaved `f32` samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub format: AudioFormat,
    pub samples: Vec<f32>,
    pub metadata: FrameMetadata,
}

impl AudioFrame {
    pub fn new(format: AudioFormat, samples: Vec<f32>) -> Self {
        Self {
            format,
            samples,
            metadata: FrameMetadata::default(),
        }
    }

    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.format.channels == 0 {
            0
        } else {
            self.samples.len() / self.format.channels as usize
        }
    }
}

/// A rewindable stream of audio frames
pub trait AudioSource {
    /// Format of every frame this source yields
    fn format(&self) -> AudioFormat;

    /// Next frame, or `None` at end of stream
    fn read_frame(&mut self) -> EngineResult<Option<AudioFrame>>;

    /// Restart from the beginning of the stream
    fn rewind(&mut self) -> EngineResult<()>;

    /// Total sample frames, when known; used only for progress reporting
    fn total_frames(&self) -> Option<u64> {
        None
    }
}

/// Destination for processed frames
///
/// Writes are provisional until [`AudioSink::commit`]; [`AudioSink::discard`]
/// must leave any pre-existing output untouched.
pub trait AudioSink {
    fn write_frame(&mut self, frame: &AudioFrame) -> EngineResult<()>;

    /// Make the written output visible at its final destination
    fn commit(&mut self) -> EngineResult<()>;

    /// Drop everything written so far
    fn discard(&mut self);
}

/// An instantiated filter chain
pub trait FilterGraph {
    /// Feed one frame, or `None` to flush lookahead state at end of stream
    fn push(&mut self, frame: Option<AudioFrame>) -> EngineResult<Vec<AudioFrame>>;
}

/// Executes textual filter chains against frame streams
pub trait FilterEngine {
    /// Build a graph for `spec` accepting frames of `input`
    ///
    /// Filters report diagnostics, including their loudness summary, through
    /// `diagnostics`.
    fn open(
        &self,
        spec: &str,
        input: AudioFormat,
        diagnostics: DiagnosticsSink,
    ) -> EngineResult<Box<dyn FilterGraph>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_count() {
        let frame = AudioFrame::new(AudioFormat::new(48000, 2), vec![0.0; 960]);
        assert_eq!(frame.frames(), 480);

        let empty = AudioFrame::new(AudioFormat::new(48000, 0), vec![0.0; 4]);
        assert_eq!(empty.frames(), 0);
    }
}
