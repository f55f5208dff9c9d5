//! Frame sources and sinks
//!
//! - [`MemorySource`] / [`MemorySink`]: interleaved buffers held in memory
//! - [`WavSource`] / [`WavSink`]: WAV files via hound; the sink writes to a
//!   temporary file next to the target and renames it into place on commit

use castnorm_loudness::{
    AudioFormat, AudioFrame, AudioSink, AudioSource, EngineError, EngineResult,
};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Source frames are 100 ms long
fn chunk_frames(format: AudioFormat) -> usize {
    (format.sample_rate as usize / 10).max(1)
}

fn wav_error(err: hound::Error) -> EngineError {
    match err {
        hound::Error::IoError(e) => EngineError::Io(e),
        other => EngineError::graph(format!("WAV error: {}", other)),
    }
}

/// Interleaved samples served as a rewindable stream
#[derive(Debug, Clone)]
pub struct MemorySource {
    format: AudioFormat,
    samples: Vec<f32>,
    position: usize,
}

impl MemorySource {
    pub fn new(format: AudioFormat, samples: Vec<f32>) -> Self {
        Self {
            format,
            samples,
            position: 0,
        }
    }
}

impl AudioSource for MemorySource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_frame(&mut self) -> EngineResult<Option<AudioFrame>> {
        if self.position >= self.samples.len() {
            return Ok(None);
        }
        let len = chunk_frames(self.format) * self.format.channels as usize;
        let end = (self.position + len).min(self.samples.len());
        let frame = AudioFrame::new(self.format, self.samples[self.position..end].to_vec());
        self.position = end;
        Ok(Some(frame))
    }

    fn rewind(&mut self) -> EngineResult<()> {
        self.position = 0;
        Ok(())
    }

    fn total_frames(&self) -> Option<u64> {
        if self.format.channels == 0 {
            return None;
        }
        Some((self.samples.len() / self.format.channels as usize) as u64)
    }
}

/// Collects written frames in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    frames: Vec<AudioFrame>,
    committed: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    /// All written samples, interleaved
    pub fn samples(&self) -> Vec<f32> {
        self.frames
            .iter()
            .flat_map(|f| f.samples.iter().copied())
            .collect()
    }

    /// Format of the written frames, if any were written
    pub fn format(&self) -> Option<AudioFormat> {
        self.frames.first().map(|f| f.format)
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

impl AudioSink for MemorySink {
    fn write_frame(&mut self, frame: &AudioFrame) -> EngineResult<()> {
        self.frames.push(frame.clone());
        Ok(())
    }

    fn commit(&mut self) -> EngineResult<()> {
        self.committed = true;
        Ok(())
    }

    fn discard(&mut self) {
        self.frames.clear();
        self.committed = false;
    }
}

/// Streams a WAV file as normalised `f32` frames
pub struct WavSource {
    reader: WavReader<BufReader<File>>,
    format: AudioFormat,
    sample_format: SampleFormat,
    int_scale: f32,
}

impl WavSource {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let reader = WavReader::open(path).map_err(wav_error)?;
        let spec = reader.spec();
        if spec.channels == 0 || spec.sample_rate == 0 {
            return Err(EngineError::graph(format!(
                "{}: unsupported WAV format",
                path.display()
            )));
        }

        debug!(
            "Opened {}: {} Hz, {} ch, {} bit {:?}",
            path.display(),
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample,
            spec.sample_format
        );

        Ok(Self {
            reader,
            format: AudioFormat::new(spec.sample_rate, spec.channels),
            sample_format: spec.sample_format,
            int_scale: (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32,
        })
    }
}

impl AudioSource for WavSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_frame(&mut self) -> EngineResult<Option<AudioFrame>> {
        let len = chunk_frames(self.format) * self.format.channels as usize;
        let samples: Vec<f32> = match self.sample_format {
            SampleFormat::Float => self
                .reader
                .samples::<f32>()
                .take(len)
                .collect::<Result<_, _>>()
                .map_err(wav_error)?,
            SampleFormat::Int => {
                let scale = self.int_scale;
                self.reader
                    .samples::<i32>()
                    .take(len)
                    .map(|s| s.map(|s| s as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(wav_error)?
            }
        };

        if samples.is_empty() {
            return Ok(None);
        }
        Ok(Some(AudioFrame::new(self.format, samples)))
    }

    fn rewind(&mut self) -> EngineResult<()> {
        self.reader.seek(0)?;
        Ok(())
    }

    fn total_frames(&self) -> Option<u64> {
        Some(u64::from(self.reader.duration()))
    }
}

/// Sample encoding of files written by [`WavSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WavEncoding {
    #[default]
    Float32,
    Pcm16,
}

struct PendingWav {
    writer: WavWriter<BufWriter<File>>,
    temp: NamedTempFile,
}

/// Writes frames to a WAV file, replacing the target only on commit
pub struct WavSink {
    target: PathBuf,
    encoding: WavEncoding,
    pending: Option<PendingWav>,
}

impl WavSink {
    pub fn new(target: impl Into<PathBuf>, encoding: WavEncoding) -> Self {
        Self {
            target: target.into(),
            encoding,
            pending: None,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    fn start(&self, format: AudioFormat) -> EngineResult<PendingWav> {
        let dir = match self.target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = NamedTempFile::new_in(&dir)?;

        let (bits_per_sample, sample_format) = match self.encoding {
            WavEncoding::Float32 => (32, SampleFormat::Float),
            WavEncoding::Pcm16 => (16, SampleFormat::Int),
        };
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample,
            sample_format,
        };
        let writer = WavWriter::new(BufWriter::new(temp.reopen()?), spec).map_err(wav_error)?;

        debug!("Writing {} via {}", self.target.display(), temp.path().display());
        Ok(PendingWav { writer, temp })
    }
}

impl AudioSink for WavSink {
    fn write_frame(&mut self, frame: &AudioFrame) -> EngineResult<()> {
        if self.pending.is_none() {
            self.pending = Some(self.start(frame.format)?);
        }
        let Some(pending) = self.pending.as_mut() else {
            return Err(EngineError::graph("WAV writer unavailable"));
        };

        match self.encoding {
            WavEncoding::Float32 => {
                for &sample in &frame.samples {
                    pending.writer.write_sample(sample).map_err(wav_error)?;
                }
            }
            WavEncoding::Pcm16 => {
                for &sample in &frame.samples {
                    let quantised = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                    pending.writer.write_sample(quantised).map_err(wav_error)?;
                }
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> EngineResult<()> {
        let Some(PendingWav { writer, temp }) = self.pending.take() else {
            return Err(EngineError::graph(format!(
                "no audio written for {}",
                self.target.display()
            )));
        };

        writer.finalize().map_err(wav_error)?;
        temp.persist(&self.target).map_err(|e| EngineError::Io(e.error))?;
        debug!("Committed {}", self.target.display());
        Ok(())
    }

    fn discard(&mut self) {
        // Dropping the temporary file removes it
        self.pending = None;
    }
}
