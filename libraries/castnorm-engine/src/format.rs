//! `aformat` stage: channel mixing and sample-rate conversion
//!
//! Channels are converted first, then the mixed signal is resampled with
//! rubato. Frames pass through untouched when the format already matches.

use crate::{check_known_options, parse_option, Filter};
use castnorm_loudness::filter_spec::FilterNode;
use castnorm_loudness::{AudioFormat, AudioFrame, EngineError, EngineResult, FrameMetadata};
use rubato::{
    Resampler, SincFixedIn, SincFixedOut, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use std::collections::VecDeque;

/// Frames per rubato chunk
const CHUNK_SIZE: usize = 1024;

enum SincResampler {
    FixedIn(SincFixedIn<f32>),
    FixedOut(SincFixedOut<f32>),
}

impl SincResampler {
    fn new(input_rate: u32, output_rate: u32, channels: usize) -> EngineResult<Self> {
        let ratio = output_rate as f64 / input_rate as f64;
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris,
        };

        if ratio >= 1.0 {
            SincFixedIn::<f32>::new(ratio, 2.0, params, CHUNK_SIZE, channels)
                .map(Self::FixedIn)
                .map_err(|e| EngineError::graph(format!("SincFixedIn creation failed: {}", e)))
        } else {
            SincFixedOut::<f32>::new(ratio, 2.0, params, CHUNK_SIZE, channels)
                .map(Self::FixedOut)
                .map_err(|e| EngineError::graph(format!("SincFixedOut creation failed: {}", e)))
        }
    }

    fn input_frames_next(&self) -> usize {
        match self {
            Self::FixedIn(r) => r.input_frames_next(),
            Self::FixedOut(r) => r.input_frames_next(),
        }
    }

    fn process(&mut self, input: &[Vec<f32>]) -> EngineResult<Vec<Vec<f32>>> {
        let result = match self {
            Self::FixedIn(r) => r.process(input, None),
            Self::FixedOut(r) => r.process(input, None),
        };
        result.map_err(|e| EngineError::graph(format!("Resampling failed: {}", e)))
    }

    fn process_partial(&mut self, input: &[Vec<f32>]) -> EngineResult<Vec<Vec<f32>>> {
        let result = match self {
            Self::FixedIn(r) => r.process_partial(Some(input), None),
            Self::FixedOut(r) => r.process_partial(Some(input), None),
        };
        result.map_err(|e| EngineError::graph(format!("Resampler flush failed: {}", e)))
    }
}

/// Streaming resampler over interleaved samples
struct StreamResampler {
    resampler: SincResampler,
    channels: usize,
    pending: VecDeque<f32>,
}

impl StreamResampler {
    fn new(input_rate: u32, output_rate: u32, channels: usize) -> EngineResult<Self> {
        Ok(Self {
            resampler: SincResampler::new(input_rate, output_rate, channels)?,
            channels,
            pending: VecDeque::new(),
        })
    }

    fn process(&mut self, input: &[f32]) -> EngineResult<Vec<f32>> {
        self.pending.extend(input.iter().copied());

        // Only full chunks go through process(); the tail waits for flush
        let mut output = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next() * self.channels;
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let resampled = self.resampler.process(&deinterleave(&chunk, self.channels))?;
            output.extend(interleave(&resampled));
        }
        Ok(output)
    }

    fn flush(&mut self) -> EngineResult<Vec<f32>> {
        if self.pending.len() < self.channels {
            self.pending.clear();
            return Ok(Vec::new());
        }
        let tail: Vec<f32> = self.pending.drain(..).collect();
        let resampled = self
            .resampler
            .process_partial(&deinterleave(&tail, self.channels))?;
        Ok(interleave(&resampled))
    }
}

/// [L, R, L, R, ...] to [[L, L, ...], [R, R, ...]]
fn deinterleave(interleaved: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = interleaved.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (ch, &sample) in frame.iter().enumerate() {
            planar[ch].push(sample);
        }
    }
    planar
}

/// [[L, L, ...], [R, R, ...]] to [L, R, L, R, ...]
fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = planar.first() else {
        return Vec::new();
    };
    let mut interleaved = Vec::with_capacity(first.len() * planar.len());
    for i in 0..first.len() {
        for channel in planar {
            interleaved.push(channel[i]);
        }
    }
    interleaved
}

/// Convert interleaved samples between channel layouts
///
/// Mixing down to mono averages all channels; any other conversion maps
/// output channel `i` to input channel `i % input_channels`.
fn mix_channels(samples: &[f32], from: usize, to: usize) -> Vec<f32> {
    if from == to {
        return samples.to_vec();
    }
    let frames = samples.len() / from;
    let mut mixed = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if to == 1 {
            mixed.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            mixed.extend((0..to).map(|ch| frame[ch % from]));
        }
    }
    mixed
}

/// `aformat` filter stage
pub struct FormatFilter {
    input: AudioFormat,
    output: AudioFormat,
    resampler: Option<StreamResampler>,
    last_metadata: FrameMetadata,
}

impl FormatFilter {
    pub fn new(
        input: AudioFormat,
        sample_rate: Option<u32>,
        channels: Option<u16>,
    ) -> EngineResult<Self> {
        let output = AudioFormat::new(
            sample_rate.unwrap_or(input.sample_rate),
            channels.unwrap_or(input.channels),
        );
        if output.sample_rate == 0 || output.channels == 0 {
            return Err(EngineError::graph(format!(
                "unsupported output format {}",
                output
            )));
        }

        let resampler = if output.sample_rate != input.sample_rate {
            Some(StreamResampler::new(
                input.sample_rate,
                output.sample_rate,
                output.channels as usize,
            )?)
        } else {
            None
        };

        Ok(Self {
            input,
            output,
            resampler,
            last_metadata: FrameMetadata::default(),
        })
    }

    /// Build from `aformat[=sample_rates=..:channels=..]`
    pub fn from_node(node: &FilterNode, input: AudioFormat) -> EngineResult<Self> {
        check_known_options(node, &["sample_rates", "channels"])?;
        Self::new(
            input,
            parse_option::<u32>(node, "sample_rates")?,
            parse_option::<u16>(node, "channels")?,
        )
    }

    fn emit(&self, samples: Vec<f32>) -> Vec<AudioFrame> {
        if samples.is_empty() {
            return Vec::new();
        }
        vec![AudioFrame {
            format: self.output,
            samples,
            metadata: self.last_metadata.clone(),
        }]
    }
}

impl Filter for FormatFilter {
    fn output_format(&self) -> AudioFormat {
        self.output
    }

    fn process(&mut self, frame: AudioFrame) -> EngineResult<Vec<AudioFrame>> {
        if self.input == self.output {
            return Ok(vec![frame]);
        }

        let mixed = mix_channels(
            &frame.samples,
            self.input.channels as usize,
            self.output.channels as usize,
        );
        self.last_metadata = frame.metadata;

        let samples = match &mut self.resampler {
            Some(resampler) => resampler.process(&mixed)?,
            None => mixed,
        };
        Ok(self.emit(samples))
    }

    fn flush(&mut self) -> EngineResult<Vec<AudioFrame>> {
        let samples = match &mut self.resampler {
            Some(resampler) => resampler.flush()?,
            None => Vec::new(),
        };
        Ok(self.emit(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castnorm_loudness::filter_spec::parse_chain;

    fn node(text: &str) -> FilterNode {
        parse_chain(text).unwrap().remove(0)
    }

    fn run(filter: &mut FormatFilter, frames: Vec<AudioFrame>) -> Vec<AudioFrame> {
        let mut out = Vec::new();
        for frame in frames {
            out.extend(filter.process(frame).unwrap());
        }
        out.extend(filter.flush().unwrap());
        out
    }

    #[test]
    fn test_passthrough_when_format_matches() {
        let format = AudioFormat::new(48000, 2);
        let mut filter = FormatFilter::from_node(&node("aformat"), format).unwrap();
        let frame = AudioFrame::new(format, vec![0.1, 0.2, 0.3, 0.4]);
        let out = run(&mut filter, vec![frame.clone()]);
        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_downmix_to_mono_averages() {
        let input = AudioFormat::new(48000, 2);
        let mut filter =
            FormatFilter::from_node(&node("aformat=channels=1"), input).unwrap();
        assert_eq!(filter.output_format(), AudioFormat::new(48000, 1));

        let out = run(&mut filter, vec![AudioFrame::new(input, vec![0.2, 0.4, -1.0, 0.0])]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].samples, vec![0.3f32, -0.5]);
    }

    #[test]
    fn test_upmix_duplicates_channels() {
        assert_eq!(mix_channels(&[0.5, -0.5], 1, 2), vec![0.5, 0.5, -0.5, -0.5]);
        assert_eq!(
            mix_channels(&[0.1, 0.2, 0.3, 0.4], 2, 3),
            vec![0.1, 0.2, 0.1, 0.3, 0.4, 0.3]
        );
    }

    #[test]
    fn test_metadata_carried_to_converted_frames() {
        let input = AudioFormat::new(48000, 2);
        let mut filter =
            FormatFilter::from_node(&node("aformat=channels=1"), input).unwrap();
        let mut frame = AudioFrame::new(input, vec![0.0; 200]);
        frame.metadata.integrated_lufs = Some(-16.0);
        let out = run(&mut filter, vec![frame]);
        assert_eq!(out[0].metadata.integrated_lufs, Some(-16.0));
    }

    #[test]
    fn test_resample_length_follows_ratio() {
        for (from, to) in [(48000u32, 44100u32), (44100, 48000), (48000, 16000)] {
            let input = AudioFormat::new(from, 1);
            let mut filter = FormatFilter::new(input, Some(to), None).unwrap();
            let frames: Vec<AudioFrame> = (0..10)
                .map(|_| AudioFrame::new(input, vec![0.25; from as usize / 10]))
                .collect();
            let total: usize = run(&mut filter, frames).iter().map(|f| f.frames()).sum();

            let expected = to as usize;
            let tolerance = expected / 10;
            assert!(
                total + tolerance >= expected && total <= expected + tolerance,
                "{} -> {}: {} frames",
                from,
                to,
                total
            );
        }
    }

    #[test]
    fn test_rejects_bad_options() {
        let input = AudioFormat::new(48000, 2);
        assert!(FormatFilter::from_node(&node("aformat=channels=0"), input).is_err());
        assert!(FormatFilter::from_node(&node("aformat=bits=16"), input).is_err());
        assert!(FormatFilter::from_node(&node("aformat=sample_rates=fast"), input).is_err());
    }

    #[test]
    fn test_interleave_roundtrip() {
        let planar = deinterleave(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2);
        assert_eq!(planar, vec![vec![1.0, 3.0, 5.0], vec![2.0, 4.0, 6.0]]);
        assert_eq!(interleave(&planar), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }
}
