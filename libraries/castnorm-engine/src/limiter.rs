//! Lookahead peak limiter
//!
//! Keeps sample peaks under a ceiling ahead of a gain stage. The attack time
//! sets the lookahead window `L`. The required gain is held at its minimum
//! over `L` frames and then averaged over `L` frames, so the gain falls as a
//! ramp spanning the attack time and no frame leaves above its own limit.

use crate::{check_known_options, check_range, db_to_linear, parse_option, Filter};
use castnorm_loudness::filter_spec::FilterNode;
use castnorm_loudness::{AudioFormat, AudioFrame, EngineResult, FrameMetadata, LimiterParams};
use std::collections::VecDeque;
use tracing::debug;

/// Time constant of the average gain reduction tracked for soft clipping
const ASC_AVERAGE_MS: f32 = 1000.0;

/// Lookahead peak limiter over interleaved samples
///
/// # Example
///
/// ```
/// use castnorm_engine::PeakLimiter;
///
/// let mut limiter = PeakLimiter::new(48000, 1);
/// limiter.set_threshold_db(-6.0);
///
/// let mut out = limiter.process(&[0.9; 4800]);
/// out.extend(limiter.flush());
/// assert_eq!(out.len(), 4800);
/// assert!(out.iter().all(|s| s.abs() <= 0.502));
/// ```
pub struct PeakLimiter {
    /// Threshold in linear (1.0 = 0 dBFS)
    threshold: f32,
    /// Release time in samples
    release_samples: usize,
    /// Current gain (linear, 0.0-1.0)
    gain: f32,
    /// Slow average of the required gain, the soft-clip recovery point
    average_gain: f32,
    average_coeff: f32,
    /// Soft-clip amount; 0.0 when disabled
    asc_level: f32,
    /// Delayed interleaved samples
    delay: VecDeque<f32>,
    /// Required gain of each delayed frame
    delay_required: VecDeque<f32>,
    /// Sliding minimum of required gain over the last `attack_frames` frames
    window: VecDeque<(u64, f32)>,
    /// Last `attack_frames` held minimums, averaged into the attack ramp
    ramp: VecDeque<f32>,
    ramp_sum: f64,
    /// Attack (and window) length in sample frames
    attack_frames: usize,
    frames_in: u64,
    frames_out: u64,
    channels: usize,
    sample_rate: u32,
}

impl PeakLimiter {
    /// Create a new peak limiter
    ///
    /// # Notes
    /// - Default threshold: 0 dBFS (1.0 linear)
    /// - Default attack: 5 ms
    /// - Default release: 50 ms
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        let mut limiter = Self {
            threshold: 1.0,
            release_samples: 1,
            gain: 1.0,
            average_gain: 1.0,
            average_coeff: 1.0 / (sample_rate as f32 * ASC_AVERAGE_MS / 1000.0).max(1.0),
            asc_level: 0.0,
            delay: VecDeque::new(),
            delay_required: VecDeque::new(),
            window: VecDeque::new(),
            ramp: VecDeque::new(),
            ramp_sum: 0.0,
            attack_frames: 1,
            frames_in: 0,
            frames_out: 0,
            channels: channels.max(1),
            sample_rate,
        };
        limiter.set_attack_ms(5.0);
        limiter.set_release_ms(50.0);
        limiter
    }

    /// Create a limiter configured from tuned parameters
    pub fn from_params(sample_rate: u32, channels: usize, params: &LimiterParams) -> Self {
        let mut limiter = Self::new(sample_rate, channels);
        limiter.set_threshold_db(params.ceiling_dbtp as f32);
        limiter.set_attack_ms(params.attack_ms as f32);
        limiter.set_release_ms(params.release_ms as f32);
        limiter.set_soft_clip(params.asc.then_some(params.asc_level as f32));
        limiter
    }

    /// Set the threshold in dB
    pub fn set_threshold_db(&mut self, threshold_db: f32) {
        self.threshold = db_to_linear(f64::from(threshold_db)) as f32;
    }

    /// Set the attack time, which also sets the lookahead
    ///
    /// Resets the limiter; call before the first sample is processed.
    pub fn set_attack_ms(&mut self, attack_ms: f32) {
        let frames = (self.sample_rate as f32 * attack_ms / 1000.0).ceil() as usize;
        self.attack_frames = frames.max(1);
        self.reset();
    }

    /// Set the release time in milliseconds
    pub fn set_release_ms(&mut self, release_ms: f32) {
        self.release_samples = ((self.sample_rate as f32 * release_ms / 1000.0) as usize).max(1);
    }

    /// Enable auto soft-clip with the given amount, or disable with `None`
    pub fn set_soft_clip(&mut self, level: Option<f32>) {
        self.asc_level = level.map_or(0.0, |l| l.clamp(0.0, 1.0));
    }

    /// Get current gain reduction in dB
    pub fn gain_reduction_db(&self) -> f32 {
        20.0 * self.gain.log10()
    }

    /// Get the latency in sample frames
    pub fn latency_frames(&self) -> usize {
        self.attack_frames - 1
    }

    /// Process interleaved samples
    ///
    /// Output lags input by [`PeakLimiter::latency_frames`]; the first call
    /// returns fewer samples than it receives and [`PeakLimiter::flush`]
    /// returns the rest.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut output = Vec::with_capacity(samples.len());

        for frame in samples.chunks_exact(self.channels) {
            let frame_peak = frame.iter().map(|s| s.abs()).fold(0.0_f32, f32::max);
            let required = if frame_peak > self.threshold {
                self.threshold / frame_peak
            } else {
                1.0
            };

            self.delay.extend(frame.iter().copied());
            self.delay_required.push_back(required);
            self.advance(required);

            if self.ready_to_emit() {
                self.emit_frame(&mut output);
            }
        }

        output
    }

    /// Drain the lookahead buffer at end of stream
    pub fn flush(&mut self) -> Vec<f32> {
        let mut output = Vec::with_capacity(self.delay.len());
        while !self.delay_required.is_empty() {
            // Frames past the end need no reduction
            self.advance(1.0);
            if self.ready_to_emit() {
                self.emit_frame(&mut output);
            }
        }
        self.restart_window();
        output
    }

    /// Reset the limiter state
    pub fn reset(&mut self) {
        self.gain = 1.0;
        self.average_gain = 1.0;
        self.delay.clear();
        self.delay_required.clear();
        self.restart_window();
    }

    /// Start the lookahead over, as if no frames had arrived
    fn restart_window(&mut self) {
        self.window.clear();
        self.ramp.clear();
        self.ramp.extend(std::iter::repeat(1.0).take(self.attack_frames));
        self.ramp_sum = self.attack_frames as f64;
        self.frames_in = 0;
        self.frames_out = 0;
    }

    /// Take in the required gain of the next frame
    fn advance(&mut self, required: f32) {
        while self.window.back().is_some_and(|&(_, g)| g >= required) {
            self.window.pop_back();
        }
        self.window.push_back((self.frames_in, required));
        let window_start = (self.frames_in + 1).saturating_sub(self.attack_frames as u64);
        while self.window.front().is_some_and(|&(i, _)| i < window_start) {
            self.window.pop_front();
        }
        self.frames_in += 1;

        let held = self.window.front().map_or(1.0, |&(_, g)| g);
        self.ramp.push_back(held);
        self.ramp_sum += f64::from(held);
        if let Some(oldest) = self.ramp.pop_front() {
            self.ramp_sum -= f64::from(oldest);
        }
    }

    fn ready_to_emit(&self) -> bool {
        self.frames_in - self.frames_out >= self.attack_frames as u64
    }

    fn emit_frame(&mut self, output: &mut Vec<f32>) {
        let required = self.delay_required.pop_front().unwrap_or(1.0);
        // Every held minimum in the ramp covers this frame, so the average
        // never exceeds its required gain
        let limit = ((self.ramp_sum / self.attack_frames as f64) as f32).min(required);

        if limit < self.gain {
            self.gain = limit;
        } else {
            // Release toward unity, or toward the average reduction with ASC
            let target = 1.0 - self.asc_level * (1.0 - self.average_gain);
            let release_coeff = 1.0 / self.release_samples as f32;
            self.gain += (target - self.gain) * release_coeff;
            if target >= 1.0 && self.gain > 0.9999 {
                self.gain = 1.0;
            }
            self.gain = self.gain.min(limit);
        }
        self.average_gain += (limit - self.average_gain) * self.average_coeff;

        for _ in 0..self.channels {
            if let Some(sample) = self.delay.pop_front() {
                output.push(sample * self.gain);
            }
        }
        self.frames_out += 1;
    }
}

/// Re-slices a delayed sample stream into the frames it came from
///
/// Frames keep their original length and metadata; a frame is released once
/// enough delayed samples have arrived to fill it.
pub(crate) struct FrameAligner {
    format: AudioFormat,
    frames: VecDeque<(usize, FrameMetadata)>,
    samples: VecDeque<f32>,
}

impl FrameAligner {
    pub(crate) fn new(format: AudioFormat) -> Self {
        Self {
            format,
            frames: VecDeque::new(),
            samples: VecDeque::new(),
        }
    }

    /// Queue a frame shell of `len` samples awaiting delayed audio
    pub(crate) fn queue(&mut self, len: usize, metadata: FrameMetadata) {
        self.frames.push_back((len, metadata));
    }

    pub(crate) fn feed(&mut self, samples: Vec<f32>) {
        self.samples.extend(samples);
    }

    /// Frames whose samples have fully arrived
    pub(crate) fn ready(&mut self) -> Vec<AudioFrame> {
        let mut out = Vec::new();
        while let Some((len, _)) = self.frames.front() {
            if self.samples.len() < *len {
                break;
            }
            let len = *len;
            if let Some((_, metadata)) = self.frames.pop_front() {
                let samples: Vec<f32> = self.samples.drain(..len).collect();
                out.push(AudioFrame {
                    format: self.format,
                    samples,
                    metadata,
                });
            }
        }
        out
    }
}

/// `limiter` filter stage
pub struct LimiterFilter {
    format: AudioFormat,
    limiter: PeakLimiter,
    aligner: FrameAligner,
}

impl LimiterFilter {
    pub fn new(format: AudioFormat, params: &LimiterParams) -> Self {
        debug!(
            "Limiter: ceiling {:.2} dBTP, attack {:.2} ms, release {:.2} ms, asc {} ({:.2})",
            params.ceiling_dbtp, params.attack_ms, params.release_ms, params.asc, params.asc_level
        );
        Self {
            format,
            limiter: PeakLimiter::from_params(
                format.sample_rate,
                format.channels as usize,
                params,
            ),
            aligner: FrameAligner::new(format),
        }
    }

    /// Build from `limiter=ceiling=..:attack=..:release=..:asc=..:asc_level=..`
    pub fn from_node(node: &FilterNode, format: AudioFormat) -> EngineResult<Self> {
        check_known_options(node, &["ceiling", "attack", "release", "asc", "asc_level"])?;
        let defaults = LimiterParams::default();

        let ceiling = parse_option(node, "ceiling")?.unwrap_or(defaults.ceiling_dbtp);
        let attack = parse_option(node, "attack")?.unwrap_or(defaults.attack_ms);
        let release = parse_option(node, "release")?.unwrap_or(defaults.release_ms);
        let asc_level = parse_option(node, "asc_level")?.unwrap_or(defaults.asc_level);

        let params = LimiterParams {
            ceiling_dbtp: check_range(node, "ceiling", ceiling, -60.0..=0.0)?,
            attack_ms: check_range(node, "attack", attack, 0.1..=80.0)?,
            release_ms: check_range(node, "release", release, 1.0..=8000.0)?,
            asc: node.bool_option("asc")?.unwrap_or(defaults.asc),
            asc_level: check_range(node, "asc_level", asc_level, 0.0..=1.0)?,
        };
        Ok(Self::new(format, &params))
    }
}

impl Filter for LimiterFilter {
    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn process(&mut self, frame: AudioFrame) -> EngineResult<Vec<AudioFrame>> {
        self.aligner.queue(frame.samples.len(), frame.metadata);
        self.aligner.feed(self.limiter.process(&frame.samples));
        Ok(self.aligner.ready())
    }

    fn flush(&mut self) -> EngineResult<Vec<AudioFrame>> {
        self.aligner.feed(self.limiter.flush());
        Ok(self.aligner.ready())
    }
}
