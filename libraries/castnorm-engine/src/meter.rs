//! Measurement instrumentation
//!
//! The `meter` filter passes audio through unchanged and attaches cumulative
//! statistics to every frame:
//! - EBU R128 momentary, short-term and integrated loudness, LRA, threshold
//! - True and sample peak (`peak=true`)
//! - RMS, dynamic range and noise floor from 50 ms blocks (`astats=1`)
//! - Transient intensity, spectral crest and spectral flux (`spectral=1`)

use crate::{check_known_options, meter_error, to_db, Filter};
use castnorm_loudness::filter_spec::FilterNode;
use castnorm_loudness::{AudioFormat, AudioFrame, EngineResult, FrameMetadata, SpectralSnapshot};
use ebur128::{EbuR128, Mode};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Block length for amplitude statistics
const BLOCK_MS: u32 = 50;

/// Blocks quieter than this (linear RMS) are digital silence, not noise
const SILENT_BLOCK_RMS: f64 = 1e-6;

/// Noise floor reported when no audible block was seen (dBFS)
const NOISE_FLOOR_UNKNOWN_DB: f64 = -120.0;

/// FFT size for spectral statistics
const FFT_SIZE: usize = 2048;

/// `meter` filter stage
pub struct MeterFilter {
    format: AudioFormat,
    ebur128: EbuR128,
    peak: bool,
    astats: bool,
    amplitude: AmplitudeStats,
    spectral: Option<SpectralStats>,
}

impl MeterFilter {
    pub fn new(
        format: AudioFormat,
        peak: bool,
        astats: bool,
        spectral: bool,
    ) -> EngineResult<Self> {
        let mut mode = Mode::M | Mode::S | Mode::I | Mode::LRA;
        if peak {
            mode |= Mode::SAMPLE_PEAK | Mode::TRUE_PEAK;
        }
        let ebur128 = EbuR128::new(u32::from(format.channels), format.sample_rate, mode)
            .map_err(meter_error)?;

        Ok(Self {
            format,
            ebur128,
            peak,
            astats,
            amplitude: AmplitudeStats::new(format.sample_rate),
            spectral: spectral.then(SpectralStats::new),
        })
    }

    /// Build from `meter[=peak=..:astats=..:spectral=..]`
    pub fn from_node(node: &FilterNode, format: AudioFormat) -> EngineResult<Self> {
        check_known_options(node, &["peak", "astats", "spectral"])?;
        Self::new(
            format,
            node.bool_option("peak")?.unwrap_or(true),
            node.bool_option("astats")?.unwrap_or(false),
            node.bool_option("spectral")?.unwrap_or(false),
        )
    }

    fn annotate(&self, metadata: &mut FrameMetadata) {
        let channels = u32::from(self.format.channels);
        metadata.momentary_lufs = self.ebur128.loudness_momentary().ok();
        metadata.shortterm_lufs = self.ebur128.loudness_shortterm().ok();
        metadata.integrated_lufs = self.ebur128.loudness_global().ok();
        metadata.loudness_range_lu = self.ebur128.loudness_range().ok();
        metadata.threshold_lufs = self.ebur128.relative_threshold().ok();

        if self.peak {
            let true_peak = (0..channels)
                .filter_map(|ch| self.ebur128.true_peak(ch).ok())
                .fold(0.0_f64, f64::max);
            let sample_peak = (0..channels)
                .filter_map(|ch| self.ebur128.sample_peak(ch).ok())
                .fold(0.0_f64, f64::max);
            metadata.true_peak_dbtp = Some(to_db(true_peak));
            metadata.sample_peak_dbfs = Some(to_db(sample_peak));
        }

        if self.astats {
            metadata.rms_dbfs = self.amplitude.rms_dbfs();
            metadata.dynamic_range_db = self.amplitude.dynamic_range_db();
            metadata.noise_floor_db = self.amplitude.noise_floor_db();
        }

        if let Some(spectral) = &self.spectral {
            if let Some(snapshot) = spectral.snapshot(&self.amplitude) {
                metadata.spectral = Some(snapshot);
            }
        }
    }
}

impl Filter for MeterFilter {
    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn process(&mut self, mut frame: AudioFrame) -> EngineResult<Vec<AudioFrame>> {
        let channels = self.format.channels as usize;
        if !frame.samples.is_empty() {
            self.ebur128
                .add_frames_f32(&frame.samples)
                .map_err(meter_error)?;
            self.amplitude.update(&frame.samples, channels);
            if let Some(spectral) = &mut self.spectral {
                spectral.update(&frame.samples, channels);
            }
        }

        self.annotate(&mut frame.metadata);
        Ok(vec![frame])
    }

    fn flush(&mut self) -> EngineResult<Vec<AudioFrame>> {
        Ok(Vec::new())
    }
}

/// Cumulative RMS, peak and 50 ms block statistics
pub struct AmplitudeStats {
    sum_squares: f64,
    samples: u64,
    peak: f32,
    block_len: usize,
    block_frames: usize,
    block_energy: f64,
    quietest_block_rms: Option<f64>,
}

impl AmplitudeStats {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sum_squares: 0.0,
            samples: 0,
            peak: 0.0,
            block_len: ((sample_rate * BLOCK_MS / 1000) as usize).max(1),
            block_frames: 0,
            block_energy: 0.0,
            quietest_block_rms: None,
        }
    }

    pub fn update(&mut self, samples: &[f32], channels: usize) {
        let channels = channels.max(1);
        for frame in samples.chunks_exact(channels) {
            let energy: f64 = frame.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
            self.sum_squares += energy;
            self.samples += channels as u64;
            self.peak = frame.iter().fold(self.peak, |p, s| p.max(s.abs()));

            self.block_energy += energy / channels as f64;
            self.block_frames += 1;
            if self.block_frames == self.block_len {
                let rms = (self.block_energy / self.block_len as f64).sqrt();
                if rms > SILENT_BLOCK_RMS {
                    self.quietest_block_rms =
                        Some(self.quietest_block_rms.map_or(rms, |q| q.min(rms)));
                }
                self.block_frames = 0;
                self.block_energy = 0.0;
            }
        }
    }

    /// Overall RMS level in dBFS
    pub fn rms_dbfs(&self) -> Option<f64> {
        (self.samples > 0).then(|| to_db((self.sum_squares / self.samples as f64).sqrt()))
    }

    /// Quietest audible 50 ms block RMS in dBFS
    pub fn noise_floor_db(&self) -> Option<f64> {
        self.quietest_block_rms.map(to_db)
    }

    /// Peak level minus the noise floor
    pub fn dynamic_range_db(&self) -> Option<f64> {
        self.noise_floor_db()
            .map(|floor| to_db(f64::from(self.peak)) - floor)
    }
}

/// Transient and FFT-based statistics over a mono downmix
pub struct SpectralStats {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    pending: Vec<f32>,
    fft_buffer: Vec<Complex<f32>>,
    previous: Option<Vec<f32>>,
    crest_sum: f64,
    analysed: u64,
    flux_sum: f64,
    flux_frames: u64,
    level_sum: f64,
    delta_sum: f64,
    last_sample: Option<f32>,
}

impl SpectralStats {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        // Hann window
        let window = (0..FFT_SIZE)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / FFT_SIZE as f32).cos()))
            .collect();

        Self {
            fft,
            window,
            pending: Vec::with_capacity(FFT_SIZE),
            fft_buffer: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            previous: None,
            crest_sum: 0.0,
            analysed: 0,
            flux_sum: 0.0,
            flux_frames: 0,
            level_sum: 0.0,
            delta_sum: 0.0,
            last_sample: None,
        }
    }

    pub fn update(&mut self, samples: &[f32], channels: usize) {
        let channels = channels.max(1);
        for frame in samples.chunks_exact(channels) {
            let mono = frame.iter().sum::<f32>() / channels as f32;

            if let Some(last) = self.last_sample {
                self.delta_sum += f64::from((mono - last).abs());
            }
            self.level_sum += f64::from(mono.abs());
            self.last_sample = Some(mono);

            self.pending.push(mono);
            if self.pending.len() == FFT_SIZE {
                self.analyse();
                self.pending.clear();
            }
        }
    }

    fn analyse(&mut self) {
        for ((bin, &sample), &w) in self
            .fft_buffer
            .iter_mut()
            .zip(self.pending.iter())
            .zip(self.window.iter())
        {
            *bin = Complex::new(sample * w, 0.0);
        }
        self.fft.process(&mut self.fft_buffer);

        let magnitudes: Vec<f32> = self.fft_buffer[1..FFT_SIZE / 2]
            .iter()
            .map(|c| c.norm())
            .collect();
        let total: f64 = magnitudes.iter().map(|&m| f64::from(m)).sum();
        let mean = total / magnitudes.len() as f64;
        if mean <= 1e-9 {
            // Silent block: no spectral shape to measure
            self.previous = None;
            return;
        }

        let max = magnitudes.iter().copied().fold(0.0_f32, f32::max);
        self.crest_sum += to_db(f64::from(max) / mean);
        self.analysed += 1;

        if let Some(previous) = &self.previous {
            let rise: f64 = magnitudes
                .iter()
                .zip(previous.iter())
                .map(|(&m, &p)| f64::from((m - p).max(0.0)))
                .sum();
            self.flux_sum += (rise / total).min(1.0);
            self.flux_frames += 1;
        }
        self.previous = Some(magnitudes);
    }

    /// Statistics so far, once at least one FFT block has been analysed
    pub fn snapshot(&self, amplitude: &AmplitudeStats) -> Option<SpectralSnapshot> {
        if self.analysed == 0 {
            return None;
        }

        Some(SpectralSnapshot {
            transient_intensity: if self.level_sum > 0.0 {
                self.delta_sum / self.level_sum
            } else {
                0.0
            },
            spectral_crest_db: self.crest_sum / self.analysed as f64,
            spectral_flux: if self.flux_frames > 0 {
                self.flux_sum / self.flux_frames as f64
            } else {
                0.0
            },
            dynamic_range_db: amplitude.dynamic_range_db().unwrap_or(0.0),
            noise_floor_db: amplitude
                .noise_floor_db()
                .unwrap_or(NOISE_FLOOR_UNKNOWN_DB),
        })
    }
}

impl Default for SpectralStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48000;

    fn sine(amplitude: f32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| {
                let t = i as f32 / RATE as f32;
                amplitude * (2.0 * PI * 1000.0 * t).sin()
            })
            .collect()
    }

    /// Deterministic white noise
    fn noise(amplitude: f32, frames: usize) -> Vec<f32> {
        let mut seed: u64 = 12345;
        (0..frames)
            .map(|_| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                let random = ((seed >> 33) as f32 / (1u64 << 31) as f32) * 2.0 - 1.0;
                random * amplitude
            })
            .collect()
    }

    fn metered(samples: &[f32]) -> FrameMetadata {
        let format = AudioFormat::new(RATE, 1);
        let mut meter = MeterFilter::new(format, true, true, true).unwrap();
        let mut last = FrameMetadata::default();
        for chunk in samples.chunks(4800) {
            let out = meter.process(AudioFrame::new(format, chunk.to_vec())).unwrap();
            last = out[0].metadata.clone();
        }
        last
    }

    #[test]
    fn test_sine_levels() {
        let metadata = metered(&sine(0.5, RATE as usize * 3));

        let sample_peak = metadata.sample_peak_dbfs.unwrap();
        assert!((sample_peak - (-6.02)).abs() < 0.05);
        assert!(metadata.true_peak_dbtp.unwrap() >= sample_peak - 0.01);

        let rms = metadata.rms_dbfs.unwrap();
        assert!((rms - (-9.03)).abs() < 0.05);

        // Steady tone: every block has the same RMS
        assert!((metadata.noise_floor_db.unwrap() - rms).abs() < 0.1);
        assert!((metadata.dynamic_range_db.unwrap() - 3.01).abs() < 0.1);

        let integrated = metadata.integrated_lufs.unwrap();
        assert!(integrated > -12.0 && integrated < -6.0, "{}", integrated);
    }

    #[test]
    fn test_spectral_distinguishes_tone_from_noise() {
        let tone = metered(&sine(0.3, RATE as usize)).spectral.unwrap();
        let hiss = metered(&noise(0.3, RATE as usize)).spectral.unwrap();

        assert!(hiss.transient_intensity > tone.transient_intensity * 5.0);
        assert!(tone.spectral_crest_db > hiss.spectral_crest_db);
        assert!(hiss.spectral_flux > tone.spectral_flux);
        assert!((0.0..=1.0).contains(&hiss.spectral_flux));
    }

    #[test]
    fn test_silence_has_no_noise_floor() {
        let metadata = metered(&vec![0.0; RATE as usize]);
        assert!(metadata.noise_floor_db.is_none());
        assert!(metadata.spectral.is_none());
        assert_eq!(metadata.sample_peak_dbfs, Some(f64::NEG_INFINITY));
    }

    #[test]
    fn test_spectral_needs_a_full_block() {
        let format = AudioFormat::new(RATE, 1);
        let mut meter = MeterFilter::new(format, true, false, true).unwrap();
        let out = meter
            .process(AudioFrame::new(format, sine(0.3, FFT_SIZE - 1)))
            .unwrap();
        assert!(out[0].metadata.spectral.is_none());
        // astats disabled
        assert!(out[0].metadata.rms_dbfs.is_none());

        let out = meter.process(AudioFrame::new(format, sine(0.3, 1))).unwrap();
        assert!(out[0].metadata.spectral.is_some());
    }

    #[test]
    fn test_samples_pass_through() {
        let format = AudioFormat::new(RATE, 2);
        let mut meter = MeterFilter::new(format, true, true, false).unwrap();
        let input: Vec<f32> = sine(0.2, 1000).into_iter().flat_map(|s| [s, -s]).collect();
        let out = meter.process(AudioFrame::new(format, input.clone())).unwrap();
        assert_eq!(out[0].samples, input);
    }
}
