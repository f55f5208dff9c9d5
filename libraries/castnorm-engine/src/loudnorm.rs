//! EBU R128 loudness normalisation filter
//!
//! Two modes:
//! - **Linear**: all measured values are supplied and a constant gain of
//!   `I - measured_I` keeps `measured_TP` under `TP`. Samples are scaled and
//!   passed straight through.
//! - **Dynamic**: used when linear gain is not peak-safe, and always when no
//!   measured values are given. A 3 s lookahead window estimates the gain for
//!   the frame leaving the window; an internal limiter holds peaks under `TP`.
//!
//! Input and output are both metered. At end of stream the filter prints a
//! JSON summary on the diagnostic channel when `print_format=json`.

use crate::limiter::{FrameAligner, PeakLimiter};
use crate::{
    check_known_options, check_range, db_to_linear, meter_error, parse_option, to_db, Filter,
};
use castnorm_loudness::filter_spec::{FilterNode, LoudnormMeasured};
use castnorm_loudness::{
    AudioFormat, AudioFrame, DiagnosticsSink, EngineError, EngineResult, LogLevel,
    LoudnormSummary, SILENCE_FLOOR_LUFS,
};
use ebur128::{EbuR128, Mode};
use std::collections::VecDeque;
use tracing::debug;

/// Lookahead window of the dynamic mode
const LOOKAHEAD_MS: u64 = 3000;

/// Largest gain the dynamic mode will apply in either direction (dB)
const MAX_DYNAMIC_GAIN_DB: f64 = 40.0;

/// Internal limiter timing for the dynamic mode
const LIMITER_ATTACK_MS: f32 = 5.0;
const LIMITER_RELEASE_MS: f32 = 100.0;

const DEFAULT_TARGET_I: f64 = -24.0;
const DEFAULT_TARGET_TP: f64 = -2.0;
const DEFAULT_TARGET_LRA: f64 = 7.0;

const OPTIONS: &[&str] = &[
    "I",
    "TP",
    "LRA",
    "measured_I",
    "measured_TP",
    "measured_LRA",
    "measured_thresh",
    "offset",
    "linear",
    "print_format",
];

enum Normalisation {
    Linear { gain: f32 },
    Dynamic(Box<DynamicState>),
}

/// `loudnorm` filter stage
pub struct LoudnormFilter {
    format: AudioFormat,
    target_i: f64,
    print_summary: bool,
    mode: Normalisation,
    input_meter: EbuR128,
    output_meter: EbuR128,
    diagnostics: DiagnosticsSink,
}

impl LoudnormFilter {
    /// Create a loudness filter
    ///
    /// `measured` selects linear mode when the constant gain is peak-safe;
    /// otherwise, or when `None`, the dynamic mode runs with `offset_db`
    /// added to its gain estimate.
    pub fn new(
        format: AudioFormat,
        target_i: f64,
        target_tp: f64,
        measured: Option<LoudnormMeasured>,
        print_summary: bool,
        diagnostics: DiagnosticsSink,
    ) -> EngineResult<Self> {
        let offset_db = measured.map_or(0.0, |m| m.offset_db);
        let mode = match measured {
            Some(m) if m.true_peak_dbtp + (target_i - m.integrated_lufs) <= target_tp => {
                let gain_db = target_i - m.integrated_lufs;
                diagnostics.log(
                    LogLevel::Verbose,
                    &format!("[loudnorm] linear mode, gain {:+.2} dB", gain_db),
                );
                Normalisation::Linear {
                    gain: db_to_linear(gain_db) as f32,
                }
            }
            Some(m) => {
                diagnostics.log(
                    LogLevel::Warning,
                    &format!(
                        "[loudnorm] measured_TP {:.2} + gain {:+.2} dB exceeds TP {:.2}, using dynamic mode",
                        m.true_peak_dbtp,
                        target_i - m.integrated_lufs,
                        target_tp
                    ),
                );
                Normalisation::Dynamic(Box::new(DynamicState::new(format, target_tp, offset_db)))
            }
            None => Normalisation::Dynamic(Box::new(DynamicState::new(format, target_tp, 0.0))),
        };

        Ok(Self {
            format,
            target_i,
            print_summary,
            mode,
            input_meter: new_meter(format)?,
            output_meter: new_meter(format)?,
            diagnostics,
        })
    }

    /// Build from `loudnorm=I=..:TP=..:LRA=..[:measured_*=..:offset=..:linear=..]:print_format=..`
    pub fn from_node(
        node: &FilterNode,
        format: AudioFormat,
        diagnostics: DiagnosticsSink,
    ) -> EngineResult<Self> {
        check_known_options(node, OPTIONS)?;

        let target_i = parse_option(node, "I")?.unwrap_or(DEFAULT_TARGET_I);
        let target_tp = parse_option(node, "TP")?.unwrap_or(DEFAULT_TARGET_TP);
        let target_lra = parse_option(node, "LRA")?.unwrap_or(DEFAULT_TARGET_LRA);
        let target_i = check_range(node, "I", target_i, -70.0..=-5.0)?;
        let target_tp = check_range(node, "TP", target_tp, -9.0..=0.0)?;
        check_range(node, "LRA", target_lra, 1.0..=50.0)?;

        let print_summary = match node.option("print_format").unwrap_or("none") {
            "json" => true,
            "none" | "summary" => false,
            other => {
                return Err(EngineError::InvalidSpec {
                    spec: node.name.clone(),
                    reason: format!("unsupported print_format '{}'", other),
                })
            }
        };

        let linear = node.bool_option("linear")?.unwrap_or(true);
        let measured = match (
            parse_option::<f64>(node, "measured_I")?,
            parse_option::<f64>(node, "measured_TP")?,
            parse_option::<f64>(node, "measured_LRA")?,
            parse_option::<f64>(node, "measured_thresh")?,
        ) {
            (Some(i), Some(tp), Some(lra), Some(thresh)) if linear => Some(LoudnormMeasured {
                integrated_lufs: check_range(node, "measured_I", i, -99.0..=0.0)?,
                true_peak_dbtp: check_range(node, "measured_TP", tp, -99.0..=99.0)?,
                loudness_range_lu: check_range(node, "measured_LRA", lra, 0.0..=99.0)?,
                threshold_lufs: check_range(node, "measured_thresh", thresh, -99.0..=0.0)?,
                offset_db: check_range(
                    node,
                    "offset",
                    parse_option(node, "offset")?.unwrap_or(0.0),
                    -99.0..=99.0,
                )?,
            }),
            _ => None,
        };

        Self::new(
            format,
            target_i,
            target_tp,
            measured,
            print_summary,
            diagnostics,
        )
    }

    /// Whether the constant-gain path is active
    pub fn is_linear(&self) -> bool {
        matches!(self.mode, Normalisation::Linear { .. })
    }

    /// Input and output statistics in the diagnostic summary layout
    pub fn summary(&self) -> LoudnormSummary {
        let channels = u32::from(self.format.channels);
        let input = MeterReading::read(&self.input_meter, channels);
        let output = MeterReading::read(&self.output_meter, channels);

        LoudnormSummary {
            input_i: input.integrated,
            input_tp: input.true_peak,
            input_lra: input.range,
            input_thresh: input.threshold,
            output_i: output.integrated,
            output_tp: output.true_peak,
            output_lra: output.range,
            output_thresh: output.threshold,
            normalization_type: if self.is_linear() { "linear" } else { "dynamic" }.to_string(),
            target_offset: self.target_i - output.integrated,
        }
    }

    fn meter_output(&mut self, frames: &[AudioFrame]) -> EngineResult<()> {
        for frame in frames.iter().filter(|f| !f.samples.is_empty()) {
            self.output_meter
                .add_frames_f32(&frame.samples)
                .map_err(meter_error)?;
        }
        Ok(())
    }
}

impl Filter for LoudnormFilter {
    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn process(&mut self, mut frame: AudioFrame) -> EngineResult<Vec<AudioFrame>> {
        if !frame.samples.is_empty() {
            self.input_meter
                .add_frames_f32(&frame.samples)
                .map_err(meter_error)?;
        }

        let out = match &mut self.mode {
            Normalisation::Linear { gain } => {
                for sample in &mut frame.samples {
                    *sample *= *gain;
                }
                vec![frame]
            }
            Normalisation::Dynamic(state) => {
                state.push(frame, &self.input_meter, self.target_i)
            }
        };

        self.meter_output(&out)?;
        Ok(out)
    }

    fn flush(&mut self) -> EngineResult<Vec<AudioFrame>> {
        let out = match &mut self.mode {
            Normalisation::Linear { .. } => Vec::new(),
            Normalisation::Dynamic(state) => state.drain(&self.input_meter, self.target_i),
        };
        self.meter_output(&out)?;

        let summary = self.summary();
        debug!(
            "loudnorm finished: {} -> {:.2} LUFS ({})",
            summary.input_i, summary.output_i, summary.normalization_type
        );
        if self.print_summary {
            self.diagnostics.log(
                LogLevel::Info,
                &format!("[loudnorm] summary\n{}", summary.to_json()),
            );
        }

        Ok(out)
    }
}

/// Lookahead gain estimation followed by a peak limiter
struct DynamicState {
    pending: VecDeque<AudioFrame>,
    pending_frames: usize,
    lookahead_frames: usize,
    channels: usize,
    offset_db: f64,
    window_filled: bool,
    /// Last gain estimated from an audible window
    gain_db: Option<f64>,
    /// Linear gain applied at the end of the previous frame
    applied: Option<f32>,
    limiter: PeakLimiter,
    aligner: FrameAligner,
}

impl DynamicState {
    fn new(format: AudioFormat, target_tp: f64, offset_db: f64) -> Self {
        let mut limiter = PeakLimiter::new(format.sample_rate, format.channels as usize);
        limiter.set_threshold_db(target_tp as f32);
        limiter.set_attack_ms(LIMITER_ATTACK_MS);
        limiter.set_release_ms(LIMITER_RELEASE_MS);

        Self {
            pending: VecDeque::new(),
            pending_frames: 0,
            lookahead_frames: (u64::from(format.sample_rate) * LOOKAHEAD_MS / 1000) as usize,
            channels: format.channels as usize,
            offset_db,
            window_filled: false,
            gain_db: None,
            applied: None,
            limiter,
            aligner: FrameAligner::new(format),
        }
    }

    fn push(&mut self, frame: AudioFrame, meter: &EbuR128, target_i: f64) -> Vec<AudioFrame> {
        self.pending_frames += frame.frames();
        self.pending.push_back(frame);

        // The short-term window spans exactly the buffered lookahead
        while self.pending_frames >= self.lookahead_frames {
            let Some(front) = self.pending.pop_front() else {
                break;
            };
            self.pending_frames -= front.frames();
            self.window_filled = true;
            let gain_db = self.estimate_gain(meter, target_i);
            self.apply(front, gain_db);
        }

        self.aligner.ready()
    }

    fn drain(&mut self, meter: &EbuR128, target_i: f64) -> Vec<AudioFrame> {
        // A stream shorter than the lookahead never filled the window; the
        // whole-stream loudness stands in for it
        let fixed_gain = (!self.window_filled).then(|| {
            let integrated = meter.loudness_global().unwrap_or(f64::NEG_INFINITY);
            if audible(integrated) {
                self.clamp_gain(target_i - integrated)
            } else {
                0.0
            }
        });

        while let Some(front) = self.pending.pop_front() {
            let gain_db = match fixed_gain {
                Some(gain_db) => gain_db,
                None => self.estimate_gain(meter, target_i),
            };
            self.apply(front, gain_db);
        }
        self.pending_frames = 0;

        self.aligner.feed(self.limiter.flush());
        self.aligner.ready()
    }

    fn estimate_gain(&mut self, meter: &EbuR128, target_i: f64) -> f64 {
        let window = meter.loudness_shortterm().unwrap_or(f64::NEG_INFINITY);
        let gate = meter
            .relative_threshold()
            .unwrap_or(SILENCE_FLOOR_LUFS)
            .max(SILENCE_FLOOR_LUFS);

        // Gated windows hold the previous gain instead of boosting silence
        if window.is_finite() && window >= gate {
            self.gain_db = Some(self.clamp_gain(target_i - window));
        }
        self.gain_db.unwrap_or(0.0)
    }

    fn clamp_gain(&self, gain_db: f64) -> f64 {
        (gain_db + self.offset_db).clamp(-MAX_DYNAMIC_GAIN_DB, MAX_DYNAMIC_GAIN_DB)
    }

    /// Ramp from the previous gain to `gain_db` across the frame, then limit
    fn apply(&mut self, mut frame: AudioFrame, gain_db: f64) {
        let end = db_to_linear(gain_db) as f32;
        let start = self.applied.unwrap_or(end);
        let frames = frame.frames().max(1) as f32;

        for (i, chunk) in frame.samples.chunks_exact_mut(self.channels).enumerate() {
            let gain = start + (end - start) * (i + 1) as f32 / frames;
            for sample in chunk {
                *sample *= gain;
            }
        }
        self.applied = Some(end);

        self.aligner.queue(frame.samples.len(), frame.metadata);
        self.aligner.feed(self.limiter.process(&frame.samples));
    }
}

struct MeterReading {
    integrated: f64,
    true_peak: f64,
    range: f64,
    threshold: f64,
}

impl MeterReading {
    fn read(meter: &EbuR128, channels: u32) -> Self {
        let true_peak = (0..channels)
            .filter_map(|ch| meter.true_peak(ch).ok())
            .fold(0.0_f64, f64::max);

        Self {
            integrated: meter.loudness_global().unwrap_or(f64::NEG_INFINITY),
            true_peak: to_db(true_peak),
            range: meter.loudness_range().unwrap_or(0.0),
            threshold: meter.relative_threshold().unwrap_or(SILENCE_FLOOR_LUFS),
        }
    }
}

fn new_meter(format: AudioFormat) -> EngineResult<EbuR128> {
    let mode = Mode::I | Mode::S | Mode::LRA | Mode::TRUE_PEAK;
    EbuR128::new(u32::from(format.channels), format.sample_rate, mode).map_err(meter_error)
}

fn audible(lufs: f64) -> bool {
    lufs.is_finite() && lufs >= SILENCE_FLOOR_LUFS
}

#[cfg(test)]
mod tests {
    use super::*;
    use castnorm_loudness::filter_spec::parse_chain;

    const RATE: u32 = 48000;

    fn tone(amplitude: f32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| {
                let t = i as f32 / RATE as f32;
                amplitude * (2.0 * std::f32::consts::PI * 997.0 * t).sin()
            })
            .collect()
    }

    fn run(spec: &str, samples: &[f32]) -> (Vec<f32>, LoudnormSummary, bool) {
        let format = AudioFormat::new(RATE, 1);
        let node = parse_chain(spec).unwrap().remove(0);
        let sink = DiagnosticsSink::new(LogLevel::Warning);
        let capture = sink.begin_capture();
        let mut filter = LoudnormFilter::from_node(&node, format, sink.clone()).unwrap();
        let linear = filter.is_linear();

        let mut out = Vec::new();
        for chunk in samples.chunks(4800) {
            for frame in filter
                .process(AudioFrame::new(format, chunk.to_vec()))
                .unwrap()
            {
                out.extend(frame.samples);
            }
        }
        for frame in filter.flush().unwrap() {
            out.extend(frame.samples);
        }

        let summary = LoudnormSummary::from_log(&capture.finish()).unwrap();
        (out, summary, linear)
    }

    fn integrated(samples: &[f32]) -> f64 {
        let mut meter = EbuR128::new(1, RATE, Mode::I).unwrap();
        meter.add_frames_f32(samples).unwrap();
        meter.loudness_global().unwrap()
    }

    #[test]
    fn test_measure_mode_reports_input() {
        let input = tone(0.1, RATE as usize * 5);
        let (output, summary, linear) =
            run("loudnorm=I=-16:TP=-1.5:LRA=11:print_format=json", &input);

        assert!(!linear);
        assert_eq!(output.len(), input.len());
        assert_eq!(summary.normalization_type, "dynamic");
        assert!((summary.input_i - integrated(&input)).abs() < 0.05);
        assert!((summary.target_offset - (-16.0 - summary.output_i)).abs() < 1e-9);
        // Dynamic output lands near the target on steady material
        assert!((summary.output_i - (-16.0)).abs() < 1.0, "{}", summary.output_i);
    }

    #[test]
    fn test_linear_mode_applies_constant_gain() {
        let input = tone(0.1, RATE as usize * 4);
        let measured_i = integrated(&input);
        let spec = format!(
            "loudnorm=I=-20.00:TP=-1.50:LRA=11.00:measured_I={:.2}:measured_TP=-20.00:\
             measured_LRA=1.00:measured_thresh=-40.00:offset=0.00:linear=true:print_format=json",
            measured_i
        );
        let (output, summary, linear) = run(&spec, &input);

        assert!(linear);
        assert_eq!(summary.normalization_type, "linear");
        let expected_gain = db_to_linear(-20.0 - (measured_i * 100.0).round() / 100.0) as f32;
        for (a, b) in input.iter().zip(output.iter()).step_by(997) {
            assert!((a * expected_gain - b).abs() < 1e-5);
        }
        assert!((summary.output_i - (-20.0)).abs() < 0.1);
    }

    #[test]
    fn test_unsafe_linear_gain_falls_back_to_dynamic() {
        let spec = "loudnorm=I=-16:TP=-1.5:LRA=11:measured_I=-30:measured_TP=-3:\
                    measured_LRA=5:measured_thresh=-40:offset=0:linear=true:print_format=json";
        let input = tone(0.05, RATE as usize);
        let (output, summary, linear) = run(spec, &input);

        assert!(!linear);
        assert_eq!(summary.normalization_type, "dynamic");
        assert_eq!(output.len(), input.len());

        let ceiling = db_to_linear(-1.5) as f32 + 1e-4;
        assert!(output.iter().all(|s| s.abs() <= ceiling));
    }

    #[test]
    fn test_metadata_survives_dynamic_buffering() {
        let format = AudioFormat::new(RATE, 1);
        let node = parse_chain("loudnorm=I=-16:TP=-1.5:LRA=11").unwrap().remove(0);
        let mut filter =
            LoudnormFilter::from_node(&node, format, DiagnosticsSink::default()).unwrap();

        let mut out = Vec::new();
        for i in 0..50 {
            let mut frame = AudioFrame::new(format, tone(0.1, 4800));
            frame.metadata.momentary_lufs = Some(f64::from(i));
            out.extend(filter.process(frame).unwrap());
        }
        out.extend(filter.flush().unwrap());

        assert_eq!(out.len(), 50);
        for (i, frame) in out.iter().enumerate() {
            assert_eq!(frame.metadata.momentary_lufs, Some(i as f64));
        }
    }

    #[test]
    fn test_summary_not_printed_without_json() {
        let format = AudioFormat::new(RATE, 1);
        let node = parse_chain("loudnorm=I=-16:TP=-1.5:LRA=11:print_format=none")
            .unwrap()
            .remove(0);
        let sink = DiagnosticsSink::default();
        let capture = sink.begin_capture();
        let mut filter = LoudnormFilter::from_node(&node, format, sink.clone()).unwrap();
        filter.process(AudioFrame::new(format, tone(0.1, 4800))).unwrap();
        filter.flush().unwrap();

        assert!(LoudnormSummary::from_log(&capture.finish()).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_targets() {
        let format = AudioFormat::new(RATE, 1);
        for spec in ["loudnorm=I=-2", "loudnorm=TP=1", "loudnorm=LRA=60", "loudnorm=gain=3"] {
            let node = parse_chain(spec).unwrap().remove(0);
            assert!(
                LoudnormFilter::from_node(&node, format, DiagnosticsSink::default()).is_err(),
                "{} accepted",
                spec
            );
        }
    }
}
