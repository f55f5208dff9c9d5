//! Two-phase loudness normalisation
//!
//! ```text
//! Idle ──► Measuring ──► Deciding ──► Applying ──► Validating ──► Done
//!   │          │             │            │
//!   │          └─────────────┴────────────┴──► Error
//!   └──► SkippedDone (normalisation disabled)
//! ```
//!
//! The measuring pass runs the engine's loudness filter over the whole stream
//! and discards the output; its diagnostic summary supplies the measured
//! values and the engine's target offset. The deciding stage runs the pure
//! calculators, the applying pass writes the normalised stream, and the
//! validating stage checks the result against the tolerance band.

use crate::calculator::{
    calculate_gain, calculate_limiter_ceiling, calculate_linear_mode_target, GainDecision,
    LimiterDecision, LinearModeDecision,
};
use crate::config::{NormalisationConfig, NormalisationTargets};
use crate::diagnostics::DiagnosticsSink;
use crate::engine::{AudioFrame, AudioSink, AudioSource, FilterEngine, FilterGraph};
use crate::error::{EngineError, NormaliseError, Result};
use crate::filter_spec::{
    FilterChain, FilterStage, FormatStage, LoudnormMeasured, LoudnormStage, MeterStage,
};
use crate::snapshot::{LoudnormSummary, MeasurementSnapshot, MetadataAccumulator};
use crate::tuner::{tune_limiter, LimiterParams};
use serde::Serialize;
use tracing::{debug, info, warn};

const MEASURE_LABEL: &str = "Measuring loudness";
const APPLY_LABEL: &str = "Applying normalisation";

/// Stage of the normalisation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormaliseState {
    Idle,
    Measuring,
    Deciding,
    Applying,
    Validating,
    Done,
    SkippedDone,
    Error,
}

/// Progress side channel; not part of the correctness contract
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    /// 1 for the measuring pass, 2 for the applying pass
    pub pass: u8,
    pub label: &'static str,
    /// 0.0-1.0, or 0.0 when the stream length is unknown
    pub fraction: f64,
    /// Latest momentary loudness
    pub level_lufs: Option<f64>,
    /// Set once a pass has produced its snapshot
    pub measurement: Option<&'a MeasurementSnapshot>,
}

/// Terminal record of one normalisation run
///
/// Numeric loudness fields are NaN when the run was skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalisationResult {
    pub input_i: f64,
    pub input_tp: f64,
    pub input_lra: f64,
    pub output_i: f64,
    pub output_tp: f64,
    pub output_lra: f64,
    /// Gain from measured loudness to the effective target (dB)
    pub gain_applied_db: f64,
    pub requested_target_i: f64,
    pub effective_target_i: f64,
    /// The requested target was lowered to stay linear under the peak ceiling
    pub linear_mode_forced: bool,
    pub limiter: LimiterDecision,
    /// Pre-limiter settings used by the apply pass, if one ran
    pub limiter_params: Option<LimiterParams>,
    /// Gain check of the measured input against the requested target
    pub gain_check: Option<GainDecision>,
    /// `|output_i - effective_target_i|`
    pub deviation_lu: f64,
    pub within_target: bool,
    pub skipped: bool,
    /// Snapshot from the measuring pass
    pub input_measurement: Option<MeasurementSnapshot>,
    /// Snapshot accumulated over the applying pass
    pub measurement: Option<MeasurementSnapshot>,
}

impl NormalisationResult {
    fn skipped(targets: &NormalisationTargets) -> Self {
        Self {
            input_i: f64::NAN,
            input_tp: f64::NAN,
            input_lra: f64::NAN,
            output_i: f64::NAN,
            output_tp: f64::NAN,
            output_lra: f64::NAN,
            gain_applied_db: 0.0,
            requested_target_i: targets.desired_i,
            effective_target_i: targets.desired_i,
            linear_mode_forced: false,
            limiter: LimiterDecision::not_needed(),
            limiter_params: None,
            gain_check: None,
            deviation_lu: f64::NAN,
            within_target: false,
            skipped: true,
            input_measurement: None,
            measurement: None,
        }
    }
}

/// Values decided between the two passes
#[derive(Debug, Clone, Copy)]
struct Decision {
    gain: GainDecision,
    limiter: LimiterDecision,
    linear: LinearModeDecision,
    limiter_params: Option<LimiterParams>,
    /// Peak reported to the loudness filter in the apply pass
    apply_peak_dbtp: f64,
}

/// Drives one engine through measure, decide, apply and validate
///
/// Each normaliser owns its diagnostics sink, so separate normalisers can run
/// concurrently; a single normaliser runs one stream at a time.
pub struct Normaliser<E: FilterEngine> {
    engine: E,
    config: NormalisationConfig,
    diagnostics: DiagnosticsSink,
    state: NormaliseState,
}

impl<E: FilterEngine> Normaliser<E> {
    pub fn new(engine: E, config: NormalisationConfig) -> Self {
        let diagnostics = DiagnosticsSink::new(config.diagnostics_level);
        Self {
            engine,
            config,
            diagnostics,
            state: NormaliseState::Idle,
        }
    }

    /// Current state machine stage
    pub fn state(&self) -> NormaliseState {
        self.state
    }

    pub fn config(&self) -> &NormalisationConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &DiagnosticsSink {
        &self.diagnostics
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn transition(&mut self, next: NormaliseState) {
        debug!("Normaliser {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Normalise `source` into `sink`
    ///
    /// `prior` is a snapshot from an earlier processing stage; its spectral
    /// statistics, when present, drive limiter tuning.
    pub fn normalise(
        &mut self,
        source: &mut dyn AudioSource,
        sink: &mut dyn AudioSink,
        prior: Option<&MeasurementSnapshot>,
    ) -> Result<NormalisationResult> {
        self.normalise_with_progress(source, sink, prior, &mut |_| {})
    }

    /// [`Normaliser::normalise`] with a progress callback
    pub fn normalise_with_progress(
        &mut self,
        source: &mut dyn AudioSource,
        sink: &mut dyn AudioSink,
        prior: Option<&MeasurementSnapshot>,
        progress: &mut dyn FnMut(&Progress<'_>),
    ) -> Result<NormalisationResult> {
        self.state = NormaliseState::Idle;
        if let Err(err) = self.config.validate() {
            warn!("Rejected normalisation config: {}", err);
            self.transition(NormaliseState::Error);
            return Err(err);
        }
        let targets = self.config.targets();

        if !self.config.enabled {
            info!("Loudness normalisation disabled, skipping");
            self.transition(NormaliseState::SkippedDone);
            return Ok(NormalisationResult::skipped(&targets));
        }

        match self.run(&targets, source, sink, prior, progress) {
            Ok(result) => {
                self.transition(NormaliseState::Done);
                Ok(result)
            }
            Err(err) => {
                warn!("Loudness normalisation failed: {}", err);
                self.transition(NormaliseState::Error);
                Err(err)
            }
        }
    }

    fn run(
        &mut self,
        targets: &NormalisationTargets,
        source: &mut dyn AudioSource,
        sink: &mut dyn AudioSink,
        prior: Option<&MeasurementSnapshot>,
        progress: &mut dyn FnMut(&Progress<'_>),
    ) -> Result<NormalisationResult> {
        self.transition(NormaliseState::Measuring);
        let measured = self.measure(targets, source, progress)?;
        info!("Measured input: {}", measured);

        self.transition(NormaliseState::Deciding);
        let decision = self.decide(targets, &measured, prior)?;

        self.transition(NormaliseState::Applying);
        let output = self.apply(targets, &measured, &decision, source, sink, progress)?;

        self.transition(NormaliseState::Validating);
        let deviation_lu = (output.integrated_lufs - decision.linear.effective_target_i).abs();
        let within_target = deviation_lu <= targets.tolerance_lu;

        if within_target {
            info!(
                "Normalised to {:.2} LUFS ({:.2} dBTP), {:.2} LU from target",
                output.integrated_lufs, output.true_peak_dbtp, deviation_lu
            );
        } else {
            warn!(
                "Output {:.2} LUFS is {:.2} LU from target {:.2} LUFS (tolerance {:.2} LU)",
                output.integrated_lufs,
                deviation_lu,
                decision.linear.effective_target_i,
                targets.tolerance_lu
            );
        }

        Ok(NormalisationResult {
            input_i: measured.integrated_lufs,
            input_tp: measured.true_peak_dbtp,
            input_lra: measured.loudness_range_lu,
            output_i: output.integrated_lufs,
            output_tp: output.true_peak_dbtp,
            output_lra: output.loudness_range_lu,
            gain_applied_db: decision.linear.offset_db,
            requested_target_i: targets.desired_i,
            effective_target_i: decision.linear.effective_target_i,
            linear_mode_forced: !decision.linear.linear_possible,
            limiter: decision.limiter,
            limiter_params: decision.limiter_params,
            gain_check: Some(decision.gain),
            deviation_lu,
            within_target,
            skipped: false,
            input_measurement: Some(measured),
            measurement: Some(output),
        })
    }

    fn measure(
        &self,
        targets: &NormalisationTargets,
        source: &mut dyn AudioSource,
        progress: &mut dyn FnMut(&Progress<'_>),
    ) -> Result<MeasurementSnapshot> {
        let chain = FilterChain::new()
            .with(FilterStage::Meter(MeterStage {
                astats: true,
                spectral: true,
            }))
            .with(FilterStage::Loudnorm(LoudnormStage {
                target_i: targets.desired_i,
                target_tp: targets.target_tp,
                target_lra: targets.target_lra,
                measured: None,
                print_summary: true,
            }));
        let spec = chain.to_string();
        debug!("Measurement chain: {}", spec);

        let mut accumulator = MetadataAccumulator::new();
        let text = {
            let capture = self.diagnostics.begin_capture();
            source.rewind().map_err(measurement_failure)?;
            let mut graph = self
                .engine
                .open(&spec, source.format(), self.diagnostics.clone())
                .map_err(measurement_failure)?;

            run_pass(
                1,
                MEASURE_LABEL,
                source,
                graph.as_mut(),
                &mut accumulator,
                &mut |_| Ok(()),
                progress,
            )
            .map_err(measurement_failure)?;
            drop(graph);
            capture.finish()
        };

        let summary = LoudnormSummary::from_log(&text)?;
        let mut snapshot = MeasurementSnapshot::from_summary(&summary);
        if !snapshot.is_audible() {
            return Err(NormaliseError::SilentAudio {
                loudness: snapshot.integrated_lufs,
            });
        }

        if let Some(meter) = accumulator.finish(summary.target_offset) {
            snapshot.sample_peak_dbfs = meter.sample_peak_dbfs;
            snapshot.rms_dbfs = meter.rms_dbfs;
        }
        snapshot.spectral = accumulator.spectral();

        progress(&Progress {
            pass: 1,
            label: MEASURE_LABEL,
            fraction: 1.0,
            level_lufs: Some(snapshot.integrated_lufs),
            measurement: Some(&snapshot),
        });

        Ok(snapshot)
    }

    fn decide(
        &self,
        targets: &NormalisationTargets,
        measured: &MeasurementSnapshot,
        prior: Option<&MeasurementSnapshot>,
    ) -> Result<Decision> {
        let measured_i = measured.integrated_lufs;
        let measured_tp = measured.true_peak_dbtp;

        let gain = calculate_gain(measured_i, targets.desired_i, targets.tolerance_lu)?;
        let limiter =
            calculate_limiter_ceiling(measured_i, measured_tp, targets.desired_i, targets.target_tp)?;

        // Without a limiter stage nothing removes peaks ahead of the gain
        let limiter_enabled = self.config.limiter.enabled;
        let apply_peak_dbtp = if limiter_enabled {
            limiter.effective_peak(measured_tp)
        } else {
            measured_tp
        };

        let linear = calculate_linear_mode_target(
            measured_i,
            apply_peak_dbtp,
            targets.desired_i,
            targets.target_tp,
        )?;

        if limiter.clamped {
            warn!(
                "Limiter ceiling clamped to {:.1} dBTP; full headroom is not available",
                limiter.ceiling_dbtp
            );
        }
        if !linear.linear_possible {
            warn!(
                "Target {:.2} LUFS not reachable linearly, using {:.2} LUFS",
                targets.desired_i, linear.effective_target_i
            );
        }

        let limiter_params = (limiter_enabled && limiter.needed).then(|| {
            let mut params = self.config.limiter.params(limiter.ceiling_dbtp);
            let spectral = prior
                .and_then(|p| p.spectral.as_ref())
                .or(measured.spectral.as_ref());
            tune_limiter(&mut params, spectral, measured.loudness_range_lu);
            params
        });

        debug!(
            "Decision: gain {:+.2} dB (needed {}), ceiling {:.2} dBTP (needed {}, clamped {}), effective target {:.2} LUFS",
            gain.gain_db,
            gain.needed,
            limiter.ceiling_dbtp,
            limiter.needed,
            limiter.clamped,
            linear.effective_target_i
        );

        Ok(Decision {
            gain,
            limiter,
            linear,
            limiter_params,
            apply_peak_dbtp,
        })
    }

    fn apply(
        &self,
        targets: &NormalisationTargets,
        measured: &MeasurementSnapshot,
        decision: &Decision,
        source: &mut dyn AudioSource,
        sink: &mut dyn AudioSink,
        progress: &mut dyn FnMut(&Progress<'_>),
    ) -> Result<MeasurementSnapshot> {
        let mut chain = FilterChain::new();
        if let Some(params) = decision.limiter_params {
            chain.push(FilterStage::Limiter(params));
        }
        chain.push(FilterStage::Loudnorm(LoudnormStage {
            target_i: decision.linear.effective_target_i,
            target_tp: targets.target_tp,
            target_lra: targets.target_lra,
            measured: Some(LoudnormMeasured {
                integrated_lufs: measured.integrated_lufs,
                true_peak_dbtp: decision.apply_peak_dbtp,
                loudness_range_lu: measured.loudness_range_lu,
                threshold_lufs: measured.threshold_lufs,
                offset_db: measured.target_offset_db,
            }),
            print_summary: true,
        }));
        chain.push(FilterStage::Meter(MeterStage {
            astats: true,
            spectral: true,
        }));
        let output = self.config.output;
        if output.sample_rate.is_some() || output.channels.is_some() {
            chain.push(FilterStage::Format(FormatStage {
                sample_rate: output.sample_rate,
                channels: output.channels,
            }));
        }
        let spec = chain.to_string();
        debug!("Apply chain: {}", spec);

        let mut accumulator = MetadataAccumulator::new();
        let outcome = {
            let capture = self.diagnostics.begin_capture();
            let outcome = self.run_apply(&spec, source, sink, &mut accumulator, progress);
            let text = capture.finish();
            if let Ok(summary) = LoudnormSummary::from_log(&text) {
                debug!(
                    "Engine reported {} normalisation to {:.2} LUFS",
                    summary.normalization_type, summary.output_i
                );
            }
            outcome
        };

        if let Err(err) = outcome {
            sink.discard();
            return Err(NormaliseError::Apply(err.to_string()));
        }
        let Some(snapshot) = accumulator.finish(measured.target_offset_db) else {
            sink.discard();
            return Err(NormaliseError::Apply(
                "apply pass produced no loudness metadata".to_string(),
            ));
        };
        if let Err(err) = sink.commit() {
            sink.discard();
            return Err(NormaliseError::Apply(err.to_string()));
        }

        progress(&Progress {
            pass: 2,
            label: APPLY_LABEL,
            fraction: 1.0,
            level_lufs: Some(snapshot.integrated_lufs),
            measurement: Some(&snapshot),
        });

        Ok(snapshot)
    }

    fn run_apply(
        &self,
        spec: &str,
        source: &mut dyn AudioSource,
        sink: &mut dyn AudioSink,
        accumulator: &mut MetadataAccumulator,
        progress: &mut dyn FnMut(&Progress<'_>),
    ) -> std::result::Result<(), EngineError> {
        source.rewind()?;
        let mut graph = self
            .engine
            .open(spec, source.format(), self.diagnostics.clone())?;
        run_pass(
            2,
            APPLY_LABEL,
            source,
            graph.as_mut(),
            accumulator,
            &mut |frame| sink.write_frame(frame),
            progress,
        )
    }
}

/// Stream `source` through `graph` to end of stream, including the flush
fn run_pass(
    pass: u8,
    label: &'static str,
    source: &mut dyn AudioSource,
    graph: &mut dyn FilterGraph,
    accumulator: &mut MetadataAccumulator,
    output: &mut dyn FnMut(&AudioFrame) -> std::result::Result<(), EngineError>,
    progress: &mut dyn FnMut(&Progress<'_>),
) -> std::result::Result<(), EngineError> {
    let total = source.total_frames();
    let mut consumed: u64 = 0;

    loop {
        let frame = source.read_frame()?;
        let finished = frame.is_none();
        if let Some(frame) = &frame {
            consumed += frame.frames() as u64;
        }

        for out in graph.push(frame)? {
            accumulator.observe(&out.metadata);
            output(&out)?;
        }

        if finished {
            return Ok(());
        }

        progress(&Progress {
            pass,
            label,
            fraction: fraction(consumed, total),
            level_lufs: accumulator.live_level(),
            measurement: None,
        });
    }
}

fn fraction(consumed: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => (consumed as f64 / total as f64).min(1.0),
        _ => 0.0,
    }
}

fn measurement_failure(err: EngineError) -> NormaliseError {
    NormaliseError::Measurement(err.to_string())
}
