//! Measurement snapshots
//!
//! A [`MeasurementSnapshot`] is the read-only result of one measurement pass:
//! integrated loudness, true peak, loudness range, gating threshold and the
//! engine's own target offset. It is produced either from the loudness summary
//! the engine prints on its diagnostic channel ([`LoudnormSummary`]) or by
//! accumulating the per-frame metadata emitted by the apply pass
//! ([`MetadataAccumulator`]).

use crate::engine::FrameMetadata;
use crate::error::{NormaliseError, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Loudness at or below which input is treated as silent (LUFS)
pub const SILENCE_FLOOR_LUFS: f64 = -70.0;

/// Spectral and amplitude statistics of a signal, consumed by the limiter tuner
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpectralSnapshot {
    /// Mean absolute sample delta divided by mean absolute sample level
    pub transient_intensity: f64,
    /// Ratio of spectral peak to spectral mean, in dB
    pub spectral_crest_db: f64,
    /// Mean positive frame-to-frame spectral change, normalised to 0..1
    pub spectral_flux: f64,
    /// Peak level minus quietest block RMS, in dB
    pub dynamic_range_db: f64,
    /// Noise floor estimate in dBFS
    pub noise_floor_db: f64,
}

/// Result of one measurement pass over audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSnapshot {
    /// Integrated loudness in LUFS (may be `-inf`)
    pub integrated_lufs: f64,
    /// True peak in dBTP
    pub true_peak_dbtp: f64,
    /// Loudness range in LU
    pub loudness_range_lu: f64,
    /// Relative gating threshold in LUFS
    pub threshold_lufs: f64,
    /// Gain bias reported by the engine; reused verbatim, never recomputed
    pub target_offset_db: f64,
    /// Sample peak in dBFS, when the pass measured it
    pub sample_peak_dbfs: Option<f64>,
    /// RMS level in dBFS, when the pass measured it
    pub rms_dbfs: Option<f64>,
    /// Optional spectral companion statistics
    pub spectral: Option<SpectralSnapshot>,
}

impl MeasurementSnapshot {
    /// Whether the integrated loudness is usable for gain decisions
    pub fn is_audible(&self) -> bool {
        is_audible(self.integrated_lufs)
    }

    /// Build a snapshot from the engine's loudness summary (input side)
    pub fn from_summary(summary: &LoudnormSummary) -> Self {
        Self {
            integrated_lufs: summary.input_i,
            true_peak_dbtp: summary.input_tp,
            loudness_range_lu: summary.input_lra,
            threshold_lufs: summary.input_thresh,
            target_offset_db: summary.target_offset,
            sample_peak_dbfs: None,
            rms_dbfs: None,
            spectral: None,
        }
    }
}

impl fmt::Display for MeasurementSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "I: {:.2} LUFS, TP: {:.2} dBTP, LRA: {:.2} LU, Thresh: {:.2} LUFS, Offset: {:.2} dB",
            self.integrated_lufs,
            self.true_peak_dbtp,
            self.loudness_range_lu,
            self.threshold_lufs,
            self.target_offset_db
        )
    }
}

/// `true` unless `lufs` is non-finite or below the silence floor
pub fn is_audible(lufs: f64) -> bool {
    lufs.is_finite() && lufs >= SILENCE_FLOOR_LUFS
}

/// Structured summary printed by a loudness-normalisation filter on completion
///
/// Values are written by the engine as strings (`"-23.54"`, `"-inf"`); numbers
/// are accepted as well.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoudnormSummary {
    #[serde(deserialize_with = "level")]
    pub input_i: f64,
    #[serde(deserialize_with = "level")]
    pub input_tp: f64,
    #[serde(deserialize_with = "level")]
    pub input_lra: f64,
    #[serde(deserialize_with = "level")]
    pub input_thresh: f64,
    #[serde(deserialize_with = "level")]
    pub output_i: f64,
    #[serde(deserialize_with = "level")]
    pub output_tp: f64,
    #[serde(deserialize_with = "level")]
    pub output_lra: f64,
    #[serde(deserialize_with = "level")]
    pub output_thresh: f64,
    pub normalization_type: String,
    #[serde(deserialize_with = "level")]
    pub target_offset: f64,
}

impl LoudnormSummary {
    /// Extract the last complete summary object from captured diagnostic text
    ///
    /// Diagnostic text interleaves ordinary log lines with the JSON block, so
    /// candidate objects are tried from the end of the buffer backwards.
    pub fn from_log(text: &str) -> Result<Self> {
        let mut last_error = None;

        for (start, _) in text.rmatch_indices('{') {
            let Some(len) = text[start..].find('}') else {
                continue;
            };
            match serde_json::from_str::<Self>(&text[start..=start + len]) {
                Ok(summary) => return Ok(summary),
                Err(err) => last_error = Some(err.to_string()),
            }
        }

        Err(NormaliseError::Measurement(match last_error {
            Some(err) => format!("unparseable loudness summary: {}", err),
            None => "no loudness summary in diagnostic output".to_string(),
        }))
    }

    /// Render in the engine's diagnostic JSON layout
    pub fn to_json(&self) -> String {
        format!(
            "{{\n\t\"input_i\" : \"{}\",\n\t\"input_tp\" : \"{}\",\n\t\"input_lra\" : \"{}\",\n\t\"input_thresh\" : \"{}\",\n\t\"output_i\" : \"{}\",\n\t\"output_tp\" : \"{}\",\n\t\"output_lra\" : \"{}\",\n\t\"output_thresh\" : \"{}\",\n\t\"normalization_type\" : \"{}\",\n\t\"target_offset\" : \"{}\"\n}}",
            fmt_level(self.input_i),
            fmt_level(self.input_tp),
            fmt_level(self.input_lra),
            fmt_level(self.input_thresh),
            fmt_level(self.output_i),
            fmt_level(self.output_tp),
            fmt_level(self.output_lra),
            fmt_level(self.output_thresh),
            self.normalization_type,
            fmt_level(self.target_offset),
        )
    }
}

fn fmt_level(value: f64) -> String {
    if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        format!("{:.2}", value)
    }
}

fn level<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| de::Error::custom("level out of range")),
        serde_json::Value::String(s) => s.trim().parse::<f64>().map_err(de::Error::custom),
        other => Err(de::Error::custom(format!("expected a level, got {}", other))),
    }
}

/// Folds per-frame measurement metadata into a final snapshot
///
/// Cumulative values (integrated loudness, LRA, threshold) take the latest
/// reported value; peaks take the maximum seen.
#[derive(Debug, Default)]
pub struct MetadataAccumulator {
    integrated_lufs: Option<f64>,
    momentary_lufs: Option<f64>,
    loudness_range_lu: Option<f64>,
    threshold_lufs: Option<f64>,
    true_peak_dbtp: Option<f64>,
    sample_peak_dbfs: Option<f64>,
    rms_dbfs: Option<f64>,
    spectral: Option<SpectralSnapshot>,
    frames: u64,
}

impl MetadataAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the metadata attached to one output frame
    pub fn observe(&mut self, metadata: &FrameMetadata) {
        self.frames += 1;
        latest(&mut self.integrated_lufs, metadata.integrated_lufs);
        latest(&mut self.momentary_lufs, metadata.momentary_lufs);
        latest(&mut self.loudness_range_lu, metadata.loudness_range_lu);
        latest(&mut self.threshold_lufs, metadata.threshold_lufs);
        latest(&mut self.rms_dbfs, metadata.rms_dbfs);
        maximum(&mut self.true_peak_dbtp, metadata.true_peak_dbtp);
        maximum(&mut self.sample_peak_dbfs, metadata.sample_peak_dbfs);
        if metadata.spectral.is_some() {
            self.spectral = metadata.spectral;
        }
    }

    /// Number of frames observed so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Most recent momentary loudness, for live level display
    pub fn live_level(&self) -> Option<f64> {
        self.momentary_lufs
    }

    /// Most recent spectral statistics
    pub fn spectral(&self) -> Option<SpectralSnapshot> {
        self.spectral
    }

    /// Produce the snapshot, carrying `target_offset_db` through unchanged
    ///
    /// Returns `None` when no frame reported integrated loudness.
    pub fn finish(&self, target_offset_db: f64) -> Option<MeasurementSnapshot> {
        let integrated_lufs = self.integrated_lufs?;
        Some(MeasurementSnapshot {
            integrated_lufs,
            true_peak_dbtp: self.true_peak_dbtp.unwrap_or(f64::NEG_INFINITY),
            loudness_range_lu: self.loudness_range_lu.unwrap_or(0.0),
            threshold_lufs: self.threshold_lufs.unwrap_or(SILENCE_FLOOR_LUFS),
            target_offset_db,
            sample_peak_dbfs: self.sample_peak_dbfs,
            rms_dbfs: self.rms_dbfs,
            spectral: self.spectral,
        })
    }
}

fn latest(slot: &mut Option<f64>, value: Option<f64>) {
    if value.is_some() {
        *slot = value;
    }
}

fn maximum(slot: &mut Option<f64>, value: Option<f64>) {
    if let Some(v) = value {
        *slot = Some(slot.map_or(v, |current| current.max(v)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FFMPEG_STYLE_LOG: &str = "[Parsed_loudnorm_0 @ 0x55d] \n{\n\t\"input_i\" : \"-27.61\",\n\t\"input_tp\" : \"-4.47\",\n\t\"input_lra\" : \"18.06\",\n\t\"input_thresh\" : \"-39.20\",\n\t\"output_i\" : \"-16.58\",\n\t\"output_tp\" : \"-1.50\",\n\t\"output_lra\" : \"14.78\",\n\t\"output_thresh\" : \"-27.71\",\n\t\"normalization_type\" : \"dynamic\",\n\t\"target_offset\" : \"0.58\"\n}\n";

    #[test]
    fn test_summary_parsed_from_noisy_log() {
        let summary = LoudnormSummary::from_log(FFMPEG_STYLE_LOG).unwrap();
        assert!((summary.input_i - (-27.61)).abs() < 1e-9);
        assert!((summary.target_offset - 0.58).abs() < 1e-9);
        assert_eq!(summary.normalization_type, "dynamic");
    }

    #[test]
    fn test_summary_accepts_infinite_and_numeric_values() {
        let log = r#"{"input_i": "-inf", "input_tp": -91.0, "input_lra": "0.00",
            "input_thresh": "-70.00", "output_i": "-inf", "output_tp": "-inf",
            "output_lra": "0.00", "output_thresh": "-70.00",
            "normalization_type": "dynamic", "target_offset": "inf"}"#;
        let summary = LoudnormSummary::from_log(log).unwrap();
        assert!(summary.input_i.is_infinite() && summary.input_i < 0.0);
        assert!((summary.input_tp - (-91.0)).abs() < 1e-9);
    }

    #[test]
    fn test_summary_missing_is_measurement_error() {
        let err = LoudnormSummary::from_log("frame=  100 size=N/A\n").unwrap_err();
        assert!(matches!(err, NormaliseError::Measurement(_)));

        let err = LoudnormSummary::from_log("{ \"input_i\" : \"-20\" }").unwrap_err();
        assert!(matches!(err, NormaliseError::Measurement(_)));
    }

    #[test]
    fn test_last_summary_wins() {
        let first = FFMPEG_STYLE_LOG.replace("-27.61", "-30.00");
        let log = format!("{}{}", first, FFMPEG_STYLE_LOG);
        let summary = LoudnormSummary::from_log(&log).unwrap();
        assert!((summary.input_i - (-27.61)).abs() < 1e-9);
    }

    #[test]
    fn test_rendered_json_is_parseable() {
        let summary = LoudnormSummary::from_log(FFMPEG_STYLE_LOG).unwrap();
        let reparsed = LoudnormSummary::from_log(&summary.to_json()).unwrap();
        assert_eq!(summary, reparsed);
    }

    #[test]
    fn test_accumulator_keeps_latest_and_maximum() {
        let mut acc = MetadataAccumulator::new();
        acc.observe(&FrameMetadata {
            integrated_lufs: Some(-20.0),
            true_peak_dbtp: Some(-3.0),
            ..FrameMetadata::default()
        });
        acc.observe(&FrameMetadata {
            integrated_lufs: Some(-18.0),
            true_peak_dbtp: Some(-6.0),
            loudness_range_lu: Some(4.0),
            ..FrameMetadata::default()
        });
        acc.observe(&FrameMetadata::default());

        let snapshot = acc.finish(0.25).unwrap();
        assert_eq!(acc.frames(), 3);
        assert!((snapshot.integrated_lufs - (-18.0)).abs() < 1e-9);
        assert!((snapshot.true_peak_dbtp - (-3.0)).abs() < 1e-9);
        assert!((snapshot.loudness_range_lu - 4.0).abs() < 1e-9);
        assert!((snapshot.target_offset_db - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_accumulator_without_loudness_yields_none() {
        let mut acc = MetadataAccumulator::new();
        acc.observe(&FrameMetadata::default());
        assert!(acc.finish(0.0).is_none());
    }

    #[test]
    fn test_audibility() {
        assert!(is_audible(-70.0));
        assert!(is_audible(-16.0));
        assert!(!is_audible(-70.01));
        assert!(!is_audible(f64::NEG_INFINITY));
        assert!(!is_audible(f64::NAN));
    }
}
