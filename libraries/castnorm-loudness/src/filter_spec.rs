//! Filter-chain serialisation boundary
//!
//! Typed stage descriptions are rendered to the engine's textual grammar
//! here and nowhere else; the decision logic never builds strings.
//!
//! ```text
//! chain  = stage *("," stage)
//! stage  = name ["=" option *(":" option)]
//! option = key "=" value
//! ```
//!
//! # Example
//!
//! ```
//! use castnorm_loudness::filter_spec::{FilterChain, FilterStage, MeterStage};
//!
//! let chain = FilterChain::new().with(FilterStage::Meter(MeterStage {
//!     astats: true,
//!     spectral: false,
//! }));
//! assert_eq!(chain.to_string(), "meter=peak=true:astats=1:spectral=0");
//! ```

use crate::error::EngineError;
use crate::tuner::LimiterParams;
use std::fmt;

/// Measured values handed to a loudness filter running in linear-apply mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnormMeasured {
    pub integrated_lufs: f64,
    pub true_peak_dbtp: f64,
    pub loudness_range_lu: f64,
    pub threshold_lufs: f64,
    pub offset_db: f64,
}

/// Loudness-normalisation filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnormStage {
    pub target_i: f64,
    pub target_tp: f64,
    pub target_lra: f64,
    /// `Some` selects linear-apply mode; `None` measures
    pub measured: Option<LoudnormMeasured>,
    /// Print the JSON summary on the diagnostic channel when the stream ends
    pub print_summary: bool,
}

/// Measurement instrumentation attaching per-frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeterStage {
    /// Amplitude statistics (RMS, dynamic range, noise floor)
    pub astats: bool,
    /// Spectral statistics (transients, crest, flux)
    pub spectral: bool,
}

/// Output format conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatStage {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// One stage of a filter chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterStage {
    Limiter(LimiterParams),
    Loudnorm(LoudnormStage),
    Meter(MeterStage),
    Format(FormatStage),
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limiter(p) => write!(
                f,
                "limiter=ceiling={:.2}:attack={:.2}:release={:.2}:asc={}:asc_level={:.2}",
                p.ceiling_dbtp,
                p.attack_ms,
                p.release_ms,
                u8::from(p.asc),
                p.asc_level
            ),
            Self::Loudnorm(s) => {
                write!(
                    f,
                    "loudnorm=I={:.2}:TP={:.2}:LRA={:.2}",
                    s.target_i, s.target_tp, s.target_lra
                )?;
                if let Some(m) = s.measured {
                    write!(
                        f,
                        ":measured_I={:.2}:measured_TP={:.2}:measured_LRA={:.2}:measured_thresh={:.2}:offset={:.2}:linear=true",
                        m.integrated_lufs,
                        m.true_peak_dbtp,
                        m.loudness_range_lu,
                        m.threshold_lufs,
                        m.offset_db
                    )?;
                }
                let format = if s.print_summary { "json" } else { "none" };
                write!(f, ":print_format={}", format)
            }
            Self::Meter(m) => write!(
                f,
                "meter=peak=true:astats={}:spectral={}",
                u8::from(m.astats),
                u8::from(m.spectral)
            ),
            Self::Format(fs) => {
                let mut options = Vec::new();
                if let Some(rate) = fs.sample_rate {
                    options.push(format!("sample_rates={}", rate));
                }
                if let Some(channels) = fs.channels {
                    options.push(format!("channels={}", channels));
                }
                if options.is_empty() {
                    write!(f, "aformat")
                } else {
                    write!(f, "aformat={}", options.join(":"))
                }
            }
        }
    }
}

/// Ordered list of stages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterChain {
    stages: Vec<FilterStage>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage (builder style)
    pub fn with(mut self, stage: FilterStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn push(&mut self, stage: FilterStage) {
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[FilterStage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Display for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", stage)?;
        }
        Ok(())
    }
}

/// A parsed stage: filter name plus raw options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterNode {
    pub name: String,
    pub options: Vec<(String, String)>,
}

impl FilterNode {
    /// Raw value of `key`, if present
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Numeric value of `key`, if present
    pub fn f64_option(&self, key: &str) -> Result<Option<f64>, EngineError> {
        self.option(key)
            .map(|raw| {
                raw.parse::<f64>().map_err(|e| EngineError::InvalidSpec {
                    spec: self.name.clone(),
                    reason: format!("option {}={}: {}", key, raw, e),
                })
            })
            .transpose()
    }

    /// Boolean value of `key` (`1`/`true`/`0`/`false`), if present
    pub fn bool_option(&self, key: &str) -> Result<Option<bool>, EngineError> {
        self.option(key)
            .map(|raw| match raw.to_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(EngineError::InvalidSpec {
                    spec: self.name.clone(),
                    reason: format!("option {}={} is not a boolean", key, raw),
                }),
            })
            .transpose()
    }
}

/// Split chain text into stages
pub fn parse_chain(spec: &str) -> Result<Vec<FilterNode>, EngineError> {
    let invalid = |reason: String| EngineError::InvalidSpec {
        spec: spec.to_string(),
        reason,
    };

    let mut nodes = Vec::new();
    for stage in spec.split(',').map(str::trim) {
        if stage.is_empty() {
            return Err(invalid("empty stage".to_string()));
        }

        let (name, rest) = match stage.split_once('=') {
            Some((name, rest)) => (name.trim(), Some(rest)),
            None => (stage, None),
        };
        if name.is_empty() {
            return Err(invalid(format!("stage '{}' has no filter name", stage)));
        }

        let mut options = Vec::new();
        if let Some(rest) = rest {
            for option in rest.split(':') {
                let (key, value) = option
                    .split_once('=')
                    .ok_or_else(|| invalid(format!("option '{}' is not key=value", option)))?;
                options.push((key.trim().to_string(), value.trim().to_string()));
            }
        }

        nodes.push(FilterNode {
            name: name.to_string(),
            options,
        });
    }

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_chain() -> FilterChain {
        FilterChain::new()
            .with(FilterStage::Limiter(LimiterParams {
                ceiling_dbtp: -12.9,
                attack_ms: 1.0,
                release_ms: 80.0,
                asc: true,
                asc_level: 0.35,
            }))
            .with(FilterStage::Loudnorm(LoudnormStage {
                target_i: -16.0,
                target_tp: -1.5,
                target_lra: 11.0,
                measured: Some(LoudnormMeasured {
                    integrated_lufs: -24.9,
                    true_peak_dbtp: -12.9,
                    loudness_range_lu: 7.25,
                    threshold_lufs: -35.1,
                    offset_db: 0.12,
                }),
                print_summary: true,
            }))
            .with(FilterStage::Meter(MeterStage::default()))
            .with(FilterStage::Format(FormatStage {
                sample_rate: Some(44100),
                channels: Some(1),
            }))
    }

    #[test]
    fn test_apply_chain_text() {
        assert_eq!(
            apply_chain().to_string(),
            "limiter=ceiling=-12.90:attack=1.00:release=80.00:asc=1:asc_level=0.35,\
             loudnorm=I=-16.00:TP=-1.50:LRA=11.00:measured_I=-24.90:measured_TP=-12.90:\
             measured_LRA=7.25:measured_thresh=-35.10:offset=0.12:linear=true:print_format=json,\
             meter=peak=true:astats=0:spectral=0,\
             aformat=sample_rates=44100:channels=1"
        );
    }

    #[test]
    fn test_measure_loudnorm_has_no_measured_values() {
        let stage = FilterStage::Loudnorm(LoudnormStage {
            target_i: -16.0,
            target_tp: -1.5,
            target_lra: 11.0,
            measured: None,
            print_summary: true,
        });
        assert_eq!(
            stage.to_string(),
            "loudnorm=I=-16.00:TP=-1.50:LRA=11.00:print_format=json"
        );
    }

    #[test]
    fn test_empty_format_stage() {
        assert_eq!(
            FilterStage::Format(FormatStage::default()).to_string(),
            "aformat"
        );
    }

    #[test]
    fn test_rendered_chain_parses() {
        let nodes = parse_chain(&apply_chain().to_string()).unwrap();
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["limiter", "loudnorm", "meter", "aformat"]);

        let loudnorm = &nodes[1];
        assert_eq!(loudnorm.f64_option("measured_TP").unwrap(), Some(-12.9));
        assert_eq!(loudnorm.bool_option("linear").unwrap(), Some(true));
        assert_eq!(loudnorm.option("print_format"), Some("json"));
        assert_eq!(loudnorm.f64_option("missing").unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_chain("").is_err());
        assert!(parse_chain("loudnorm=I").is_err());
        assert!(parse_chain("meter,,aformat").is_err());
        assert!(parse_chain("=I=1").is_err());

        let nodes = parse_chain("loudnorm=I=abc").unwrap();
        assert!(nodes[0].f64_option("I").is_err());
        assert!(nodes[0].bool_option("I").is_err());
    }
}
