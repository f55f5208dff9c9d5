/// Normalisation configuration
use crate::diagnostics::LogLevel;
use crate::error::{NormaliseError, Result};
use crate::tuner::LimiterParams;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Requested loudness targets for one run; immutable once the run starts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalisationTargets {
    /// Desired integrated loudness (LUFS)
    pub desired_i: f64,
    /// True-peak ceiling (dBTP)
    pub target_tp: f64,
    /// Loudness range target passed to the engine (LU)
    pub target_lra: f64,
    /// Accepted deviation from the target (LU)
    pub tolerance_lu: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NormalisationConfig {
    /// When false the normaliser skips without measuring
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_target_i")]
    pub target_i: f64,

    #[serde(default = "default_target_tp")]
    pub target_tp: f64,

    #[serde(default = "default_target_lra")]
    pub target_lra: f64,

    #[serde(default = "default_tolerance_lu")]
    pub tolerance_lu: f64,

    #[serde(default = "default_limiter")]
    pub limiter: LimiterSettings,

    #[serde(default)]
    pub output: OutputSettings,

    /// Engine diagnostic verbosity outside of captures
    #[serde(default = "default_diagnostics_level")]
    pub diagnostics_level: LogLevel,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimiterSettings {
    /// Allow a pre-limiter stage in the apply pass
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_attack_ms")]
    pub attack_ms: f64,

    #[serde(default = "default_release_ms")]
    pub release_ms: f64,

    #[serde(default)]
    pub asc: bool,

    #[serde(default = "default_asc_level")]
    pub asc_level: f64,
}

impl LimiterSettings {
    /// Starting parameters for the tuner, at the given ceiling
    pub fn params(&self, ceiling_dbtp: f64) -> LimiterParams {
        LimiterParams {
            ceiling_dbtp,
            attack_ms: self.attack_ms,
            release_ms: self.release_ms,
            asc: self.asc,
            asc_level: self.asc_level,
        }
    }
}

/// Output format conversion applied at the end of the apply pass
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct OutputSettings {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

impl NormalisationConfig {
    /// Load configuration from an optional file and the environment
    ///
    /// Environment variables are prefixed with `CASTNORM_` and use `__` as the
    /// nesting separator (`CASTNORM_LIMITER__ENABLED=false`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(NormaliseError::Config(format!(
                    "Config file not found: {:?}",
                    path
                )));
            }
            settings = settings.add_source(config::File::from(path));
        }

        settings = settings.add_source(
            config::Environment::with_prefix("CASTNORM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(-70.0..=-5.0).contains(&self.target_i) {
            return Err(NormaliseError::InvalidTarget(format!(
                "target_i {} LUFS is outside -70..-5",
                self.target_i
            )));
        }
        if !(-9.0..=0.0).contains(&self.target_tp) {
            return Err(NormaliseError::InvalidTarget(format!(
                "target_tp {} dBTP is outside -9..0",
                self.target_tp
            )));
        }
        if !(1.0..=50.0).contains(&self.target_lra) {
            return Err(NormaliseError::InvalidTarget(format!(
                "target_lra {} LU is outside 1..50",
                self.target_lra
            )));
        }
        if self.tolerance_lu.is_nan() || self.tolerance_lu <= 0.0 {
            return Err(NormaliseError::Config(format!(
                "tolerance_lu must be positive, got {}",
                self.tolerance_lu
            )));
        }
        if !(0.0..=1.0).contains(&self.limiter.asc_level) {
            return Err(NormaliseError::Config(format!(
                "limiter.asc_level must be within 0..1, got {}",
                self.limiter.asc_level
            )));
        }
        if self.limiter.attack_ms <= 0.0 || self.limiter.release_ms <= 0.0 {
            return Err(NormaliseError::Config(
                "limiter attack and release must be positive".to_string(),
            ));
        }
        if self.output.sample_rate == Some(0) || self.output.channels == Some(0) {
            return Err(NormaliseError::Config(
                "output sample_rate and channels must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Targets for one normalisation run
    pub fn targets(&self) -> NormalisationTargets {
        NormalisationTargets {
            desired_i: self.target_i,
            target_tp: self.target_tp,
            target_lra: self.target_lra,
            tolerance_lu: self.tolerance_lu,
        }
    }
}

// Default values
fn default_enabled() -> bool {
    true
}

fn default_target_i() -> f64 {
    -16.0
}

fn default_target_tp() -> f64 {
    -1.5
}

fn default_target_lra() -> f64 {
    11.0
}

fn default_tolerance_lu() -> f64 {
    0.5
}

fn default_limiter() -> LimiterSettings {
    LimiterSettings {
        enabled: default_enabled(),
        attack_ms: default_attack_ms(),
        release_ms: default_release_ms(),
        asc: false,
        asc_level: default_asc_level(),
    }
}

fn default_attack_ms() -> f64 {
    5.0
}

fn default_release_ms() -> f64 {
    50.0
}

fn default_asc_level() -> f64 {
    0.5
}

fn default_diagnostics_level() -> LogLevel {
    LogLevel::Warning
}

impl Default for NormalisationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            target_i: default_target_i(),
            target_tp: default_target_tp(),
            target_lra: default_target_lra(),
            tolerance_lu: default_tolerance_lu(),
            limiter: default_limiter(),
            output: OutputSettings::default(),
            diagnostics_level: default_diagnostics_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NormalisationConfig::default();
        assert!(config.validate().is_ok());

        let targets = config.targets();
        assert_eq!(targets.desired_i, -16.0);
        assert_eq!(targets.target_tp, -1.5);
        assert_eq!(targets.tolerance_lu, 0.5);
    }

    #[test]
    fn test_validate_rejects_out_of_range_targets() {
        let mut config = NormalisationConfig::default();
        config.target_i = -2.0;
        assert!(matches!(
            config.validate(),
            Err(NormaliseError::InvalidTarget(_))
        ));

        let mut config = NormalisationConfig::default();
        config.target_tp = 1.0;
        assert!(config.validate().is_err());

        let mut config = NormalisationConfig::default();
        config.tolerance_lu = 0.0;
        assert!(matches!(config.validate(), Err(NormaliseError::Config(_))));

        let mut config = NormalisationConfig::default();
        config.limiter.asc_level = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "target_i = -19.0\ntolerance_lu = 1.0\n\n[limiter]\nenabled = false\n\n[output]\nsample_rate = 44100"
        )
        .unwrap();

        let config = NormalisationConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.target_i, -19.0);
        assert_eq!(config.tolerance_lu, 1.0);
        assert!(!config.limiter.enabled);
        assert_eq!(config.limiter.attack_ms, 5.0);
        assert_eq!(config.output.sample_rate, Some(44100));
        assert_eq!(config.target_tp, -1.5);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = NormalisationConfig::load(Some(Path::new("/nonexistent/castnorm.toml")));
        assert!(matches!(result, Err(NormaliseError::Config(_))));
    }

    #[test]
    fn test_limiter_settings_to_params() {
        let config = NormalisationConfig::default();
        let params = config.limiter.params(-12.9);
        assert_eq!(params.ceiling_dbtp, -12.9);
        assert_eq!(params.attack_ms, 5.0);
        assert!(!params.asc);
    }
}
