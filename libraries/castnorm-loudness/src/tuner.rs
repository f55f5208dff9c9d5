//! Peak-safety limiter tuning
//!
//! Maps post-filter signal statistics to limiter attack, release and auto
//! soft-clip (ASC) settings. Each sub-decision is a threshold ladder evaluated
//! top to bottom; the first matching rung wins.
//!
//! | Decision | Ladder |
//! |----------|--------|
//! | Attack   | extreme (0.5 ms) > sharp (1 ms) > normal (2.5 ms) > gentle (5 ms) |
//! | Release  | expressive (150 ms) / controlled (40 ms) / standard (80 ms), +40 ms for wide dynamic range |
//! | ASC      | dynamic (0.6) > moderate (0.35) > off, +0.15 on noisy content (max 1.0) |

use crate::snapshot::SpectralSnapshot;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Transient intensity at or above which attack is fastest
const TRANSIENT_EXTREME: f64 = 0.5;
const TRANSIENT_SHARP: f64 = 0.3;
const TRANSIENT_NORMAL: f64 = 0.15;

/// Spectral crest (dB) rungs paired with the transient ladder
const CREST_EXTREME_DB: f64 = 30.0;
const CREST_SHARP_DB: f64 = 20.0;
const CREST_NORMAL_DB: f64 = 12.0;

const ATTACK_EXTREME_MS: f64 = 0.5;
const ATTACK_SHARP_MS: f64 = 1.0;
const ATTACK_NORMAL_MS: f64 = 2.5;
const ATTACK_GENTLE_MS: f64 = 5.0;

const FLUX_HIGH: f64 = 0.3;
const FLUX_LOW: f64 = 0.1;
const LRA_WIDE_LU: f64 = 10.0;
const LRA_NARROW_LU: f64 = 6.0;

const RELEASE_EXPRESSIVE_MS: f64 = 150.0;
const RELEASE_CONTROLLED_MS: f64 = 40.0;
const RELEASE_STANDARD_MS: f64 = 80.0;

/// Dynamic range (dB) above which release is lengthened
const DR_WIDE_DB: f64 = 24.0;
const RELEASE_WIDE_DR_BOOST_MS: f64 = 40.0;

const ASC_DR_HIGH_DB: f64 = 30.0;
const ASC_CREST_HIGH_DB: f64 = 35.0;
const ASC_DR_MODERATE_DB: f64 = 20.0;
const ASC_LEVEL_DYNAMIC: f64 = 0.6;
const ASC_LEVEL_MODERATE: f64 = 0.35;

/// Noise floor (dBFS) above which content counts as noisy
const NOISY_FLOOR_DB: f64 = -50.0;
const ASC_NOISE_BOOST: f64 = 0.15;

/// Pre-limiter settings handed to the apply pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimiterParams {
    /// Threshold in dBTP
    pub ceiling_dbtp: f64,
    /// Attack (and lookahead) time in milliseconds
    pub attack_ms: f64,
    /// Release time in milliseconds
    pub release_ms: f64,
    /// Auto soft-clip enabled
    pub asc: bool,
    /// Auto soft-clip amount (0.0-1.0)
    pub asc_level: f64,
}

impl Default for LimiterParams {
    fn default() -> Self {
        Self {
            ceiling_dbtp: -1.0,
            attack_ms: ATTACK_GENTLE_MS,
            release_ms: 50.0,
            asc: false,
            asc_level: 0.5,
        }
    }
}

/// Adjust `params` for the measured signal character
///
/// `None` leaves `params` unchanged.
pub fn tune_limiter(
    params: &mut LimiterParams,
    spectral: Option<&SpectralSnapshot>,
    loudness_range_lu: f64,
) {
    let Some(stats) = spectral else {
        return;
    };

    params.attack_ms = attack_for(stats);
    params.release_ms = release_for(stats, loudness_range_lu);
    apply_soft_clip(params, stats);

    debug!(
        "Tuned limiter: attack {:.1} ms, release {:.0} ms, asc {} ({:.2})",
        params.attack_ms, params.release_ms, params.asc, params.asc_level
    );
}

fn attack_for(stats: &SpectralSnapshot) -> f64 {
    let transient = stats.transient_intensity;
    let crest = stats.spectral_crest_db;

    if transient >= TRANSIENT_EXTREME || crest >= CREST_EXTREME_DB {
        ATTACK_EXTREME_MS
    } else if transient >= TRANSIENT_SHARP || crest >= CREST_SHARP_DB {
        ATTACK_SHARP_MS
    } else if transient >= TRANSIENT_NORMAL || crest >= CREST_NORMAL_DB {
        ATTACK_NORMAL_MS
    } else {
        ATTACK_GENTLE_MS
    }
}

fn release_for(stats: &SpectralSnapshot, loudness_range_lu: f64) -> f64 {
    let base = if stats.spectral_flux >= FLUX_HIGH && loudness_range_lu >= LRA_WIDE_LU {
        RELEASE_EXPRESSIVE_MS
    } else if stats.spectral_flux <= FLUX_LOW && loudness_range_lu <= LRA_NARROW_LU {
        RELEASE_CONTROLLED_MS
    } else {
        RELEASE_STANDARD_MS
    };

    if stats.dynamic_range_db > DR_WIDE_DB {
        base + RELEASE_WIDE_DR_BOOST_MS
    } else {
        base
    }
}

fn apply_soft_clip(params: &mut LimiterParams, stats: &SpectralSnapshot) {
    if stats.dynamic_range_db > ASC_DR_HIGH_DB || stats.spectral_crest_db > ASC_CREST_HIGH_DB {
        params.asc = true;
        params.asc_level = ASC_LEVEL_DYNAMIC;
    } else if stats.dynamic_range_db > ASC_DR_MODERATE_DB {
        params.asc = true;
        params.asc_level = ASC_LEVEL_MODERATE;
    } else {
        params.asc = false;
        params.asc_level = 0.0;
        return;
    }

    // Masks pumping against a raised noise floor
    if stats.noise_floor_db > NOISY_FLOOR_DB {
        params.asc_level = (params.asc_level + ASC_NOISE_BOOST).min(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calm() -> SpectralSnapshot {
        SpectralSnapshot {
            transient_intensity: 0.05,
            spectral_crest_db: 6.0,
            spectral_flux: 0.2,
            dynamic_range_db: 12.0,
            noise_floor_db: -70.0,
        }
    }

    fn tuned(stats: SpectralSnapshot, lra: f64) -> LimiterParams {
        let mut params = LimiterParams::default();
        tune_limiter(&mut params, Some(&stats), lra);
        params
    }

    #[test]
    fn test_none_keeps_params() {
        let mut params = LimiterParams {
            attack_ms: 7.0,
            asc: true,
            ..LimiterParams::default()
        };
        let before = params;
        tune_limiter(&mut params, None, 20.0);
        assert_eq!(params, before);
    }

    #[test]
    fn test_attack_ladder_ordering() {
        let gentle = tuned(calm(), 8.0).attack_ms;
        let normal = tuned(
            SpectralSnapshot {
                transient_intensity: 0.2,
                ..calm()
            },
            8.0,
        )
        .attack_ms;
        let sharp = tuned(
            SpectralSnapshot {
                spectral_crest_db: 22.0,
                ..calm()
            },
            8.0,
        )
        .attack_ms;
        let extreme = tuned(
            SpectralSnapshot {
                transient_intensity: 0.8,
                ..calm()
            },
            8.0,
        )
        .attack_ms;

        assert!(extreme < sharp && sharp < normal && normal < gentle);
        assert_eq!(gentle, ATTACK_GENTLE_MS);
    }

    #[test]
    fn test_release_rules() {
        let expressive = tuned(
            SpectralSnapshot {
                spectral_flux: 0.5,
                ..calm()
            },
            14.0,
        );
        assert_eq!(expressive.release_ms, RELEASE_EXPRESSIVE_MS);

        let controlled = tuned(
            SpectralSnapshot {
                spectral_flux: 0.05,
                ..calm()
            },
            4.0,
        );
        assert_eq!(controlled.release_ms, RELEASE_CONTROLLED_MS);

        // High flux alone is not enough for expressive release
        let standard = tuned(
            SpectralSnapshot {
                spectral_flux: 0.5,
                ..calm()
            },
            5.0,
        );
        assert_eq!(standard.release_ms, RELEASE_STANDARD_MS);
    }

    #[test]
    fn test_wide_dynamic_range_boosts_release() {
        let params = tuned(
            SpectralSnapshot {
                spectral_flux: 0.05,
                dynamic_range_db: 26.0,
                ..calm()
            },
            4.0,
        );
        assert_eq!(
            params.release_ms,
            RELEASE_CONTROLLED_MS + RELEASE_WIDE_DR_BOOST_MS
        );
    }

    #[test]
    fn test_soft_clip_levels() {
        let off = tuned(calm(), 8.0);
        assert!(!off.asc);
        assert_eq!(off.asc_level, 0.0);

        let moderate = tuned(
            SpectralSnapshot {
                dynamic_range_db: 25.0,
                ..calm()
            },
            8.0,
        );
        assert!(moderate.asc);
        assert_eq!(moderate.asc_level, ASC_LEVEL_MODERATE);

        let dynamic = tuned(
            SpectralSnapshot {
                spectral_crest_db: 40.0,
                ..calm()
            },
            8.0,
        );
        assert!(dynamic.asc);
        assert!(dynamic.asc_level > moderate.asc_level);
    }

    #[test]
    fn test_noise_boost_only_when_enabled() {
        let noisy_off = tuned(
            SpectralSnapshot {
                noise_floor_db: -40.0,
                ..calm()
            },
            8.0,
        );
        assert!(!noisy_off.asc);
        assert_eq!(noisy_off.asc_level, 0.0);

        let noisy_dynamic = tuned(
            SpectralSnapshot {
                dynamic_range_db: 35.0,
                noise_floor_db: -40.0,
                ..calm()
            },
            8.0,
        );
        assert!((noisy_dynamic.asc_level - (ASC_LEVEL_DYNAMIC + ASC_NOISE_BOOST)).abs() < 1e-9);
        assert!(noisy_dynamic.asc_level <= 1.0);
    }
}
