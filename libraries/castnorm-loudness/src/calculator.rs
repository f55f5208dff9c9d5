//! Gain, linear-mode target and limiter ceiling decisions
//!
//! Pure functions that turn a measurement into decision values. None of them
//! touch audio; the normaliser feeds their results into the apply pass.
//!
//! # Peak hand-off
//!
//! The limiter ceiling is decided first. When a pre-limiter will run and its
//! ceiling was not clamped, the linear-mode resolver must see the ceiling as
//! the input peak, because the limiter has already removed that headroom
//! pressure. When the ceiling was clamped to [`LIMITER_FLOOR_DBTP`], the
//! limiter cannot deliver the full headroom and the raw measured peak is used.
//! [`LimiterDecision::effective_peak`] encodes this rule.
//!
//! # Example
//!
//! ```
//! use castnorm_loudness::{calculate_limiter_ceiling, calculate_linear_mode_target};
//!
//! let limiter = calculate_limiter_ceiling(-24.9, -5.0, -16.0, -2.0)?;
//! assert!(limiter.needed && !limiter.clamped);
//!
//! let peak = limiter.effective_peak(-5.0);
//! let linear = calculate_linear_mode_target(-24.9, peak, -16.0, -2.0)?;
//! assert!(linear.linear_possible);
//! # Ok::<(), castnorm_loudness::NormaliseError>(())
//! ```

use crate::error::{NormaliseError, Result};
use crate::snapshot::is_audible;
use serde::{Deserialize, Serialize};

/// Margin below the true-peak target kept by the linear-mode resolver (dB)
///
/// Covers rounding differences between this calculation and the engine's.
pub const LINEAR_SAFETY_MARGIN_DB: f64 = 0.1;

/// Margin subtracted from the limiter ceiling (dB)
///
/// A limiter reshaping waveforms can create new inter-sample peaks of up to
/// about 1.6 dB.
pub const LIMITER_SAFETY_MARGIN_DB: f64 = 2.0;

/// Lowest ceiling the downstream limiter can express (dBTP)
pub const LIMITER_FLOOR_DBTP: f64 = -24.0;

/// Outcome of the gain check
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainDecision {
    /// Gain to apply in dB (0.0 when not needed)
    pub gain_db: f64,
    /// Whether the loudness is outside the tolerance band
    pub needed: bool,
}

/// Outcome of the linear-mode feasibility check
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearModeDecision {
    /// Target to hand to the apply pass (never above the requested one)
    pub effective_target_i: f64,
    /// Gain from measured loudness to the effective target (dB)
    pub offset_db: f64,
    /// `false` when the requested target had to be lowered
    pub linear_possible: bool,
}

/// Outcome of the limiter ceiling calculation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimiterDecision {
    /// Limiter threshold in dBTP (0.0 when not needed)
    pub ceiling_dbtp: f64,
    /// Whether pre-limiting is required to make the gain safe
    pub needed: bool,
    /// Whether the ceiling was raised to [`LIMITER_FLOOR_DBTP`]
    pub clamped: bool,
}

impl LimiterDecision {
    /// Decision for input that needs no limiting
    pub fn not_needed() -> Self {
        Self {
            ceiling_dbtp: 0.0,
            needed: false,
            clamped: false,
        }
    }

    /// Peak the gain stage will see after this limiter
    ///
    /// The ceiling when the limiter runs unclamped, otherwise `measured_tp`.
    pub fn effective_peak(&self, measured_tp: f64) -> f64 {
        if self.needed && !self.clamped {
            self.ceiling_dbtp
        } else {
            measured_tp
        }
    }
}

fn ensure_audible(loudness: f64) -> Result<()> {
    if is_audible(loudness) {
        Ok(())
    } else {
        Err(NormaliseError::SilentAudio { loudness })
    }
}

/// Gain required to move `output_i` to `target_i`
///
/// Boost and cut are treated identically: any deviation within `tolerance`
/// reports `needed = false` with zero gain.
///
/// # Errors
/// [`NormaliseError::SilentAudio`] if `output_i` is `-inf` or below -70 LUFS
pub fn calculate_gain(output_i: f64, target_i: f64, tolerance: f64) -> Result<GainDecision> {
    ensure_audible(output_i)?;

    let gain_db = target_i - output_i;
    if gain_db.abs() <= tolerance {
        return Ok(GainDecision {
            gain_db: 0.0,
            needed: false,
        });
    }

    Ok(GainDecision {
        gain_db,
        needed: true,
    })
}

/// Largest target reachable with a single constant gain under `target_tp`
///
/// # Arguments
/// * `measured_i` - Measured integrated loudness (LUFS)
/// * `measured_tp` - Peak the gain stage will see (dBTP)
/// * `desired_i` - Requested integrated loudness (LUFS)
/// * `target_tp` - True-peak ceiling (dBTP)
///
/// # Returns
/// The requested target when reachable; otherwise the reachable maximum with
/// `linear_possible = false`. A cut counts as reachable only when it also
/// brings the peak under `target_tp`.
pub fn calculate_linear_mode_target(
    measured_i: f64,
    measured_tp: f64,
    desired_i: f64,
    target_tp: f64,
) -> Result<LinearModeDecision> {
    ensure_audible(measured_i)?;

    let max_linear_i = max_linear_target(measured_i, measured_tp, target_tp);

    if desired_i <= max_linear_i {
        return Ok(LinearModeDecision {
            effective_target_i: desired_i,
            offset_db: desired_i - measured_i,
            linear_possible: true,
        });
    }

    Ok(LinearModeDecision {
        effective_target_i: max_linear_i,
        offset_db: max_linear_i - measured_i,
        linear_possible: false,
    })
}

/// Loudness reachable by linear gain before the peak hits `target_tp`
pub fn max_linear_target(measured_i: f64, measured_tp: f64, target_tp: f64) -> f64 {
    target_tp - measured_tp + measured_i - LINEAR_SAFETY_MARGIN_DB
}

/// Peak-limiter threshold required to make the gain to `target_i` safe
///
/// # Arguments
/// * `measured_i` - Measured integrated loudness (LUFS)
/// * `measured_tp` - Measured true peak (dBTP)
/// * `target_i` - Loudness the gain stage aims for (LUFS)
/// * `target_tp` - True-peak ceiling (dBTP)
pub fn calculate_limiter_ceiling(
    measured_i: f64,
    measured_tp: f64,
    target_i: f64,
    target_tp: f64,
) -> Result<LimiterDecision> {
    ensure_audible(measured_i)?;

    let gain_required = target_i - measured_i;
    let projected_tp = measured_tp + gain_required;
    if projected_tp <= target_tp {
        return Ok(LimiterDecision::not_needed());
    }

    let ceiling = target_tp - gain_required - LIMITER_SAFETY_MARGIN_DB;
    if ceiling < LIMITER_FLOOR_DBTP {
        return Ok(LimiterDecision {
            ceiling_dbtp: LIMITER_FLOOR_DBTP,
            needed: true,
            clamped: true,
        });
    }

    Ok(LimiterDecision {
        ceiling_dbtp: ceiling,
        needed: true,
        clamped: false,
    })
}
