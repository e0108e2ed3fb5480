// ============================================================
// Layer 3 — What-if Scenario Arithmetic
// ============================================================
// Pure post-processing over an already computed forecast.
// A lifestyle change becomes a single decline factor f that
// scales the forecast's drop from the last observed score:
//
//   f  = 1.0 − sleepΔ·0.05 − activityΔ(fraction)·0.2
//   f  = clamp(f, 0.5, 1.5)
//   adjusted = last − (last − estimate)·f
//
// No model internals are involved; everything here is testable
// without a trained network.

use serde::{Deserialize, Serialize};

use crate::domain::error::{TwinError, TwinResult};
use crate::domain::forecast::{ForecastResult, HorizonForecast};

pub const SLEEP_WEIGHT_PER_HOUR: f32 = 0.05;
pub const ACTIVITY_WEIGHT_PER_FRACTION: f32 = 0.2;
pub const MIN_DECLINE_FACTOR: f32 = 0.5;
pub const MAX_DECLINE_FACTOR: f32 = 1.5;

/// Lifestyle deltas relative to the patient's current habits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDeltas {
    /// Additional hours of sleep per night (negative = less)
    pub sleep_hours: f32,
    /// Change in physical activity, in percent (+10 = 10% more)
    pub activity_percent: f32,
}

impl ScenarioDeltas {
    pub fn new(sleep_hours: f32, activity_percent: f32) -> Self {
        Self {
            sleep_hours,
            activity_percent,
        }
    }
}

/// Sane ranges for scenario deltas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScenarioLimits {
    pub max_sleep_hours: f32,
    pub max_activity_percent: f32,
}

impl Default for ScenarioLimits {
    fn default() -> Self {
        Self {
            max_sleep_hours: 4.0,
            max_activity_percent: 50.0,
        }
    }
}

impl ScenarioLimits {
    pub fn validate(&self, deltas: &ScenarioDeltas) -> TwinResult<()> {
        if !deltas.sleep_hours.is_finite() || deltas.sleep_hours.abs() > self.max_sleep_hours {
            return Err(TwinError::InvalidDelta(format!(
                "sleep delta {} h outside ±{} h",
                deltas.sleep_hours, self.max_sleep_hours
            )));
        }
        if !deltas.activity_percent.is_finite()
            || deltas.activity_percent.abs() > self.max_activity_percent
        {
            return Err(TwinError::InvalidDelta(format!(
                "activity delta {}% outside ±{}%",
                deltas.activity_percent, self.max_activity_percent
            )));
        }
        Ok(())
    }
}

/// Decline factor for a set of deltas, clamped to [0.5, 1.5].
pub fn decline_factor(deltas: &ScenarioDeltas) -> f32 {
    let mut f = 1.0f32;
    f -= deltas.sleep_hours * SLEEP_WEIGHT_PER_HOUR;
    f -= (deltas.activity_percent / 100.0) * ACTIVITY_WEIGHT_PER_FRACTION;
    f.clamp(MIN_DECLINE_FACTOR, MAX_DECLINE_FACTOR)
}

/// Scale the drop from `last_observed` to `estimate` by `factor`.
pub fn adjust_estimate(last_observed: f32, estimate: f32, factor: f32) -> f32 {
    if factor == 1.0 {
        return estimate;
    }
    let baseline_drop = last_observed - estimate;
    last_observed - baseline_drop * factor
}

/// Build the adjusted forecast from a baseline one. Interval bounds
/// move with the point estimate so their width is preserved.
pub fn apply_decline_factor(
    baseline: &ForecastResult,
    last_observed: f32,
    factor: f32,
) -> ForecastResult {
    let horizons = baseline
        .horizons
        .iter()
        .map(|h| {
            let point = adjust_estimate(last_observed, h.point_estimate, factor);
            let shift = point - h.point_estimate;
            HorizonForecast {
                point_estimate: point,
                lower: h.lower.map(|l| l + shift),
                upper: h.upper.map(|u| u + shift),
                ..h.clone()
            }
        })
        .collect();

    ForecastResult {
        horizons,
        ..baseline.clone()
    }
}
