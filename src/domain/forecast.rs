// ============================================================
// Layer 3 — Forecast Result Types
// ============================================================
// Produced fresh by every inference call and never mutated
// afterwards. Scenario adjustments build a new result.

use serde::{Deserialize, Serialize};

use crate::domain::scenario::ScenarioDeltas;

/// Forecast for a single horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonForecast {
    /// Months after the last historical timepoint
    pub horizon_months: u32,

    pub point_estimate: f32,

    /// Sample standard deviation of the Monte-Carlo outputs
    pub std_dev: Option<f32>,

    /// std_dev / sqrt(N)
    pub std_error: Option<f32>,

    pub lower: Option<f32>,
    pub upper: Option<f32>,

    /// Score actually observed at the target timestamp, if the
    /// patient's timeline already contains it
    pub observed: Option<f32>,
}

impl HorizonForecast {
    pub fn point(horizon_months: u32, point_estimate: f32) -> Self {
        Self {
            horizon_months,
            point_estimate,
            std_dev: None,
            std_error: None,
            lower: None,
            upper: None,
            observed: None,
        }
    }

    pub fn absolute_error(&self) -> Option<f32> {
        self.observed.map(|o| (o - self.point_estimate).abs())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub patient_id: String,

    /// Identifier of the checkpoint that produced this forecast
    pub checkpoint_id: String,

    pub last_timestamp_months: f32,
    pub last_observed_score: Option<f32>,

    /// Confidence level of the interval bounds, when present
    pub confidence: Option<f32>,

    pub horizons: Vec<HorizonForecast>,
}

impl ForecastResult {
    pub fn horizon(&self, months: u32) -> Option<&HorizonForecast> {
        self.horizons.iter().find(|h| h.horizon_months == months)
    }
}

/// Baseline and counterfactual forecasts, returned together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioForecast {
    pub deltas: ScenarioDeltas,
    pub decline_factor: f32,
    pub baseline: ForecastResult,
    pub adjusted: ForecastResult,
}

impl ScenarioForecast {
    /// adjusted − baseline per horizon
    pub fn deltas_by_horizon(&self) -> Vec<(u32, f32)> {
        self.baseline
            .horizons
            .iter()
            .zip(&self.adjusted.horizons)
            .map(|(b, a)| (b.horizon_months, a.point_estimate - b.point_estimate))
            .collect()
    }
}
