// ============================================================
// Layer 2 — Forecast Use Case
// ============================================================
// Answers forecast requests against one loaded checkpoint:
//
//   predict               → point forecast, or MC-dropout interval
//                           when a confidence level is given
//   predict_with_scenario → baseline and decline-factor adjusted
//                           forecasts, returned together
//   predict_all           → every known patient, failures skipped
//
// Steps for a single request:
//   Step 1: Load the patient's history      (Layer 4 - data)
//   Step 2: Apply the history cutoff        (Layer 3 - domain)
//   Step 3: Run the inferencer              (Layer 5 - ml)
//   Step 4: Attach observed actuals         (Layer 3 - domain)

use std::{fs, io::Write, path::Path};

use anyhow::{Context, Result};

use crate::data::dataset::HORIZON_TOLERANCE_MONTHS;
use crate::data::loader::{load_history, JsonDirectoryProvider};
use crate::domain::error::{TwinError, TwinResult};
use crate::domain::forecast::{ForecastResult, ScenarioForecast};
use crate::domain::patient::{HandwritingPolicy, PatientHistory};
use crate::domain::scenario::{apply_decline_factor, decline_factor, ScenarioDeltas, ScenarioLimits};
use crate::domain::traits::{EmbeddingProvider, MetadataProvider};
use crate::infra::checkpoint::CheckpointManager;
use crate::ml::inferencer::Inferencer;
use crate::ml::uncertainty::UncertaintyConfig;

pub struct ForecastUseCase<P> {
    inferencer:  Inferencer,
    provider:    P,
    uncertainty: UncertaintyConfig,
    limits:      ScenarioLimits,
}

impl ForecastUseCase<JsonDirectoryProvider> {
    /// Load the best checkpoint from `checkpoint_dir` and patients from `data_dir`.
    pub fn open(checkpoint_dir: impl AsRef<Path>, data_dir: impl AsRef<Path>) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref();
        let ckpt_manager = CheckpointManager::fs(checkpoint_dir)?;
        let inferencer = Inferencer::from_checkpoint(&ckpt_manager).with_context(|| {
            format!("Cannot load checkpoint from '{}'. Run `train` first.", checkpoint_dir.display())
        })?;

        let data_dir = data_dir.as_ref();
        let provider = JsonDirectoryProvider::open(data_dir)
            .with_context(|| format!("Cannot open data directory '{}'", data_dir.display()))?;

        Ok(Self::new(inferencer, provider))
    }
}

impl<P: MetadataProvider + EmbeddingProvider> ForecastUseCase<P> {
    pub fn new(inferencer: Inferencer, provider: P) -> Self {
        Self {
            inferencer,
            provider,
            uncertainty: UncertaintyConfig::default(),
            limits: ScenarioLimits::default(),
        }
    }

    pub fn with_uncertainty(mut self, uncertainty: UncertaintyConfig) -> Self {
        self.uncertainty = uncertainty;
        self
    }

    pub fn with_policy(mut self, policy: HandwritingPolicy) -> Self {
        self.inferencer = self.inferencer.with_policy(policy);
        self
    }

    /// Point forecast, or an interval forecast at `confidence`.
    pub fn predict(
        &self,
        patient_id: &str,
        horizons:   &[u32],
        confidence: Option<f32>,
    ) -> TwinResult<ForecastResult> {
        self.predict_at(patient_id, horizons, confidence, None)
    }

    /// Like `predict`, but only records at or before `until` months form
    /// the history. Later records still serve as observed actuals.
    pub fn predict_at(
        &self,
        patient_id: &str,
        horizons:   &[u32],
        confidence: Option<f32>,
        until:      Option<f32>,
    ) -> TwinResult<ForecastResult> {
        let full = load_history(&self.provider, &self.provider, patient_id)?;
        let history = match until {
            Some(months) => full.until(months),
            None => full.clone(),
        };
        if history.is_empty() {
            return Err(TwinError::EmptySequence);
        }

        let mut result = match confidence {
            Some(confidence) => {
                let cfg = UncertaintyConfig { confidence, ..self.uncertainty };
                self.inferencer.forecast_interval(&history, horizons, &cfg)?
            }
            None => self.inferencer.forecast_point(&history, horizons)?,
        };
        attach_observed(&mut result, &full);
        Ok(result)
    }

    /// Baseline (factor 1.0) and adjusted forecasts for lifestyle deltas.
    pub fn predict_with_scenario(
        &self,
        patient_id: &str,
        horizons:   &[u32],
        sleep_delta_hours:     f32,
        activity_delta_percent: f32,
    ) -> TwinResult<ScenarioForecast> {
        let deltas = ScenarioDeltas::new(sleep_delta_hours, activity_delta_percent);
        self.limits.validate(&deltas)?;

        let baseline = self.predict(patient_id, horizons, None)?;
        let last_observed = baseline.last_observed_score.ok_or_else(|| TwinError::InvalidTimeline {
            patient_id: patient_id.to_string(),
            reason: "no observed score to anchor the scenario".to_string(),
        })?;

        let factor = decline_factor(&deltas);
        let adjusted = apply_decline_factor(&baseline, last_observed, factor);
        tracing::debug!(
            "Scenario for '{}': sleep {:+} h, activity {:+}% → decline factor {:.3}",
            patient_id,
            deltas.sleep_hours,
            deltas.activity_percent,
            factor
        );

        Ok(ScenarioForecast { deltas, decline_factor: factor, baseline, adjusted })
    }

    /// Forecast every known patient. Patients that fail are logged and skipped.
    pub fn predict_all(
        &self,
        horizons:   &[u32],
        confidence: Option<f32>,
        until:      Option<f32>,
    ) -> TwinResult<Vec<ForecastResult>> {
        let ids = self.provider.patient_ids()?;
        let mut results = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.predict_at(id, horizons, confidence, until) {
                Ok(r) => results.push(r),
                Err(e) => tracing::warn!("Skipping patient '{}': {}", id, e),
            }
        }
        tracing::info!("Forecast {} of {} patients", results.len(), ids.len());
        Ok(results)
    }
}

fn attach_observed(result: &mut ForecastResult, full: &PatientHistory) {
    let last = result.last_timestamp_months;
    for h in &mut result.horizons {
        h.observed = full.observed_at(last + h.horizon_months as f32, HORIZON_TOLERANCE_MONTHS);
    }
}

/// One row per (patient, horizon). Empty cells for absent values.
pub fn write_csv(results: &[ForecastResult], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::File::create(path)
        .with_context(|| format!("Cannot create '{}'", path.display()))?;

    writeln!(f, "patient_id,last_timestamp_months,horizon_months,point_estimate,lower,upper,observed,abs_error")?;
    let cell = |v: Option<f32>| v.map(|x| format!("{x:.3}")).unwrap_or_default();
    for r in results {
        for h in &r.horizons {
            writeln!(
                f,
                "{},{},{},{:.3},{},{},{},{}",
                r.patient_id,
                r.last_timestamp_months,
                h.horizon_months,
                h.point_estimate,
                cell(h.lower),
                cell(h.upper),
                cell(h.observed),
                cell(h.absolute_error()),
            )?;
        }
    }
    tracing::info!("Wrote {} forecasts to '{}'", results.len(), path.display());
    Ok(())
}
