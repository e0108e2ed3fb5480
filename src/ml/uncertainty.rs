// ============================================================
// Layer 5 — Monte-Carlo Dropout Uncertainty
// ============================================================
// Runs the model N times with dropout ACTIVE and turns the
// spread of the outputs into an interval per horizon:
//
//   mean      = (1/N) Σ yᵢ
//   sample σ² = Σ (yᵢ − mean)² / (N − 1)
//   std       = sqrt((σ² + floor²) · max(ref_len / len, 1))
//   interval  = mean ± z · std,   z = Φ⁻¹((1 + c) / 2)
//   std_error = std / √N
//
// The floor keeps intervals from collapsing to zero width when
// dropout is small; the length factor widens short histories
// (a single timepoint is a cold start).
//
// The N passes are one batched forward over N replicated rows,
// so each row draws its own dropout mask and the statistics are
// taken only once the whole batch has come back.

use burn::{prelude::*, tensor::backend::AutodiffBackend};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::data::batcher::SequenceBatcher;
use crate::data::preprocessor::SequenceFeatures;
use crate::domain::error::{TwinError, TwinResult};
use crate::ml::model::TwinModel;
use crate::ml::tensor_to_vec;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyConfig {
    /// Number of stochastic passes (N ≥ 2)
    pub samples: usize,
    /// Confidence level of the interval, in (0, 1)
    pub confidence: f32,
    /// Minimum per-sample dispersion, in score points
    pub dispersion_floor: f32,
    /// History length at which no cold-start widening applies
    pub reference_len: usize,
    /// Seed for the dropout masks; `None` leaves the backend RNG as is
    pub seed: Option<u64>,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            samples: 10,
            confidence: 0.95,
            dispersion_floor: 0.25,
            reference_len: 3,
            seed: None,
        }
    }
}

impl UncertaintyConfig {
    pub fn validate(&self) -> TwinResult<()> {
        if self.samples < 2 {
            return Err(TwinError::InsufficientSamples(self.samples));
        }
        z_score(self.confidence)?;
        if !self.dispersion_floor.is_finite() || self.dispersion_floor < 0.0 {
            return Err(TwinError::InvalidConfig(format!(
                "dispersion floor must be a non-negative number, got {}",
                self.dispersion_floor
            )));
        }
        Ok(())
    }
}

/// Per-horizon statistics of one Monte-Carlo run, in score points.
#[derive(Debug, Clone, PartialEq)]
pub struct McSummary {
    pub mean:       Vec<f32>,
    pub std_dev:    Vec<f32>,
    pub std_error:  Vec<f32>,
    pub lower:      Vec<f32>,
    pub upper:      Vec<f32>,
    pub samples:    usize,
    pub confidence: f32,
}

/// Two-sided z for confidence level `confidence`, e.g. 0.95 → 1.96.
pub fn z_score(confidence: f32) -> TwinResult<f32> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(TwinError::InvalidConfig(format!(
            "confidence level must lie in (0, 1), got {confidence}"
        )));
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| TwinError::InvalidConfig(e.to_string()))?;
    Ok(normal.inverse_cdf((1.0 + confidence as f64) / 2.0) as f32)
}

/// Aggregate N sampled forecasts (one row of H values each) taken on a
/// history of `seq_len` timepoints.
pub fn summarize(samples: &[Vec<f32>], seq_len: usize, cfg: &UncertaintyConfig) -> TwinResult<McSummary> {
    let n = samples.len();
    if n < 2 {
        return Err(TwinError::InsufficientSamples(n));
    }
    let z = z_score(cfg.confidence)?;
    let h = samples[0].len();
    if let Some(bad) = samples.iter().find(|row| row.len() != h) {
        return Err(TwinError::shape("sampled forecast", h, bad.len()));
    }

    let inflation = (cfg.reference_len as f64 / seq_len.max(1) as f64).max(1.0);
    let floor_sq = (cfg.dispersion_floor as f64).powi(2);

    let mut summary = McSummary {
        mean:       Vec::with_capacity(h),
        std_dev:    Vec::with_capacity(h),
        std_error:  Vec::with_capacity(h),
        lower:      Vec::with_capacity(h),
        upper:      Vec::with_capacity(h),
        samples:    n,
        confidence: cfg.confidence,
    };

    for j in 0..h {
        let mean = samples.iter().map(|row| row[j] as f64).sum::<f64>() / n as f64;
        let var = samples
            .iter()
            .map(|row| (row[j] as f64 - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        let std = ((var + floor_sq) * inflation).sqrt();

        summary.mean.push(mean as f32);
        summary.std_dev.push(std as f32);
        summary.std_error.push((std / (n as f64).sqrt()) as f32);
        summary.lower.push((mean - z as f64 * std) as f32);
        summary.upper.push((mean + z as f64 * std) as f32);
    }
    Ok(summary)
}

/// MC-dropout estimate for one encoded history.
///
/// `model` must live on an autodiff backend: that is where dropout is
/// active. Outputs are denormalized to score points before aggregation.
pub fn estimate<B: AutodiffBackend>(
    model:    &TwinModel<B>,
    batcher:  &SequenceBatcher<B>,
    features: &SequenceFeatures,
    cfg:      &UncertaintyConfig,
) -> TwinResult<McSummary> {
    cfg.validate()?;
    if let Some(seed) = cfg.seed {
        B::seed(seed);
    }

    let batch = batcher.replicate(features, cfg.samples)?;
    let output = model.forward_batch(&batch)?.detach();
    let h = output.dims()[1];
    let flat = tensor_to_vec(output)?;

    let pre = batcher.preprocessor();
    let samples: Vec<Vec<f32>> = flat
        .chunks(h)
        .map(|row| row.iter().map(|&z| pre.denormalize_score(z)).collect())
        .collect();

    tracing::debug!("MC dropout: {} passes over {} timepoints", samples.len(), features.len);
    summarize(&samples, features.len, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures;
    use crate::data::preprocessor::{FeatureLayout, FeatureScaling, Preprocessor};
    use crate::domain::patient::HandwritingPolicy;
    use crate::ml::forecast::ForecastHeadConfig;
    use crate::ml::fusion::FusionEncoderConfig;
    use crate::ml::model::TwinModelConfig;
    use crate::ml::{default_device, TrainBackend};

    fn model(dropout: f64) -> TwinModel<TrainBackend> {
        TrainBackend::seed(17);
        let fusion = FusionEncoderConfig::new(10)
            .with_d_model(16)
            .with_d_ff(16)
            .with_dropout(dropout);
        let forecast = ForecastHeadConfig::new(16, 2).with_hidden(8).with_dropout(dropout);
        TwinModelConfig::new(fusion, forecast).init(&default_device())
    }

    fn batcher() -> SequenceBatcher<TrainBackend> {
        let layout = FeatureLayout::new(4, 4, vec!["age".into(), "gait_variability".into()]);
        let pre = Preprocessor::new(layout, FeatureScaling::default(), HandwritingPolicy::Average);
        SequenceBatcher::new(pre, 2, default_device())
    }

    #[test]
    fn z_score_matches_normal_table() {
        assert!((z_score(0.95).unwrap() - 1.959964).abs() < 1e-4);
        assert!((z_score(0.80).unwrap() - 1.281552).abs() < 1e-4);
        assert!((z_score(0.99).unwrap() - 2.575829).abs() < 1e-4);
        assert!(z_score(1.0).is_err());
        assert!(z_score(0.0).is_err());
    }

    #[test]
    fn fewer_than_two_samples_is_rejected() {
        let cfg = UncertaintyConfig::default();
        let err = summarize(&[vec![1.0, 2.0]], 3, &cfg).unwrap_err();
        assert!(matches!(err, TwinError::InsufficientSamples(1)));

        let cfg = UncertaintyConfig { samples: 1, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(TwinError::InsufficientSamples(1))));
    }

    #[test]
    fn summary_statistics() {
        let cfg = UncertaintyConfig { dispersion_floor: 0.0, ..Default::default() };
        let s = summarize(&[vec![1.0], vec![3.0]], 3, &cfg).unwrap();
        assert_eq!(s.mean, vec![2.0]);
        // sample std of {1, 3} is √2
        assert!((s.std_dev[0] - 2f32.sqrt()).abs() < 1e-6);
        assert!((s.std_error[0] - 1.0).abs() < 1e-6);
        assert!((s.upper[0] - s.lower[0] - 2.0 * 1.959964 * 2f32.sqrt()).abs() < 1e-3);
    }

    #[test]
    fn single_timepoint_interval_is_wider() {
        let m = model(0.0);
        let b = batcher();
        let cfg = UncertaintyConfig::default();

        let one = fixtures::history("P1", 4, 4, &[0.0], 2);
        let three = fixtures::history("P1", 4, 4, &[0.0, 6.0, 12.0], 2);
        let s1 = estimate(&m, &b, &b.preprocessor().encode(&one).unwrap(), &cfg).unwrap();
        let s3 = estimate(&m, &b, &b.preprocessor().encode(&three).unwrap(), &cfg).unwrap();

        for j in 0..2 {
            let w1 = s1.upper[j] - s1.lower[j];
            let w3 = s3.upper[j] - s3.lower[j];
            assert!(w1 >= w3, "horizon {j}: {w1} < {w3}");
        }
    }

    #[test]
    fn dropout_produces_spread() {
        let m = model(0.3);
        let b = batcher();
        let cfg = UncertaintyConfig { samples: 30, dispersion_floor: 0.0, seed: Some(3), ..Default::default() };
        let h = fixtures::history("P1", 4, 4, &fixtures::TIMEPOINTS, 2);
        let s = estimate(&m, &b, &b.preprocessor().encode(&h).unwrap(), &cfg).unwrap();
        assert!(s.std_dev.iter().all(|&sd| sd > 0.0));
        assert!(s.mean.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn more_samples_tighten_standard_error() {
        let m = model(0.3);
        let b = batcher();
        let h = fixtures::history("P1", 4, 4, &fixtures::TIMEPOINTS, 2);
        let features = b.preprocessor().encode(&h).unwrap();

        let mean_se = |samples: usize| {
            let mut total = 0.0f32;
            for run in 0..5u64 {
                let cfg = UncertaintyConfig { samples, seed: Some(100 + run), ..Default::default() };
                let s = estimate(&m, &b, &features, &cfg).unwrap();
                total += s.std_error.iter().sum::<f32>();
            }
            total / 5.0
        };
        assert!(mean_se(100) <= mean_se(5));
    }
}
