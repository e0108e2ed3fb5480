// ============================================================
// Layer 5 — Inferencer
// ============================================================
// Loads a verified checkpoint once and turns patient histories
// into ForecastResults.
//
//   point mode    → eval model (NdArray, dropout off), one pass,
//                   deterministic for fixed weights
//   interval mode → MC model (Autodiff<NdArray>, dropout on),
//                   N replicated passes via uncertainty::estimate
//
// The checkpoint is read, never written. Two inferencers may
// hold different checkpoints side by side.

use burn::{module::AutodiffModule, prelude::*};

use crate::data::batcher::SequenceBatcher;
use crate::data::preprocessor::Preprocessor;
use crate::domain::error::{TwinError, TwinResult};
use crate::domain::forecast::{ForecastResult, HorizonForecast};
use crate::domain::patient::{HandwritingPolicy, PatientHistory};
use crate::infra::checkpoint::{CheckpointManager, CheckpointManifest};
use crate::ml::model::TwinModel;
use crate::ml::uncertainty::{self, UncertaintyConfig};
use crate::ml::{default_device, tensor_to_vec, InnerBackend, TrainBackend};

pub struct Inferencer {
    model:      TwinModel<InnerBackend>,
    mc_model:   TwinModel<TrainBackend>,
    batcher:    SequenceBatcher<InnerBackend>,
    mc_batcher: SequenceBatcher<TrainBackend>,
    manifest:   CheckpointManifest,
}

impl Inferencer {
    pub fn from_checkpoint(ckpt_manager: &CheckpointManager) -> TwinResult<Self> {
        let device = default_device();
        let (mc_model, manifest) = ckpt_manager.load_model::<TrainBackend>(&device)?;
        let model = mc_model.valid();

        let preprocessor = manifest.spec.preprocessor();
        let n_horizons = manifest.spec.horizons.len();
        tracing::info!(
            "Inferencer ready: checkpoint {} (epoch {}, val_mae={:.4}), horizons {:?}",
            manifest.checkpoint_id,
            manifest.epoch,
            manifest.val_mae,
            manifest.spec.horizons
        );

        Ok(Self {
            model,
            mc_model,
            batcher: SequenceBatcher::new(preprocessor.clone(), n_horizons, device.clone()),
            mc_batcher: SequenceBatcher::new(preprocessor, n_horizons, device),
            manifest,
        })
    }

    /// Same weights, different handwriting trace policy.
    pub fn with_policy(mut self, policy: HandwritingPolicy) -> Self {
        if policy != self.manifest.spec.policy {
            tracing::info!(
                "Handwriting policy {:?} overrides checkpoint policy {:?}",
                policy,
                self.manifest.spec.policy
            );
        }
        let preprocessor = self.preprocessor().with_policy(policy);
        let n_horizons = self.manifest.spec.horizons.len();
        let device = default_device();
        self.batcher = SequenceBatcher::new(preprocessor.clone(), n_horizons, device.clone());
        self.mc_batcher = SequenceBatcher::new(preprocessor, n_horizons, device);
        self
    }

    pub fn horizons(&self) -> &[u32] {
        &self.manifest.spec.horizons
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        self.batcher.preprocessor()
    }

    /// An empty request means "the trained horizons". Anything else must
    /// match them exactly.
    pub fn resolve_horizons(&self, requested: &[u32]) -> TwinResult<Vec<u32>> {
        let trained = self.horizons();
        if requested.is_empty() || requested == trained {
            return Ok(trained.to_vec());
        }
        Err(TwinError::HorizonMismatch {
            trained: trained.to_vec(),
            requested: requested.to_vec(),
        })
    }

    /// Deterministic point forecast.
    pub fn forecast_point(&self, history: &PatientHistory, horizons: &[u32]) -> TwinResult<ForecastResult> {
        let horizons = self.resolve_horizons(horizons)?;
        let features = self.preprocessor().encode(history)?;
        let batch = self.batcher.inputs(std::slice::from_ref(&features))?;

        let output = tensor_to_vec(self.model.forward_batch(&batch)?)?;
        if output.len() != horizons.len() {
            return Err(TwinError::shape("forecast output", horizons.len(), output.len()));
        }

        let pre = self.preprocessor();
        let forecasts = horizons
            .iter()
            .zip(output)
            .map(|(&h, z)| HorizonForecast::point(h, pre.denormalize_score(z)))
            .collect();
        self.result(history, None, forecasts)
    }

    /// Monte-Carlo dropout forecast with (1−α) interval bounds.
    pub fn forecast_interval(
        &self,
        history:  &PatientHistory,
        horizons: &[u32],
        cfg:      &UncertaintyConfig,
    ) -> TwinResult<ForecastResult> {
        let horizons = self.resolve_horizons(horizons)?;
        let features = self.preprocessor().encode(history)?;
        let summary = uncertainty::estimate(&self.mc_model, &self.mc_batcher, &features, cfg)?;

        let forecasts = horizons
            .iter()
            .enumerate()
            .map(|(j, &h)| HorizonForecast {
                horizon_months: h,
                point_estimate: summary.mean[j],
                std_dev:        Some(summary.std_dev[j]),
                std_error:      Some(summary.std_error[j]),
                lower:          Some(summary.lower[j]),
                upper:          Some(summary.upper[j]),
                observed:       None,
            })
            .collect();
        self.result(history, Some(summary.confidence), forecasts)
    }

    fn result(
        &self,
        history:    &PatientHistory,
        confidence: Option<f32>,
        horizons:   Vec<HorizonForecast>,
    ) -> TwinResult<ForecastResult> {
        let last_timestamp_months = history.last_timestamp().ok_or(TwinError::EmptySequence)?;
        Ok(ForecastResult {
            patient_id: history.id().to_string(),
            checkpoint_id: self.manifest.checkpoint_id.clone(),
            last_timestamp_months,
            last_observed_score: history.last_observed_score(),
            confidence,
            horizons,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::data::fixtures;
    use crate::data::preprocessor::{FeatureLayout, FeatureScaling};
    use crate::infra::checkpoint::{MemoryCheckpointStore, ModelSpec};
    use crate::ml::forecast::ForecastHeadConfig;
    use crate::ml::fusion::FusionEncoderConfig;
    use crate::ml::model::TwinModelConfig;

    /// A small untrained checkpoint over 4+4 dim embeddings, 2 scalars,
    /// horizons [6, 12].
    pub(crate) fn checkpoint(dropout: f64) -> CheckpointManager {
        let layout = FeatureLayout::new(4, 4, vec!["age".into(), "gait_variability".into()]);
        let fusion = FusionEncoderConfig::new(layout.fusion_input_dim())
            .with_d_model(16)
            .with_d_ff(16)
            .with_dropout(dropout);
        let forecast = ForecastHeadConfig::new(16, 2).with_hidden(8).with_dropout(dropout);
        let spec = ModelSpec {
            model: TwinModelConfig::new(fusion, forecast),
            layout,
            scaling: FeatureScaling::default(),
            horizons: vec![6, 12],
            policy: HandwritingPolicy::Average,
        };

        InnerBackend::seed(5);
        let model: TwinModel<InnerBackend> = spec.model.init(&default_device());
        let manager = CheckpointManager::new(Arc::new(MemoryCheckpointStore::new()));
        manager.save_best(&model, &spec, 1, 3.0, 4.0).unwrap();
        manager
    }

    #[test]
    fn point_forecast_is_deterministic() {
        let inf = Inferencer::from_checkpoint(&checkpoint(0.2)).unwrap();
        let h = fixtures::history("P001", 4, 4, &fixtures::TIMEPOINTS, 4);

        let a = inf.forecast_point(&h, &[6, 12]).unwrap();
        let b = inf.forecast_point(&h, &[6, 12]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.horizons.len(), 2);
        assert_eq!(a.last_timestamp_months, 24.0);
        assert!(a.checkpoint_id.starts_with("epoch1-"));
    }

    #[test]
    fn mismatched_horizons_are_rejected() {
        let inf = Inferencer::from_checkpoint(&checkpoint(0.1)).unwrap();
        let h = fixtures::history("P001", 4, 4, &fixtures::TIMEPOINTS, 4);

        let err = inf.forecast_point(&h, &[18, 24]).unwrap_err();
        assert!(matches!(err, TwinError::HorizonMismatch { .. }));
        assert!(inf.forecast_point(&h, &[]).is_ok());
    }

    #[test]
    fn single_timepoint_history_forecasts() {
        let inf = Inferencer::from_checkpoint(&checkpoint(0.1)).unwrap();
        let h = fixtures::history("P001", 4, 4, &[0.0], 4);
        let cfg = UncertaintyConfig { seed: Some(1), ..Default::default() };

        let r = inf.forecast_interval(&h, &[6, 12], &cfg).unwrap();
        assert_eq!(r.confidence, Some(0.95));
        for f in &r.horizons {
            assert!(f.lower.unwrap() < f.point_estimate && f.point_estimate < f.upper.unwrap());
        }
    }

    #[test]
    fn wrong_embedding_width_is_a_shape_mismatch() {
        let inf = Inferencer::from_checkpoint(&checkpoint(0.1)).unwrap();
        let h = fixtures::history("P001", 6, 4, &fixtures::TIMEPOINTS, 4);
        assert!(matches!(inf.forecast_point(&h, &[]), Err(TwinError::ShapeMismatch { .. })));
    }
}
