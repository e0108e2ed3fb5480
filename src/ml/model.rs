use burn::{
    nn::{
        loss::{MseLoss, Reduction},
        Linear, LinearRecord,
    },
    prelude::*,
};

use crate::data::batcher::SequenceBatch;
use crate::data::preprocessor::STEP_FEATURES;
use crate::domain::error::{TwinError, TwinResult};
use crate::ml::forecast::{ForecastHead, ForecastHeadConfig};
use crate::ml::fusion::{FusionEncoder, FusionEncoderConfig};

#[derive(Config, Debug)]
pub struct TwinModelConfig {
    pub fusion:   FusionEncoderConfig,
    pub forecast: ForecastHeadConfig,
}

impl TwinModelConfig {
    pub fn n_horizons(&self) -> usize {
        self.forecast.n_horizons
    }

    pub fn validate(&self) -> TwinResult<()> {
        let f = &self.fusion;
        if f.input_dim == 0 || f.d_model == 0 || f.n_tokens == 0 {
            return Err(TwinError::InvalidConfig("fusion dimensions must be non-zero".into()));
        }
        if f.num_heads == 0 || f.d_model % f.num_heads != 0 {
            return Err(TwinError::InvalidConfig(format!(
                "d_model {} is not divisible by {} heads",
                f.d_model, f.num_heads
            )));
        }
        if f.num_layers == 0 || f.d_ff == 0 {
            return Err(TwinError::InvalidConfig(
                "fusion encoder needs at least one attention block with a non-empty FFN".into(),
            ));
        }
        if self.forecast.num_layers == 0 || self.forecast.hidden == 0 {
            return Err(TwinError::InvalidConfig(
                "forecast head needs at least one recurrent layer with a non-zero hidden size".into(),
            ));
        }
        if self.forecast.joint_dim != f.d_model {
            return Err(TwinError::InvalidConfig(format!(
                "forecast head expects joint dim {}, fusion emits {}",
                self.forecast.joint_dim, f.d_model
            )));
        }
        if self.forecast.n_horizons == 0 {
            return Err(TwinError::InvalidConfig("at least one horizon is required".into()));
        }
        if !(0.0..1.0).contains(&f.dropout) || !(0.0..1.0).contains(&self.forecast.dropout) {
            return Err(TwinError::InvalidConfig("dropout must lie in [0, 1)".into()));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> TwinModel<B> {
        TwinModel {
            fusion:   self.fusion.init(device),
            forecast: self.forecast.init(device),
        }
    }
}

/// Fusion Encoder and Forecast Head, trained jointly.
#[derive(Module, Debug)]
pub struct TwinModel<B: Backend> {
    pub fusion:   FusionEncoder<B>,
    pub forecast: ForecastHead<B>,
}

impl<B: Backend> TwinModel<B> {
    /// fusion_in: [batch, seq_len, A+S+k], steps: [batch, seq_len, 3]
    /// → standardized scores [batch, H]
    pub fn forward(&self, fusion_in: Tensor<B, 3>, steps: Tensor<B, 3>) -> Tensor<B, 2> {
        let joint = self.fusion.forward(fusion_in);
        self.forecast.forward(joint, steps)
    }

    /// Forward pass with the shape checks a raw tensor call cannot give.
    pub fn forward_batch(&self, batch: &SequenceBatch<B>) -> TwinResult<Tensor<B, 2>> {
        let [b, seq_len, width] = batch.fusion.dims();
        let [sb, s_len, s_width] = batch.steps.dims();
        if seq_len == 0 {
            return Err(TwinError::EmptySequence);
        }
        if width != self.fusion.input_dim {
            return Err(TwinError::shape("fusion input", self.fusion.input_dim, width));
        }
        if s_width != STEP_FEATURES {
            return Err(TwinError::shape("step features", STEP_FEATURES, s_width));
        }
        if sb != b || s_len != seq_len {
            return Err(TwinError::shape("step sequence", b * seq_len, sb * s_len));
        }
        Ok(self.forward(batch.fusion.clone(), batch.steps.clone()))
    }

    /// Mean squared error over every group of a mini-batch.
    /// Returns the scalar loss and the concatenated predictions.
    pub fn forward_loss(&self, groups: &[SequenceBatch<B>]) -> TwinResult<(Tensor<B, 1>, Tensor<B, 2>)> {
        if groups.is_empty() {
            return Err(TwinError::EmptySequence);
        }
        let mut preds = Vec::with_capacity(groups.len());
        let mut targets = Vec::with_capacity(groups.len());
        for g in groups {
            let target = g.targets.clone().ok_or_else(|| {
                TwinError::InvalidConfig("training batch without targets".into())
            })?;
            let pred = self.forward_batch(g)?;
            if pred.dims() != target.dims() {
                return Err(TwinError::shape("targets", pred.dims()[1], target.dims()[1]));
            }
            preds.push(pred);
            targets.push(target);
        }

        let preds = Tensor::cat(preds, 0);
        let targets = Tensor::cat(targets, 0);
        let loss = MseLoss::new().forward(preds.clone(), targets, Reduction::Mean);
        Ok((loss, preds))
    }

    pub fn n_horizons(&self) -> usize {
        self.forecast.n_horizons
    }

    /// (fusion, forecast) parameter counts
    pub fn parameter_summary(&self) -> (usize, usize) {
        (self.fusion.num_params(), self.forecast.num_params())
    }

    /// Layer counts and linear weight shapes of `record` must equal this
    /// model's before the record is loaded into it.
    pub fn check_record(&self, record: &TwinModelRecord<B>) -> TwinResult<()> {
        let (fusion, forecast) = (&record.fusion, &record.forecast);
        if fusion.blocks.len() != self.fusion.blocks.len() {
            return Err(TwinError::shape("fusion attention blocks", self.fusion.blocks.len(), fusion.blocks.len()));
        }
        if forecast.layers.len() != self.forecast.layers.len() {
            return Err(TwinError::shape("forecast recurrent layers", self.forecast.layers.len(), forecast.layers.len()));
        }

        let mut linears = vec![
            ("fusion input projection".to_string(), &self.fusion.input_proj, &fusion.input_proj),
            ("fusion output projection 1".to_string(), &self.fusion.out_proj1, &fusion.out_proj1),
            ("fusion output projection 2".to_string(), &self.fusion.out_proj2, &fusion.out_proj2),
            ("forecast head 1".to_string(), &self.forecast.head1, &forecast.head1),
            ("forecast head 2".to_string(), &self.forecast.head2, &forecast.head2),
        ];
        for (i, (block, rec)) in self.fusion.blocks.iter().zip(&fusion.blocks).enumerate() {
            linears.push((format!("fusion block {i} ffn 1"), &block.ffn_linear1, &rec.ffn_linear1));
            linears.push((format!("fusion block {i} ffn 2"), &block.ffn_linear2, &rec.ffn_linear2));
        }

        for (what, linear, rec) in linears {
            let (expected, actual) = (linear_dims(linear), linear_record_dims(rec));
            if expected != actual {
                return Err(TwinError::InvalidConfig(format!(
                    "{what} weights are {actual:?}, model expects {expected:?}"
                )));
            }
        }
        Ok(())
    }
}

fn linear_dims<B: Backend>(linear: &Linear<B>) -> [usize; 2] {
    linear.weight.val().dims()
}

fn linear_record_dims<B: Backend>(record: &LinearRecord<B>) -> [usize; 2] {
    record.weight.val().dims()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::train_use_case::TrainConfig;
    use crate::data::batcher::SequenceBatcher;
    use crate::data::dataset::build_samples;
    use crate::data::fixtures;
    use crate::data::preprocessor::{FeatureLayout, FeatureScaling, Preprocessor};
    use crate::domain::patient::HandwritingPolicy;
    use crate::ml::{default_device, tensor_to_vec, InnerBackend};

    fn small_config(input_dim: usize) -> TwinModelConfig {
        let fusion = FusionEncoderConfig::new(input_dim).with_d_model(16).with_d_ff(16);
        let forecast = ForecastHeadConfig::new(16, 2).with_hidden(8);
        TwinModelConfig::new(fusion, forecast)
    }

    fn batcher() -> SequenceBatcher<InnerBackend> {
        let layout = FeatureLayout::new(4, 4, vec!["age".into(), "gait_variability".into()]);
        let pre = Preprocessor::new(layout, FeatureScaling::default(), HandwritingPolicy::Average);
        SequenceBatcher::new(pre, 2, default_device())
    }

    #[test]
    fn default_architecture_fits_combined_budget() {
        let cfg = TrainConfig::default().model_config();
        assert_eq!(cfg.fusion.input_dim, 128 + 128 + 4);
        cfg.validate().unwrap();
        let model: TwinModel<InnerBackend> = cfg.init(&default_device());
        let (fusion, forecast) = model.parameter_summary();
        assert!(fusion + forecast < 1_000_000);
    }

    #[test]
    fn validate_rejects_inconsistent_configs() {
        let mut cfg = small_config(10);
        cfg.fusion.num_heads = 3;
        assert!(matches!(cfg.validate(), Err(TwinError::InvalidConfig(_))));

        let mut cfg = small_config(10);
        cfg.forecast.joint_dim = 32;
        assert!(cfg.validate().is_err());

        let mut cfg = small_config(10);
        cfg.fusion.num_layers = 0;
        assert!(matches!(cfg.validate(), Err(TwinError::InvalidConfig(_))));

        let mut cfg = small_config(10);
        cfg.forecast.hidden = 0;
        assert!(matches!(cfg.validate(), Err(TwinError::InvalidConfig(_))));

        let mut cfg = small_config(10);
        cfg.forecast.num_layers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn record_from_another_architecture_is_rejected() {
        let device = default_device();
        let trained: TwinModel<InnerBackend> = small_config(10).init(&device);

        let mut fewer_blocks = small_config(10);
        fewer_blocks.fusion.num_layers = 1;
        let target: TwinModel<InnerBackend> = fewer_blocks.init(&device);
        let err = target.check_record(&trained.clone().into_record()).unwrap_err();
        assert!(matches!(err, TwinError::ShapeMismatch { expected: 1, actual: 2, .. }));

        let mut wider_head = small_config(10);
        wider_head.forecast.hidden = 12;
        let target: TwinModel<InnerBackend> = wider_head.init(&device);
        assert!(target.check_record(&trained.clone().into_record()).is_err());

        let same: TwinModel<InnerBackend> = small_config(10).init(&device);
        same.check_record(&trained.into_record()).unwrap();
    }

    #[test]
    fn forward_batch_checks_input_width() {
        let model: TwinModel<InnerBackend> = small_config(11).init(&default_device());
        let h = fixtures::history("P1", 4, 4, &fixtures::TIMEPOINTS, 1);
        let groups = batcher().batch(build_samples(&h, &[6, 12], 1), 0).unwrap();
        let err = model.forward_batch(&groups[0]).unwrap_err();
        assert!(matches!(err, TwinError::ShapeMismatch { expected: 11, actual: 10, .. }));
    }

    #[test]
    fn loss_covers_all_length_groups() {
        let model: TwinModel<InnerBackend> = small_config(10).init(&default_device());
        let h = fixtures::history("P1", 4, 4, &fixtures::TIMEPOINTS, 1);
        let groups = batcher().batch(build_samples(&h, &[6, 12], 1), 0).unwrap();

        let (loss, preds) = model.forward_loss(&groups).unwrap();
        assert_eq!(preds.dims(), [3, 2]);
        let loss = tensor_to_vec(loss).unwrap();
        assert_eq!(loss.len(), 1);
        assert!(loss[0].is_finite() && loss[0] >= 0.0);
    }

    #[test]
    fn eval_forward_is_deterministic() {
        let model: TwinModel<InnerBackend> = small_config(10).init(&default_device());
        let h = fixtures::history("P1", 4, 4, &fixtures::TIMEPOINTS, 1);
        let features = batcher().preprocessor().encode(&h).unwrap();
        let batch = batcher().inputs(&[features]).unwrap();

        let a = tensor_to_vec(model.forward_batch(&batch).unwrap()).unwrap();
        let b = tensor_to_vec(model.forward_batch(&batch).unwrap()).unwrap();
        assert_eq!(a, b);
    }
}
