// ============================================================
// Layer 4 — Sequence Batcher
// ============================================================
// Converts PatientSamples into tensors for the forward pass.
//
// Histories have different lengths, so a mini-batch is split
// into groups of equal length. Each group becomes one
// SequenceBatch:
//
//   fusion : [group, seq_len, A+S+k]
//   steps  : [group, seq_len, 3]
//   targets: [group, H]            (standardized scores)
//
// Any per-sample shape problem fails the whole batch with
// BatchShapeError; nothing is padded or skipped.

use std::collections::BTreeMap;

use burn::prelude::*;

use crate::data::dataset::PatientSample;
use crate::data::preprocessor::{Preprocessor, SequenceFeatures, STEP_FEATURES};
use crate::domain::error::{TwinError, TwinResult};

#[derive(Debug, Clone)]
pub struct SequenceBatch<B: Backend> {
    pub fusion: Tensor<B, 3>,
    pub steps: Tensor<B, 3>,
    /// Standardized targets, present for training/validation batches
    pub targets: Option<Tensor<B, 2>>,
    /// Raw target scores, row per sequence
    pub raw_targets: Vec<Vec<f32>>,
    pub patient_ids: Vec<String>,
}

impl<B: Backend> SequenceBatch<B> {
    pub fn seq_len(&self) -> usize {
        self.fusion.dims()[1]
    }
}

#[derive(Clone, Debug)]
pub struct SequenceBatcher<B: Backend> {
    preprocessor: Preprocessor,
    n_horizons: usize,
    device: B::Device,
}

impl<B: Backend> SequenceBatcher<B> {
    pub fn new(preprocessor: Preprocessor, n_horizons: usize, device: B::Device) -> Self {
        Self {
            preprocessor,
            n_horizons,
            device,
        }
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Stack same-length feature sets into one input batch (no targets).
    pub fn inputs(&self, features: &[SequenceFeatures]) -> TwinResult<SequenceBatch<B>> {
        let first = features.first().ok_or(TwinError::EmptySequence)?;
        let seq_len = first.len;
        let width = self.preprocessor.layout().fusion_input_dim();

        let mut fusion = Vec::with_capacity(features.len() * seq_len * width);
        let mut steps = Vec::with_capacity(features.len() * seq_len * STEP_FEATURES);
        for f in features {
            if f.len != seq_len {
                return Err(TwinError::shape("sequence length within group", seq_len, f.len));
            }
            if f.fusion.len() != seq_len * width {
                return Err(TwinError::shape("fusion input", seq_len * width, f.fusion.len()));
            }
            if f.steps.len() != seq_len * STEP_FEATURES {
                return Err(TwinError::shape("step features", seq_len * STEP_FEATURES, f.steps.len()));
            }
            fusion.extend_from_slice(&f.fusion);
            steps.extend_from_slice(&f.steps);
        }

        let b = features.len();
        Ok(SequenceBatch {
            fusion: Tensor::from_data(TensorData::new(fusion, [b, seq_len, width]), &self.device),
            steps: Tensor::from_data(
                TensorData::new(steps, [b, seq_len, STEP_FEATURES]),
                &self.device,
            ),
            targets: None,
            raw_targets: Vec::new(),
            patient_ids: Vec::new(),
        })
    }

    /// `n` copies of one sequence, for repeated stochastic passes.
    pub fn replicate(&self, features: &SequenceFeatures, n: usize) -> TwinResult<SequenceBatch<B>> {
        let copies = vec![features.clone(); n];
        self.inputs(&copies)
    }

    /// Encode a mini-batch of samples, grouped by sequence length.
    pub fn batch(&self, items: Vec<PatientSample>, batch_index: usize) -> TwinResult<Vec<SequenceBatch<B>>> {
        let mut groups: BTreeMap<usize, Vec<(SequenceFeatures, Vec<f32>, String)>> = BTreeMap::new();

        for item in items {
            if item.targets.len() != self.n_horizons {
                return Err(TwinError::BatchShapeError {
                    batch: batch_index,
                    detail: format!(
                        "patient {} has {} targets, model predicts {}",
                        item.patient_id(),
                        item.targets.len(),
                        self.n_horizons
                    ),
                });
            }
            let features = self
                .preprocessor
                .encode(&item.history)
                .map_err(|e| e.into_batch_error(batch_index))?;
            groups
                .entry(features.len)
                .or_default()
                .push((features, item.targets, item.history.id().to_string()));
        }

        groups
            .into_values()
            .map(|group| {
                let (features, raw_targets, patient_ids): (Vec<_>, Vec<_>, Vec<_>) =
                    unzip3(group);
                let mut batch = self
                    .inputs(&features)
                    .map_err(|e| e.into_batch_error(batch_index))?;

                let normalized: Vec<f32> = raw_targets
                    .iter()
                    .flatten()
                    .map(|&t| self.preprocessor.normalize_score(t))
                    .collect();
                batch.targets = Some(Tensor::from_data(
                    TensorData::new(normalized, [raw_targets.len(), self.n_horizons]),
                    &self.device,
                ));
                batch.raw_targets = raw_targets;
                batch.patient_ids = patient_ids;
                Ok(batch)
            })
            .collect()
    }
}

fn unzip3<A, B, C>(items: Vec<(A, B, C)>) -> (Vec<A>, Vec<B>, Vec<C>) {
    let mut a = Vec::with_capacity(items.len());
    let mut b = Vec::with_capacity(items.len());
    let mut c = Vec::with_capacity(items.len());
    for (x, y, z) in items {
        a.push(x);
        b.push(y);
        c.push(z);
    }
    (a, b, c)
}
