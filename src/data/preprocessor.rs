// ============================================================
// Layer 4 — Feature Preprocessor
// ============================================================
// Turns a PatientHistory into the flat float buffers the model
// consumes. Per timepoint it produces:
//
//   fusion row : [ audio(A) ‖ handwriting(S) ‖ standardized scalars(k) ]
//   step row   : [ timestamp_z, score_z | 0, observed ∈ {0,1} ]
//
// Standardization statistics are fitted once on the training
// split, frozen into the checkpoint, and reused at inference.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::error::{TwinError, TwinResult};
use crate::domain::patient::{HandwritingPolicy, PatientHistory};

/// Number of per-step features appended to each joint embedding.
pub const STEP_FEATURES: usize = 3;

const MIN_STD: f32 = 1e-6;

/// Fixed mean/std pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub mean: f32,
    pub std: f32,
}

impl Standardization {
    pub fn new(mean: f32, std: f32) -> Self {
        Self { mean, std }
    }

    /// Population mean/std of `values`; a degenerate spread becomes 1.0.
    pub fn fit(values: &[f32]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        let std = var.sqrt() as f32;
        Some(Self {
            mean: mean as f32,
            std: if std < MIN_STD { 1.0 } else { std },
        })
    }

    pub fn apply(&self, v: f32) -> f32 {
        (v - self.mean) / self.std
    }

    pub fn invert(&self, z: f32) -> f32 {
        z * self.std + self.mean
    }
}

/// Frozen statistics for every standardized input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaling {
    pub scalars: BTreeMap<String, Standardization>,
    pub timestamp: Standardization,
    pub score: Standardization,
}

impl Default for FeatureScaling {
    fn default() -> Self {
        let scalars = [
            ("age", Standardization::new(75.0, 10.0)),
            ("baseline_score", Standardization::new(95.0, 5.0)),
            ("typing_flight_time", Standardization::new(132.0, 7.0)),
            ("gait_variability", Standardization::new(0.066, 0.009)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            scalars,
            timestamp: Standardization::new(12.0, 8.0),
            score: Standardization::new(90.0, 5.0),
        }
    }
}

impl FeatureScaling {
    /// Fit scaling on the training cohort. Names without any observed
    /// value keep their default statistics, or 0/1 when none exist.
    pub fn fit(histories: &[PatientHistory], scalar_names: &[String]) -> Self {
        let defaults = Self::default();

        let mut timestamps = Vec::new();
        let mut scores = Vec::new();
        let mut per_scalar: BTreeMap<&str, Vec<f32>> = BTreeMap::new();

        for h in histories {
            for r in h.records() {
                timestamps.push(r.timestamp_months);
                if let Some(s) = r.observed_score {
                    scores.push(s);
                }
                for name in scalar_names {
                    if let Some(v) = lookup_scalar(h, r.scalars.get(name.as_str()), name) {
                        per_scalar.entry(name.as_str()).or_default().push(v);
                    }
                }
            }
        }

        let scalars = scalar_names
            .iter()
            .map(|name| {
                let fitted = per_scalar
                    .get(name.as_str())
                    .and_then(|v| Standardization::fit(v))
                    .or_else(|| defaults.scalars.get(name).copied())
                    .unwrap_or(Standardization::new(0.0, 1.0));
                (name.clone(), fitted)
            })
            .collect();

        Self {
            scalars,
            timestamp: Standardization::fit(&timestamps).unwrap_or(defaults.timestamp),
            score: Standardization::fit(&scores).unwrap_or(defaults.score),
        }
    }

    fn scalar(&self, name: &str) -> TwinResult<Standardization> {
        self.scalars.get(name).copied().ok_or_else(|| {
            TwinError::InvalidConfig(format!("no scaling statistics for scalar '{name}'"))
        })
    }
}

/// Dimensions and scalar names of the fusion input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureLayout {
    pub audio_dim: usize,
    pub handwriting_dim: usize,
    pub scalar_names: Vec<String>,
}

impl FeatureLayout {
    pub fn new(audio_dim: usize, handwriting_dim: usize, scalar_names: Vec<String>) -> Self {
        Self {
            audio_dim,
            handwriting_dim,
            scalar_names,
        }
    }

    /// A + S + k
    pub fn fusion_input_dim(&self) -> usize {
        self.audio_dim + self.handwriting_dim + self.scalar_names.len()
    }
}

/// Host-side model input for one patient history.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceFeatures {
    pub len: usize,
    /// len × fusion_input_dim, row-major
    pub fusion: Vec<f32>,
    /// len × STEP_FEATURES, row-major
    pub steps: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    layout: FeatureLayout,
    scaling: FeatureScaling,
    policy: HandwritingPolicy,
}

impl Preprocessor {
    pub fn new(layout: FeatureLayout, scaling: FeatureScaling, policy: HandwritingPolicy) -> Self {
        Self {
            layout,
            scaling,
            policy,
        }
    }

    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    /// Same preprocessor with a different handwriting policy.
    pub fn with_policy(&self, policy: HandwritingPolicy) -> Self {
        Self {
            policy,
            ..self.clone()
        }
    }

    pub fn normalize_score(&self, score: f32) -> f32 {
        self.scaling.score.apply(score)
    }

    pub fn denormalize_score(&self, z: f32) -> f32 {
        self.scaling.score.invert(z)
    }

    pub fn encode(&self, history: &PatientHistory) -> TwinResult<SequenceFeatures> {
        if history.is_empty() {
            return Err(TwinError::EmptySequence);
        }

        let width = self.layout.fusion_input_dim();
        let mut fusion = Vec::with_capacity(history.len() * width);
        let mut steps = Vec::with_capacity(history.len() * STEP_FEATURES);

        for record in history.records() {
            if record.audio.len() != self.layout.audio_dim {
                return Err(TwinError::shape(
                    "audio embedding",
                    self.layout.audio_dim,
                    record.audio.len(),
                ));
            }
            let handwriting = self
                .policy
                .select(&record.handwriting, self.layout.handwriting_dim)?;

            if record.audio.iter().chain(&handwriting).any(|v| !v.is_finite()) {
                return Err(TwinError::EmbeddingUnavailable {
                    patient_id: history.id().to_string(),
                    timestamp_months: record.timestamp_months,
                    reason: "embedding contains non-finite values".into(),
                });
            }

            fusion.extend_from_slice(&record.audio);
            fusion.extend_from_slice(&handwriting);

            for name in &self.layout.scalar_names {
                let raw = lookup_scalar(history, record.scalars.get(name.as_str()), name)
                    .ok_or_else(|| TwinError::MissingScalar {
                        patient_id: history.id().to_string(),
                        name: name.clone(),
                    })?;
                fusion.push(self.scaling.scalar(name)?.apply(raw));
            }

            steps.push(self.scaling.timestamp.apply(record.timestamp_months));
            match record.observed_score {
                Some(score) => {
                    steps.push(self.scaling.score.apply(score));
                    steps.push(1.0);
                }
                None => {
                    steps.push(0.0);
                    steps.push(0.0);
                }
            }
        }

        Ok(SequenceFeatures {
            len: history.len(),
            fusion,
            steps,
        })
    }
}

// Per-timepoint value wins over the patient's static value.
fn lookup_scalar(history: &PatientHistory, per_timepoint: Option<&f32>, name: &str) -> Option<f32> {
    per_timepoint
        .copied()
        .or_else(|| history.patient().static_scalar(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::patient::{Patient, TimepointRecord};

    fn layout() -> FeatureLayout {
        FeatureLayout::new(2, 2, vec!["age".into(), "gait_variability".into()])
    }

    fn history(score: Option<f32>, gait: Option<f32>) -> PatientHistory {
        let mut scalars = BTreeMap::new();
        if let Some(g) = gait {
            scalars.insert("gait_variability".to_string(), g);
        }
        let record = TimepointRecord {
            timestamp_months: 6.0,
            observed_score: score,
            audio: vec![0.5, -0.5],
            handwriting: vec![vec![1.0, 1.0], vec![3.0, 3.0]],
            scalars,
        };
        PatientHistory::new(Patient::new("P1", 85.0, 95.0), vec![record]).unwrap()
    }

    #[test]
    fn encodes_fusion_and_step_rows() {
        let pre = Preprocessor::new(layout(), FeatureScaling::default(), HandwritingPolicy::Average);
        let f = pre.encode(&history(Some(95.0), Some(0.066))).unwrap();

        assert_eq!(f.len, 1);
        assert_eq!(f.fusion.len(), layout().fusion_input_dim());
        // audio, averaged handwriting, age z-score (85-75)/10, gait z-score 0
        assert_eq!(&f.fusion[..4], &[0.5, -0.5, 2.0, 2.0]);
        assert!((f.fusion[4] - 1.0).abs() < 1e-6);
        assert!(f.fusion[5].abs() < 1e-4);
        // timestamp (6-12)/8, score (95-90)/5, observed flag
        assert_eq!(f.steps, vec![-0.75, 1.0, 1.0]);
    }

    #[test]
    fn unobserved_score_uses_sentinel() {
        let pre = Preprocessor::new(layout(), FeatureScaling::default(), HandwritingPolicy::First);
        let f = pre.encode(&history(None, Some(0.07))).unwrap();
        assert_eq!(&f.steps[1..], &[0.0, 0.0]);
        assert_eq!(&f.fusion[2..4], &[1.0, 1.0]);
    }

    #[test]
    fn missing_scalar_is_an_error() {
        let pre = Preprocessor::new(layout(), FeatureScaling::default(), HandwritingPolicy::Average);
        let err = pre.encode(&history(Some(95.0), None)).unwrap_err();
        assert!(matches!(err, TwinError::MissingScalar { ref name, .. } if name == "gait_variability"));
    }

    #[test]
    fn wrong_audio_dim_is_a_shape_mismatch() {
        let pre = Preprocessor::new(
            FeatureLayout::new(3, 2, vec![]),
            FeatureScaling::default(),
            HandwritingPolicy::Average,
        );
        let err = pre.encode(&history(Some(95.0), None)).unwrap_err();
        assert!(matches!(err, TwinError::ShapeMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn empty_history_is_rejected() {
        let pre = Preprocessor::new(layout(), FeatureScaling::default(), HandwritingPolicy::Average);
        let empty = PatientHistory::new(Patient::new("P1", 70.0, 90.0), vec![]).unwrap();
        assert!(matches!(pre.encode(&empty), Err(TwinError::EmptySequence)));
    }

    #[test]
    fn fit_uses_training_values_and_guards_zero_spread() {
        let h = history(Some(80.0), Some(0.1));
        let scaling = FeatureScaling::fit(&[h], &["age".into(), "gait_variability".into()]);
        // single value → std falls back to 1.0
        assert_eq!(scaling.scalars["age"], Standardization::new(85.0, 1.0));
        assert_eq!(scaling.score, Standardization::new(80.0, 1.0));
        assert_eq!(scaling.timestamp.mean, 6.0);
    }

    #[test]
    fn standardization_round_trips() {
        let s = Standardization::new(90.0, 5.0);
        assert!((s.invert(s.apply(83.5)) - 83.5).abs() < 1e-5);
    }
}
