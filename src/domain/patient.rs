// ============================================================
// Layer 3 — Patient and Timepoint Domain Types
// ============================================================
// A Patient is immutable once created. Its TimepointRecords are
// produced by upstream collaborators and, ordered by timestamp,
// form the immutable input of a single forecast call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::error::{TwinError, TwinResult};

/// Static patient information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,

    /// Age in years
    pub age: f32,

    /// Cognitive score at enrolment, 0–100 scale
    pub baseline_score: f32,

    /// Intrinsic decline in points/year. Only meaningful for
    /// generated cohorts; usable as an optional scalar feature.
    #[serde(default)]
    pub decline_rate: Option<f32>,
}

impl Patient {
    pub fn new(id: impl Into<String>, age: f32, baseline_score: f32) -> Self {
        Self {
            id: id.into(),
            age,
            baseline_score,
            decline_rate: None,
        }
    }

    pub fn with_decline_rate(mut self, rate: f32) -> Self {
        self.decline_rate = Some(rate);
        self
    }

    /// Look up a static scalar by its feature name.
    pub fn static_scalar(&self, name: &str) -> Option<f32> {
        match name {
            "age" => Some(self.age),
            "baseline_score" => Some(self.baseline_score),
            "decline_rate" => self.decline_rate,
            _ => None,
        }
    }
}

/// One entry of the metadata provider's ordered timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub timestamp_months: f32,

    #[serde(default, alias = "cognitive_score")]
    pub observed_score: Option<f32>,

    /// Per-timepoint passive biomarkers, e.g. typing flight time
    #[serde(default)]
    pub scalars: BTreeMap<String, f32>,
}

/// What the metadata provider returns for a patient.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientMetadata {
    pub patient: Patient,
    pub timeline: Vec<TimelineEntry>,
}

/// Embeddings for one timepoint as handed over by the embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimepointEmbeddings {
    pub audio: Vec<f32>,
    pub handwriting: Vec<Vec<f32>>,
}

/// One observation of a patient.
#[derive(Debug, Clone, PartialEq)]
pub struct TimepointRecord {
    pub timestamp_months: f32,
    pub observed_score: Option<f32>,
    pub audio: Vec<f32>,
    /// One or more handwriting-trace embeddings
    pub handwriting: Vec<Vec<f32>>,
    pub scalars: BTreeMap<String, f32>,
}

impl TimepointRecord {
    pub fn new(entry: TimelineEntry, embeddings: TimepointEmbeddings) -> Self {
        Self {
            timestamp_months: entry.timestamp_months,
            observed_score: entry.observed_score,
            audio: embeddings.audio,
            handwriting: embeddings.handwriting,
            scalars: entry.scalars,
        }
    }
}

/// How several handwriting traces at one timepoint collapse to one vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandwritingPolicy {
    /// Element-wise mean of all traces
    #[default]
    Average,
    /// The first trace only
    First,
}

impl HandwritingPolicy {
    /// Pick the single representative trace. Every trace must have length `dim`.
    pub fn select(self, traces: &[Vec<f32>], dim: usize) -> TwinResult<Vec<f32>> {
        if traces.is_empty() {
            return Err(TwinError::shape("handwriting trace count", 1, 0));
        }
        for trace in traces {
            if trace.len() != dim {
                return Err(TwinError::shape("handwriting embedding", dim, trace.len()));
            }
        }

        match self {
            HandwritingPolicy::First => Ok(traces[0].clone()),
            HandwritingPolicy::Average => {
                let mut mean = vec![0.0f32; dim];
                for trace in traces {
                    for (m, v) in mean.iter_mut().zip(trace) {
                        *m += v;
                    }
                }
                let n = traces.len() as f32;
                mean.iter_mut().for_each(|m| *m /= n);
                Ok(mean)
            }
        }
    }
}

/// A patient together with its validated, time-ordered records.
#[derive(Debug, Clone)]
pub struct PatientHistory {
    patient: Patient,
    records: Vec<TimepointRecord>,
}

impl PatientHistory {
    /// Validates that timestamps are finite, non-negative and strictly increasing.
    pub fn new(patient: Patient, records: Vec<TimepointRecord>) -> TwinResult<Self> {
        let invalid = |reason: String| TwinError::InvalidTimeline {
            patient_id: patient.id.clone(),
            reason,
        };

        let mut previous: Option<f32> = None;
        for r in &records {
            let t = r.timestamp_months;
            if !t.is_finite() || t < 0.0 {
                return Err(invalid(format!("timestamp {t} is not a non-negative number")));
            }
            if let Some(p) = previous {
                if t <= p {
                    return Err(invalid(format!(
                        "timestamps must be strictly increasing ({p} then {t})"
                    )));
                }
            }
            if let Some(score) = r.observed_score {
                if !score.is_finite() {
                    return Err(invalid(format!("non-finite score at {t} months")));
                }
            }
            previous = Some(t);
        }

        Ok(Self { patient, records })
    }

    pub fn patient(&self) -> &Patient {
        &self.patient
    }

    pub fn id(&self) -> &str {
        &self.patient.id
    }

    pub fn records(&self) -> &[TimepointRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The history restricted to records at or before `months`.
    pub fn until(&self, months: f32) -> PatientHistory {
        let records = self
            .records
            .iter()
            .filter(|r| r.timestamp_months <= months)
            .cloned()
            .collect();
        PatientHistory {
            patient: self.patient.clone(),
            records,
        }
    }

    /// The first `n` records.
    pub fn prefix(&self, n: usize) -> PatientHistory {
        PatientHistory {
            patient: self.patient.clone(),
            records: self.records.iter().take(n).cloned().collect(),
        }
    }

    pub fn last_timestamp(&self) -> Option<f32> {
        self.records.last().map(|r| r.timestamp_months)
    }

    /// Most recent observed score in the history.
    pub fn last_observed_score(&self) -> Option<f32> {
        self.records.iter().rev().find_map(|r| r.observed_score)
    }

    /// Observed score at `months`, within `tolerance` months.
    pub fn observed_at(&self, months: f32, tolerance: f32) -> Option<f32> {
        self.records
            .iter()
            .find(|r| (r.timestamp_months - months).abs() <= tolerance)
            .and_then(|r| r.observed_score)
    }
}
