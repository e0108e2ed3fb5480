use crate::domain::patient::PatientHistory;

/// Months of slack when matching a horizon to an observed timepoint.
pub const HORIZON_TOLERANCE_MONTHS: f32 = 0.5;

/// One training example: a history prefix and the observed
/// scores at each configured horizon after its last timepoint.
#[derive(Debug, Clone)]
pub struct PatientSample {
    pub history: PatientHistory,
    pub targets: Vec<f32>,
}

impl PatientSample {
    pub fn patient_id(&self) -> &str {
        self.history.id()
    }

    pub fn seq_len(&self) -> usize {
        self.history.len()
    }
}

/// Every (prefix, targets) pair a patient supports. A prefix ending at
/// index k qualifies when k+1 >= `min_history` and a score is observed
/// at t_k + h for every horizon h.
pub fn build_samples(
    history: &PatientHistory,
    horizons: &[u32],
    min_history: usize,
) -> Vec<PatientSample> {
    let mut samples = Vec::new();
    for (k, record) in history.records().iter().enumerate() {
        if k + 1 < min_history.max(1) {
            continue;
        }
        let targets: Option<Vec<f32>> = horizons
            .iter()
            .map(|&h| {
                history.observed_at(record.timestamp_months + h as f32, HORIZON_TOLERANCE_MONTHS)
            })
            .collect();
        if let Some(targets) = targets {
            samples.push(PatientSample {
                history: history.prefix(k + 1),
                targets,
            });
        }
    }
    samples
}

pub struct PatientDataset {
    samples: Vec<PatientSample>,
}

impl PatientDataset {
    pub fn from_histories(histories: &[PatientHistory], horizons: &[u32], min_history: usize) -> Self {
        let samples = histories
            .iter()
            .flat_map(|h| build_samples(h, horizons, min_history))
            .collect();
        Self { samples }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[PatientSample] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures;

    #[test]
    fn five_point_timeline_yields_three_samples() {
        // timepoints 0, 6, 12, 18, 24 with horizons +6/+12
        let h = fixtures::history("P1", 4, 4, &[0.0, 6.0, 12.0, 18.0, 24.0], 3);
        let samples = build_samples(&h, &[6, 12], 1);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].seq_len(), 1);
        assert_eq!(samples[2].seq_len(), 3);
        assert_eq!(samples[2].targets, vec![
            h.records()[3].observed_score.unwrap(),
            h.records()[4].observed_score.unwrap(),
        ]);
    }

    #[test]
    fn min_history_drops_short_prefixes() {
        let h = fixtures::history("P1", 4, 4, &[0.0, 6.0, 12.0, 18.0, 24.0], 3);
        let samples = build_samples(&h, &[6, 12], 3);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].seq_len(), 3);
    }

    #[test]
    fn dataset_collects_every_patient() {
        let cohort = fixtures::cohort(3, 4, 4, 11);
        let ds = PatientDataset::from_histories(&cohort, &[6, 12], 1);
        assert_eq!(ds.sample_count(), 9);
        assert_eq!(ds.samples().iter().filter(|s| s.patient_id() == "P002").count(), 3);
    }
}
