// Test cohorts: linear decline plus noise, with embeddings that
// carry a weak signal of the current score.

use std::collections::BTreeMap;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::domain::patient::{Patient, PatientHistory, TimepointRecord};

pub const TIMEPOINTS: [f32; 5] = [0.0, 6.0, 12.0, 18.0, 24.0];

pub fn history(
    id: &str,
    audio_dim: usize,
    handwriting_dim: usize,
    timestamps: &[f32],
    seed: u64,
) -> PatientHistory {
    let mut rng = StdRng::seed_from_u64(seed);
    let age = rng.gen_range(65.0..85.0f32);
    let baseline = rng.gen_range(90.0..100.0f32);
    let rate = rng.gen_range(0.0..6.0f32);
    let patient = Patient::new(id, age, baseline).with_decline_rate(rate);

    let records = timestamps
        .iter()
        .map(|&t| {
            let score = (baseline - rate * t / 12.0 + rng.gen_range(-1.0..1.0f32)).clamp(0.0, 100.0);
            let signal = (score - 90.0) / 5.0;
            let audio = (0..audio_dim)
                .map(|i| signal * ((i + 1) as f32).sin() + rng.gen_range(-0.1..0.1f32))
                .collect();
            let handwriting = (0..2)
                .map(|_| {
                    (0..handwriting_dim)
                        .map(|i| signal * ((i + 2) as f32).cos() + rng.gen_range(-0.1..0.1f32))
                        .collect()
                })
                .collect();
            let mut scalars = BTreeMap::new();
            scalars.insert("typing_flight_time".to_string(), 120.0 + (1.0 - score / 100.0) * 130.0);
            scalars.insert("gait_variability".to_string(), 0.05 + (1.0 - score / 100.0) * 0.2);
            TimepointRecord {
                timestamp_months: t,
                observed_score: Some(score),
                audio,
                handwriting,
                scalars,
            }
        })
        .collect();

    PatientHistory::new(patient, records).expect("fixture timeline is ordered")
}

pub fn cohort(n: usize, audio_dim: usize, handwriting_dim: usize, seed: u64) -> Vec<PatientHistory> {
    (0..n)
        .map(|i| {
            history(
                &format!("P{:03}", i + 1),
                audio_dim,
                handwriting_dim,
                &TIMEPOINTS,
                seed.wrapping_mul(31).wrapping_add(i as u64),
            )
        })
        .collect()
}
