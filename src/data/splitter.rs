// ============================================================
// Layer 4 — Train/Validation Splitter
// ============================================================
// Splits by PATIENT, never by sample: every sample of a patient
// lands on the same side, so validation patients are never
// gradient sources. The shuffle is seeded, so a rerun with the
// same seed reproduces the same split.
//
// Uses Fisher-Yates shuffle via rand::seq::SliceRandom.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::domain::patient::PatientHistory;

/// Shuffle `items` with `seed` and split into (train, validation).
///
/// # Arguments
/// * `items`          - All available items (consumed by this function)
/// * `train_fraction` - Proportion for training, e.g. 0.8 = 80%
/// * `seed`           - Shuffle seed
pub fn split_train_val<T>(mut items: Vec<T>, train_fraction: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);

    let total = items.len();
    let split_at = ((total as f64) * train_fraction).round() as usize;
    let split_at = split_at.min(total);

    let val = items.split_off(split_at);

    tracing::debug!(
        "Split: {} training, {} validation ({}% / {}%)",
        items.len(),
        val.len(),
        (items.len() * 100) / total.max(1),
        (val.len() * 100) / total.max(1),
    );

    (items, val)
}

/// Patient-level split. Input order does not affect the result: patients
/// are sorted by id before the seeded shuffle.
pub fn split_patients(
    mut histories: Vec<PatientHistory>,
    train_fraction: f64,
    seed: u64,
) -> (Vec<PatientHistory>, Vec<PatientHistory>) {
    histories.sort_by(|a, b| a.id().cmp(b.id()));
    split_train_val(histories, train_fraction, seed)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures;

    #[test]
    fn test_correct_split_sizes() {
        let items: Vec<usize> = (0..100).collect();
        let (train, val) = split_train_val(items, 0.8, 42);
        assert_eq!(train.len(), 80);
        assert_eq!(val.len(), 20);
    }

    #[test]
    fn test_all_items_preserved() {
        let items: Vec<usize> = (0..50).collect();
        let (train, val) = split_train_val(items, 0.7, 1);
        let mut all: Vec<usize> = train.into_iter().chain(val).collect();
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_dataset() {
        let (train, val) = split_train_val(Vec::<usize>::new(), 0.8, 42);
        assert!(train.is_empty());
        assert!(val.is_empty());
    }

    #[test]
    fn test_same_seed_same_split() {
        let a = split_train_val((0..30).collect::<Vec<usize>>(), 0.8, 7);
        let b = split_train_val((0..30).collect::<Vec<usize>>(), 0.8, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn test_patient_split_is_disjoint_and_order_independent() {
        let cohort = fixtures::cohort(10, 2, 2, 3);
        let mut reversed = cohort.clone();
        reversed.reverse();

        let (train, val) = split_patients(cohort, 0.8, 42);
        let (train_r, _) = split_patients(reversed, 0.8, 42);

        let train_ids: Vec<&str> = train.iter().map(|h| h.id()).collect();
        let train_r_ids: Vec<&str> = train_r.iter().map(|h| h.id()).collect();
        assert_eq!(train_ids, train_r_ids);
        assert_eq!(train.len(), 8);
        assert!(val.iter().all(|v| !train_ids.contains(&v.id())));
    }
}
