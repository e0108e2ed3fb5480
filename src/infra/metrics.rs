// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Records training metrics to a CSV file after each epoch.
//
// Metrics recorded per epoch:
//   - epoch:      the epoch number (1, 2, 3, ...)
//   - train_loss: mean squared error on standardized scores
//   - val_mae:    mean absolute error on validation forecasts,
//                 in score points, across every horizon
//   - val_rmse:   root mean squared error, same population
//   - improved:   1 when val_mae beat the best so far
//
// Output file: <checkpoint_dir>/metrics.csv
//
// After training, the reloaded best checkpoint is scored once more
// per horizon (MAE, RMSE, R²); those numbers go to summary.json.
//
// Example CSV output:
//   epoch,train_loss,val_mae,val_rmse,improved
//   1,0.912300,3.412000,4.120000,1
//   2,0.640100,3.108000,3.871000,1
//   3,0.588000,3.190000,3.902000,0

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::domain::error::TwinResult;

/// One row of metrics data for a single training epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// The epoch number (starts at 1)
    pub epoch: usize,

    /// Mean training loss over all mini-batches
    pub train_loss: f64,

    pub val_mae: f64,

    pub val_rmse: f64,

    pub improved: bool,
}

impl EpochMetrics {
    pub fn new(epoch: usize, train_loss: f64, val_mae: f64, val_rmse: f64, improved: bool) -> Self {
        Self { epoch, train_loss, val_mae, val_rmse, improved }
    }
}

/// Validation error of the best checkpoint at one horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonMetrics {
    pub horizon_months: u32,
    pub samples:        usize,
    pub mae:            f64,
    pub rmse:           f64,
    /// Coefficient of determination; NaN when the targets have no spread
    pub r2:             f64,
}

impl HorizonMetrics {
    pub fn from_accumulator(horizon_months: u32, acc: &ErrorAccumulator) -> Self {
        Self {
            horizon_months,
            samples: acc.count(),
            mae: acc.mae(),
            rmse: acc.rmse(),
            r2: acc.r2(),
        }
    }
}

// ─── Error accumulators ───────────────────────────────────────────────────────
/// Running MAE / RMSE / R² over (prediction, target) pairs.
#[derive(Debug, Clone, Default)]
pub struct ErrorAccumulator {
    abs_sum:       f64,
    sq_sum:        f64,
    target_sum:    f64,
    target_sq_sum: f64,
    count:         usize,
}

impl ErrorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, prediction: f32, target: f32) {
        let e = (prediction - target) as f64;
        self.abs_sum += e.abs();
        self.sq_sum += e * e;
        self.target_sum += target as f64;
        self.target_sq_sum += (target as f64).powi(2);
        self.count += 1;
    }

    pub fn extend(&mut self, predictions: &[f32], targets: &[f32]) {
        for (&p, &t) in predictions.iter().zip(targets) {
            self.add(p, t);
        }
    }

    pub fn merge(&mut self, other: &ErrorAccumulator) {
        self.abs_sum += other.abs_sum;
        self.sq_sum += other.sq_sum;
        self.target_sum += other.target_sum;
        self.target_sq_sum += other.target_sq_sum;
        self.count += other.count;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// NaN when empty
    pub fn mae(&self) -> f64 {
        if self.count == 0 { f64::NAN } else { self.abs_sum / self.count as f64 }
    }

    pub fn rmse(&self) -> f64 {
        if self.count == 0 { f64::NAN } else { (self.sq_sum / self.count as f64).sqrt() }
    }

    /// 1 − SS_res / SS_tot
    pub fn r2(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        let n = self.count as f64;
        let ss_tot = self.target_sq_sum - self.target_sum * self.target_sum / n;
        if ss_tot <= f64::EPSILON * self.target_sq_sum.max(1.0) {
            return f64::NAN;
        }
        1.0 - self.sq_sum / ss_tot
    }
}

// ─── CSV logger ───────────────────────────────────────────────────────────────
/// Logs epoch metrics to a CSV file for later analysis.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Starts a fresh metrics.csv in `dir`, replacing one from an earlier run.
    pub fn new(dir: impl AsRef<Path>) -> TwinResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let csv_path = dir.join("metrics.csv");
        let mut f = fs::File::create(&csv_path)?;
        writeln!(f, "epoch,train_loss,val_mae,val_rmse,improved")?;
        tracing::debug!("Created metrics CSV: '{}'", csv_path.display());

        Ok(Self { csv_path })
    }

    /// Append one epoch's metrics as a new row in the CSV.
    pub fn log(&self, m: &EpochMetrics) -> TwinResult<()> {
        let mut f = OpenOptions::new().append(true).open(&self.csv_path)?;

        writeln!(
            f,
            "{},{:.6},{:.6},{:.6},{}",
            m.epoch,
            m.train_loss,
            m.val_mae,
            m.val_rmse,
            u8::from(m.improved),
        )?;

        tracing::debug!(
            "Logged epoch {} metrics: train_loss={:.4}, val_mae={:.4}",
            m.epoch,
            m.train_loss,
            m.val_mae,
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mae_and_rmse() {
        let mut acc = ErrorAccumulator::new();
        acc.extend(&[1.0, 2.0, 3.0, 4.0], &[2.0, 2.0, 5.0, 4.0]);
        assert_eq!(acc.count(), 4);
        assert!((acc.mae() - 0.75).abs() < 1e-9);
        assert!((acc.rmse() - (5.0f64 / 4.0).sqrt()).abs() < 1e-9);
        assert!(ErrorAccumulator::new().mae().is_nan());
    }

    #[test]
    fn test_r2() {
        let mut perfect = ErrorAccumulator::new();
        perfect.extend(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]);
        assert!((perfect.r2() - 1.0).abs() < 1e-9);

        // predicting the target mean scores zero
        let mut mean = ErrorAccumulator::new();
        mean.extend(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]);
        assert!(mean.r2().abs() < 1e-9);

        let mut flat = ErrorAccumulator::new();
        flat.extend(&[1.0, 2.0], &[5.0, 5.0]);
        assert!(flat.r2().is_nan());
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let (preds, targets) = ([1.0, 2.5, 3.0, 4.0], [2.0, 2.0, 5.0, 4.5]);
        let mut whole = ErrorAccumulator::new();
        whole.extend(&preds, &targets);

        let mut left = ErrorAccumulator::new();
        left.extend(&preds[..2], &targets[..2]);
        let mut right = ErrorAccumulator::new();
        right.extend(&preds[2..], &targets[2..]);
        left.merge(&right);

        assert_eq!(left.count(), 4);
        assert!((left.mae() - whole.mae()).abs() < 1e-12);
        assert!((left.r2() - whole.r2()).abs() < 1e-12);

        let m = HorizonMetrics::from_accumulator(6, &left);
        assert_eq!(m.samples, 4);
        assert_eq!(m.horizon_months, 6);
    }

    #[test]
    fn test_csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        logger.log(&EpochMetrics::new(1, 0.9123, 3.412, 4.12, true)).unwrap();
        logger.log(&EpochMetrics::new(2, 0.64, 3.5, 3.9, false)).unwrap();

        let csv = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "epoch,train_loss,val_mae,val_rmse,improved");
        assert_eq!(lines[1], "1,0.912300,3.412000,4.120000,1");
        assert!(lines[2].ends_with(",0"));
    }
}
