// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Train + validation loop with Adam, best-model checkpointing
// and early stopping.
//
// Run state machine:
//
//   Initialized → Training(1) → Training(2) → … ┬→ EarlyStopped     ┐
//                                               └→ MaxEpochsReached ┴→ Finalized
//
// The epoch loop (drive_training) only sees an EpochRunner: it
// asks for one epoch's numbers and, on a strict validation MAE
// improvement, asks the runner to checkpoint. BurnEpochRunner is
// the real runner:
//   - training uses TrainBackend (Autodiff<NdArray>) for gradients
//   - validation runs on model.valid() (NdArray, dropout off)
//   - a batch with inconsistent shapes aborts the run with
//     BatchShapeError; nothing is skipped
//
// evaluate_per_horizon scores a finished model on held-out
// samples, one MAE / RMSE / R² row per horizon.
//
// Reference: Kingma & Ba (2015) Adam

use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::application::train_use_case::TrainConfig;
use crate::data::{batcher::SequenceBatcher, dataset::PatientSample};
use crate::domain::error::{TwinError, TwinResult};
use crate::infra::{
    checkpoint::{CheckpointManager, ModelSpec},
    metrics::{EpochMetrics, ErrorAccumulator, HorizonMetrics, MetricsLogger},
};
use crate::ml::model::TwinModel;
use crate::ml::{default_device, tensor_to_vec, InnerBackend, TrainBackend};

// ─── Run state ────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EarlyStopped,
    MaxEpochsReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Initialized,
    Training { epoch: usize },
    EarlyStopped { epoch: usize },
    MaxEpochsReached { epoch: usize },
    Finalized(StopReason),
}

/// Best validation MAE seen so far and the epochs since it was set.
#[derive(Debug, Clone)]
pub struct ValidationTracker {
    patience:                 usize,
    best_mae:                 f64,
    best_epoch:               Option<usize>,
    epochs_since_improvement: usize,
}

impl ValidationTracker {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_mae: f64::INFINITY,
            best_epoch: None,
            epochs_since_improvement: 0,
        }
    }

    /// Record one epoch. Returns true on a strict improvement, which is
    /// the only thing that resets the counter. NaN never improves.
    pub fn observe(&mut self, epoch: usize, val_mae: f64) -> bool {
        if val_mae < self.best_mae {
            self.best_mae = val_mae;
            self.best_epoch = Some(epoch);
            self.epochs_since_improvement = 0;
            true
        } else {
            self.epochs_since_improvement += 1;
            false
        }
    }

    pub fn should_stop(&self) -> bool {
        self.epochs_since_improvement >= self.patience
    }

    pub fn best_mae(&self) -> f64 {
        self.best_mae
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn epochs_since_improvement(&self) -> usize {
        self.epochs_since_improvement
    }
}

/// Numbers produced by one full epoch (training pass + validation pass).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochEval {
    pub train_loss: f64,
    pub val_mae:    f64,
    pub val_rmse:   f64,
}

pub trait EpochRunner {
    fn run_epoch(&mut self, epoch: usize) -> TwinResult<EpochEval>;

    /// Persist the current weights as the best model so far.
    fn save_checkpoint(&mut self, epoch: usize, eval: &EpochEval) -> TwinResult<()>;
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub final_epoch:   usize,
    pub best_epoch:    Option<usize>,
    pub best_val_mae:  f64,
    pub best_val_rmse: f64,
    pub stop_reason:   StopReason,
    pub state:         TrainingState,
    pub history:       Vec<EpochMetrics>,
}

/// Run epochs until patience runs out or `max_epochs` is reached.
/// Any runner error aborts the run and is returned unchanged.
pub fn drive_training<R: EpochRunner>(
    runner:     &mut R,
    max_epochs: usize,
    patience:   usize,
    metrics:    Option<&MetricsLogger>,
) -> TwinResult<TrainingOutcome> {
    let mut state = TrainingState::Initialized;
    let mut tracker = ValidationTracker::new(patience);
    let mut best_val_rmse = f64::NAN;
    let mut history = Vec::new();
    tracing::debug!("Training state: {:?}", state);

    for epoch in 1..=max_epochs {
        state = TrainingState::Training { epoch };
        let eval = runner.run_epoch(epoch)?;

        let improved = tracker.observe(epoch, eval.val_mae);
        if improved {
            runner.save_checkpoint(epoch, &eval)?;
            best_val_rmse = eval.val_rmse;
        }

        let row = EpochMetrics::new(epoch, eval.train_loss, eval.val_mae, eval.val_rmse, improved);
        if let Some(logger) = metrics {
            logger.log(&row)?;
        }
        history.push(row);

        tracing::info!(
            "Epoch {:>3}/{} | train_loss={:.4} | val_mae={:.4} | val_rmse={:.4}{}",
            epoch,
            max_epochs,
            eval.train_loss,
            eval.val_mae,
            eval.val_rmse,
            if improved {
                " | new best".to_string()
            } else {
                format!(" | no improvement ({}/{})", tracker.epochs_since_improvement(), patience)
            },
        );

        if tracker.should_stop() {
            state = TrainingState::EarlyStopped { epoch };
            break;
        }
    }

    let final_epoch = history.len();
    let stop_reason = match state {
        TrainingState::EarlyStopped { .. } => StopReason::EarlyStopped,
        _ => {
            state = TrainingState::MaxEpochsReached { epoch: final_epoch };
            StopReason::MaxEpochsReached
        }
    };
    tracing::info!("Training state: {:?}", state);

    Ok(TrainingOutcome {
        final_epoch,
        best_epoch: tracker.best_epoch(),
        best_val_mae: tracker.best_mae(),
        best_val_rmse,
        stop_reason,
        state: TrainingState::Finalized(stop_reason),
        history,
    })
}

// ─── Burn runner ──────────────────────────────────────────────────────────────
pub struct BurnEpochRunner<'a, O> {
    model:         TwinModel<TrainBackend>,
    optim:         O,
    lr:            f64,
    batch_size:    usize,
    rng:           StdRng,
    train_samples: Vec<PatientSample>,
    val_samples:   Vec<PatientSample>,
    train_batcher: SequenceBatcher<TrainBackend>,
    val_batcher:   SequenceBatcher<InnerBackend>,
    spec:          &'a ModelSpec,
    ckpt_manager:  &'a CheckpointManager,
}

impl<'a, O> BurnEpochRunner<'a, O>
where
    O: Optimizer<TwinModel<TrainBackend>, TrainBackend>,
{
    fn train_pass(&mut self) -> TwinResult<f64> {
        let mut order: Vec<usize> = (0..self.train_samples.len()).collect();
        order.shuffle(&mut self.rng);

        let mut loss_sum = 0.0f64;
        let mut batches = 0usize;

        for (batch_index, chunk) in order.chunks(self.batch_size.max(1)).enumerate() {
            let items: Vec<PatientSample> =
                chunk.iter().map(|&i| self.train_samples[i].clone()).collect();
            let groups = self.train_batcher.batch(items, batch_index)?;
            let (loss, _) = self
                .model
                .forward_loss(&groups)
                .map_err(|e| e.into_batch_error(batch_index))?;

            loss_sum += loss.clone().into_scalar().elem::<f64>();
            batches += 1;

            // Backward pass + Adam update
            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optim.step(self.lr, self.model.clone(), grads);
        }

        Ok(if batches > 0 { loss_sum / batches as f64 } else { f64::NAN })
    }

    fn validation_pass(&self) -> TwinResult<ErrorAccumulator> {
        // model.valid() → TwinModel<InnerBackend>, dropout disabled
        let per_horizon = horizon_errors(&self.model.valid(), &self.val_batcher, &self.val_samples, self.batch_size)?;
        let mut acc = ErrorAccumulator::new();
        for h in &per_horizon {
            acc.merge(h);
        }
        Ok(acc)
    }
}

/// Errors of `model` on `samples` in score points, one accumulator per horizon.
fn horizon_errors(
    model:      &TwinModel<InnerBackend>,
    batcher:    &SequenceBatcher<InnerBackend>,
    samples:    &[PatientSample],
    batch_size: usize,
) -> TwinResult<Vec<ErrorAccumulator>> {
    let pre = batcher.preprocessor();
    let n_horizons = model.n_horizons();
    let mut accs = vec![ErrorAccumulator::new(); n_horizons];

    for (batch_index, chunk) in samples.chunks(batch_size.max(1)).enumerate() {
        for group in batcher.batch(chunk.to_vec(), batch_index)? {
            let preds = model
                .forward_batch(&group)
                .map_err(|e| e.into_batch_error(batch_index))?;
            let preds = tensor_to_vec(preds)?;
            for (row, targets) in preds.chunks(n_horizons.max(1)).zip(&group.raw_targets) {
                for (acc, (&z, &t)) in accs.iter_mut().zip(row.iter().zip(targets)) {
                    acc.add(pre.denormalize_score(z), t);
                }
            }
        }
    }
    Ok(accs)
}

/// Score a trained model on `samples`, one row per trained horizon.
pub fn evaluate_per_horizon(
    model:      &TwinModel<InnerBackend>,
    spec:       &ModelSpec,
    samples:    &[PatientSample],
    batch_size: usize,
) -> TwinResult<Vec<HorizonMetrics>> {
    let batcher = SequenceBatcher::new(spec.preprocessor(), spec.horizons.len(), default_device());
    let accs = horizon_errors(model, &batcher, samples, batch_size)?;

    let metrics: Vec<HorizonMetrics> = spec
        .horizons
        .iter()
        .zip(&accs)
        .map(|(&h, acc)| HorizonMetrics::from_accumulator(h, acc))
        .collect();
    for m in &metrics {
        tracing::info!(
            "Horizon +{} months: mae={:.4} rmse={:.4} r2={:.4} ({} samples)",
            m.horizon_months,
            m.mae,
            m.rmse,
            m.r2,
            m.samples
        );
    }
    Ok(metrics)
}

impl<'a, O> EpochRunner for BurnEpochRunner<'a, O>
where
    O: Optimizer<TwinModel<TrainBackend>, TrainBackend>,
{
    fn run_epoch(&mut self, _epoch: usize) -> TwinResult<EpochEval> {
        let train_loss = self.train_pass()?;
        let acc = self.validation_pass()?;
        Ok(EpochEval {
            train_loss,
            val_mae: acc.mae(),
            val_rmse: acc.rmse(),
        })
    }

    fn save_checkpoint(&mut self, epoch: usize, eval: &EpochEval) -> TwinResult<()> {
        self.ckpt_manager
            .save_best(&self.model.valid(), self.spec, epoch, eval.val_mae, eval.val_rmse)
            .map(|_| ())
    }
}

/// Train a fresh model on `train_samples`, validating on `val_samples`.
pub fn run_training(
    cfg:           &TrainConfig,
    spec:          &ModelSpec,
    train_samples: Vec<PatientSample>,
    val_samples:   Vec<PatientSample>,
    ckpt_manager:  &CheckpointManager,
    metrics:       Option<&MetricsLogger>,
) -> TwinResult<TrainingOutcome> {
    if train_samples.is_empty() || val_samples.is_empty() {
        return Err(TwinError::InvalidConfig(format!(
            "need training and validation samples, got {} and {}",
            train_samples.len(),
            val_samples.len()
        )));
    }
    spec.check_consistency()?;

    let device = default_device();
    TrainBackend::seed(cfg.seed);

    // ── Build model ───────────────────────────────────────────────────────────
    let model: TwinModel<TrainBackend> = spec.model.init(&device);
    let (fusion_params, forecast_params) = model.parameter_summary();
    tracing::info!(
        "Model ready: fusion encoder {} params, forecast head {} params",
        fusion_params,
        forecast_params
    );

    // ── Adam optimiser ────────────────────────────────────────────────────────
    // m = β1*m + (1-β1)*g        (mean)
    // v = β2*v + (1-β2)*g²       (variance)
    // θ = θ - lr * m / (√v + ε)  (update)
    let optim = AdamConfig::new().with_epsilon(1e-8).init();

    let preprocessor = spec.preprocessor();
    let n_horizons = spec.horizons.len();
    let mut runner = BurnEpochRunner {
        model,
        optim,
        lr: cfg.lr,
        batch_size: cfg.batch_size,
        rng: StdRng::seed_from_u64(cfg.seed),
        train_samples,
        val_samples,
        train_batcher: SequenceBatcher::new(preprocessor.clone(), n_horizons, device.clone()),
        val_batcher: SequenceBatcher::new(preprocessor, n_horizons, device),
        spec,
        ckpt_manager,
    };

    let outcome = drive_training(&mut runner, cfg.epochs, cfg.patience, metrics)?;
    tracing::info!(
        "Training complete: {:?} after {} epochs, best val_mae={:.4}",
        outcome.stop_reason,
        outcome.final_epoch,
        outcome.best_val_mae
    );
    Ok(outcome)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a fixed validation MAE sequence.
    struct ScriptedRunner {
        maes:    Vec<f64>,
        fail_at: Option<usize>,
        epochs:  Vec<usize>,
        saved:   Vec<usize>,
    }

    impl ScriptedRunner {
        fn new(maes: &[f64]) -> Self {
            Self { maes: maes.to_vec(), fail_at: None, epochs: vec![], saved: vec![] }
        }
    }

    impl EpochRunner for ScriptedRunner {
        fn run_epoch(&mut self, epoch: usize) -> TwinResult<EpochEval> {
            if self.fail_at == Some(epoch) {
                return Err(TwinError::BatchShapeError { batch: 0, detail: "bad audio".into() });
            }
            self.epochs.push(epoch);
            let mae = self.maes[epoch - 1];
            Ok(EpochEval { train_loss: 1.0, val_mae: mae, val_rmse: mae + 1.0 })
        }

        fn save_checkpoint(&mut self, epoch: usize, _eval: &EpochEval) -> TwinResult<()> {
            self.saved.push(epoch);
            Ok(())
        }
    }

    #[test]
    fn checkpoint_follows_best_epoch() {
        let mut runner = ScriptedRunner::new(&[5.0, 4.2, 4.5, 3.9, 4.0, 4.1]);
        let out = drive_training(&mut runner, 6, 10, None).unwrap();

        assert_eq!(runner.saved, vec![1, 2, 4]);
        assert_eq!(out.best_epoch, Some(4));
        assert_eq!(out.best_val_mae, 3.9);
        assert_eq!(out.best_val_rmse, 4.9);
        assert_eq!(out.stop_reason, StopReason::MaxEpochsReached);
        assert_eq!(out.state, TrainingState::Finalized(StopReason::MaxEpochsReached));
        let improved: Vec<bool> = out.history.iter().map(|m| m.improved).collect();
        assert_eq!(improved, vec![true, true, false, true, false, false]);
    }

    #[test]
    fn stops_after_patience_runs_out() {
        let mut runner = ScriptedRunner::new(&[5.0, 5.1, 5.2, 5.3, 5.4, 5.5]);
        let out = drive_training(&mut runner, 6, 3, None).unwrap();

        assert_eq!(out.final_epoch, 4);
        assert_eq!(runner.epochs, vec![1, 2, 3, 4]);
        assert_eq!(out.stop_reason, StopReason::EarlyStopped);
        assert_eq!(runner.saved, vec![1]);
    }

    #[test]
    fn counter_resets_only_on_strict_improvement() {
        let mut tracker = ValidationTracker::new(5);
        assert!(tracker.observe(1, 4.0));
        assert!(!tracker.observe(2, 4.0));
        assert_eq!(tracker.epochs_since_improvement(), 1);
        assert!(!tracker.observe(3, f64::NAN));
        assert_eq!(tracker.epochs_since_improvement(), 2);
        assert!(tracker.observe(4, 3.99));
        assert_eq!(tracker.epochs_since_improvement(), 0);
    }

    #[test]
    fn batch_error_aborts_the_run() {
        let mut runner = ScriptedRunner::new(&[5.0, 4.0, 3.0]);
        runner.fail_at = Some(2);
        let err = drive_training(&mut runner, 3, 10, None).unwrap_err();

        assert!(matches!(err, TwinError::BatchShapeError { .. }));
        assert_eq!(runner.saved, vec![1]);
    }

    #[test]
    fn metrics_rows_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        let mut runner = ScriptedRunner::new(&[5.0, 4.0]);
        drive_training(&mut runner, 2, 3, Some(&logger)).unwrap();

        let csv = std::fs::read_to_string(logger.csv_path()).unwrap();
        assert_eq!(csv.lines().count(), 3);
    }
}
