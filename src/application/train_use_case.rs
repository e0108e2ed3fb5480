// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates the full training pipeline in order:
//
//   Step 1: Load patient histories     (Layer 4 - data)
//   Step 2: Split train/validation     (Layer 4 - data)
//   Step 3: Fit feature scaling        (Layer 4 - data)
//   Step 4: Build samples per horizon  (Layer 4 - data)
//   Step 5: Save config                (Layer 6 - infra)
//   Step 6: Run training loop          (Layer 5 - ml)
//   Step 7: Reload best checkpoint and
//           score it per horizon       (Layer 5/6)
//   Step 8: Save summary               (Layer 6 - infra)
//
// Every patient must load cleanly. A patient whose metadata or
// embeddings cannot be assembled fails the run before any
// training starts.

use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::data::{
    dataset::PatientDataset,
    loader::{load_cohort, JsonDirectoryProvider},
    preprocessor::{FeatureLayout, FeatureScaling},
    splitter::split_patients,
};
use crate::domain::patient::HandwritingPolicy;
use crate::domain::traits::{EmbeddingProvider, MetadataProvider};
use crate::infra::{
    checkpoint::{CheckpointManager, ModelSpec, MANIFEST_KEY, SUMMARY_KEY, TRAIN_CONFIG_KEY},
    metrics::{HorizonMetrics, MetricsLogger},
};
use crate::ml::{
    default_device,
    forecast::ForecastHeadConfig,
    fusion::FusionEncoderConfig,
    model::TwinModelConfig,
    trainer::{evaluate_per_horizon, run_training, StopReason},
    InnerBackend,
};

// ─── Training Configuration ──────────────────────────────────────────────────
// All hyperparameters for a training run.
// Saved next to the checkpoint as train_config.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub data_dir:           String,
    pub checkpoint_dir:     String,
    /// Months after the last historical timepoint
    pub horizons:           Vec<u32>,
    /// Shortest history prefix used as a training sample
    pub min_history:        usize,
    pub scalar_names:       Vec<String>,
    pub audio_dim:          usize,
    pub handwriting_dim:    usize,
    pub handwriting_policy: HandwritingPolicy,
    pub train_fraction:     f64,
    pub batch_size:         usize,
    pub epochs:             usize,
    pub patience:           usize,
    pub lr:                 f64,
    pub d_model:            usize,
    pub n_tokens:           usize,
    pub num_heads:          usize,
    pub num_layers:         usize,
    pub d_ff:               usize,
    pub gru_hidden:         usize,
    pub gru_layers:         usize,
    pub dropout:            f64,
    pub seed:               u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_dir:           "data".to_string(),
            checkpoint_dir:     "checkpoints".to_string(),
            horizons:           vec![6, 12],
            min_history:        1,
            scalar_names:       ["age", "baseline_score", "typing_flight_time", "gait_variability"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            audio_dim:          128,
            handwriting_dim:    128,
            handwriting_policy: HandwritingPolicy::Average,
            train_fraction:     0.8,
            batch_size:         4,
            epochs:             20,
            patience:           10,
            lr:                 1e-3,
            d_model:            128,
            n_tokens:           3,
            num_heads:          2,
            num_layers:         2,
            d_ff:               128,
            gru_hidden:         64,
            gru_layers:         2,
            dropout:            0.1,
            seed:               42,
        }
    }
}

impl TrainConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config from '{}'", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Invalid training config in '{}'", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.horizons.is_empty() {
            bail!("at least one horizon is required");
        }
        if self.horizons.windows(2).any(|w| w[0] >= w[1]) || self.horizons[0] == 0 {
            bail!("horizons must be positive and strictly increasing, got {:?}", self.horizons);
        }
        if self.batch_size == 0 || self.epochs == 0 || self.min_history == 0 {
            bail!("batch_size, epochs and min_history must be at least 1");
        }
        if self.patience == 0 {
            bail!("patience must be at least 1 epoch");
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            bail!("train_fraction must lie in (0, 1), got {}", self.train_fraction);
        }
        if !(self.lr > 0.0) {
            bail!("learning rate must be positive, got {}", self.lr);
        }
        Ok(())
    }

    pub fn layout(&self) -> FeatureLayout {
        FeatureLayout::new(self.audio_dim, self.handwriting_dim, self.scalar_names.clone())
    }

    pub fn model_config(&self) -> TwinModelConfig {
        let fusion = FusionEncoderConfig::new(self.layout().fusion_input_dim())
            .with_d_model(self.d_model)
            .with_n_tokens(self.n_tokens)
            .with_num_heads(self.num_heads)
            .with_num_layers(self.num_layers)
            .with_d_ff(self.d_ff)
            .with_dropout(self.dropout);
        let forecast = ForecastHeadConfig::new(self.d_model, self.horizons.len())
            .with_hidden(self.gru_hidden)
            .with_num_layers(self.gru_layers)
            .with_dropout(self.dropout);
        TwinModelConfig::new(fusion, forecast)
    }
}

// ─── Training Summary ────────────────────────────────────────────────────────
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub final_epoch:          usize,
    pub best_epoch:           usize,
    pub best_validation_mae:  f64,
    pub best_validation_rmse: f64,
    pub checkpoint_id:        String,
    pub checkpoint_location:  String,
    pub stop_reason:          StopReason,
    /// Best checkpoint, reloaded and scored on the validation split
    pub per_horizon:          Vec<HorizonMetrics>,
    pub train_patients:       Vec<String>,
    pub validation_patients:  Vec<String>,
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Train from the data directory into the checkpoint directory.
    pub fn execute(&self) -> Result<TrainingSummary> {
        let cfg = &self.config;
        tracing::info!("Loading patients from '{}'", cfg.data_dir);
        let provider = JsonDirectoryProvider::open(&cfg.data_dir)
            .with_context(|| format!("Cannot open data directory '{}'", cfg.data_dir))?;
        let ckpt_manager = CheckpointManager::fs(&cfg.checkpoint_dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", cfg.checkpoint_dir))?;
        let metrics = MetricsLogger::new(&cfg.checkpoint_dir)?;

        self.run(&provider, &provider, &ckpt_manager, Some(&metrics))
    }

    /// Train against arbitrary collaborators.
    pub fn run(
        &self,
        metadata:     &dyn MetadataProvider,
        embeddings:   &dyn EmbeddingProvider,
        ckpt_manager: &CheckpointManager,
        metrics:      Option<&MetricsLogger>,
    ) -> Result<TrainingSummary> {
        let cfg = &self.config;
        cfg.validate()?;

        // ── Step 1: Load all patient histories ───────────────────────────────
        let histories = load_cohort(metadata, embeddings)
            .context("Cannot assemble the training cohort")?;
        if histories.len() < 2 {
            bail!("need at least 2 patients to train, found {}", histories.len());
        }

        // ── Step 2: Patient-level train / validation split ───────────────────
        let (train, val) = split_patients(histories, cfg.train_fraction, cfg.seed);
        if val.is_empty() {
            bail!("validation split is empty; lower train_fraction or add patients");
        }
        let train_patients: Vec<String> = train.iter().map(|h| h.id().to_string()).collect();
        let validation_patients: Vec<String> = val.iter().map(|h| h.id().to_string()).collect();
        tracing::info!("Split: {} train patients, {} validation patients", train.len(), val.len());

        // ── Step 3: Fit scaling on the training split only ───────────────────
        let scaling = FeatureScaling::fit(&train, &cfg.scalar_names);
        let spec = ModelSpec {
            model: cfg.model_config(),
            layout: cfg.layout(),
            scaling,
            horizons: cfg.horizons.clone(),
            policy: cfg.handwriting_policy,
        };

        // ── Step 4: Samples for every usable history prefix ──────────────────
        let train_ds = PatientDataset::from_histories(&train, &cfg.horizons, cfg.min_history);
        let val_ds = PatientDataset::from_histories(&val, &cfg.horizons, cfg.min_history);
        tracing::info!(
            "Built {} training samples, {} validation samples",
            train_ds.sample_count(),
            val_ds.sample_count()
        );

        // ── Step 5: Save config for reproducibility ──────────────────────────
        ckpt_manager.save_json(TRAIN_CONFIG_KEY, cfg)?;

        // ── Step 6: Run training loop (Layer 5) ──────────────────────────────
        let outcome = run_training(
            cfg,
            &spec,
            train_ds.samples().to_vec(),
            val_ds.samples().to_vec(),
            ckpt_manager,
            metrics,
        )?;

        // ── Step 7: Score the committed best checkpoint ──────────────────────
        let best_epoch = outcome
            .best_epoch
            .context("validation error never improved; no checkpoint was written")?;
        let (best_model, manifest) = ckpt_manager
            .load_model::<InnerBackend>(&default_device())
            .context("Cannot reload the best checkpoint")?;
        let per_horizon = evaluate_per_horizon(&best_model, &manifest.spec, val_ds.samples(), cfg.batch_size)?;

        // ── Step 8: Summarise ────────────────────────────────────────────────
        let summary = TrainingSummary {
            final_epoch: outcome.final_epoch,
            best_epoch,
            best_validation_mae: outcome.best_val_mae,
            best_validation_rmse: outcome.best_val_rmse,
            checkpoint_id: manifest.checkpoint_id,
            checkpoint_location: ckpt_manager.location(MANIFEST_KEY).display().to_string(),
            stop_reason: outcome.stop_reason,
            per_horizon,
            train_patients,
            validation_patients,
        };
        ckpt_manager.save_json(SUMMARY_KEY, &summary)?;
        Ok(summary)
    }
}
