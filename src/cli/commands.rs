// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the three subcommands: `train`, `predict` and
// `what-if`, and all their configurable flags.
//
// Train flags are optional overrides: they are applied on top
// of the defaults, or on top of a JSON file given via --config.

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};

use crate::application::train_use_case::TrainConfig;
use crate::domain::patient::HandwritingPolicy;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train the fusion encoder and forecast head on a patient cohort
    Train(TrainArgs),

    /// Forecast one patient, or every patient with --all
    Predict(PredictArgs),

    /// Compare a baseline forecast with a lifestyle scenario
    WhatIf(WhatIfArgs),
}

/// How multiple handwriting traces per timepoint are combined
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum HandwritingArg {
    /// Element-wise mean of all traces
    Average,
    /// First trace only
    First,
}

impl From<HandwritingArg> for HandwritingPolicy {
    fn from(a: HandwritingArg) -> Self {
        match a {
            HandwritingArg::Average => HandwritingPolicy::Average,
            HandwritingArg::First => HandwritingPolicy::First,
        }
    }
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// JSON training config; flags below override its values
    #[arg(long)]
    pub config: Option<String>,

    /// Directory with patients.json and embeddings/
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Directory for checkpoints, metrics.csv and summary.json
    #[arg(long)]
    pub checkpoint_dir: Option<String>,

    /// Forecast horizons in months, comma separated (e.g. 6,12)
    #[arg(long, value_delimiter = ',')]
    pub horizons: Option<Vec<u32>>,

    #[arg(long)]
    pub epochs: Option<usize>,

    /// Stop after this many epochs without a validation MAE improvement
    #[arg(long)]
    pub patience: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Adam learning rate
    #[arg(long)]
    pub lr: Option<f64>,

    /// Seeds the patient split, shuffling and weight init
    #[arg(long)]
    pub seed: Option<u64>,

    /// Dropout probability, also used for MC-dropout at inference
    #[arg(long)]
    pub dropout: Option<f64>,

    #[arg(long)]
    pub d_model: Option<usize>,

    #[arg(long)]
    pub train_fraction: Option<f64>,

    #[arg(long, value_enum)]
    pub handwriting: Option<HandwritingArg>,
}

impl TrainArgs {
    /// Build the application-layer config. The application layer never
    /// sees clap types.
    pub fn into_config(self) -> Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::from_json_file(path)?,
            None => TrainConfig::default(),
        };

        if let Some(v) = self.data_dir { cfg.data_dir = v; }
        if let Some(v) = self.checkpoint_dir { cfg.checkpoint_dir = v; }
        if let Some(v) = self.horizons { cfg.horizons = v; }
        if let Some(v) = self.epochs { cfg.epochs = v; }
        if let Some(v) = self.patience { cfg.patience = v; }
        if let Some(v) = self.batch_size { cfg.batch_size = v; }
        if let Some(v) = self.lr { cfg.lr = v; }
        if let Some(v) = self.seed { cfg.seed = v; }
        if let Some(v) = self.dropout { cfg.dropout = v; }
        if let Some(v) = self.d_model { cfg.d_model = v; }
        if let Some(v) = self.train_fraction { cfg.train_fraction = v; }
        if let Some(v) = self.handwriting { cfg.handwriting_policy = v.into(); }

        Ok(cfg)
    }
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    #[arg(long, required_unless_present = "all", conflicts_with = "all")]
    pub patient_id: Option<String>,

    /// Forecast every patient in the data directory
    #[arg(long)]
    pub all: bool,

    /// Horizons in months; must match the trained horizons (default: trained)
    #[arg(long, value_delimiter = ',')]
    pub horizons: Vec<u32>,

    /// Report a Monte-Carlo interval at this confidence level (e.g. 0.95)
    #[arg(long)]
    pub confidence: Option<f32>,

    /// Number of Monte-Carlo dropout passes
    #[arg(long, default_value_t = 10)]
    pub samples: usize,

    /// Only use history up to this many months
    #[arg(long)]
    pub until: Option<f32>,

    /// Write forecasts to this CSV file
    #[arg(long)]
    pub output: Option<String>,

    #[arg(long, value_enum)]
    pub handwriting: Option<HandwritingArg>,

    #[arg(long, default_value = "data")]
    pub data_dir: String,

    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,
}

#[derive(Args, Debug)]
pub struct WhatIfArgs {
    #[arg(long)]
    pub patient_id: String,

    /// Additional hours of sleep per night (negative for less)
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub sleep_delta: f32,

    /// Change in physical activity in percent (e.g. 10 or -20)
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub activity_delta: f32,

    #[arg(long, value_delimiter = ',')]
    pub horizons: Vec<u32>,

    #[arg(long, default_value = "data")]
    pub data_dir: String,

    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::Cli;

    #[test]
    fn train_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "cognitive-twin", "train", "--epochs", "3", "--horizons", "18,24", "--handwriting", "first",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else { panic!("expected train") };

        let cfg = args.into_config().unwrap();
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.horizons, vec![18, 24]);
        assert_eq!(cfg.handwriting_policy, HandwritingPolicy::First);
        assert_eq!(cfg.patience, TrainConfig::default().patience);
    }

    #[test]
    fn predict_needs_patient_or_all() {
        assert!(Cli::try_parse_from(["cognitive-twin", "predict"]).is_err());
        assert!(Cli::try_parse_from(["cognitive-twin", "predict", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["cognitive-twin", "predict", "--all", "--patient-id", "P1"]).is_err());
    }

    #[test]
    fn what_if_accepts_negative_deltas() {
        let cli = Cli::try_parse_from([
            "cognitive-twin", "what-if", "--patient-id", "P1", "--sleep-delta", "-1.5", "--activity-delta", "10",
        ])
        .unwrap();
        let Commands::WhatIf(args) = cli.command else { panic!("expected what-if") };
        assert_eq!(args.sleep_delta, -1.5);
        assert_eq!(args.activity_delta, 10.0);
    }
}
