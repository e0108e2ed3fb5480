// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction, parsed with clap.
// All business logic is delegated to Layer 2 (application).
//
// Three commands are supported:
//   1. `train`   — trains a model on a patient cohort
//   2. `predict` — point or interval forecasts from a checkpoint
//   3. `what-if` — baseline vs. lifestyle-adjusted forecast

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, PredictArgs, TrainArgs, WhatIfArgs};

use crate::application::forecast_use_case::{write_csv, ForecastUseCase};
use crate::application::train_use_case::TrainUseCase;
use crate::domain::forecast::ForecastResult;
use crate::ml::uncertainty::UncertaintyConfig;

#[derive(Parser, Debug)]
#[command(
    name = "cognitive-twin",
    version,
    about = "Forecast cognitive scores from voice, handwriting and passive biomarkers."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Match on the subcommand and dispatch to the correct use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)  => run_train(args),
            Commands::Predict(args) => run_predict(args),
            Commands::WhatIf(args) => run_what_if(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    let cfg = args.into_config()?;
    tracing::info!("Starting training on patients in: {}", cfg.data_dir);

    let summary = TrainUseCase::new(cfg).execute()?;

    println!("Training complete ({:?} at epoch {}).", summary.stop_reason, summary.final_epoch);
    println!(
        "Best epoch {}: val MAE {:.3}, val RMSE {:.3}",
        summary.best_epoch, summary.best_validation_mae, summary.best_validation_rmse
    );
    for m in &summary.per_horizon {
        println!(
            "  +{:>2} months: MAE {:.3} | RMSE {:.3} | R² {:.3}",
            m.horizon_months, m.mae, m.rmse, m.r2
        );
    }
    println!("Checkpoint {} saved to {}", summary.checkpoint_id, summary.checkpoint_location);
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let mut use_case = ForecastUseCase::open(&args.checkpoint_dir, &args.data_dir)?
        .with_uncertainty(UncertaintyConfig { samples: args.samples, ..Default::default() });
    if let Some(policy) = args.handwriting {
        use_case = use_case.with_policy(policy.into());
    }

    let results = match &args.patient_id {
        Some(id) => vec![use_case.predict_at(id, &args.horizons, args.confidence, args.until)?],
        None => use_case.predict_all(&args.horizons, args.confidence, args.until)?,
    };

    for r in &results {
        print_forecast(r);
    }
    if let Some(path) = &args.output {
        write_csv(&results, path)?;
        println!("\nSaved {} forecasts to {}", results.len(), path);
    }
    Ok(())
}

fn run_what_if(args: WhatIfArgs) -> Result<()> {
    let use_case = ForecastUseCase::open(&args.checkpoint_dir, &args.data_dir)?;
    let s = use_case.predict_with_scenario(
        &args.patient_id,
        &args.horizons,
        args.sleep_delta,
        args.activity_delta,
    )?;

    println!(
        "What-if for {}: sleep {:+.1} h, activity {:+.0}% → decline factor {:.3}",
        args.patient_id, s.deltas.sleep_hours, s.deltas.activity_percent, s.decline_factor
    );
    if let Some(last) = s.baseline.last_observed_score {
        println!("Last observed score: {:.2} at month {}", last, s.baseline.last_timestamp_months);
    }
    for ((b, a), (h, delta)) in s.baseline.horizons.iter().zip(&s.adjusted.horizons).zip(s.deltas_by_horizon()) {
        println!(
            "  +{:>2} months: baseline {:>6.2} | scenario {:>6.2} | change {:+.2}",
            h, b.point_estimate, a.point_estimate, delta
        );
    }
    Ok(())
}

fn print_forecast(r: &ForecastResult) {
    println!("\nPatient {} (history to month {}):", r.patient_id, r.last_timestamp_months);
    for h in &r.horizons {
        let mut line = format!("  +{:>2} months: {:>6.2}", h.horizon_months, h.point_estimate);
        if let (Some(lo), Some(hi)) = (h.lower, h.upper) {
            let pct = r.confidence.unwrap_or_default() * 100.0;
            line.push_str(&format!("  [{:.2}, {:.2}] {:.0}% CI", lo, hi, pct));
        }
        if let Some(obs) = h.observed {
            line.push_str(&format!("  observed {:.2}", obs));
        }
        println!("{line}");
    }
}
