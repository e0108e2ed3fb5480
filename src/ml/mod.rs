// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// Every network definition and every training/inference loop
// lives here. Other layers hand in host-side buffers
// (SequenceFeatures) and get host-side numbers back.
//
// What's in this layer:
//
//   fusion.rs      — Fusion Encoder
//                    [audio ‖ handwriting ‖ scalars] → linear
//                    projection into modality tokens → self-
//                    attention blocks → joint embedding (D)
//
//   forecast.rs    — Forecast Head
//                    [joint ‖ time_z ‖ score_z ‖ observed] per
//                    step → stacked GRU → final hidden state →
//                    feed-forward head → H horizons
//
//   model.rs       — Fusion + Forecast wired together, with
//                    the MSE training loss
//
//   uncertainty.rs — Monte-Carlo dropout intervals
//
//   trainer.rs     — Epoch loop, validation, early stopping
//
//   inferencer.rs  — Loads a checkpoint and forecasts
//
// Backends:
//   TrainBackend = Autodiff<NdArray>  → gradients, dropout active
//   InnerBackend = NdArray            → model.valid(), dropout off

use burn::{backend::ndarray::NdArrayDevice, prelude::*};

use crate::domain::error::{TwinError, TwinResult};

/// Fusion Encoder architecture
pub mod fusion;

/// Recurrent multi-horizon forecast head
pub mod forecast;

/// Fusion Encoder + Forecast Head
pub mod model;

/// Monte-Carlo dropout uncertainty estimator
pub mod uncertainty;

/// Training loop with validation, checkpointing and early stopping
pub mod trainer;

/// Inference engine — loads a checkpoint and produces forecasts
pub mod inferencer;

pub type TrainBackend = burn::backend::Autodiff<burn::backend::NdArray>;
pub type InnerBackend = burn::backend::NdArray;

pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// Copy a float tensor back to the host.
pub(crate) fn tensor_to_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> TwinResult<Vec<f32>> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TwinError::Tensor(format!("{e:?}")))
}
