// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Cross-cutting concerns that don't belong in any specific
// business layer:
//
//   checkpoint.rs — Checkpoint stores and manager
//                   Atomic named-blob stores (filesystem and
//                   in-memory), the best-model manifest, and
//                   verified loading. Also persists the run's
//                   TrainConfig and TrainingSummary as JSON.
//
//   metrics.rs    — Training metrics
//                   MAE/RMSE accumulation and the per-epoch
//                   metrics.csv log.

/// Model checkpoint saving and loading
pub mod checkpoint;

/// Training metrics CSV logger
pub mod metrics;
