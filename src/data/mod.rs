// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything between the metadata/embedding collaborators and
// the tensors the model consumes.
//
// The pipeline flows in this order:
//
//   patients.json + embeddings/
//       │
//       ▼
//   loader            → joins metadata and embeddings into PatientHistory
//       │
//       ▼
//   splitter          → patient-level train/validation split
//       │
//       ▼
//   dataset           → history prefixes with targets at each horizon
//       │
//       ▼
//   preprocessor      → standardized fusion rows and step features
//       │
//       ▼
//   batcher           → equal-length groups stacked into tensors
//
// Each module is responsible for exactly one step.

/// Metadata and embedding providers
pub mod loader;

/// Feature standardization and per-timepoint encoding
pub mod preprocessor;

/// Training samples built from patient histories
pub mod dataset;

/// Stacks samples into tensor batches grouped by length
pub mod batcher;

/// Seeded patient-level train/validation split
pub mod splitter;

#[cfg(test)]
pub(crate) mod fixtures;
