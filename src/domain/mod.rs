// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust structs, enums and traits describing patients,
// forecasts and collaborators. No burn types and no file I/O.

/// Error taxonomy shared by every layer of the core
pub mod error;

/// Patients, timepoint records and the handwriting trace policy
pub mod patient;

/// Forecast results and scenario pairs
pub mod forecast;

/// Decline-factor arithmetic for what-if scenarios
pub mod scenario;

/// Collaborator abstractions (embedding, metadata, checkpoint storage)
pub mod traits;

pub use error::{TwinError, TwinResult};
