// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer orchestrates all the other layers to accomplish
// a specific goal (training a model or forecasting patients).
//
// Rules for this layer:
//   - No ML math or model code here
//   - No printing here (that's Layer 1)
//   - Only workflow coordination
//
// Errors from the core arrive as TwinError and leave as
// anyhow::Error with added context, except where a caller
// needs to match on the typed variant.

/// The training workflow
pub mod train_use_case;

/// Point, interval and what-if forecasting
pub mod forecast_use_case;
