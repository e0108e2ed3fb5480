#![recursion_limit = "256"]

//! Cognitive-score forecasting from multimodal embeddings.
//!
//! Layers, outermost first: `cli` → `application` → `domain` →
//! `data` → `ml` → `infra`.

pub mod application;
pub mod cli;
pub mod data;
pub mod domain;
pub mod infra;
pub mod ml;
