// ============================================================
// Layer 3 — Collaborator Traits
// ============================================================
// The core never extracts embeddings or stores blobs itself.
// Upstream collaborators implement these traits:
//
//   - JsonDirectoryProvider → metadata + embeddings from disk
//   - InMemoryProvider      → fixtures and embedding services
//   - FsCheckpointStore     → checkpoint blobs on a filesystem
//   - MemoryCheckpointStore → checkpoint blobs in memory

use std::path::PathBuf;

use crate::domain::error::TwinResult;
use crate::domain::patient::{PatientMetadata, TimepointEmbeddings};

// ─── MetadataProvider ─────────────────────────────────────────────────────────
pub trait MetadataProvider {
    /// Every patient id this provider knows about, in a stable order.
    fn patient_ids(&self) -> TwinResult<Vec<String>>;

    /// Age, baseline score and the ordered (timestamp, score?) timeline.
    /// Fails with `UnknownPatient` for ids it does not hold.
    fn metadata(&self, patient_id: &str) -> TwinResult<PatientMetadata>;
}

// ─── EmbeddingProvider ────────────────────────────────────────────────────────
pub trait EmbeddingProvider {
    /// One audio embedding and one-or-more handwriting embeddings for the
    /// timepoint. A missing embedding surfaces as `EmbeddingUnavailable`,
    /// never as a zero vector.
    fn embeddings(&self, patient_id: &str, timestamp_months: f32)
        -> TwinResult<TimepointEmbeddings>;
}

// ─── CheckpointStore ──────────────────────────────────────────────────────────
/// Named-blob storage for checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// Replace the blob under `key`. Readers see either the old or the
    /// new content, never a partial write.
    fn write_blob(&self, key: &str, bytes: &[u8]) -> TwinResult<()>;

    fn read_blob(&self, key: &str) -> TwinResult<Option<Vec<u8>>>;

    fn remove_blob(&self, key: &str) -> TwinResult<()>;

    /// Human readable location of the blob (a path for filesystem stores).
    fn location(&self, key: &str) -> PathBuf;
}
