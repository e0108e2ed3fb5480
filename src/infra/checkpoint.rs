// ============================================================
// Layer 6 — Checkpoint Store + Manager
// ============================================================
// Persists the best model of a training run and restores it for
// inference.
//
// What gets saved:
//   1. model_<sha16>.bin    — weights (BinBytesRecorder, full precision),
//                             named by the first 16 hex chars of their
//                             SHA-256 so a committed blob is never
//                             rewritten with different bytes
//   2. best_model.json      — manifest: epoch, val MAE/RMSE, model
//                             config, feature layout + scaling,
//                             horizons, handwriting policy, weights
//                             key, byte length, SHA-256
//   3. train_config.json    — the TrainConfig of the run
//   4. summary.json         — the TrainingSummary of the run
//
// Commit order: weights blob first, manifest second. The manifest
// is the commit point; until it is replaced, readers keep loading
// the previous weights. Superseded weights are pruned afterwards.
//
// Every blob write goes through CheckpointStore::write_blob, which
// is atomic (FsCheckpointStore: write <key>.tmp, fsync, rename).
//
// Loading checks manifest → blob exists → length → hash → config
// dims → record layer counts and shapes → parameter count, and
// reports any failure as CheckpointCorrupt before a prediction is
// attempted.

use std::{
    collections::HashMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use burn::{
    prelude::*,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::data::preprocessor::{FeatureLayout, FeatureScaling, Preprocessor};
use crate::domain::error::{TwinError, TwinResult};
use crate::domain::patient::HandwritingPolicy;
use crate::domain::traits::CheckpointStore;
use crate::ml::model::{TwinModel, TwinModelConfig, TwinModelRecord};

pub const MANIFEST_KEY: &str = "best_model.json";
pub const TRAIN_CONFIG_KEY: &str = "train_config.json";
pub const SUMMARY_KEY: &str = "summary.json";

// ─── Filesystem store ─────────────────────────────────────────────────────────
pub struct FsCheckpointStore {
    dir: PathBuf,
}

impl FsCheckpointStore {
    /// Creates the directory if it doesn't already exist.
    pub fn new(dir: impl AsRef<Path>) -> TwinResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn write_blob(&self, key: &str, bytes: &[u8]) -> TwinResult<()> {
        let path = self.dir.join(key);
        let tmp = self.dir.join(format!("{key}.tmp"));

        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        drop(f);

        fs::rename(&tmp, &path)?;
        tracing::debug!("Wrote {} bytes to '{}'", bytes.len(), path.display());
        Ok(())
    }

    fn read_blob(&self, key: &str) -> TwinResult<Option<Vec<u8>>> {
        match fs::read(self.dir.join(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_blob(&self, key: &str) -> TwinResult<()> {
        match fs::remove_file(self.dir.join(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn location(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

// ─── In-memory store ──────────────────────────────────────────────────────────
/// Clones share the same blobs.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> TwinResult<Vec<String>> {
        let mut keys: Vec<String> = self.lock()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn lock(&self) -> TwinResult<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|_| TwinError::Io(io::Error::new(io::ErrorKind::Other, "checkpoint store lock poisoned")))
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn write_blob(&self, key: &str, bytes: &[u8]) -> TwinResult<()> {
        self.lock()?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read_blob(&self, key: &str) -> TwinResult<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn remove_blob(&self, key: &str) -> TwinResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn location(&self, key: &str) -> PathBuf {
        PathBuf::from(format!("memory://{key}"))
    }
}

// ─── Manifest ─────────────────────────────────────────────────────────────────
/// Everything besides weights needed to rebuild a model and its inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model:    TwinModelConfig,
    pub layout:   FeatureLayout,
    pub scaling:  FeatureScaling,
    pub horizons: Vec<u32>,
    pub policy:   HandwritingPolicy,
}

impl ModelSpec {
    pub fn preprocessor(&self) -> Preprocessor {
        Preprocessor::new(self.layout.clone(), self.scaling.clone(), self.policy)
    }

    /// Config dims must agree with the feature layout and horizon list.
    pub fn check_consistency(&self) -> TwinResult<()> {
        self.model.validate()?;
        if self.model.fusion.input_dim != self.layout.fusion_input_dim() {
            return Err(TwinError::shape(
                "fusion input width",
                self.layout.fusion_input_dim(),
                self.model.fusion.input_dim,
            ));
        }
        if self.model.n_horizons() != self.horizons.len() {
            return Err(TwinError::shape("horizon count", self.horizons.len(), self.model.n_horizons()));
        }
        for name in &self.layout.scalar_names {
            if !self.scaling.scalars.contains_key(name) {
                return Err(TwinError::InvalidConfig(format!("no scaling statistics for scalar '{name}'")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// `epoch<n>-<first 12 hex chars of the weights hash>`
    pub checkpoint_id:  String,
    pub epoch:          usize,
    pub val_mae:        f64,
    pub val_rmse:       f64,
    pub spec:           ModelSpec,
    pub weights_key:    String,
    pub weights_len:    usize,
    pub weights_sha256: String,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest: [u8; 32] = hasher.finalize().into();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn corrupt(detail: impl Into<String>) -> TwinError {
    TwinError::CheckpointCorrupt(detail.into())
}

// ─── Manager ──────────────────────────────────────────────────────────────────
/// Writes and reads checkpoints through a CheckpointStore.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Filesystem-backed manager rooted at `dir`.
    pub fn fs(dir: impl AsRef<Path>) -> TwinResult<Self> {
        Ok(Self::new(Arc::new(FsCheckpointStore::new(dir)?)))
    }

    pub fn location(&self, key: &str) -> PathBuf {
        self.store.location(key)
    }

    /// Persist `model` as the new best checkpoint.
    pub fn save_best<B: Backend>(
        &self,
        model:    &TwinModel<B>,
        spec:     &ModelSpec,
        epoch:    usize,
        val_mae:  f64,
        val_rmse: f64,
    ) -> TwinResult<CheckpointManifest> {
        let bytes = BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(model.clone().into_record(), ())
            .map_err(|e| TwinError::Tensor(format!("cannot record model: {e:?}")))?;

        let sha = sha256_hex(&bytes);
        let manifest = CheckpointManifest {
            checkpoint_id:  format!("epoch{epoch}-{}", &sha[..12]),
            epoch,
            val_mae,
            val_rmse,
            spec:           spec.clone(),
            weights_key:    format!("model_{}.bin", &sha[..16]),
            weights_len:    bytes.len(),
            weights_sha256: sha,
        };

        // an unreadable previous manifest only means nothing to prune
        let previous = self.read_manifest().ok().flatten();

        self.store.write_blob(&manifest.weights_key, &bytes)?;
        self.save_json(MANIFEST_KEY, &manifest)?;

        if let Some(prev) = previous {
            if prev.weights_key != manifest.weights_key {
                self.store.remove_blob(&prev.weights_key)?;
            }
        }

        tracing::info!(
            "Saved checkpoint {} (epoch {}, val_mae={:.4}) to '{}'",
            manifest.checkpoint_id,
            epoch,
            val_mae,
            self.store.location(MANIFEST_KEY).display()
        );
        Ok(manifest)
    }

    fn read_manifest(&self) -> TwinResult<Option<CheckpointManifest>> {
        match self.store.read_blob(MANIFEST_KEY)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| corrupt(format!("unreadable manifest: {e}"))),
        }
    }

    pub fn load_manifest(&self) -> TwinResult<CheckpointManifest> {
        self.read_manifest()?.ok_or_else(|| {
            corrupt(format!(
                "no checkpoint manifest at '{}'; has a model been trained?",
                self.store.location(MANIFEST_KEY).display()
            ))
        })
    }

    /// Load and verify the best checkpoint.
    pub fn load_model<B: Backend>(&self, device: &B::Device) -> TwinResult<(TwinModel<B>, CheckpointManifest)> {
        let manifest = self.load_manifest()?;
        manifest
            .spec
            .check_consistency()
            .map_err(|e| corrupt(format!("{}: {e}", manifest.checkpoint_id)))?;

        let bytes = self
            .store
            .read_blob(&manifest.weights_key)?
            .ok_or_else(|| corrupt(format!("weights '{}' are missing", manifest.weights_key)))?;
        if bytes.len() != manifest.weights_len {
            return Err(corrupt(format!(
                "weights '{}' hold {} bytes, manifest records {}",
                manifest.weights_key,
                bytes.len(),
                manifest.weights_len
            )));
        }
        if sha256_hex(&bytes) != manifest.weights_sha256 {
            return Err(corrupt(format!("weights '{}' fail the SHA-256 check", manifest.weights_key)));
        }

        let record: TwinModelRecord<B> = BinBytesRecorder::<FullPrecisionSettings>::default()
            .load(bytes, device)
            .map_err(|e| corrupt(format!("cannot decode weights: {e:?}")))?;

        let model: TwinModel<B> = manifest.spec.model.init(device);
        model
            .check_record(&record)
            .map_err(|e| corrupt(format!("{}: {e}", manifest.checkpoint_id)))?;
        let expected = model.num_params();
        let model = model.load_record(record);
        if model.num_params() != expected {
            return Err(corrupt(format!(
                "weights hold {} parameters, model definition has {}",
                model.num_params(),
                expected
            )));
        }

        tracing::info!("Loaded checkpoint {} (epoch {})", manifest.checkpoint_id, manifest.epoch);
        Ok((model, manifest))
    }

    /// Write a JSON document atomically under `key`.
    pub fn save_json<T: Serialize>(&self, key: &str, value: &T) -> TwinResult<()> {
        let json = serde_json::to_vec_pretty(value)?;
        self.store.write_blob(key, &json)
    }
}
