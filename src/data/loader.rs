// ============================================================
// Layer 4 — Patient Data Loaders
// ============================================================
// Collaborator implementations of MetadataProvider and
// EmbeddingProvider, plus the helpers that join the two into
// validated PatientHistory values.
//
// Directory layout read by JsonDirectoryProvider:
//
//   <data_dir>/
//     patients.json               ← metadata + timelines
//     embeddings/
//       P001_T00.json             ← {"audio": [..], "handwriting": [[..], ..]}
//       P001_T06.json
//       ...
//
// The embedding file name carries the timestamp rounded to whole
// months, zero padded to two digits. Two timepoints of one patient
// that round to the same month would share a file, so such
// timelines are rejected when the directory is opened.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::domain::error::{TwinError, TwinResult};
use crate::domain::patient::{
    Patient, PatientHistory, PatientMetadata, TimelineEntry, TimepointEmbeddings, TimepointRecord,
};
use crate::domain::traits::{EmbeddingProvider, MetadataProvider};

#[derive(Debug, Clone, Deserialize)]
struct PatientFileEntry {
    #[serde(alias = "id")]
    patient_id: String,
    age: f32,
    baseline_score: f32,
    #[serde(default)]
    decline_rate: Option<f32>,
    #[serde(default)]
    timeline: Vec<TimelineEntry>,
}

/// Reads patients.json once and embeddings lazily from disk.
pub struct JsonDirectoryProvider {
    dir: PathBuf,
    patients: BTreeMap<String, PatientMetadata>,
}

impl JsonDirectoryProvider {
    pub fn open(dir: impl AsRef<Path>) -> TwinResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join("patients.json");
        let json = fs::read_to_string(&path)?;
        let entries: Vec<PatientFileEntry> = serde_json::from_str(&json)?;

        let mut patients = BTreeMap::new();
        for e in entries {
            check_embedding_months(&e.patient_id, &e.timeline)?;
            let patient = Patient {
                id: e.patient_id.clone(),
                age: e.age,
                baseline_score: e.baseline_score,
                decline_rate: e.decline_rate,
            };
            patients.insert(e.patient_id, PatientMetadata { patient, timeline: e.timeline });
        }

        tracing::info!("Loaded metadata for {} patients from '{}'", patients.len(), path.display());
        Ok(Self { dir, patients })
    }

    fn embedding_path(&self, patient_id: &str, timestamp_months: f32) -> PathBuf {
        self.dir
            .join("embeddings")
            .join(format!("{patient_id}_T{:02}.json", file_month(timestamp_months)))
    }
}

fn file_month(timestamp_months: f32) -> u32 {
    timestamp_months.round() as u32
}

fn check_embedding_months(patient_id: &str, timeline: &[TimelineEntry]) -> TwinResult<()> {
    let mut seen: HashMap<u32, f32> = HashMap::new();
    for entry in timeline {
        let month = file_month(entry.timestamp_months);
        if let Some(other) = seen.insert(month, entry.timestamp_months) {
            return Err(TwinError::InvalidTimeline {
                patient_id: patient_id.to_string(),
                reason: format!(
                    "timepoints {other} and {} both map to embedding file T{month:02}",
                    entry.timestamp_months
                ),
            });
        }
    }
    Ok(())
}

impl MetadataProvider for JsonDirectoryProvider {
    fn patient_ids(&self) -> TwinResult<Vec<String>> {
        Ok(self.patients.keys().cloned().collect())
    }

    fn metadata(&self, patient_id: &str) -> TwinResult<PatientMetadata> {
        self.patients
            .get(patient_id)
            .cloned()
            .ok_or_else(|| TwinError::UnknownPatient(patient_id.to_string()))
    }
}

impl EmbeddingProvider for JsonDirectoryProvider {
    fn embeddings(&self, patient_id: &str, timestamp_months: f32) -> TwinResult<TimepointEmbeddings> {
        let path = self.embedding_path(patient_id, timestamp_months);
        let unavailable = |reason: String| TwinError::EmbeddingUnavailable {
            patient_id: patient_id.to_string(),
            timestamp_months,
            reason,
        };

        let json = fs::read_to_string(&path)
            .map_err(|e| unavailable(format!("{}: {e}", path.display())))?;
        let emb: TimepointEmbeddings = serde_json::from_str(&json)
            .map_err(|e| unavailable(format!("{}: {e}", path.display())))?;

        if emb.handwriting.is_empty() {
            return Err(unavailable("no handwriting traces".into()));
        }
        Ok(emb)
    }
}

// ─── In-memory provider ───────────────────────────────────────────────────────
/// Holds metadata and embeddings in memory. Used by services that
/// compute embeddings on the fly, and by tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    patients: BTreeMap<String, PatientMetadata>,
    embeddings: HashMap<(String, i64), TimepointEmbeddings>,
}

fn timestamp_key(t: f32) -> i64 {
    (t * 1000.0).round() as i64
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_histories(histories: &[PatientHistory]) -> Self {
        let mut provider = Self::new();
        for h in histories {
            provider.insert(h.patient().clone(), h.records().to_vec());
        }
        provider
    }

    pub fn insert(&mut self, patient: Patient, records: Vec<TimepointRecord>) {
        let mut timeline = Vec::with_capacity(records.len());
        for r in records {
            self.embeddings.insert(
                (patient.id.clone(), timestamp_key(r.timestamp_months)),
                TimepointEmbeddings {
                    audio: r.audio,
                    handwriting: r.handwriting,
                },
            );
            timeline.push(TimelineEntry {
                timestamp_months: r.timestamp_months,
                observed_score: r.observed_score,
                scalars: r.scalars,
            });
        }
        self.patients
            .insert(patient.id.clone(), PatientMetadata { patient, timeline });
    }

    /// Drop the embedding of one timepoint.
    pub fn remove_embedding(&mut self, patient_id: &str, timestamp_months: f32) {
        self.embeddings
            .remove(&(patient_id.to_string(), timestamp_key(timestamp_months)));
    }
}

impl MetadataProvider for InMemoryProvider {
    fn patient_ids(&self) -> TwinResult<Vec<String>> {
        Ok(self.patients.keys().cloned().collect())
    }

    fn metadata(&self, patient_id: &str) -> TwinResult<PatientMetadata> {
        self.patients
            .get(patient_id)
            .cloned()
            .ok_or_else(|| TwinError::UnknownPatient(patient_id.to_string()))
    }
}

impl EmbeddingProvider for InMemoryProvider {
    fn embeddings(&self, patient_id: &str, timestamp_months: f32) -> TwinResult<TimepointEmbeddings> {
        self.embeddings
            .get(&(patient_id.to_string(), timestamp_key(timestamp_months)))
            .cloned()
            .ok_or_else(|| TwinError::EmbeddingUnavailable {
                patient_id: patient_id.to_string(),
                timestamp_months,
                reason: "not present in provider".into(),
            })
    }
}

// ─── Joining metadata and embeddings ──────────────────────────────────────────
/// Load one patient's ordered records. A patient without records is
/// reported as unknown.
pub fn load_history(
    metadata: &dyn MetadataProvider,
    embeddings: &dyn EmbeddingProvider,
    patient_id: &str,
) -> TwinResult<PatientHistory> {
    let meta = metadata.metadata(patient_id)?;
    if meta.timeline.is_empty() {
        return Err(TwinError::UnknownPatient(patient_id.to_string()));
    }

    let mut records = Vec::with_capacity(meta.timeline.len());
    for entry in meta.timeline {
        let emb = embeddings.embeddings(patient_id, entry.timestamp_months)?;
        records.push(TimepointRecord::new(entry, emb));
    }
    PatientHistory::new(meta.patient, records)
}

/// Load every patient for training. The first patient whose data
/// cannot be assembled fails the whole load; shape problems are left
/// for the batcher.
pub fn load_cohort(
    metadata: &dyn MetadataProvider,
    embeddings: &dyn EmbeddingProvider,
) -> TwinResult<Vec<PatientHistory>> {
    let ids = metadata.patient_ids()?;
    let mut cohort = Vec::with_capacity(ids.len());
    for id in &ids {
        cohort.push(load_history(metadata, embeddings, id)?);
    }
    tracing::info!("Loaded {} patient histories", cohort.len());
    Ok(cohort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures;

    #[test]
    fn in_memory_round_trip() {
        let cohort = fixtures::cohort(2, 3, 3, 5);
        let provider = InMemoryProvider::from_histories(&cohort);
        let h = load_history(&provider, &provider, "P001").unwrap();
        assert_eq!(h.records(), cohort[0].records());
    }

    #[test]
    fn unknown_patient_is_reported() {
        let provider = InMemoryProvider::new();
        let err = load_history(&provider, &provider, "nobody").unwrap_err();
        assert!(matches!(err, TwinError::UnknownPatient(_)));
    }

    #[test]
    fn missing_embedding_is_typed_not_zeroed() {
        let cohort = fixtures::cohort(1, 3, 3, 5);
        let mut provider = InMemoryProvider::from_histories(&cohort);
        provider.remove_embedding("P001", 12.0);
        let err = load_history(&provider, &provider, "P001").unwrap_err();
        assert!(matches!(err, TwinError::EmbeddingUnavailable { .. }));

        let err = load_cohort(&provider, &provider).unwrap_err();
        assert!(matches!(err, TwinError::EmbeddingUnavailable { ref patient_id, .. } if patient_id == "P001"));
    }

    #[test]
    fn cohort_load_fails_on_any_bad_patient() {
        let cohort = fixtures::cohort(3, 3, 3, 5);
        let mut provider = InMemoryProvider::from_histories(&cohort);
        assert_eq!(load_cohort(&provider, &provider).unwrap().len(), 3);

        provider.remove_embedding("P003", 0.0);
        assert!(load_cohort(&provider, &provider).is_err());
    }

    #[test]
    fn timepoints_sharing_an_embedding_file_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("patients.json"),
            r#"[{"patient_id": "P001", "age": 72, "baseline_score": 94.5,
                 "timeline": [{"timestamp_months": 0},
                              {"timestamp_months": 5.8},
                              {"timestamp_months": 6.2}]}]"#,
        )
        .unwrap();

        let err = JsonDirectoryProvider::open(dir.path()).err().unwrap();
        match err {
            TwinError::InvalidTimeline { patient_id, reason } => {
                assert_eq!(patient_id, "P001");
                assert!(reason.contains("T06"));
            }
            other => panic!("expected InvalidTimeline, got {other:?}"),
        }
    }

    #[test]
    fn json_directory_provider_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("patients.json"),
            r#"[{"patient_id": "P001", "age": 72, "baseline_score": 94.5,
                 "timeline": [{"timestamp_months": 0, "cognitive_score": 94.0,
                               "scalars": {"gait_variability": 0.06}}]}]"#,
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("embeddings")).unwrap();
        fs::write(
            dir.path().join("embeddings/P001_T00.json"),
            r#"{"audio": [0.1, 0.2], "handwriting": [[1.0, 2.0], [3.0, 4.0]]}"#,
        )
        .unwrap();

        let provider = JsonDirectoryProvider::open(dir.path()).unwrap();
        assert_eq!(provider.patient_ids().unwrap(), vec!["P001".to_string()]);

        let h = load_history(&provider, &provider, "P001").unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h.records()[0].observed_score, Some(94.0));
        assert_eq!(h.records()[0].handwriting.len(), 2);
        assert_eq!(h.records()[0].scalars["gait_variability"], 0.06);

        let err = provider.embeddings("P001", 6.0).unwrap_err();
        assert!(matches!(err, TwinError::EmbeddingUnavailable { .. }));
    }
}
