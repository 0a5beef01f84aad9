use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::offer::EmbeddingEntry;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no entry for id {0}")]
    NotFound(String),
    #[error("vector of length {actual} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// On-disk shape of the store. Private to this module so the encoding can
/// change without touching callers.
#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    dimension: Option<usize>,
    entries: Vec<EmbeddingEntry>,
}

/// In-memory embedding store with an explicit save/load lifecycle.
///
/// Entries are kept in first-insertion order; replacing an entry keeps its
/// original position. All vectors share one dimensionality, established at
/// construction or by the first `put`.
pub struct EmbeddingStore {
    entries: Vec<EmbeddingEntry>,
    index: FxHashMap<String, usize>,
    dimension: Option<usize>,
}

impl EmbeddingStore {
    pub fn new() -> Self {
        EmbeddingStore {
            entries: Vec::new(),
            index: FxHashMap::default(),
            dimension: None,
        }
    }

    /// A store that only accepts vectors of the given length.
    pub fn with_dimension(dimension: usize) -> Self {
        EmbeddingStore {
            entries: Vec::new(),
            index: FxHashMap::default(),
            dimension: Some(dimension),
        }
    }

    /// Inserts or replaces the entry for `entry.id`.
    pub fn put(&mut self, entry: EmbeddingEntry) -> Result<(), StoreError> {
        match self.dimension {
            Some(expected) if entry.vector.len() != expected => {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: entry.vector.len(),
                });
            }
            Some(_) => {}
            None => self.dimension = Some(entry.vector.len()),
        }

        if let Some(&slot) = self.index.get(&entry.id) {
            self.entries[slot] = entry;
        } else {
            self.index.insert(entry.id.clone(), self.entries.len());
            self.entries.push(entry);
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&EmbeddingEntry, StoreError> {
        self.index
            .get(id)
            .map(|&slot| &self.entries[slot])
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// All entries in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &EmbeddingEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Serializes the whole store to `path`.
    ///
    /// The document is written to a temp file in the destination directory
    /// and renamed over the target, so a concurrent reader never observes a
    /// partial file.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = match dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new_in(".")?,
        };
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let doc = StoreFile {
                version: FORMAT_VERSION,
                dimension: self.dimension,
                entries: self.entries.clone(),
            };
            serde_json::to_writer(&mut writer, &doc)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        debug!(entries = self.entries.len(), path = %path.display(), "store saved");
        Ok(())
    }

    /// Loads a store from `path`.
    ///
    /// A missing file is a normal first run and yields an empty store; an
    /// unreadable or inconsistent file is logged and also yields an empty
    /// store, so bootstrapping never fails.
    pub fn load(path: &Path) -> Self {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no store file yet, starting empty");
                return EmbeddingStore::new();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "store file unreadable, starting empty");
                return EmbeddingStore::new();
            }
        };

        let doc: StoreFile = match serde_json::from_reader(BufReader::new(file)) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "store file corrupt, starting empty");
                return EmbeddingStore::new();
            }
        };
        if doc.version != FORMAT_VERSION {
            warn!(
                path = %path.display(),
                version = doc.version,
                "unknown store format version, starting empty"
            );
            return EmbeddingStore::new();
        }

        let mut store = EmbeddingStore {
            entries: Vec::new(),
            index: FxHashMap::default(),
            dimension: doc.dimension,
        };
        for entry in doc.entries {
            if let Err(e) = store.put(entry) {
                warn!(path = %path.display(), error = %e, "store file inconsistent, starting empty");
                return EmbeddingStore::new();
            }
        }
        store
    }
}

impl Default for EmbeddingStore {
    fn default() -> Self {
        EmbeddingStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ndarray::arr1;
    use std::collections::HashMap;

    fn entry(id: &str, vector: &[f32]) -> EmbeddingEntry {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        EmbeddingEntry {
            id: id.to_string(),
            vector: arr1(vector),
            text: format!("offer text for {id}"),
            metadata: HashMap::from([("title".to_string(), id.to_string())]),
            source_updated_at: ts,
            stored_at: ts,
        }
    }

    #[test]
    fn put_then_get() {
        let mut store = EmbeddingStore::new();
        store.put(entry("a", &[1.0, 0.0])).unwrap();
        let got = store.get("a").unwrap();
        assert_eq!(got.vector, arr1(&[1.0, 0.0]));
        assert!(matches!(store.get("b"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn replace_keeps_insertion_position() {
        let mut store = EmbeddingStore::new();
        store.put(entry("a", &[1.0, 0.0])).unwrap();
        store.put(entry("b", &[0.0, 1.0])).unwrap();
        store.put(entry("a", &[0.5, 0.5])).unwrap();

        assert_eq!(store.len(), 2);
        let ids: Vec<_> = store.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.get("a").unwrap().vector, arr1(&[0.5, 0.5]));
    }

    #[test]
    fn dimension_mismatch_leaves_store_unchanged() {
        let mut store = EmbeddingStore::new();
        store.put(entry("a", &[1.0, 0.0])).unwrap();
        let err = store.put(entry("b", &[1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert_eq!(store.len(), 1);
        assert!(store.get("b").is_err());
    }

    #[test]
    fn fixed_dimension_rejects_first_put_too() {
        let mut store = EmbeddingStore::with_dimension(3);
        let err = store.put(entry("a", &[1.0, 0.0])).unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");

        let mut store = EmbeddingStore::new();
        store.put(entry("b", &[0.1, 0.2, 0.3])).unwrap();
        store.put(entry("a", &[0.4, 0.5, 0.6])).unwrap();
        store.save(&path).unwrap();

        let loaded = EmbeddingStore::load(&path);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.dimension(), Some(3));

        // Insertion order and every field survive the round trip.
        let ids: Vec<_> = loaded.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        for original in store.iter() {
            let restored = loaded.get(&original.id).unwrap();
            assert_eq!(restored.text, original.text);
            assert_eq!(restored.metadata, original.metadata);
            assert_eq!(restored.source_updated_at, original.source_updated_at);
            assert_eq!(restored.stored_at, original.stored_at);
            for (x, y) in restored.vector.iter().zip(original.vector.iter()) {
                assert!((x - y).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::load(&dir.path().join("nope.json"));
        assert!(store.is_empty());
        assert_eq!(store.dimension(), None);
    }

    #[test]
    fn load_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = EmbeddingStore::load(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn load_unknown_version_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        std::fs::write(&path, br#"{"version":99,"dimension":null,"entries":[]}"#).unwrap();
        let store = EmbeddingStore::load(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn save_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");

        let mut store = EmbeddingStore::new();
        store.put(entry("a", &[1.0])).unwrap();
        store.save(&path).unwrap();
        store.put(entry("b", &[2.0])).unwrap();
        store.save(&path).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("embeddings.json")]);
        assert_eq!(EmbeddingStore::load(&path).len(), 2);
    }
}
