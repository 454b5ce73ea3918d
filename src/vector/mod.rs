//! Persistent vector store
//!
//! Named collections of `(id, vector, metadata)` entries, persisted one JSON
//! file per collection and searched in memory by cosine similarity with an
//! optional metadata filter. Collection replacement is atomic: the new
//! contents are written to a temp file and renamed over the old one, then the
//! in-memory collection is swapped, so concurrent readers never observe a
//! partial index.

use crate::embedding::cosine_similarity;
use crate::error::OmniError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// One stored entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f32>,
    /// Full metadata payload carried with the entry; consumers read their
    /// domain objects back out of this rather than re-deriving them.
    pub metadata: Value,
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub metadata: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collection {
    entries: Vec<VectorEntry>,
}

/// Thread-safe store over a directory of collection files.
pub struct VectorStore {
    dir: PathBuf,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl VectorStore {
    /// Open the store, loading every collection file found under `dir`.
    /// Corrupt files are dropped with a warning and rebuilt on next index.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, OmniError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut collections = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Self::load_collection(&path) {
                Ok(collection) => {
                    collections.insert(name.to_string(), Arc::new(collection));
                }
                Err(e) => {
                    warn!(collection = name, error = %e, "corrupt collection file, ignoring");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        info!(collections = collections.len(), dir = %dir.display(), "vector store opened");
        Ok(Self {
            dir,
            collections: RwLock::new(collections),
        })
    }

    fn load_collection(path: &Path) -> Result<Collection, OmniError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn collection_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn read_collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    fn persist_and_swap(&self, name: &str, collection: Collection) -> Result<(), OmniError> {
        let path = self.collection_path(name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(&collection)?)?;
        std::fs::rename(&tmp, &path)?;
        self.collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), Arc::new(collection));
        Ok(())
    }

    /// Replace a collection's entire contents atomically.
    pub fn replace_collection(
        &self,
        name: &str,
        entries: Vec<VectorEntry>,
    ) -> Result<(), OmniError> {
        let count = entries.len();
        self.persist_and_swap(name, Collection { entries })?;
        info!(collection = name, entries = count, "collection replaced");
        Ok(())
    }

    /// Insert or update entries by id, leaving the rest of the collection
    /// untouched.
    pub fn upsert(&self, name: &str, entries: Vec<VectorEntry>) -> Result<(), OmniError> {
        let mut merged: Vec<VectorEntry> = self
            .read_collection(name)
            .map(|c| c.entries.clone())
            .unwrap_or_default();
        for entry in entries {
            match merged.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => *existing = entry,
                None => merged.push(entry),
            }
        }
        self.persist_and_swap(name, Collection { entries: merged })
    }

    /// Remove entries by id. Missing ids are ignored.
    pub fn remove(&self, name: &str, ids: &[String]) -> Result<(), OmniError> {
        let Some(collection) = self.read_collection(name) else {
            return Ok(());
        };
        let remaining: Vec<VectorEntry> = collection
            .entries
            .iter()
            .filter(|e| !ids.contains(&e.id))
            .cloned()
            .collect();
        self.persist_and_swap(name, Collection { entries: remaining })
    }

    /// Nearest-neighbor search by cosine similarity, restricted to entries
    /// whose metadata satisfies `filter`. Results are ordered by descending
    /// score.
    pub fn search(
        &self,
        name: &str,
        query: &[f32],
        k: usize,
        filter: Option<&dyn Fn(&Value) -> bool>,
    ) -> Vec<SearchHit> {
        let Some(collection) = self.read_collection(name) else {
            return Vec::new();
        };
        let mut hits: Vec<SearchHit> = collection
            .entries
            .iter()
            .filter(|e| filter.map_or(true, |f| f(&e.metadata)))
            .map(|e| SearchHit {
                id: e.id.clone(),
                score: cosine_similarity(query, &e.vector),
                metadata: e.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        hits
    }

    /// Number of entries in a collection.
    pub fn count(&self, name: &str) -> usize {
        self.read_collection(name).map_or(0, |c| c.entries.len())
    }
}
