//! Catalog persistence and live snapshot
//!
//! The store owns two artifacts: the enriched catalog file on disk and an
//! in-memory snapshot served to the running pipeline. Rebuilds write to a
//! temp file and rename over the old artifact, then swap the snapshot, so
//! concurrent readers keep serving the previous snapshot until the swap.

use super::{enrich_catalog, RawRouteEntry, RouteDefinition};
use crate::error::OmniError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Owner of the enriched catalog.
pub struct CatalogStore {
    enriched_path: PathBuf,
    snapshot: RwLock<Arc<Vec<RouteDefinition>>>,
}

impl CatalogStore {
    /// Load the enriched catalog from disk if present, otherwise start empty.
    pub fn open(enriched_path: impl Into<PathBuf>) -> Result<Self, OmniError> {
        let enriched_path = enriched_path.into();
        let routes = if enriched_path.exists() {
            let content = std::fs::read_to_string(&enriched_path)?;
            let routes: Vec<RouteDefinition> = serde_json::from_str(&content)?;
            for route in &routes {
                route.validate()?;
            }
            routes
        } else {
            Vec::new()
        };
        info!(routes = routes.len(), path = %enriched_path.display(), "catalog loaded");
        Ok(Self {
            enriched_path,
            snapshot: RwLock::new(Arc::new(routes)),
        })
    }

    /// Current read-only snapshot. Cheap to clone; stays valid across
    /// concurrent rebuilds.
    pub fn snapshot(&self) -> Arc<Vec<RouteDefinition>> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Look up a route by identifier in the current snapshot.
    pub fn route(&self, id: &str) -> Option<RouteDefinition> {
        self.snapshot().iter().find(|r| r.id == id).cloned()
    }

    /// Number of routes currently served.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the catalog has no routes.
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Rebuild from a raw catalog file: enrich every entry, persist the
    /// enriched artifact atomically, and swap the live snapshot.
    pub fn rebuild_from_file(&self, raw_path: &Path) -> Result<Arc<Vec<RouteDefinition>>, OmniError> {
        let content = std::fs::read_to_string(raw_path)?;
        let raw: Vec<RawRouteEntry> = serde_json::from_str(&content)?;
        self.rebuild(raw)
    }

    /// Rebuild from already-parsed raw entries.
    pub fn rebuild(&self, raw: Vec<RawRouteEntry>) -> Result<Arc<Vec<RouteDefinition>>, OmniError> {
        let enriched = enrich_catalog(raw);
        self.ensure_unique_ids(&enriched)?;

        // Persist first: write-to-temp then rename so a crash mid-write
        // leaves the previous artifact intact.
        if let Some(parent) = self.enriched_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.enriched_path.with_extension("json.tmp");
        let serialized = serde_json::to_string_pretty(&enriched)?;
        std::fs::write(&tmp_path, serialized)?;
        std::fs::rename(&tmp_path, &self.enriched_path)?;

        let snapshot = Arc::new(enriched);
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.clone();
        info!(routes = snapshot.len(), "catalog rebuilt and swapped");
        Ok(snapshot)
    }

    fn ensure_unique_ids(&self, routes: &[RouteDefinition]) -> Result<(), OmniError> {
        let mut seen: HashMap<&str, ()> = HashMap::with_capacity(routes.len());
        for route in routes {
            if seen.insert(route.id.as_str(), ()).is_some() {
                return Err(OmniError::catalog(format!(
                    "duplicate route id: {}",
                    route.id
                )));
            }
        }
        Ok(())
    }
}
