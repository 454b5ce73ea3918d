//! Semantic route retrieval
//!
//! Embeds the user query (through the embedding cache) and returns the top-K
//! route definitions from the vector store. Each vector entry's metadata
//! carries the full enriched definition, so consumers never re-parse path
//! templates to recover platform or entity-type.

use crate::cache::CacheRegistry;
use crate::catalog::RouteDefinition;
use crate::embedding::TextEmbedder;
use crate::error::OmniError;
use crate::vector::{VectorEntry, VectorStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Collection name holding the route index.
pub const ROUTE_COLLECTION: &str = "routes";

/// Retrievals whose best score falls below this are treated as "nothing
/// applicable" and surface as a clarification request upstream.
pub const DEFAULT_MIN_SCORE: f32 = 0.35;

/// A retrieved route with its similarity score.
#[derive(Debug, Clone)]
pub struct RetrievedRoute {
    pub route: RouteDefinition,
    pub score: f32,
}

/// Retrieval seam used by the orchestrators.
#[async_trait]
pub trait RouteRetriever: Send + Sync {
    /// Top-`k` routes for a query, ordered by descending similarity; empty
    /// when nothing applicable scores above the threshold.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedRoute>, OmniError>;
}

/// Retriever over the route collection.
pub struct SemanticRetriever {
    embedder: TextEmbedder,
    store: Arc<VectorStore>,
    caches: CacheRegistry,
    min_score: f32,
}

impl SemanticRetriever {
    pub fn new(embedder: TextEmbedder, store: Arc<VectorStore>, caches: CacheRegistry) -> Self {
        Self {
            embedder,
            store,
            caches,
            min_score: DEFAULT_MIN_SCORE,
        }
    }

    /// Override the minimum acceptable top score.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    /// Embed a query, consulting the embedding cache first.
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, OmniError> {
        if let Some(cached) = self.caches.embeddings.get(query) {
            return Ok(cached);
        }
        let vector = self.embedder.embed_one(query).await?;
        self.caches.set_embedding(query, vector.clone());
        Ok(vector)
    }

    /// Retrieve the top-`k` route definitions for a query, ordered by
    /// descending similarity. Returns an empty list when the best hit falls
    /// below the score threshold.
    async fn retrieve_inner(&self, query: &str, k: usize) -> Result<Vec<RetrievedRoute>, OmniError> {
        let vector = self.embed_query(query).await?;
        let hits = self.store.search(ROUTE_COLLECTION, &vector, k, None);

        match hits.first() {
            None => return Ok(Vec::new()),
            Some(best) if best.score < self.min_score => {
                debug!(query, top_score = best.score, "top retrieval score below threshold");
                return Ok(Vec::new());
            }
            _ => {}
        }

        let mut retrieved = Vec::with_capacity(hits.len());
        for hit in hits {
            let route: RouteDefinition = serde_json::from_value(hit.metadata).map_err(|e| {
                OmniError::vector(format!("route {} metadata is not a definition: {e}", hit.id))
            })?;
            retrieved.push(RetrievedRoute {
                route,
                score: hit.score,
            });
        }
        Ok(retrieved)
    }

    /// Rebuild the route collection from a catalog snapshot. The collection
    /// is replaced atomically; readers keep the old index until the swap.
    pub async fn index_routes(&self, routes: &[RouteDefinition]) -> Result<(), OmniError> {
        let texts: Vec<String> = routes.iter().map(route_document).collect();
        let vectors = self.embedder.embed_batch(texts).await?;
        let entries = routes
            .iter()
            .zip(vectors)
            .map(|(route, vector)| {
                Ok(VectorEntry {
                    id: route.id.clone(),
                    vector,
                    metadata: serde_json::to_value(route)?,
                })
            })
            .collect::<Result<Vec<_>, OmniError>>()?;
        self.store.replace_collection(ROUTE_COLLECTION, entries)?;
        info!(routes = routes.len(), "route index rebuilt");
        Ok(())
    }
}

#[async_trait]
impl RouteRetriever for SemanticRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedRoute>, OmniError> {
        self.retrieve_inner(query, k).await
    }
}

/// The retrieval document for a route: name, description, and tags, which is
/// what user queries actually describe.
fn route_document(route: &RouteDefinition) -> String {
    format!(
        "{} | {} | platform:{} entity:{}",
        route.name, route.description, route.platform, route.entity_type
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_document_mentions_tags() {
        let route = crate::catalog::test_route();
        let doc = route_document(&route);
        assert!(doc.contains("bilibili"));
        assert!(doc.contains("user"));
        assert!(doc.contains(&route.description));
    }
}
