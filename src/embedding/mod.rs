//! Text embedding via a local fastembed model
//!
//! Produces fixed-dimension dense vectors, normalized to unit length so that
//! dot product equals cosine similarity. Inference is CPU-bound and runs on
//! the blocking pool; the async wrappers are safe to call from request
//! handlers.

use crate::config::EmbeddingConfig;
use crate::error::OmniError;
use fastembed::{EmbeddingModel, TextEmbedding, TextInitOptions};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Vector dimension of the supported models.
pub const DIMENSION: usize = 384;

/// Shared handle to the embedding model.
///
/// Cloning is cheap; all clones serialize inference through one model
/// instance.
#[derive(Clone)]
pub struct TextEmbedder {
    inner: Arc<Mutex<TextEmbedding>>,
    model_name: String,
}

/// Map a configured model identifier onto a fastembed model.
fn model_for(identifier: &str) -> Result<EmbeddingModel, OmniError> {
    match identifier {
        "multilingual-e5-small" => Ok(EmbeddingModel::MultilingualE5Small),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        other => Err(OmniError::internal(format!(
            "unsupported embedding model: {other}"
        ))),
    }
}

impl TextEmbedder {
    /// Initialize the model, downloading the artifact into the configured
    /// cache directory on first use.
    pub fn init(config: &EmbeddingConfig) -> Result<Self, OmniError> {
        std::fs::create_dir_all(&config.cache_dir)?;
        let options = TextInitOptions::new(model_for(&config.model)?)
            .with_show_download_progress(false)
            .with_cache_dir(config.cache_dir.clone());
        let model = TextEmbedding::try_new(options)
            .map_err(|e| OmniError::internal(format!("embedding model init failed: {e}")))?;
        info!(model = %config.model, "embedding model ready");
        Ok(Self {
            inner: Arc::new(Mutex::new(model)),
            model_name: config.model.clone(),
        })
    }

    /// Model identifier this embedder was initialized with.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Embed a batch of texts on the blocking pool, returning unit-length
    /// vectors.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, OmniError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.clone();
        let vectors = tokio::task::spawn_blocking(move || {
            let mut model = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            model.embed(texts, None)
        })
        .await
        .map_err(|e| OmniError::internal(format!("embedding task panicked: {e}")))?
        .map_err(|e| OmniError::internal(format!("embedding inference failed: {e}")))?;
        Ok(vectors.into_iter().map(|v| normalize(&v)).collect())
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, OmniError> {
        let mut vectors = self.embed_batch(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| OmniError::internal("embedding returned no vector"))
    }
}

/// Scale a vector to unit length. A zero vector is returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (ai, bi) in a.iter().zip(b.iter()) {
        dot += ai * bi;
        norm_a += ai * ai;
        norm_b += bi * bi;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_unit_length() {
        let v = normalize(&[3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_unchanged() {
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = [1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_model_rejected() {
        assert!(model_for("word2vec").is_err());
        assert!(model_for("multilingual-e5-small").is_ok());
    }
}
