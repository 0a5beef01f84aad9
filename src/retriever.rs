use std::cmp::Ordering;

use ndarray::Array1;
use thiserror::Error;

use crate::offer::RetrievedOffer;
use crate::store::EmbeddingStore;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query vector of length {actual} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("k must be a positive integer")]
    InvalidK,
}

/// Metadata equality requirements applied before ranking. Every listed
/// key must be present with exactly the given value.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    required: Vec<(String, String)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        MetadataFilter::default()
    }

    pub fn require(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.required.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    fn matches(&self, metadata: &std::collections::HashMap<String, String>) -> bool {
        self.required
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

/// Ranks all stored entries by cosine similarity to `vector` and returns the
/// top `k`, ties broken by ascending id so repeated queries against an
/// unchanged store are reproducible.
///
/// Read-only: safe to call concurrently against a loaded store.
pub fn query(
    store: &EmbeddingStore,
    vector: &Array1<f32>,
    k: usize,
) -> Result<Vec<RetrievedOffer>, QueryError> {
    query_filtered(store, vector, k, &MetadataFilter::default())
}

/// Like [`query`], restricted to entries whose metadata satisfies `filter`.
pub fn query_filtered(
    store: &EmbeddingStore,
    vector: &Array1<f32>,
    k: usize,
    filter: &MetadataFilter,
) -> Result<Vec<RetrievedOffer>, QueryError> {
    if k == 0 {
        return Err(QueryError::InvalidK);
    }
    if let Some(expected) = store.dimension() {
        if vector.len() != expected {
            return Err(QueryError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
    }

    let mut hits: Vec<RetrievedOffer> = store
        .iter()
        .filter(|entry| filter.matches(&entry.metadata))
        .map(|entry| RetrievedOffer {
            id: entry.id.clone(),
            score: cosine_similarity(&entry.vector, vector),
            text: entry.text.clone(),
            metadata: entry.metadata.clone(),
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(k.min(store.len()));
    Ok(hits)
}

/// Cosine similarity, with 0 (not an error) when either vector has zero norm.
fn cosine_similarity(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    let dot_product = a.dot(b);
    let norm_a = a.dot(a).sqrt();
    let norm_b = b.dot(b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
