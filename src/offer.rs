use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// One job posting as produced by the offer source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    /// Stable unique key issued by the source system.
    pub id: String,
    /// Concatenated title/description, the text that gets embedded.
    pub text: String,
    /// Display fields (title, company, city, url, ...).
    pub metadata: HashMap<String, String>,
    /// Source-side modification timestamp, used for change detection.
    pub updated_at: DateTime<Utc>,
}

/// A stored embedding alongside the denormalized offer fields.
///
/// `metadata` and `text` are copied from the offer so retrieval needs no
/// second lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingEntry {
    pub id: String,
    pub vector: Array1<f32>,
    pub text: String,
    pub metadata: HashMap<String, String>,
    /// `updated_at` the source reported when this entry was written. An
    /// offer is re-embedded only when the source reports a strictly newer
    /// timestamp.
    pub source_updated_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

impl EmbeddingEntry {
    pub fn from_offer(offer: &Offer, vector: Array1<f32>, stored_at: DateTime<Utc>) -> Self {
        EmbeddingEntry {
            id: offer.id.clone(),
            vector,
            text: offer.text.clone(),
            metadata: offer.metadata.clone(),
            source_updated_at: offer.updated_at,
            stored_at,
        }
    }
}

/// One ranked retrieval hit, passed verbatim to the answer generator.
#[derive(Debug, Clone)]
pub struct RetrievedOffer {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub metadata: HashMap<String, String>,
}
