use std::hash::Hasher;
use std::time::Duration;

use lazy_static::lazy_static;
use ndarray::Array1;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Failures of the embedding capability. All kinds are retryable: the
/// ingestion cycle skips the affected offer and picks it up next run.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding endpoint rate limited: {0}")]
    RateLimited(String),
    #[error("embedding endpoint unavailable: {0}")]
    Unavailable(String),
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
}

/// Turns text into a fixed-length vector.
///
/// The dimensionality is a property of the codec and must match the store it
/// feeds.
pub trait EmbeddingCodec {
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Array1<f32>, EmbedError>;
}

lazy_static! {
    static ref NON_WORD: Regex = Regex::new(r"[^\w\s]").unwrap();
    static ref STOP_WORDS: FxHashSet<&'static str> = {
        let words = vec![
            // English
            "a", "an", "and", "are", "as", "at", "be", "by", "for", "from",
            "has", "he", "in", "is", "it", "its", "of", "on", "that", "the",
            "to", "was", "were", "will", "with",
            // French, the offers' dominant language
            "au", "aux", "avec", "dans", "de", "des", "du", "en", "et", "la",
            "le", "les", "ou", "par", "pour", "sur", "un", "une", "vous",
        ];
        words.into_iter().collect()
    };
}

/// Local, deterministic codec: token frequencies hashed into a fixed number
/// of buckets, L2-normalized. Signed hashing keeps collisions from biasing
/// the vector in one direction.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        HashingEmbedder { dimension }
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        let text = text.nfc().collect::<String>().to_lowercase();
        let text = NON_WORD.replace_all(&text, " ");

        text.split_whitespace()
            .filter(|token| !STOP_WORDS.contains(token))
            .map(|token| token.to_string())
            .collect()
    }
}

impl EmbeddingCodec for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Array1<f32>, EmbedError> {
        let tokens = self.tokenize(text);

        let mut term_freq = FxHashMap::default();
        for token in &tokens {
            *term_freq.entry(token.as_str()).or_insert(0.0f32) += 1.0;
        }

        let mut vector = Array1::<f32>::zeros(self.dimension);
        for (term, freq) in term_freq {
            let mut hasher = FxHasher::default();
            hasher.write(term.as_bytes());
            let hash = hasher.finish();
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash & (1u64 << 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign * freq;
        }

        let norm = vector.dot(&vector).sqrt();
        if norm > 0.0 {
            vector /= norm;
        }
        Ok(vector)
    }
}

/// Remote embeddings client for an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
    timeout: Duration,
}

impl HttpEmbedder {
    pub fn new(
        base_url: String,
        model: String,
        api_key: Option<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, EmbedError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &api_key {
            let auth = format!("Bearer {}", key.trim());
            let value = HeaderValue::from_str(&auth)
                .map_err(|e| EmbedError::Unavailable(format!("invalid api key: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(HttpEmbedder {
            client,
            endpoint,
            model,
            dimension,
            timeout,
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl EmbeddingCodec for HttpEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Array1<f32>, EmbedError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
            dimensions: self.dimension,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    EmbedError::Timeout(self.timeout)
                } else {
                    EmbedError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbedError::RateLimited(body));
        }
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbedError::Unavailable(format!("{status}: {body}")));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .map_err(|e| EmbedError::Unavailable(format!("malformed response: {e}")))?;
        let row = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Unavailable("response carried no embedding".to_string()))?;
        Ok(Array1::from(row.embedding))
    }
}
