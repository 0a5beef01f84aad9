use std::env;
use std::fs::DirBuilder;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, defaults overridable through `VIE_SCOUT_*`
/// environment variables.
pub struct AppConfig {
    /// Directory holding the store and refresh marker files.
    pub data_dir: PathBuf,
    /// Embedding dimensionality, fixed per store.
    pub embedding_dimension: usize,
    /// Offers per batch during ingestion; the store is saved per batch.
    pub batch_size: usize,
    /// Offers retrieved per query.
    pub top_k: usize,
    /// Bound on every outbound HTTP request.
    pub request_timeout: Duration,
    /// Source API pages requested at this size.
    pub page_size: usize,
    /// Offer API base url; ingestion requires it.
    pub source_url: Option<String>,
    /// Embeddings API base url; without it, the local hashing codec is used.
    pub embeddings_url: Option<String>,
    pub embeddings_model: String,
    /// Chat-completions base url; without it, retrieval results are shown raw.
    pub generator_url: Option<String>,
    pub generator_model: String,
    pub api_key: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vie-scout");
        Self {
            data_dir,
            embedding_dimension: 512,
            batch_size: 50,
            top_k: 3,
            request_timeout: Duration::from_secs(30),
            page_size: 100,
            source_url: None,
            embeddings_url: None,
            embeddings_model: "mistral-embed".to_string(),
            generator_url: None,
            generator_model: "mistral-7b-instruct".to_string(),
            api_key: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut config = AppConfig::default();
        if let Ok(dir) = env::var("VIE_SCOUT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(n) = env_usize("VIE_SCOUT_DIMENSION") {
            config.embedding_dimension = n;
        }
        if let Some(n) = env_usize("VIE_SCOUT_BATCH_SIZE") {
            config.batch_size = n;
        }
        if let Some(n) = env_usize("VIE_SCOUT_TOP_K") {
            config.top_k = n;
        }
        if let Some(n) = env_usize("VIE_SCOUT_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(n as u64);
        }
        if let Ok(url) = env::var("VIE_SCOUT_SOURCE_URL") {
            config.source_url = Some(url);
        }
        if let Ok(url) = env::var("VIE_SCOUT_EMBEDDINGS_URL") {
            config.embeddings_url = Some(url);
        }
        if let Ok(model) = env::var("VIE_SCOUT_EMBEDDINGS_MODEL") {
            config.embeddings_model = model;
        }
        if let Ok(url) = env::var("VIE_SCOUT_GENERATOR_URL") {
            config.generator_url = Some(url);
        }
        if let Ok(model) = env::var("VIE_SCOUT_GENERATOR_MODEL") {
            config.generator_model = model;
        }
        if let Ok(key) = env::var("VIE_SCOUT_API_KEY") {
            config.api_key = Some(key);
        }
        config
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("embeddings.json")
    }

    pub fn tracker_path(&self) -> PathBuf {
        self.data_dir.join("last_refresh")
    }

    /// Creates the data directory if it doesn't exist.
    pub fn ensure_data_dir(&self) -> std::io::Result<()> {
        DirBuilder::new().recursive(true).create(&self.data_dir)
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|raw| raw.parse().ok())
}
