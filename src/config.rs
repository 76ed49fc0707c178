//! Configuration for air4-memory

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for the memory system
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Embedding model name (`all-MiniLM-L6-v2`, `bge-small-en-v1.5`, ... or `hashing`)
    pub embedding_model: String,

    /// Where downloaded embedding weights are cached (fastembed default when unset)
    pub embedding_cache_dir: Option<PathBuf>,

    /// Embedding dimensions (384 for all-MiniLM-L6-v2)
    pub embedding_dimensions: usize,

    /// Chunk window size in characters
    pub chunk_size: usize,

    /// Overlap between consecutive chunks in characters
    pub chunk_overlap: usize,

    /// Number of results returned by a search when the caller does not say
    pub default_k: usize,

    /// Candidate oversampling factor for the retriever
    pub candidate_multiplier: u32,

    /// Minimum boosted score for prompt context on the persistent store (0.0 - 1.0)
    pub min_similarity_score: f32,

    /// Minimum boosted score for prompt context on the in-memory fallback store
    pub fallback_min_similarity_score: f32,

    /// Whether searches expand the query with a hypothetical answer by default
    pub use_hyde: bool,

    /// Default MMR lambda for context assembly (None disables MMR)
    pub mmr_lambda: Option<f32>,

    /// Capacity of the short-term conversation ring
    pub short_term_capacity: usize,

    /// Skip the persistent vector store and use the in-memory fallback
    pub force_fallback_store: bool,

    /// Timeout for each embedding call and each store write during ingest
    pub ingest_timeout: Duration,

    /// Timeout for a single vector store query
    pub query_timeout: Duration,

    /// Timeout for the hypothetical-answer completion call
    pub hyde_timeout: Duration,

    /// Timeout for summary completion calls
    pub completion_timeout: Duration,

    /// Base URL of the Ollama-compatible completion service (None disables it)
    pub completion_base_url: Option<String>,

    /// Model requested from the completion service
    pub completion_model: String,

    /// Token budget for assembled prompt context
    pub context_max_tokens: u32,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("air4-memory");

        Self {
            data_dir,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_cache_dir: None,
            embedding_dimensions: 384, // MiniLM-L6-v2 outputs 384-dim vectors
            chunk_size: 800,
            chunk_overlap: 200,
            default_k: 5,
            candidate_multiplier: 3,
            min_similarity_score: 0.2,
            fallback_min_similarity_score: 0.6,
            use_hyde: false,
            mmr_lambda: Some(0.7),
            short_term_capacity: 12,
            force_fallback_store: false,
            ingest_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(10),
            hyde_timeout: Duration::from_secs(15),
            completion_timeout: Duration::from_secs(60),
            completion_base_url: Some("http://127.0.0.1:11434".to_string()),
            completion_model: "llama3.1:8b".to_string(),
            context_max_tokens: 2000,
            server_port: 8420,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Build a config from defaults overridden by `AIR4_*` / `OLLAMA_*` variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an explicit variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("AIR4_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(model) = lookup("AIR4_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        if let Some(dir) = lookup("AIR4_EMBEDDING_CACHE_DIR") {
            config.embedding_cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = lookup("AIR4_EMBEDDING_DIMENSIONS") {
            config.embedding_dimensions = parse_var("AIR4_EMBEDDING_DIMENSIONS", &v)?;
        }
        if let Some(v) = lookup("AIR4_CHUNK_SIZE") {
            config.chunk_size = parse_var("AIR4_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = lookup("AIR4_CHUNK_OVERLAP") {
            config.chunk_overlap = parse_var("AIR4_CHUNK_OVERLAP", &v)?;
        }
        if let Some(v) = lookup("AIR4_DEFAULT_K") {
            config.default_k = parse_var("AIR4_DEFAULT_K", &v)?;
        }
        if let Some(v) = lookup("AIR4_CANDIDATE_MULTIPLIER") {
            config.candidate_multiplier = parse_var("AIR4_CANDIDATE_MULTIPLIER", &v)?;
        }
        if let Some(v) = lookup("AIR4_MIN_SCORE") {
            config.min_similarity_score = parse_var("AIR4_MIN_SCORE", &v)?;
        }
        if let Some(v) = lookup("AIR4_MIN_SCORE_FALLBACK") {
            config.fallback_min_similarity_score = parse_var("AIR4_MIN_SCORE_FALLBACK", &v)?;
        }
        if let Some(v) = lookup("AIR4_INGEST_TIMEOUT_SECS") {
            config.ingest_timeout =
                Duration::from_secs(parse_var("AIR4_INGEST_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("AIR4_USE_HYDE") {
            config.use_hyde = parse_flag(&v);
        }
        if let Some(v) = lookup("AIR4_MMR_LAMBDA") {
            config.mmr_lambda = match v.trim() {
                "" | "off" | "none" => None,
                other => Some(parse_var("AIR4_MMR_LAMBDA", other)?),
            };
        }
        if let Some(v) = lookup("AIR4_SHORT_TERM_CAPACITY") {
            config.short_term_capacity = parse_var("AIR4_SHORT_TERM_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("AIR4_MEMORY_FORCE_FALLBACK") {
            config.force_fallback_store = parse_flag(&v);
        }
        if let Some(url) = lookup("OLLAMA_BASE_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            config.completion_base_url = if url.is_empty() { None } else { Some(url) };
        }
        if let Some(model) = lookup("OLLAMA_MODEL") {
            config.completion_model = model;
        }
        if let Some(v) = lookup("AIR4_PORT") {
            config.server_port = parse_var("AIR4_PORT", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the chunker and retriever cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size must be greater than zero"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.embedding_dimensions == 0 {
            return Err(Error::config("embedding_dimensions must be greater than zero"));
        }
        if self.candidate_multiplier == 0 {
            return Err(Error::config("candidate_multiplier must be at least 1"));
        }
        if let Some(lambda) = self.mmr_lambda {
            if !(0.0..=1.0).contains(&lambda) {
                return Err(Error::config(format!("mmr_lambda {lambda} is outside [0, 1]")));
            }
        }
        Ok(())
    }

    /// Relevance floor for prompt context on the named store backend.
    ///
    /// The in-memory fallback is held to a stricter floor than the persistent
    /// store.
    pub fn min_score_for(&self, backend: &str) -> f32 {
        if backend.starts_with("memory") {
            self.fallback_min_similarity_score
        } else {
            self.min_similarity_score
        }
    }

    /// Get the path to the SQLite database holding facts, todos and summaries
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("records.db")
    }

    /// Get the path to the vector database
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    /// Get the path to the journal of the in-memory fallback store
    pub fn fallback_store_path(&self) -> PathBuf {
        self.data_dir.join("fallback.jsonl")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.vector_db_path())?;
        if let Some(cache) = &self.embedding_cache_dir {
            std::fs::create_dir_all(cache)?;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{key}: cannot parse {value:?}")))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn env_overrides_apply() {
        let config = Config::from_lookup(lookup(&[
            ("AIR4_DATA_DIR", "/tmp/air4"),
            ("AIR4_CHUNK_SIZE", "400"),
            ("AIR4_CHUNK_OVERLAP", "50"),
            ("AIR4_USE_HYDE", "true"),
            ("AIR4_MMR_LAMBDA", "off"),
            ("OLLAMA_BASE_URL", "http://localhost:11434/"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/air4"));
        assert_eq!(config.chunk_size, 400);
        assert_eq!(config.chunk_overlap, 50);
        assert!(config.use_hyde);
        assert_eq!(config.mmr_lambda, None);
        assert_eq!(config.completion_base_url.as_deref(), Some("http://localhost:11434"));
        assert_eq!(config.sqlite_path(), PathBuf::from("/tmp/air4/records.db"));
    }

    #[test]
    fn relevance_floor_depends_on_backend() {
        let config = Config::from_lookup(lookup(&[
            ("AIR4_MIN_SCORE", "0.25"),
            ("AIR4_MIN_SCORE_FALLBACK", "0.5"),
            ("AIR4_INGEST_TIMEOUT_SECS", "7"),
        ]))
        .unwrap();

        assert_eq!(config.min_score_for("lancedb"), 0.25);
        assert_eq!(config.min_score_for("memory"), 0.5);
        assert_eq!(config.min_score_for("memory+jsonl"), 0.5);
        assert_eq!(config.ingest_timeout, Duration::from_secs(7));

        let defaults = Config::default();
        assert!(defaults.min_score_for("memory") > defaults.min_score_for("lancedb"));
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let err = Config::from_lookup(lookup(&[
            ("AIR4_CHUNK_SIZE", "100"),
            ("AIR4_CHUNK_OVERLAP", "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unparsable_number_is_a_config_error() {
        let err = Config::from_lookup(lookup(&[("AIR4_DEFAULT_K", "five")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
