//! Embedding generation: the provider interface, a local fastembed model and a
//! deterministic feature-hashing embedder

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::text::tokens;

/// Turns texts into fixed-length, L2-normalized vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per text in the same order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Length of every vector this provider returns
    fn dimensions(&self) -> usize;

    /// Embed a single text
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding("No embedding returned"))
    }
}

/// Build the provider named by `config.embedding_model`.
///
/// Fails with [`Error::EmbeddingUnavailable`] when the model cannot be loaded;
/// callers should treat that as fatal at startup.
pub fn provider_from_config(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    if config.embedding_model.eq_ignore_ascii_case("hashing") {
        info!(
            dimensions = config.embedding_dimensions,
            "using feature-hashing embedder"
        );
        return Ok(Arc::new(HashingEmbedder::new(config.embedding_dimensions)));
    }
    Ok(Arc::new(FastEmbedProvider::new(config)?))
}

/// Embedding service running a local fastembed model.
///
/// Inference is CPU-bound and runs on the blocking thread pool.
pub struct FastEmbedProvider {
    model: Arc<Mutex<TextEmbedding>>,
    dimensions: usize,
}

impl FastEmbedProvider {
    /// Load the configured model, downloading weights to the cache on first use
    pub fn new(config: &Config) -> Result<Self> {
        let (model_kind, dimensions) = resolve_model(&config.embedding_model)?;

        let mut options = InitOptions::new(model_kind).with_show_download_progress(true);
        if let Some(cache_dir) = &config.embedding_cache_dir {
            options = options.with_cache_dir(cache_dir.clone());
        }

        let model = TextEmbedding::try_new(options).map_err(|e| {
            Error::embedding_unavailable(format!(
                "Failed to load embedding model {}: {}",
                config.embedding_model, e
            ))
        })?;

        info!(model = %config.embedding_model, dimensions, "embedding model loaded");

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = Arc::clone(&self.model);
        let batch = texts.to_vec();
        let embeddings = off_runtime(move || {
            let mut guard = model.lock().unwrap_or_else(|e| e.into_inner());
            guard.embed(batch, None)
        })
        .await?
        .map_err(|e| Error::embedding(format!("Embedding failed: {}", e)))?;

        if embeddings.len() != texts.len() {
            return Err(Error::embedding(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }

        Ok(embeddings.into_iter().map(normalize).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Run CPU-bound work on the blocking pool so async workers stay responsive
async fn off_runtime<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::embedding(format!("Embedding task failed: {}", e)))
}

fn resolve_model(name: &str) -> Result<(EmbeddingModel, usize)> {
    match name.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
            Ok((EmbeddingModel::AllMiniLML6V2, 384))
        }
        "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" | "baai/bge-base-en-v1.5" => Ok((EmbeddingModel::BGEBaseENV15, 768)),
        "multilingual-e5-small" | "intfloat/multilingual-e5-small" => {
            Ok((EmbeddingModel::MultilingualE5Small, 384))
        }
        other => Err(Error::embedding_unavailable(format!(
            "Unknown embedding model: {other}"
        ))),
    }
}

/// Bag-of-words embedder hashing lowercase tokens into fixed buckets.
///
/// Needs no model weights, so it works offline and in tests. Texts sharing
/// tokens get a positive cosine similarity.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Embed synchronously
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let mut any = false;
        for token in tokens(text) {
            vector[self.bucket(&token)] += 1.0;
            any = true;
        }
        if !any {
            // Punctuation-only or empty text still needs a unit vector
            let trimmed = text.trim();
            let slot = if trimmed.is_empty() { 0 } else { self.bucket(trimmed) };
            vector[slot] = 1.0;
        }
        normalize(vector)
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(bytes) % self.dimensions as u64) as usize
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Scale a vector to unit length; the zero vector is returned unchanged
pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
    vector
}

/// Cosine similarity of two vectors; 0.0 on length mismatch or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Token counter using tiktoken
pub struct TokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenCounter {
    /// Create a new token counter for a specific model
    pub fn new(model: &str) -> Result<Self> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .map_err(|e| Error::config(format!("Failed to load tokenizer for {}: {}", model, e)))?;

        Ok(Self { bpe })
    }

    /// cl100k_base, a close enough approximation for local chat models
    pub fn cl100k() -> Result<Self> {
        Self::new("gpt-4")
    }

    /// Count tokens in a text
    pub fn count(&self, text: &str) -> u32 {
        self.bpe.encode_with_special_tokens(text).len() as u32
    }

    /// Estimate tokens without using the tokenizer (faster, less accurate)
    pub fn estimate(text: &str) -> u32 {
        // ~4 characters per token is a reasonable estimate
        text.len().div_ceil(4) as u32
    }
}
