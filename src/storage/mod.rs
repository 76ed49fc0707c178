//! Storage backends for air4-memory

mod fallback;
mod jsonl;
mod sqlite;
pub mod vector;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::Config;
use crate::embedding::{normalize, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::memory::{MemoryEntry, MetadataFilter};

pub use fallback::InMemoryVectorStore;
pub use jsonl::JsonlLog;
pub use sqlite::{
    RecordFilter, RecordKind, SqliteStorage, StoredRecord, StoredSummary, StoredTriple,
};
pub use vector::LanceVectorStore;

/// A stored entry with its cosine similarity to the query
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub similarity: f32,
}

/// Persists memory entries and answers nearest-neighbour queries.
///
/// Results are ordered by descending cosine similarity, ties by insertion
/// order, and never padded: a store holding fewer than `k` matching entries
/// returns fewer than `k`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Store `entries` as one batch. Entries whose id is already stored are
    /// skipped. Returns how many entries were inserted.
    async fn add(&self, entries: Vec<MemoryEntry>) -> Result<usize>;

    /// The `k` entries nearest to `embedding` that satisfy `filter`
    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredEntry>>;

    /// Number of stored entries
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// The provider used to embed query text
    fn embedder(&self) -> &Arc<dyn EmbeddingProvider>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Embedding dimensionality of every stored entry
    fn dimensions(&self) -> usize {
        self.embedder().dimensions()
    }

    /// Embed `text` with the store's provider and query with the result
    async fn query_text(
        &self,
        text: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredEntry>> {
        let embedding = self.embedder().embed_one(text).await?;
        self.query(&embedding, k, filter).await
    }
}

/// Open the persistent LanceDB store, falling back to the in-memory store.
///
/// The fallback journals to `config.fallback_store_path()` so its contents
/// survive restarts.
pub async fn open_vector_store(
    config: &Config,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Result<Arc<dyn VectorStore>> {
    if !config.force_fallback_store {
        match LanceVectorStore::open(config, embedder.clone()).await {
            Ok(store) => return Ok(Arc::new(store)),
            Err(e) => {
                let e = Error::store_unavailable(e.to_string());
                warn!(error = %e, "falling back to in-memory vector store");
            }
        }
    }

    let store = InMemoryVectorStore::open(embedder, config.fallback_store_path())?;
    Ok(Arc::new(store))
}

/// Check entries against the store invariants and normalize their embeddings
pub(crate) fn prepare_entries(
    entries: Vec<MemoryEntry>,
    dimensions: usize,
) -> Result<Vec<MemoryEntry>> {
    entries
        .into_iter()
        .map(|mut entry| {
            if entry.id.trim().is_empty() {
                return Err(Error::invalid_input("Entry id must not be empty"));
            }
            if entry.text.trim().is_empty() {
                return Err(Error::invalid_input(format!(
                    "Entry {} has empty text",
                    entry.id
                )));
            }
            if entry.embedding.len() != dimensions {
                return Err(Error::invalid_input(format!(
                    "Embedding dimension mismatch for {}: expected {}, got {}",
                    entry.id,
                    dimensions,
                    entry.embedding.len()
                )));
            }
            if entry.embedding.iter().all(|x| *x == 0.0) {
                return Err(Error::invalid_input(format!(
                    "Entry {} has a zero embedding",
                    entry.id
                )));
            }
            entry.embedding = normalize(entry.embedding);
            Ok(entry)
        })
        .collect()
}

/// Order by similarity descending, then by insertion sequence ascending
pub(crate) fn rank(scored: &mut [(ScoredEntry, u64)]) {
    scored.sort_by(|(a, seq_a), (b, seq_b)| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(seq_a.cmp(seq_b))
    });
}
