//! In-process vector store with exact cosine search

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::error::Result;
use crate::memory::{filter_accepts, MemoryEntry, MetadataFilter};
use crate::storage::jsonl::JsonlLog;
use crate::storage::{prepare_entries, rank, ScoredEntry, VectorStore};

/// Linear-scan store used when the persistent backend cannot start.
///
/// All entries live in one vector behind a single lock; a whole `add` batch is
/// applied under one write guard. With a journal attached, every batch is
/// appended to the JSONL file before it becomes visible.
pub struct InMemoryVectorStore {
    embedder: Arc<dyn EmbeddingProvider>,
    inner: RwLock<Inner>,
    journal: Option<JsonlLog>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<MemoryEntry>,
    ids: HashSet<String>,
}

impl InMemoryVectorStore {
    /// Create an empty, purely in-process store
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            inner: RwLock::new(Inner::default()),
            journal: None,
        }
    }

    /// Create a store journaled to `path`, replaying any existing entries
    pub fn open(embedder: Arc<dyn EmbeddingProvider>, path: impl Into<PathBuf>) -> Result<Self> {
        let journal = JsonlLog::new(path)?;
        let dimensions = embedder.dimensions();

        let mut inner = Inner::default();
        for entry in journal.read_all::<MemoryEntry>()? {
            if entry.embedding.len() != dimensions {
                warn!(
                    id = %entry.id,
                    expected = dimensions,
                    got = entry.embedding.len(),
                    "skipping journaled entry with wrong dimensions"
                );
                continue;
            }
            if inner.ids.insert(entry.id.clone()) {
                inner.entries.push(entry);
            }
        }

        info!(
            path = %journal.path().display(),
            entries = inner.entries.len(),
            "opened in-memory vector store"
        );

        Ok(Self {
            embedder,
            inner: RwLock::new(inner),
            journal: Some(journal),
        })
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, entries: Vec<MemoryEntry>) -> Result<usize> {
        let entries = prepare_entries(entries, self.dimensions())?;

        let mut inner = self.inner.write().await;

        let mut batch_ids = HashSet::new();
        let fresh: Vec<MemoryEntry> = entries
            .into_iter()
            .filter(|e| !inner.ids.contains(&e.id) && batch_ids.insert(e.id.clone()))
            .collect();

        if fresh.is_empty() {
            return Ok(0);
        }

        if let Some(journal) = &self.journal {
            journal.append_all(&fresh)?;
        }

        let inserted = fresh.len();
        for entry in fresh {
            inner.ids.insert(entry.id.clone());
            inner.entries.push(entry);
        }

        Ok(inserted)
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredEntry>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let inner = self.inner.read().await;
        let mut scored: Vec<(ScoredEntry, u64)> = inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| filter_accepts(filter, &e.metadata))
            .map(|(seq, e)| {
                (
                    ScoredEntry {
                        entry: e.clone(),
                        similarity: cosine_similarity(embedding, &e.embedding),
                    },
                    seq as u64,
                )
            })
            .collect();
        drop(inner);

        rank(&mut scored);
        scored.truncate(k);
        Ok(scored.into_iter().map(|(s, _)| s).collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.inner.read().await.entries.len())
    }

    fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    fn backend(&self) -> &'static str {
        if self.journal.is_some() {
            "memory+jsonl"
        } else {
            "memory"
        }
    }
}
