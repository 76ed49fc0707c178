//! Stored memory entries, their metadata, and the memory manager that owns
//! ingestion and the short-term conversation buffer

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::chunker::chunk;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{Role, ShortTermBuffer, Turn};
use crate::storage::VectorStore;
use crate::summarizer::{extractive_summary, SummaryRecord};

/// A scalar metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Equality used by metadata filters; integers and floats compare by value
    pub fn matches(&self, other: &MetaValue) -> bool {
        match (self, other) {
            (MetaValue::Int(a), MetaValue::Float(b)) | (MetaValue::Float(b), MetaValue::Int(a)) => {
                (*a as f64) == *b
            }
            _ => self == other,
        }
    }
}

impl std::fmt::Display for MetaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetaValue::Bool(b) => write!(f, "{b}"),
            MetaValue::Int(i) => write!(f, "{i}"),
            MetaValue::Float(x) => write!(f, "{x}"),
            MetaValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

/// Ordered metadata map attached to every entry
pub type Metadata = BTreeMap<String, MetaValue>;

/// Build a [`Metadata`] map from `key => value` pairs
#[macro_export]
macro_rules! metadata {
    () => { $crate::memory::Metadata::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::memory::Metadata::new();
        $( map.insert($key.to_string(), $crate::memory::MetaValue::from($value)); )+
        map
    }};
}

/// Conjunction of `field = value` constraints; an empty filter matches everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter(pub BTreeMap<String, MetaValue>);

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality constraint
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.0.iter()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.0
            .iter()
            .all(|(field, wanted)| metadata.get(field).is_some_and(|v| v.matches(wanted)))
    }
}

/// Whether `filter` (if any) accepts `metadata`
pub fn filter_accepts(filter: Option<&MetadataFilter>, metadata: &Metadata) -> bool {
    filter.map_or(true, |f| f.matches(metadata))
}

/// A stored text fragment with its embedding.
///
/// Entries are immutable once stored; corrections are new entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Opaque, stable identifier
    pub id: String,

    /// The fragment text
    pub text: String,

    /// L2-normalized embedding of `text`
    pub embedding: Vec<f32>,

    /// user_id, session_id, source, chunk_index, title, created_at, tags, ...
    #[serde(default)]
    pub metadata: Metadata,
}

impl MemoryEntry {
    pub fn new(id: impl Into<String>, text: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            embedding,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// String value of a metadata field
    pub fn meta_str(&self, field: &str) -> Option<&str> {
        self.metadata.get(field).and_then(MetaValue::as_str)
    }
}

/// One conversation: the owner of a rolling summary
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// The conversation a filter is pinned to, when it constrains both
    /// `user_id` and `session_id` to text values
    pub fn from_filter(filter: &MetadataFilter) -> Option<Self> {
        let user_id = filter.0.get("user_id")?.as_str()?;
        let session_id = filter.0.get("session_id")?.as_str()?;
        Some(Self::new(user_id, session_id))
    }
}

/// Orchestrates ingestion into the vector store and owns the short-term buffer.
///
/// Construct once at startup and share behind an `Arc`; every method takes
/// `&self`.
pub struct MemoryManager {
    store: Arc<dyn VectorStore>,
    chunk_size: usize,
    chunk_overlap: usize,
    ingest_timeout: Duration,
    short_term: Mutex<ShortTermBuffer>,
    summaries: Mutex<HashMap<SessionKey, SummaryRecord>>,
}

impl MemoryManager {
    /// Create a memory manager over an already opened vector store
    pub fn new(store: Arc<dyn VectorStore>, config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            ingest_timeout: config.ingest_timeout,
            short_term: Mutex::new(ShortTermBuffer::new(config.short_term_capacity)),
            summaries: Mutex::new(HashMap::new()),
        })
    }

    /// Get the vector store
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Chunk, embed and store `text`, returning the ids of the new entries.
    ///
    /// Every call creates fresh ids, so ingesting the same text twice stores it
    /// twice. Use [`MemoryManager::ingest_keyed`] for idempotent ingestion.
    pub async fn ingest(&self, text: &str, metadata: Metadata) -> Result<Vec<String>> {
        self.ingest_with(text, metadata, |_| Uuid::new_v4().to_string())
            .await
    }

    /// Like [`MemoryManager::ingest`], but ids are `"{key}:{chunk_index}"`.
    ///
    /// Stores skip ids they already hold, so re-ingesting the same document
    /// under the same key adds nothing.
    pub async fn ingest_keyed(
        &self,
        text: &str,
        metadata: Metadata,
        key: &str,
    ) -> Result<Vec<String>> {
        if key.trim().is_empty() {
            return Err(Error::invalid_input("ingest key must not be empty"));
        }
        self.ingest_with(text, metadata, |index| format!("{key}:{index}"))
            .await
    }

    async fn ingest_with(
        &self,
        text: &str,
        metadata: Metadata,
        make_id: impl Fn(usize) -> String,
    ) -> Result<Vec<String>> {
        match metadata.get("user_id") {
            Some(MetaValue::Text(user)) if !user.trim().is_empty() => {}
            _ => return Err(Error::invalid_input("metadata must carry a user_id")),
        }

        let chunks = chunk(text, self.chunk_size, self.chunk_overlap)?;
        if chunks.is_empty() {
            debug!("nothing to ingest after normalization");
            return Ok(Vec::new());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = tokio::time::timeout(self.ingest_timeout, self.store.embedder().embed(&texts))
            .await
            .map_err(|_| {
                Error::embedding(format!("embedding timed out after {:?}", self.ingest_timeout))
            })??;
        if embeddings.len() != chunks.len() {
            return Err(Error::embedding(format!(
                "Expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }

        let created_at = Utc::now().timestamp();
        let entries: Vec<MemoryEntry> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(c, embedding)| {
                let mut meta = metadata.clone();
                meta.insert("chunk_index".into(), MetaValue::Int(c.index as i64));
                meta.entry("created_at".into())
                    .or_insert(MetaValue::Int(created_at));
                MemoryEntry::new(make_id(c.index), c.text, embedding).with_metadata(meta)
            })
            .collect();

        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let inserted = tokio::time::timeout(self.ingest_timeout, self.store.add(entries))
            .await
            .map_err(|_| {
                Error::store_unavailable(format!(
                    "{} write timed out after {:?}",
                    self.store.backend(),
                    self.ingest_timeout
                ))
            })??;
        info!(
            chunks = ids.len(),
            inserted,
            backend = self.store.backend(),
            "ingested text"
        );

        Ok(ids)
    }

    /// Append a turn to the short-term ring
    pub fn push_turn(&self, role: Role, content: impl Into<String>) {
        self.short_term_guard().push(Turn::new(role, content));
    }

    /// Short-term turns, oldest first
    pub fn turns(&self) -> Vec<Turn> {
        self.short_term_guard().iter().cloned().collect()
    }

    /// Render the short-term ring as `role: content` lines
    pub fn short_context(&self) -> String {
        self.short_term_guard().render()
    }

    /// Drop all short-term turns and cached summaries
    pub fn clear_short_term(&self) {
        self.short_term_guard().clear();
        self.summaries_guard().clear();
    }

    /// Remember the latest rolling summary of `session`
    pub fn record_summary(&self, session: &SessionKey, summary: &SummaryRecord) {
        self.summaries_guard().insert(session.clone(), summary.clone());
    }

    /// The summary last recorded for `session`
    pub fn latest_summary(&self, session: &SessionKey) -> Option<SummaryRecord> {
        self.summaries_guard().get(session).cloned()
    }

    /// The tldr recorded for `session`, or an extractive summary of the ring.
    ///
    /// Without a session only the ring is summarized; summaries of other
    /// conversations are never returned.
    pub fn short_summary(&self, session: Option<&SessionKey>) -> String {
        if let Some(summary) = session.and_then(|s| self.latest_summary(s)) {
            if !summary.tldr.trim().is_empty() {
                return summary.tldr;
            }
        }
        let contents = self
            .short_term_guard()
            .iter()
            .map(|t| t.content.clone())
            .collect::<Vec<_>>()
            .join(" ");
        extractive_summary(&contents, 6)
    }

    fn short_term_guard(&self) -> MutexGuard<'_, ShortTermBuffer> {
        self.short_term.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn summaries_guard(&self) -> MutexGuard<'_, HashMap<SessionKey, SummaryRecord>> {
        self.summaries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
