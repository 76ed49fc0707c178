//! # air4-memory
//!
//! Local retrieval-augmented memory for a personal assistant.
//!
//! ## Architecture
//!
//! - **Long-term memory** - text is chunked, embedded and stored in a vector
//!   store (LanceDB, or an in-memory store journaled to JSONL as fallback)
//! - **Retrieval** - oversampled candidates, optional HyDE expansion, keyword
//!   boosting, filtering, deduplication and MMR re-ranking
//! - **Short-term memory** - a bounded ring of recent turns plus a rolling
//!   summary of the conversation
//! - **Records** - durable facts and todos in SQLite, deduplicated per owner
//!   by content hash, plus facts extracted from user messages and per-user
//!   profiles
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use air4_memory::{metadata, Config, MemoryManager, Retriever, SearchOptions};
//!
//! let config = Config::from_env()?;
//! config.ensure_dirs()?;
//!
//! let embedder = air4_memory::embedding::provider_from_config(&config)?;
//! let store = air4_memory::storage::open_vector_store(&config, embedder).await?;
//!
//! let memory = MemoryManager::new(store.clone(), &config)?;
//! memory.ingest("Deployments run on Fridays.", metadata! { "user_id" => "u1" }).await?;
//!
//! let retriever = Retriever::new(store, None, &config);
//! let blocks = retriever.search("when do we deploy", 5, &SearchOptions::default()).await;
//! ```

pub mod chunker;
pub mod completion;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod memory;
pub mod message;
pub mod profile;
pub mod records;
pub mod retrieval;
pub mod storage;
pub mod summarizer;
pub mod text;

pub use completion::{CompletionService, OllamaClient};
pub use config::Config;
pub use context::{ContextBuilder, RetrievalContext};
pub use embedding::{EmbeddingProvider, HashingEmbedder};
pub use error::{Error, Result};
pub use extract::{Triple, TripleExtractor};
pub use memory::{MemoryEntry, MemoryManager, MetaValue, Metadata, MetadataFilter, SessionKey};
pub use message::{Role, Turn};
pub use profile::{ProfilePatch, ProfileStore, UserProfile};
pub use records::{FactStore, RecordOwner};
pub use retrieval::{DiversityMetric, Retriever, ScoredBlock, SearchOptions};
pub use storage::{open_vector_store, VectorStore};
pub use summarizer::{Summarizer, SummaryRecord};
