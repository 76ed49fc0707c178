//! Durable, hash-deduplicated facts and todos

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::extract::Triple;
use crate::storage::{RecordFilter, RecordKind, SqliteStorage, StoredRecord, StoredTriple};
use crate::text::{normalize_whitespace, scoped_content_hash};

/// Who produced a record
#[derive(Debug, Clone, Default)]
pub struct RecordOwner {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl RecordOwner {
    pub fn new(user_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            session_id,
        }
    }
}

/// Append-only fact and todo store keyed by owner and content hash.
///
/// Two texts from the same user that differ only in case or whitespace share
/// a hash, so the second insert is a no-op. Different users never collide.
#[derive(Clone)]
pub struct FactStore {
    storage: Arc<SqliteStorage>,
}

impl FactStore {
    pub fn new(storage: Arc<SqliteStorage>) -> Self {
        Self { storage }
    }

    /// Get the underlying SQLite storage
    pub fn storage(&self) -> &Arc<SqliteStorage> {
        &self.storage
    }

    /// Store a fact. Returns false when an equal fact already exists.
    pub fn add_fact(&self, text: &str, tags: &[String], owner: &RecordOwner) -> Result<bool> {
        self.add(RecordKind::Fact, text, tags, owner)
    }

    /// Store an open todo. Returns false when an equal todo already exists.
    pub fn add_todo(&self, text: &str, tags: &[String], owner: &RecordOwner) -> Result<bool> {
        self.add(RecordKind::Todo, text, tags, owner)
    }

    /// The key a record with this text and owner is stored under
    pub fn hash_for(&self, text: &str, owner: &RecordOwner) -> String {
        scoped_content_hash(owner.user_id.as_deref(), &normalize_whitespace(text))
    }

    /// Store extracted facts for the owner's user. Returns how many were new.
    pub fn add_triples(&self, triples: &[Triple], owner: &RecordOwner) -> Result<usize> {
        let user_id = owner
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::invalid_input("extracted facts need a user_id"))?;

        let mut added = 0;
        for triple in triples {
            if self
                .storage
                .upsert_triple(user_id, owner.session_id.as_deref(), triple)?
            {
                added += 1;
            }
        }
        debug!(user_id, extracted = triples.len(), added, "stored extracted facts");
        Ok(added)
    }

    /// A user's extracted facts about `subject`, newest first
    pub fn facts_for_subject(
        &self,
        user_id: &str,
        subject: &str,
        limit: usize,
    ) -> Result<Vec<StoredTriple>> {
        self.storage.triples_for_subject(user_id, subject, limit)
    }

    pub fn list_facts(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>> {
        self.storage.list_records(RecordKind::Fact, filter)
    }

    pub fn list_todos(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>> {
        self.storage.list_records(RecordKind::Todo, filter)
    }

    pub fn set_todo_done(&self, hash: &str, done: bool) -> Result<bool> {
        self.storage.set_done(hash, done)
    }

    pub fn delete_fact(&self, hash: &str) -> Result<bool> {
        self.storage.delete_record(RecordKind::Fact, hash)
    }

    pub fn delete_todo(&self, hash: &str) -> Result<bool> {
        self.storage.delete_record(RecordKind::Todo, hash)
    }

    fn add(&self, kind: RecordKind, text: &str, tags: &[String], owner: &RecordOwner) -> Result<bool> {
        let text = normalize_whitespace(text);
        if text.is_empty() {
            return Err(Error::invalid_input(format!("{kind} text must not be empty")));
        }

        let mut unique_tags: Vec<String> = Vec::with_capacity(tags.len());
        for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if !unique_tags.iter().any(|t| t == tag) {
                unique_tags.push(tag.to_string());
            }
        }

        let record = StoredRecord {
            hash: scoped_content_hash(owner.user_id.as_deref(), &text),
            text,
            tags: unique_tags,
            user_id: owner.user_id.clone(),
            session_id: owner.session_id.clone(),
            created_at: Utc::now(),
            done: match kind {
                RecordKind::Fact => None,
                RecordKind::Todo => Some(false),
            },
        };

        let inserted = self.storage.insert_record(kind, &record)?;
        debug!(%kind, hash = %record.hash, inserted, "stored record");
        Ok(inserted)
    }
}
