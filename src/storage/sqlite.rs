//! SQLite storage for facts, todos and rolling summaries

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extract::Triple;
use crate::profile::UserProfile;
use crate::summarizer::SummaryRecord;

/// Which record table an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Fact,
    Todo,
}

impl RecordKind {
    fn table(self) -> &'static str {
        match self {
            RecordKind::Fact => "facts",
            RecordKind::Todo => "todos",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Fact => write!(f, "fact"),
            RecordKind::Todo => write!(f, "todo"),
        }
    }
}

/// A fact or todo row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub text: String,
    pub hash: String,
    pub tags: Vec<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Completion flag; always `None` for facts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

/// Equality constraints for listing records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub tag: Option<String>,
    /// Only applies to todos
    pub done: Option<bool>,
}

/// A conversation's rolling summary with its last update time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSummary {
    pub session_id: String,
    pub summary: SummaryRecord,
    pub updated_at: DateTime<Utc>,
}

/// An extracted fact with its owner and last sighting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTriple {
    #[serde(flatten)]
    pub triple: Triple,
    pub user_id: String,
    pub session_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open the records database at `config.sqlite_path()`
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(config.sqlite_path())
    }

    /// Open (or create) a records database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Initialize schema
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a record unless one with the same hash exists. Returns whether a
    /// row was inserted.
    pub fn insert_record(&self, kind: RecordKind, record: &StoredRecord) -> Result<bool> {
        let conn = self.conn();
        let tags = serde_json::to_string(&record.tags)?;
        let created_at = record.created_at.to_rfc3339();

        let inserted = match kind {
            RecordKind::Fact => conn.execute(
                r#"
                INSERT OR IGNORE INTO facts (hash, text, tags, user_id, session_id, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.hash,
                    record.text,
                    tags,
                    record.user_id,
                    record.session_id,
                    created_at,
                ],
            )?,
            RecordKind::Todo => conn.execute(
                r#"
                INSERT OR IGNORE INTO todos (hash, text, tags, user_id, session_id, created_at, done)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    record.hash,
                    record.text,
                    tags,
                    record.user_id,
                    record.session_id,
                    created_at,
                    record.done.unwrap_or(false),
                ],
            )?,
        };

        Ok(inserted > 0)
    }

    /// List records matching `filter`, oldest first
    pub fn list_records(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<StoredRecord>> {
        let conn = self.conn();

        let done_col = match kind {
            RecordKind::Fact => "NULL",
            RecordKind::Todo => "done",
        };
        let mut sql = format!(
            "SELECT text, hash, tags, user_id, session_id, created_at, {done_col} FROM {} WHERE 1=1",
            kind.table()
        );

        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(user_id) = &filter.user_id {
            sql.push_str(" AND user_id = ?");
            params_vec.push(Box::new(user_id.clone()));
        }

        if let Some(session_id) = &filter.session_id {
            sql.push_str(" AND session_id = ?");
            params_vec.push(Box::new(session_id.clone()));
        }

        if let Some(tag) = &filter.tag {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(tags) WHERE value = ?)");
            params_vec.push(Box::new(tag.clone()));
        }

        if let (RecordKind::Todo, Some(done)) = (kind, filter.done) {
            sql.push_str(" AND done = ?");
            params_vec.push(Box::new(done));
        }

        sql.push_str(" ORDER BY rowid");

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            Ok(RecordRow {
                text: row.get(0)?,
                hash: row.get(1)?,
                tags: row.get(2)?,
                user_id: row.get(3)?,
                session_id: row.get(4)?,
                created_at: row.get(5)?,
                done: row.get(6)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }

        Ok(records)
    }

    /// Mark a todo done or open again. Returns false for an unknown hash.
    pub fn set_done(&self, hash: &str, done: bool) -> Result<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE todos SET done = ?1 WHERE hash = ?2",
            params![done, hash],
        )?;
        Ok(updated > 0)
    }

    /// Delete a record. Returns false for an unknown hash.
    pub fn delete_record(&self, kind: RecordKind, hash: &str) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE hash = ?1", kind.table()),
            params![hash],
        )?;
        Ok(deleted > 0)
    }

    /// The stored rolling summary of a conversation
    pub fn get_summary(&self, user_id: &str, session_id: &str) -> Result<Option<SummaryRecord>> {
        let conn = self.conn();

        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM summaries WHERE user_id = ?1 AND session_id = ?2",
                params![user_id, session_id],
                |row| row.get(0),
            )
            .optional()?;

        record
            .map(|json| serde_json::from_str(&json).map_err(Error::from))
            .transpose()
    }

    /// Replace the rolling summary of a conversation
    pub fn save_summary(&self, user_id: &str, session_id: &str, summary: &SummaryRecord) -> Result<()> {
        let conn = self.conn();

        conn.execute(
            r#"
            INSERT INTO summaries (user_id, session_id, record, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, session_id) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
            params![
                user_id,
                session_id,
                serde_json::to_string(summary)?,
                timestamp(Utc::now()),
            ],
        )?;

        Ok(())
    }
}

impl SqliteStorage {
    /// Latest summaries of a user's conversations, most recently updated first
    pub fn recent_summaries(&self, user_id: &str, limit: usize) -> Result<Vec<StoredSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, record, updated_at FROM summaries
            WHERE user_id = ?1
            ORDER BY updated_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )?;

        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (session_id, record, updated_at) = row?;
            summaries.push(StoredSummary {
                session_id,
                summary: serde_json::from_str(&record)?,
                updated_at: parse_timestamp(&updated_at)?,
            });
        }
        Ok(summaries)
    }

    /// A user's stored profile
    pub fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        read_profile(&self.conn(), user_id)
    }

    /// Insert or replace a profile
    pub fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        write_profile(&self.conn(), profile)
    }

    /// Read, modify and write back a profile under one lock, starting from an
    /// empty profile for an unknown user
    pub fn update_profile(
        &self,
        user_id: &str,
        modify: impl FnOnce(&mut UserProfile),
    ) -> Result<UserProfile> {
        let conn = self.conn();
        let mut profile = read_profile(&conn, user_id)?.unwrap_or_else(|| UserProfile::new(user_id));
        modify(&mut profile);
        write_profile(&conn, &profile)?;
        Ok(profile)
    }

    /// Store an extracted fact, refreshing its timestamp and session if the
    /// user already has it. Returns whether the fact is new.
    pub fn upsert_triple(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        triple: &Triple,
    ) -> Result<bool> {
        let conn = self.conn();

        let exists = conn
            .query_row(
                r#"
                SELECT 1 FROM triples
                WHERE user_id = ?1 AND subject = ?2 AND predicate = ?3 AND object = ?4
                "#,
                params![user_id, triple.subject, triple.predicate, triple.object],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        conn.execute(
            r#"
            INSERT INTO triples (user_id, subject, predicate, object, category, session_id, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(user_id, subject, predicate, object) DO UPDATE SET
                category = excluded.category,
                session_id = excluded.session_id,
                updated_at = excluded.updated_at
            "#,
            params![
                user_id,
                triple.subject,
                triple.predicate,
                triple.object,
                triple.category,
                session_id,
                timestamp(Utc::now()),
            ],
        )?;

        Ok(!exists)
    }

    /// A user's facts about `subject` (case-insensitive), newest first
    pub fn triples_for_subject(
        &self,
        user_id: &str,
        subject: &str,
        limit: usize,
    ) -> Result<Vec<StoredTriple>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT subject, predicate, object, category, session_id, updated_at FROM triples
            WHERE user_id = ?1 AND subject = ?2 COLLATE NOCASE
            ORDER BY updated_at DESC, rowid DESC
            LIMIT ?3
            "#,
        )?;

        let rows = stmt.query_map(params![user_id, subject.trim(), limit as i64], |row| {
            Ok((
                Triple {
                    subject: row.get(0)?,
                    predicate: row.get(1)?,
                    object: row.get(2)?,
                    category: row.get(3)?,
                },
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut triples = Vec::new();
        for row in rows {
            let (triple, session_id, updated_at) = row?;
            triples.push(StoredTriple {
                triple,
                user_id: user_id.to_string(),
                session_id,
                updated_at: parse_timestamp(&updated_at)?,
            });
        }
        Ok(triples)
    }
}

fn read_profile(conn: &Connection, user_id: &str) -> Result<Option<UserProfile>> {
    let profile: Option<String> = conn
        .query_row(
            "SELECT profile FROM profiles WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;

    profile
        .map(|json| serde_json::from_str(&json).map_err(Error::from))
        .transpose()
}

fn write_profile(conn: &Connection, profile: &UserProfile) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO profiles (user_id, profile, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(user_id) DO UPDATE SET
            profile = excluded.profile,
            updated_at = excluded.updated_at
        "#,
        params![
            profile.user_id,
            serde_json::to_string(profile)?,
            timestamp(Utc::now()),
        ],
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 so stored timestamps sort as text
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::invalid_input(format!("Bad timestamp {value:?}: {e}")))
}

/// Intermediate struct for reading from SQLite
struct RecordRow {
    text: String,
    hash: String,
    tags: String,
    user_id: Option<String>,
    session_id: Option<String>,
    created_at: String,
    done: Option<bool>,
}

impl RecordRow {
    fn into_record(self) -> Result<StoredRecord> {
        Ok(StoredRecord {
            text: self.text,
            hash: self.hash,
            tags: serde_json::from_str(&self.tags)?,
            user_id: self.user_id,
            session_id: self.session_id,
            created_at: parse_timestamp(&self.created_at)?,
            done: self.done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("records.db")).unwrap();
        (dir, storage)
    }

    fn record(text: &str, hash: &str, user: &str, tags: &[&str]) -> StoredRecord {
        StoredRecord {
            text: text.into(),
            hash: hash.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            user_id: Some(user.into()),
            session_id: None,
            created_at: Utc::now(),
            done: None,
        }
    }

    #[test]
    fn insert_is_ignored_for_existing_hash() {
        let (_dir, storage) = storage();
        let r = record("buy milk", "h1", "u1", &[]);
        assert!(storage.insert_record(RecordKind::Fact, &r).unwrap());
        assert!(!storage.insert_record(RecordKind::Fact, &r).unwrap());
        // Tables are independent
        assert!(storage.insert_record(RecordKind::Todo, &r).unwrap());

        let facts = storage
            .list_records(RecordKind::Fact, &RecordFilter::default())
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].done, None);
    }

    #[test]
    fn list_filters_and_keeps_insertion_order() {
        let (_dir, storage) = storage();
        for (text, hash, user, tags) in [
            ("first", "a", "u1", &["summary"][..]),
            ("second", "b", "u2", &["summary"][..]),
            ("third", "c", "u1", &["manual"][..]),
        ] {
            storage
                .insert_record(RecordKind::Fact, &record(text, hash, user, tags))
                .unwrap();
        }

        let texts = |filter: RecordFilter| -> Vec<String> {
            storage
                .list_records(RecordKind::Fact, &filter)
                .unwrap()
                .into_iter()
                .map(|r| r.text)
                .collect()
        };

        assert_eq!(texts(RecordFilter::default()), vec!["first", "second", "third"]);
        assert_eq!(
            texts(RecordFilter {
                user_id: Some("u1".into()),
                ..Default::default()
            }),
            vec!["first", "third"]
        );
        assert_eq!(
            texts(RecordFilter {
                user_id: Some("u1".into()),
                tag: Some("summary".into()),
                ..Default::default()
            }),
            vec!["first"]
        );
    }

    #[test]
    fn todos_can_be_completed_and_deleted() {
        let (_dir, storage) = storage();
        storage
            .insert_record(RecordKind::Todo, &record("call bob", "t1", "u1", &[]))
            .unwrap();

        assert!(storage.set_done("t1", true).unwrap());
        assert!(!storage.set_done("missing", true).unwrap());

        let open = storage
            .list_records(
                RecordKind::Todo,
                &RecordFilter {
                    done: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(open.is_empty());

        assert!(storage.delete_record(RecordKind::Todo, "t1").unwrap());
        assert!(!storage.delete_record(RecordKind::Todo, "t1").unwrap());
    }

    #[test]
    fn summaries_are_overwritten_per_conversation() {
        let (_dir, storage) = storage();
        assert!(storage.get_summary("u1", "s1").unwrap().is_none());

        let first = SummaryRecord {
            tldr: "• first".into(),
            ..Default::default()
        };
        let second = SummaryRecord {
            tldr: "• second".into(),
            facts: vec!["likes tea".into()],
            ..Default::default()
        };
        storage.save_summary("u1", "s1", &first).unwrap();
        storage.save_summary("u1", "s1", &second).unwrap();

        assert_eq!(storage.get_summary("u1", "s1").unwrap(), Some(second));
        assert!(storage.get_summary("u1", "s2").unwrap().is_none());
    }

    #[test]
    fn recent_summaries_are_newest_first_per_user() {
        let (_dir, storage) = storage();
        let summary = |tldr: &str| SummaryRecord {
            tldr: tldr.into(),
            ..Default::default()
        };
        storage.save_summary("u1", "s1", &summary("• one")).unwrap();
        storage.save_summary("u1", "s2", &summary("• two")).unwrap();
        storage.save_summary("u2", "s9", &summary("• other user")).unwrap();
        storage.save_summary("u1", "s1", &summary("• one again")).unwrap();

        let recent = storage.recent_summaries("u1", 3).unwrap();
        let sessions: Vec<&str> = recent.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(sessions, vec!["s1", "s2"]);
        assert_eq!(recent[0].summary.tldr, "• one again");
        assert!(recent[0].updated_at >= recent[1].updated_at);

        assert_eq!(storage.recent_summaries("u1", 1).unwrap().len(), 1);
        assert!(storage.recent_summaries("nobody", 3).unwrap().is_empty());
    }

    fn triple(subject: &str, predicate: &str, object: &str) -> Triple {
        Triple {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            category: None,
        }
    }

    #[test]
    fn triples_are_upserted_per_user() {
        let (_dir, storage) = storage();
        let sushi = triple("alice", "likes", "sushi");

        assert!(storage.upsert_triple("u1", Some("s1"), &sushi).unwrap());
        assert!(storage
            .upsert_triple("u1", Some("s1"), &triple("alice", "owns", "a bike"))
            .unwrap());
        assert!(!storage.upsert_triple("u1", Some("s2"), &sushi).unwrap());
        assert!(storage.upsert_triple("u2", None, &sushi).unwrap());

        let facts = storage.triples_for_subject("u1", "ALICE", 10).unwrap();
        assert_eq!(facts.len(), 2);
        // The re-sighted fact moves to the front and remembers the new session
        assert_eq!(facts[0].triple, sushi);
        assert_eq!(facts[0].session_id.as_deref(), Some("s2"));
        assert_eq!(storage.triples_for_subject("u1", "alice", 1).unwrap().len(), 1);
        assert!(storage.triples_for_subject("u1", "bob", 10).unwrap().is_empty());
    }

    #[test]
    fn profiles_round_trip() {
        let (_dir, storage) = storage();
        assert!(storage.get_profile("u1").unwrap().is_none());

        let updated = storage
            .update_profile("u1", |p| p.name = Some("Alice".into()))
            .unwrap();
        assert_eq!(updated.user_id, "u1");
        assert_eq!(storage.get_profile("u1").unwrap(), Some(updated));
    }
}
