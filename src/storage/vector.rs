//! Vector storage using LanceDB for semantic search

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lance_arrow::FixedSizeListArrayExt;
use lancedb::connect;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::DistanceType;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::memory::{filter_accepts, MemoryEntry, MetaValue, Metadata, MetadataFilter};
use crate::storage::{prepare_entries, rank, ScoredEntry, VectorStore};

const TABLE_NAME: &str = "memories";

/// Metadata fields mirrored into their own columns so filters on them run inside LanceDB
const INDEXED_FIELDS: [&str; 3] = ["user_id", "session_id", "source"];

/// Vector store backed by an on-disk LanceDB table
pub struct LanceVectorStore {
    db: lancedb::Connection,
    embedder: Arc<dyn EmbeddingProvider>,
    dimensions: usize,
    /// Serializes writers; holds the next insertion sequence number
    next_seq: Mutex<i64>,
}

impl LanceVectorStore {
    /// Open (or create) the store under `config.vector_db_path()`
    pub async fn open(config: &Config, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let path = config.vector_db_path();
        let uri = path
            .to_str()
            .ok_or_else(|| Error::store_unavailable("Vector DB path is not valid UTF-8"))?;

        let db = connect(uri)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        let mut store = Self {
            db,
            dimensions: embedder.dimensions(),
            embedder,
            next_seq: Mutex::new(0),
        };

        store.ensure_table().await?;
        let rows = store.table().await?.count_rows(None).await.map_err(db_err)?;
        store.next_seq = Mutex::new(rows as i64);

        info!(path = %path.display(), rows, "opened LanceDB vector store");
        Ok(store)
    }

    /// Get the schema for the memories table
    fn schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("metadata", DataType::Utf8, false),
            Field::new("user_id", DataType::Utf8, true),
            Field::new("session_id", DataType::Utf8, true),
            Field::new("source", DataType::Utf8, true),
            Field::new("seq", DataType::Int64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimensions as i32,
                ),
                false,
            ),
        ])
    }

    /// Ensure the memories table exists with the configured dimensionality
    async fn ensure_table(&self) -> Result<()> {
        let tables = self.db.table_names().execute().await.map_err(db_err)?;

        if !tables.contains(&TABLE_NAME.to_string()) {
            let schema = Arc::new(self.schema());
            let empty_batch = RecordBatch::new_empty(schema.clone());
            let reader = RecordBatchIterator::new(vec![Ok(empty_batch)], schema);

            self.db
                .create_table(TABLE_NAME, Box::new(reader))
                .execute()
                .await
                .map_err(db_err)?;
            return Ok(());
        }

        let schema = self.table().await?.schema().await.map_err(db_err)?;
        let stored = schema
            .field_with_name("vector")
            .ok()
            .and_then(|f| match f.data_type() {
                DataType::FixedSizeList(_, size) => Some(*size as usize),
                _ => None,
            });
        match stored {
            Some(d) if d == self.dimensions => Ok(()),
            Some(d) => Err(Error::store_unavailable(format!(
                "Existing table has {} dimensions, embedder produces {}",
                d, self.dimensions
            ))),
            None => Err(Error::store_unavailable("Existing table has no vector column")),
        }
    }

    async fn table(&self) -> Result<lancedb::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(db_err)
    }

    /// Ids among `ids` already present in the table
    async fn existing_ids(&self, table: &lancedb::Table, ids: &[&str]) -> Result<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let list = ids.iter().map(|id| sql_literal(id)).collect::<Vec<_>>().join(", ");

        let batches: Vec<RecordBatch> = table
            .query()
            .only_if(format!("id IN ({list})"))
            .select(Select::Columns(vec!["id".to_string()]))
            .execute()
            .await
            .map_err(db_err)?
            .try_collect()
            .await
            .map_err(db_err)?;

        let mut found = HashSet::new();
        for batch in &batches {
            let col = string_column(batch, "id")?;
            for i in 0..batch.num_rows() {
                found.insert(col.value(i).to_string());
            }
        }
        Ok(found)
    }

    fn build_batch(&self, entries: &[MemoryEntry], first_seq: i64) -> Result<RecordBatch> {
        let indexed = |field: &str| -> StringArray {
            entries
                .iter()
                .map(|e| e.meta_str(field).map(str::to_string))
                .collect::<Vec<Option<String>>>()
                .into()
        };

        let metadata = entries
            .iter()
            .map(|e| serde_json::to_string(&e.metadata))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let values = Float32Array::from(
            entries
                .iter()
                .flat_map(|e| e.embedding.iter().copied())
                .collect::<Vec<f32>>(),
        );
        let vector_array = FixedSizeListArray::try_new_from_values(values, self.dimensions as i32)
            .map_err(|e: arrow_schema::ArrowError| Error::vector_db(e.to_string()))?;

        RecordBatch::try_new(
            Arc::new(self.schema()),
            vec![
                Arc::new(StringArray::from_iter_values(entries.iter().map(|e| e.id.as_str())))
                    as Arc<dyn Array>,
                Arc::new(StringArray::from_iter_values(entries.iter().map(|e| e.text.as_str()))),
                Arc::new(StringArray::from(metadata)),
                Arc::new(indexed("user_id")),
                Arc::new(indexed("session_id")),
                Arc::new(indexed("source")),
                Arc::new(Int64Array::from_iter_values(
                    (0..entries.len() as i64).map(|i| first_seq + i),
                )),
                Arc::new(vector_array),
            ],
        )
        .map_err(|e| Error::vector_db(e.to_string()))
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn add(&self, entries: Vec<MemoryEntry>) -> Result<usize> {
        let entries = prepare_entries(entries, self.dimensions)?;

        let mut next_seq = self.next_seq.lock().await;
        let table = self.table().await?;

        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        let existing = self.existing_ids(&table, &ids).await?;

        let mut seen = HashSet::new();
        let fresh: Vec<MemoryEntry> = entries
            .into_iter()
            .filter(|e| !existing.contains(&e.id) && seen.insert(e.id.clone()))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let batch = self.build_batch(&fresh, *next_seq)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);

        table.add(Box::new(reader)).execute().await.map_err(db_err)?;

        *next_seq += fresh.len() as i64;
        debug!(inserted = fresh.len(), "added entries to LanceDB");
        Ok(fresh.len())
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

        let table = self.table().await?;
        let total = table.count_rows(None).await.map_err(db_err)?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let (pushdown, needs_post_filter) = split_filter(filter);
        // Post-filtered queries scan everything so no match is cut off by the limit
        let limit = if needs_post_filter { total } else { k };

        let mut query = table
            .vector_search(embedding.to_vec())
            .map_err(db_err)?
            .distance_type(DistanceType::Cosine)
            .limit(limit);

        if let Some(clause) = pushdown {
            query = query.only_if(clause);
        }

        let batches: Vec<RecordBatch> = query
            .execute()
            .await
            .map_err(db_err)?
            .try_collect()
            .await
            .map_err(db_err)?;

        let mut scored = Vec::new();
        for batch in &batches {
            let ids = string_column(batch, "id")?;
            let texts = string_column(batch, "text")?;
            let metas = string_column(batch, "metadata")?;
            let seqs = batch
                .column_by_name("seq")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
                .ok_or_else(|| Error::vector_db("Missing seq column"))?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| Error::vector_db("Missing _distance column"))?;
            let vectors = batch
                .column_by_name("vector")
                .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
                .ok_or_else(|| Error::vector_db("Missing vector column"))?;

            for i in 0..batch.num_rows() {
                let metadata: Metadata = serde_json::from_str(metas.value(i))?;
                if !filter_accepts(filter, &metadata) {
                    continue;
                }

                let vector = vectors.value(i);
                let embedding = vector
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .ok_or_else(|| Error::vector_db("vector items are not Float32"))?
                    .values()
                    .to_vec();

                let entry = MemoryEntry::new(ids.value(i), texts.value(i), embedding)
                    .with_metadata(metadata);
                scored.push((
                    ScoredEntry {
                        entry,
                        // Cosine distance is 1 - cosine similarity
                        similarity: 1.0 - distances.value(i),
                    },
                    seqs.value(i) as u64,
                ));
            }
        }

        rank(&mut scored);
        scored.truncate(k);
        Ok(scored.into_iter().map(|(s, _)| s).collect())
    }

    async fn len(&self) -> Result<usize> {
        self.table().await?.count_rows(None).await.map_err(db_err)
    }

    fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    fn backend(&self) -> &'static str {
        "lancedb"
    }
}

fn db_err(e: lancedb::Error) -> Error {
    Error::vector_db(e.to_string())
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::vector_db(format!("Missing {name} column")))
}

/// Quote a string as a SQL literal
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Split a filter into a LanceDB `WHERE` clause over the indexed columns and
/// whether other constraints remain to be checked row by row
fn split_filter(filter: Option<&MetadataFilter>) -> (Option<String>, bool) {
    let Some(filter) = filter else {
        return (None, false);
    };

    let mut clauses = Vec::new();
    let mut post = false;
    for (field, value) in filter.iter() {
        match value {
            MetaValue::Text(s) if INDEXED_FIELDS.contains(&field.as_str()) => {
                clauses.push(format!("{field} = {}", sql_literal(s)));
            }
            _ => post = true,
        }
    }

    let clause = (!clauses.is_empty()).then(|| clauses.join(" AND "));
    (clause, post)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::metadata;

    async fn open(dir: &tempfile::TempDir) -> LanceVectorStore {
        let config = Config::with_data_dir(dir.path());
        config.ensure_dirs().unwrap();
        LanceVectorStore::open(&config, Arc::new(HashingEmbedder::new(32)))
            .await
            .unwrap()
    }

    fn entry(id: &str, text: &str, user: &str) -> MemoryEntry {
        MemoryEntry::new(id, text, HashingEmbedder::new(32).embed_text(text))
            .with_metadata(metadata! { "user_id" => user, "topic" => "misc" })
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(sql_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn filter_splits_into_pushdown_and_post() {
        let filter = MetadataFilter::new().eq("user_id", "u1").eq("topic", "misc");
        let (clause, post) = split_filter(Some(&filter));
        assert_eq!(clause.as_deref(), Some("user_id = 'u1'"));
        assert!(post);

        let (clause, post) = split_filter(None);
        assert!(clause.is_none() && !post);
    }

    #[tokio::test]
    async fn stores_and_queries_with_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        assert!(store.query_text("anything", 3, None).await.unwrap().is_empty());

        let inserted = store
            .add(vec![
                entry("a", "vector databases index embeddings", "u1"),
                entry("b", "vector databases index embeddings", "u2"),
                entry("c", "gardening in spring", "u1"),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 3);
        assert_eq!(store.add(vec![entry("a", "dup", "u1")]).await.unwrap(), 0);

        let hits = store.query_text("vector databases", 3, None).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].entry.id, "a");
        assert_eq!(hits[1].entry.id, "b");

        let filter = MetadataFilter::new().eq("user_id", "u2").eq("topic", "misc");
        let hits = store
            .query_text("vector databases", 3, Some(&filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, "b");
        assert_eq!(hits[0].entry.meta_str("topic"), Some("misc"));
    }

    #[tokio::test]
    async fn reopen_keeps_entries_and_rejects_other_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir).await;
            store.add(vec![entry("a", "kept", "u1")]).await.unwrap();
        }
        assert_eq!(open(&dir).await.len().await.unwrap(), 1);

        let config = Config::with_data_dir(dir.path());
        let err = LanceVectorStore::open(&config, Arc::new(HashingEmbedder::new(16)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::StoreUnavailable(_)));
    }
}
