use std::sync::Arc;

use air4_memory::chunker::chunk;
use air4_memory::records::RecordOwner;
use air4_memory::storage::{JsonlLog, RecordFilter, SqliteStorage};
use air4_memory::{
    metadata, open_vector_store, Config, FactStore, HashingEmbedder, MemoryEntry, MemoryManager,
    Role, SessionKey, Summarizer, VectorStore,
};

fn config(dir: &tempfile::TempDir) -> Config {
    Config {
        chunk_size: 40,
        chunk_overlap: 10,
        force_fallback_store: true,
        completion_base_url: None,
        ..Config::with_data_dir(dir.path())
    }
}

const DOC: &str = "Quarterly planning starts on Monday. The team agreed to ship the \
                   search feature first and to postpone the billing rewrite.";

#[tokio::test]
async fn plain_ingest_duplicates_keyed_ingest_does_not() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let store = open_vector_store(&config, Arc::new(HashingEmbedder::new(64)))
        .await
        .unwrap();
    let memory = MemoryManager::new(store.clone(), &config).unwrap();
    let chunks = chunk(DOC, config.chunk_size, config.chunk_overlap).unwrap().len();

    let first = memory.ingest(DOC, metadata! { "user_id" => "u1" }).await.unwrap();
    let second = memory.ingest(DOC, metadata! { "user_id" => "u1" }).await.unwrap();
    assert_eq!(first.len(), chunks);
    assert_ne!(first, second);
    assert_eq!(store.len().await.unwrap(), 2 * chunks);

    let keyed = memory
        .ingest_keyed(DOC, metadata! { "user_id" => "u1" }, "doc-1")
        .await
        .unwrap();
    let again = memory
        .ingest_keyed(DOC, metadata! { "user_id" => "u1" }, "doc-1")
        .await
        .unwrap();
    assert_eq!(keyed, again);
    assert_eq!(keyed[0], "doc-1:0");
    assert_eq!(store.len().await.unwrap(), 3 * chunks);
}

#[tokio::test]
async fn fallback_store_is_journaled_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);

    {
        let store = open_vector_store(&config, Arc::new(HashingEmbedder::new(64)))
            .await
            .unwrap();
        assert_eq!(store.backend(), "memory+jsonl");
        MemoryManager::new(store, &config)
            .unwrap()
            .ingest(DOC, metadata! { "user_id" => "u1", "title" => "Planning" })
            .await
            .unwrap();
    }

    assert!(config.fallback_store_path().exists());
    let store = open_vector_store(&config, Arc::new(HashingEmbedder::new(64)))
        .await
        .unwrap();
    let hits = store.query_text("billing rewrite", 1, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entry.meta_str("title"), Some("Planning"));
    assert_eq!(hits[0].entry.meta_str("user_id"), Some("u1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_keyed_ingests_journal_whole_batches() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let store = open_vector_store(&config, Arc::new(HashingEmbedder::new(64)))
        .await
        .unwrap();
    let memory = Arc::new(MemoryManager::new(store.clone(), &config).unwrap());
    let chunks = chunk(DOC, config.chunk_size, config.chunk_overlap).unwrap().len();
    assert!(chunks > 1);

    let keys: Vec<String> = (0..8).map(|i| format!("doc-{i}")).collect();
    let tasks: Vec<_> = keys
        .iter()
        .cloned()
        .map(|key| {
            let memory = memory.clone();
            tokio::spawn(async move {
                memory
                    .ingest_keyed(DOC, metadata! { "user_id" => "u1" }, &key)
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().len(), chunks);
    }
    assert_eq!(store.len().await.unwrap(), keys.len() * chunks);

    // Each document's chunks sit together in the journal, in chunk order
    let journal: Vec<MemoryEntry> = JsonlLog::new(config.fallback_store_path())
        .unwrap()
        .read_all()
        .unwrap();
    assert_eq!(journal.len(), keys.len() * chunks);
    for batch in journal.chunks(chunks) {
        let key = batch[0].id.split(':').next().unwrap();
        let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
        let expected: Vec<String> = (0..chunks).map(|i| format!("{key}:{i}")).collect();
        assert_eq!(ids, expected);
    }

    drop(memory);
    drop(store);
    let reopened = open_vector_store(&config, Arc::new(HashingEmbedder::new(64)))
        .await
        .unwrap();
    assert_eq!(reopened.len().await.unwrap(), keys.len() * chunks);
}

#[tokio::test]
async fn facts_are_deduplicated_by_content() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let facts = FactStore::new(Arc::new(SqliteStorage::new(&config).unwrap()));
    let owner = RecordOwner::new("u1", None);

    let first = facts.add_fact("buy milk", &[], &owner).unwrap();
    let second = facts.add_fact("buy milk", &[], &owner).unwrap();
    assert_eq!((first, second), (true, false));
    assert_eq!(facts.list_facts(&RecordFilter::default()).unwrap().len(), 1);

    // The same text from another user is a separate fact
    let other = RecordOwner::new("u2", None);
    assert!(facts.add_fact("buy milk", &[], &other).unwrap());
    assert!(!facts.add_fact("Buy milk", &[], &other).unwrap());
    let u2_only = RecordFilter {
        user_id: Some("u2".into()),
        ..Default::default()
    };
    assert_eq!(facts.list_facts(&u2_only).unwrap().len(), 1);
    assert_eq!(facts.list_facts(&RecordFilter::default()).unwrap().len(), 2);
}

#[tokio::test]
async fn summaries_roll_up_without_a_completion_service() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let facts = FactStore::new(Arc::new(SqliteStorage::new(&config).unwrap()));
    let summarizer = Summarizer::new(None, facts.clone(), config.completion_timeout);

    let first = summarizer
        .summarize("u1", "s1", "The plan is to ship search first.", "Agreed, search first.")
        .await
        .unwrap();
    assert!(first.tldr.starts_with("• "));

    let second = summarizer
        .summarize("u1", "s1", "Billing waits until next quarter.", "Noted.")
        .await
        .unwrap();
    assert!(second.tldr.contains("ship search first"));
    assert!(second.tldr.contains("Billing waits"));

    let stored = facts.storage().get_summary("u1", "s1").unwrap();
    assert_eq!(stored, Some(second.clone()));

    // The manager surfaces the recorded tldr as its short summary
    let store = open_vector_store(&config, Arc::new(HashingEmbedder::new(64)))
        .await
        .unwrap();
    let memory = MemoryManager::new(store, &config).unwrap();
    memory.push_turn(Role::User, "Billing waits until next quarter.");
    let session = SessionKey::new("u1", "s1");
    memory.record_summary(&session, &second);
    assert_eq!(memory.short_summary(Some(&session)), second.tldr);

    // Another conversation only sees the extractive summary of the ring
    let elsewhere = SessionKey::new("u2", "s1");
    assert_ne!(memory.short_summary(Some(&elsewhere)), second.tldr);
    assert_eq!(
        memory.short_summary(Some(&elsewhere)),
        memory.short_summary(None)
    );
}
