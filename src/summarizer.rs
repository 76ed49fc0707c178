//! Rolling conversation summaries
//!
//! Each exchange is condensed into a [`SummaryRecord`] by the completion
//! service and merged with the prior record of the conversation. Whenever the
//! service is missing, slow or returns something unusable, an extractive
//! summary is produced instead, so summarizing never fails.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::completion::CompletionService;
use crate::error::{Error, Result};
use crate::extract::TripleExtractor;
use crate::records::{FactStore, RecordOwner};
use crate::text::{normalize_for_dedup, normalize_whitespace};

const MAX_FACTS: usize = 6;
const MAX_TODOS: usize = 5;
const MAX_ENTITIES: usize = 6;
const DEFAULT_BULLETS: usize = 6;

/// Tag attached to facts and todos forwarded from summaries
pub const SUMMARY_TAG: &str = "summary";

const DELTA_PROMPT: &str = r#"You are a concise analyst.
Condense the latest exchange below into a compact session rollup.

Reply with strict JSON using exactly these keys:
- "tldr": 1-3 short bullets in one string, each starting with "• "
- "facts": atomic, durable facts worth remembering (at most 6, short)
- "todos": actionable todos for the user (at most 5)
- "entities": important names or identifiers (at most 6)

Do not repeat what the prior summary already says.
User: {user}
Assistant: {assistant}
Prior summary (may be empty JSON): {prior}
"#;

const MERGE_PROMPT: &str = r#"Merge a prior JSON summary with a delta JSON summary.
Remove duplicates, keep it short, keep only durable facts and todos.
Reply with strict JSON using the same keys: tldr, facts, todos, entities.

Prior: {prior}
Delta: {delta}
"#;

/// Sentences containing these score higher in extractive summaries
const KEYWORDS: [&str; 12] = [
    "todo", "plan", "step", "next", "important", "decided", "decision", "status", "error",
    "result", "deadline", "must",
];

/// Rolling summary of one conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    #[serde(default)]
    pub tldr: String,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub todos: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
}

impl SummaryRecord {
    pub fn is_empty(&self) -> bool {
        self.tldr.trim().is_empty()
            && self.facts.is_empty()
            && self.todos.is_empty()
            && self.entities.is_empty()
    }
}

/// Produces and persists rolling summaries
pub struct Summarizer {
    completion: Option<Arc<dyn CompletionService>>,
    records: FactStore,
    extractor: Option<TripleExtractor>,
    timeout: Duration,
}

impl Summarizer {
    pub fn new(
        completion: Option<Arc<dyn CompletionService>>,
        records: FactStore,
        timeout: Duration,
    ) -> Self {
        let extractor = TripleExtractor::new()
            .map_err(|e| warn!(error = %e, "fact extraction disabled"))
            .ok();
        Self {
            completion,
            records,
            extractor,
            timeout,
        }
    }

    /// Summarize an exchange against the conversation's stored summary and
    /// persist the result
    pub async fn summarize(
        &self,
        user_id: &str,
        session_id: &str,
        user_turn: &str,
        assistant_turn: &str,
    ) -> Result<SummaryRecord> {
        if user_id.trim().is_empty() || session_id.trim().is_empty() {
            return Err(Error::invalid_input("user_id and session_id are required"));
        }

        let storage = self.records.storage();
        let prior = storage.get_summary(user_id, session_id)?;
        let owner = RecordOwner::new(user_id, Some(session_id.to_string()));

        let record = self
            .summarize_and_store(prior.as_ref(), user_turn, assistant_turn, &owner)
            .await;

        storage.save_summary(user_id, session_id, &record)?;
        Ok(record)
    }

    /// Merge one exchange into `prior` and forward the resulting facts and
    /// todos to the record store, along with facts the user stated about
    /// themselves
    pub async fn summarize_and_store(
        &self,
        prior: Option<&SummaryRecord>,
        user_turn: &str,
        assistant_turn: &str,
        owner: &RecordOwner,
    ) -> SummaryRecord {
        let prior = prior.filter(|p| !p.is_empty());
        let record = self.rollup(prior, user_turn, assistant_turn).await;
        self.forward(&record, owner);
        self.extract_facts(user_turn, owner);
        record
    }

    async fn rollup(
        &self,
        prior: Option<&SummaryRecord>,
        user_turn: &str,
        assistant_turn: &str,
    ) -> SummaryRecord {
        let prior_json = prior
            .and_then(|p| serde_json::to_string(p).ok())
            .unwrap_or_else(|| "{}".to_string());

        let prompt = DELTA_PROMPT
            .replace("{user}", user_turn.trim())
            .replace("{assistant}", assistant_turn.trim())
            .replace("{prior}", &prior_json);

        let delta = match self.ask(&prompt).await.and_then(|reply| parse_summary_json(&reply)) {
            Ok(delta) => delta,
            Err(e) => {
                warn!(error = %e, "summary delta unavailable, using extractive summary");
                return extractive_record(prior, user_turn, assistant_turn);
            }
        };

        let Some(prior) = prior else {
            return delta;
        };

        let delta_json = serde_json::to_string(&delta).unwrap_or_else(|_| "{}".to_string());
        let prompt = MERGE_PROMPT
            .replace("{prior}", &prior_json)
            .replace("{delta}", &delta_json);

        match self.ask(&prompt).await.and_then(|reply| parse_summary_json(&reply)) {
            Ok(merged) => dedup_record(merged),
            Err(e) => {
                warn!(error = %e, "summary merge unavailable, merging locally");
                merge_locally(prior, &delta)
            }
        }
    }

    async fn ask(&self, prompt: &str) -> Result<String> {
        let completion = self
            .completion
            .as_ref()
            .ok_or_else(|| Error::completion("no completion service configured"))?;

        match tokio::time::timeout(self.timeout, completion.complete(prompt)).await {
            Ok(reply) => reply,
            Err(_) => Err(Error::completion(format!(
                "{} timed out after {:?}",
                completion.name(),
                self.timeout
            ))),
        }
    }

    fn forward(&self, record: &SummaryRecord, owner: &RecordOwner) {
        let tags = [SUMMARY_TAG.to_string()];
        let mut added = 0;

        for fact in &record.facts {
            match self.records.add_fact(fact, &tags, owner) {
                Ok(inserted) => added += inserted as usize,
                Err(e) => warn!(error = %e, "failed to store summary fact"),
            }
        }
        for todo in &record.todos {
            match self.records.add_todo(todo, &tags, owner) {
                Ok(inserted) => added += inserted as usize,
                Err(e) => warn!(error = %e, "failed to store summary todo"),
            }
        }

        debug!(added, "forwarded summary records");
    }

    fn extract_facts(&self, user_turn: &str, owner: &RecordOwner) {
        let (Some(extractor), Some(user_id)) = (&self.extractor, owner.user_id.as_deref()) else {
            return;
        };

        let triples = extractor.extract(user_turn, user_id);
        if triples.is_empty() {
            return;
        }
        if let Err(e) = self.records.add_triples(&triples, owner) {
            warn!(error = %e, "failed to store extracted facts");
        }
    }
}

/// Parse a summary from a model reply, taking the outermost `{...}`
pub fn parse_summary_json(reply: &str) -> Result<SummaryRecord> {
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        return Err(Error::malformed_summary("no JSON object in reply"));
    };
    if end < start {
        return Err(Error::malformed_summary("no JSON object in reply"));
    }

    let value: Value = serde_json::from_str(&reply[start..=end])
        .map_err(|e| Error::malformed_summary(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(Error::malformed_summary("reply is not a JSON object"));
    };

    let tldr = match map.get("tldr") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => string_items(items)
            .into_iter()
            .map(|s| {
                if s.starts_with('•') {
                    s
                } else {
                    format!("• {s}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };

    let list = |key: &str, max: usize| -> Vec<String> {
        match map.get(key) {
            Some(Value::Array(items)) => {
                let mut items = dedup(string_items(items));
                items.truncate(max);
                items
            }
            _ => Vec::new(),
        }
    };

    let record = SummaryRecord {
        tldr,
        facts: list("facts", MAX_FACTS),
        todos: list("todos", MAX_TODOS),
        entities: list("entities", MAX_ENTITIES),
    };

    if record.is_empty() {
        return Err(Error::malformed_summary("summary has no content"));
    }
    Ok(record)
}

fn string_items(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(normalize_whitespace(s)),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Drop items whose normalized text was already seen, keeping first occurrences
fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(normalize_for_dedup(item)))
        .collect()
}

fn dedup_record(record: SummaryRecord) -> SummaryRecord {
    SummaryRecord {
        tldr: record.tldr,
        facts: dedup(record.facts),
        todos: dedup(record.todos),
        entities: dedup(record.entities),
    }
}

fn merge_locally(prior: &SummaryRecord, delta: &SummaryRecord) -> SummaryRecord {
    let concat = |a: &[String], b: &[String]| dedup(a.iter().chain(b).cloned().collect());
    SummaryRecord {
        tldr: if delta.tldr.trim().is_empty() {
            prior.tldr.clone()
        } else {
            delta.tldr.clone()
        },
        facts: concat(&prior.facts, &delta.facts),
        todos: concat(&prior.todos, &delta.todos),
        entities: concat(&prior.entities, &delta.entities),
    }
}

fn extractive_record(
    prior: Option<&SummaryRecord>,
    user_turn: &str,
    assistant_turn: &str,
) -> SummaryRecord {
    let prior_tldr = prior
        .map(|p| {
            p.tldr
                .lines()
                .map(|l| l.trim().trim_start_matches('•').trim())
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    let source = [prior_tldr.as_str(), user_turn, assistant_turn].join(" ");
    let prior = prior.cloned().unwrap_or_default();

    SummaryRecord {
        tldr: extractive_summary(&source, DEFAULT_BULLETS),
        ..prior
    }
}

/// Pick the most informative sentences of `text` as `• ` bullet lines.
///
/// Sentences end at `.`, `!` or `?` followed by whitespace. Each scores
/// `len^0.4` plus 1.8 per keyword it contains; the best `max_bullets` are kept,
/// highest first. Empty input yields `• (empty)`.
pub fn extractive_summary(text: &str, max_bullets: usize) -> String {
    let text = normalize_whitespace(text);
    if text.is_empty() {
        return "• (empty)".to_string();
    }

    let mut scored: Vec<(f32, &str)> = split_sentences(&text)
        .into_iter()
        .map(|s| {
            let lower = s.to_lowercase();
            let hits = KEYWORDS.iter().filter(|k| lower.contains(*k)).count();
            ((s.chars().count() as f32).powf(0.4) + 1.8 * hits as f32, s)
        })
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let bullets: Vec<String> = scored
        .into_iter()
        .take(max_bullets.max(1))
        .map(|(_, s)| format!("• {s}"))
        .collect();

    if bullets.is_empty() {
        let head: String = text.chars().take(200).collect();
        return format!("• {head}");
    }
    bullets.join("\n")
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(next, n)) = chars.peek() {
                if n.is_whitespace() {
                    sentences.push(&text[start..next]);
                    start = next;
                }
            }
        }
    }
    sentences.push(&text[start..]);

    sentences
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RecordFilter, SqliteStorage};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies with scripted responses in order, then errors
    struct Scripted(Mutex<VecDeque<Result<String>>>);

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(replies.into())))
        }
    }

    #[async_trait]
    impl CompletionService for Scripted {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::completion("script exhausted")))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl CompletionService for Sleepy {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(r#"{"tldr":"late"}"#.into())
        }
    }

    fn records() -> (tempfile::TempDir, FactStore) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("records.db")).unwrap();
        (dir, FactStore::new(Arc::new(storage)))
    }

    fn summarizer(
        completion: Option<Arc<dyn CompletionService>>,
        records: &FactStore,
    ) -> Summarizer {
        Summarizer::new(completion, records.clone(), Duration::from_millis(200))
    }

    fn owner() -> RecordOwner {
        RecordOwner::new("u1", Some("s1".into()))
    }

    fn prior() -> SummaryRecord {
        SummaryRecord {
            tldr: "• User is planning a trip to Lisbon.".into(),
            facts: vec!["User lives in Berlin".into()],
            todos: vec!["Book flights".into()],
            entities: vec!["Lisbon".into()],
        }
    }

    #[test]
    fn extractive_summary_of_empty_text_is_placeholder() {
        assert_eq!(extractive_summary("", 6), "• (empty)");
        assert_eq!(extractive_summary("  \n\t ", 6), "• (empty)");
    }

    #[test]
    fn extractive_summary_prefers_keyword_sentences() {
        let text = "The weather was fine today. Next step is the deployment plan! Ok.";
        let summary = extractive_summary(text, 1);
        assert_eq!(summary, "• Next step is the deployment plan!");

        let all = extractive_summary(text, 6);
        assert_eq!(all.lines().count(), 3);
        assert!(all.lines().all(|l| l.starts_with("• ")));
    }

    #[test]
    fn sentences_split_only_before_whitespace() {
        assert_eq!(
            split_sentences("Version 1.2 is out. Is it good?Yes"),
            vec!["Version 1.2 is out.", "Is it good?Yes"]
        );
    }

    #[test]
    fn json_is_found_inside_chatter() {
        let reply = "Sure! Here it is:\n{\"tldr\": [\"met Ana\", \"• chose Rust\"], \"facts\": [\"Ana is CTO\", \"ana is  CTO\"], \"extra\": 1}\nHope it helps.";
        let record = parse_summary_json(reply).unwrap();
        assert_eq!(record.tldr, "• met Ana\n• chose Rust");
        assert_eq!(record.facts, vec!["Ana is CTO"]);
        assert!(record.todos.is_empty());
    }

    #[test]
    fn unusable_replies_are_malformed() {
        for reply in ["no json here", "} backwards {", "{\"tldr\": ", "{}", "[1, 2]"] {
            let err = parse_summary_json(reply).unwrap_err();
            assert!(matches!(err, Error::MalformedSummary(_)), "{reply}");
        }
    }

    #[tokio::test]
    async fn without_service_prior_is_carried_over() {
        let (_dir, records) = records();
        let prior = prior();
        let record = summarizer(None, &records)
            .summarize_and_store(Some(&prior), "What is next?", "Next step: book the hotel.", &owner())
            .await;

        assert_eq!(record.facts, prior.facts);
        assert_eq!(record.todos, prior.todos);
        assert!(record.tldr.contains("Lisbon"));
        assert!(record.tldr.contains("book the hotel"));
    }

    #[tokio::test]
    async fn malformed_delta_falls_back_to_extractive() {
        let (_dir, records) = records();
        let service = Scripted::new(vec![Ok("I cannot produce JSON today.".into())]);
        let record = summarizer(Some(service), &records)
            .summarize_and_store(None, "We decided to use SQLite.", "Good choice.", &owner())
            .await;

        assert!(record.tldr.starts_with("• "));
        assert!(record.facts.is_empty());
    }

    #[tokio::test]
    async fn first_delta_is_used_and_forwarded() {
        let (_dir, records) = records();
        let service = Scripted::new(vec![Ok(
            r#"{"tldr":"• chose SQLite","facts":["Project uses SQLite"],"todos":["Write migration"],"entities":["SQLite"]}"#.into(),
        )]);
        let record = summarizer(Some(service), &records)
            .summarize_and_store(None, "Which database?", "SQLite.", &owner())
            .await;

        assert_eq!(record.tldr, "• chose SQLite");
        let facts = records.list_facts(&RecordFilter::default()).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].tags, vec![SUMMARY_TAG]);
        assert_eq!(records.list_todos(&RecordFilter::default()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_merge_is_done_locally() {
        let (_dir, records) = records();
        let service = Scripted::new(vec![
            Ok(r#"{"tldr":"• hotel booked","facts":["user lives in berlin","Hotel is near the river"]}"#.into()),
            Err(Error::completion("boom")),
        ]);
        let prior = prior();
        let record = summarizer(Some(service), &records)
            .summarize_and_store(Some(&prior), "Booked it.", "Great.", &owner())
            .await;

        assert_eq!(record.tldr, "• hotel booked");
        assert_eq!(
            record.facts,
            vec!["User lives in Berlin", "Hotel is near the river"]
        );
        assert_eq!(record.todos, prior.todos);
    }

    #[tokio::test]
    async fn merge_reply_replaces_the_record() {
        let (_dir, records) = records();
        let service = Scripted::new(vec![
            Ok(r#"{"tldr":"• delta"}"#.into()),
            Ok(r#"{"tldr":"• merged","facts":["a","A"]}"#.into()),
        ]);
        let record = summarizer(Some(service), &records)
            .summarize_and_store(Some(&prior()), "u", "a", &owner())
            .await;

        assert_eq!(record.tldr, "• merged");
        assert_eq!(record.facts, vec!["a"]);
    }

    #[tokio::test]
    async fn user_statements_become_subject_facts() {
        let (_dir, records) = records();
        summarizer(None, &records)
            .summarize_and_store(None, "I live in Tallinn. I love sushi and ramen.", "Nice!", &owner())
            .await;

        let facts = records.facts_for_subject("u1", "u1", 10).unwrap();
        let mut objects: Vec<&str> = facts.iter().map(|f| f.triple.object.as_str()).collect();
        objects.sort_unstable();
        assert_eq!(objects, vec!["ramen", "sushi", "tallinn"]);
        assert!(facts.iter().all(|f| f.session_id.as_deref() == Some("s1")));

        // Anonymous exchanges are summarized but nothing is extracted
        let anonymous = RecordOwner::default();
        summarizer(None, &records)
            .summarize_and_store(None, "I own a bike.", "Cool.", &anonymous)
            .await;
        assert_eq!(records.facts_for_subject("u1", "u1", 10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn slow_service_times_out_to_extractive() {
        let (_dir, records) = records();
        let record = summarizer(Some(Arc::new(Sleepy)), &records)
            .summarize_and_store(None, "Status is green.", "Noted.", &owner())
            .await;
        assert!(record.tldr.contains("Status is green."));
    }

    #[tokio::test]
    async fn summarize_persists_per_conversation() {
        let (_dir, records) = records();
        let service = Scripted::new(vec![Ok(r#"{"tldr":"• first pass","facts":["x"]}"#.into())]);
        let summarizer = summarizer(Some(service), &records);

        let record = summarizer.summarize("u1", "s1", "hi", "hello").await.unwrap();
        let stored = records.storage().get_summary("u1", "s1").unwrap();
        assert_eq!(stored, Some(record));

        let err = summarizer.summarize("u1", " ", "hi", "hello").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
