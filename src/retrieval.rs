//! Multi-stage retrieval over the vector store
//!
//! A search oversamples candidates from the store, optionally widens the pool
//! with a hypothetical answer to the query (HyDE), boosts candidates that share
//! words with the query, filters, deduplicates and finally picks the top `k`,
//! either directly or through Maximal Marginal Relevance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::completion::CompletionService;
use crate::config::Config;
use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::memory::{filter_accepts, MemoryEntry, Metadata, MetadataFilter};
use crate::storage::{ScoredEntry, VectorStore};
use crate::text::{jaccard, normalize_for_dedup, token_set};

/// Weight of the query/candidate token overlap added to the similarity
const KEYWORD_WEIGHT: f32 = 0.35;

/// Bonus when the candidate's title shares a word with the query
const TITLE_BONUS: f32 = 0.10;

/// Metadata fields whose words count towards the keyword boost
const BOOST_FIELDS: [&str; 5] = ["title", "filename", "tag", "tags", "topic"];

/// Similarity used to penalize redundant picks during MMR
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiversityMetric {
    /// Jaccard overlap of the candidates' word sets
    #[default]
    Lexical,
    /// Cosine similarity of the candidates' embeddings
    Embedding,
}

/// Per-search knobs
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    /// MMR trade-off between relevance (1.0) and diversity (0.0); `None` skips MMR
    pub mmr_lambda: Option<f32>,
    pub use_hyde: bool,
    pub metadata_filter: Option<MetadataFilter>,
    /// How many candidates to fetch per requested result
    pub candidate_multiplier: u32,
    /// Drop candidates whose boosted score is below this
    pub score_threshold: Option<f32>,
    pub diversity: DiversityMetric,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mmr_lambda: None,
            use_hyde: false,
            metadata_filter: None,
            candidate_multiplier: 3,
            score_threshold: None,
            diversity: DiversityMetric::Lexical,
        }
    }
}

impl SearchOptions {
    /// Options with the configured defaults for MMR, HyDE and oversampling
    pub fn from_config(config: &Config) -> Self {
        Self {
            mmr_lambda: config.mmr_lambda,
            use_hyde: config.use_hyde,
            candidate_multiplier: config.candidate_multiplier,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.metadata_filter = Some(filter);
        self
    }
}

/// A ranked search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredBlock {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    /// Store similarity plus keyword boost
    pub score: f32,
}

#[derive(Debug, Clone)]
struct Candidate {
    entry: MemoryEntry,
    score: f32,
}

impl From<Candidate> for ScoredBlock {
    fn from(c: Candidate) -> Self {
        Self {
            id: c.entry.id,
            text: c.entry.text,
            metadata: c.entry.metadata,
            score: c.score,
        }
    }
}

/// Retrieval engine for fetching relevant memory
pub struct Retriever {
    store: Arc<dyn VectorStore>,
    completion: Option<Arc<dyn CompletionService>>,
    query_timeout: Duration,
    hyde_timeout: Duration,
}

impl Retriever {
    /// Create a retriever; without a completion service HyDE is a no-op
    pub fn new(
        store: Arc<dyn VectorStore>,
        completion: Option<Arc<dyn CompletionService>>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            completion,
            query_timeout: config.query_timeout,
            hyde_timeout: config.hyde_timeout,
        }
    }

    /// Rank stored entries for `query`.
    ///
    /// Never fails: store and completion errors are logged and contribute no
    /// candidates. Returns at most `k` blocks, none of which repeats another's
    /// normalized text.
    pub async fn search(&self, query: &str, k: usize, options: &SearchOptions) -> Vec<ScoredBlock> {
        if k == 0 || query.trim().is_empty() {
            return Vec::new();
        }

        let n = k.saturating_mul(options.candidate_multiplier.max(1) as usize).max(k);
        let filter = options.metadata_filter.as_ref();

        let mut candidates: Vec<Candidate> = self
            .fetch(query, n, filter)
            .await
            .into_iter()
            .map(|s| Candidate {
                entry: s.entry,
                score: s.similarity,
            })
            .collect();
        let fetched = candidates.len();

        if options.use_hyde {
            if let Some(answer) = self.hypothetical_answer(query).await {
                // An entry found by both queries keeps its better similarity
                let mut positions: HashMap<String, usize> = candidates
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.entry.id.clone(), i))
                    .collect();
                for s in self.fetch(&answer, n, filter).await {
                    match positions.get(&s.entry.id) {
                        Some(&i) => {
                            candidates[i].score = candidates[i].score.max(s.similarity);
                        }
                        None => {
                            positions.insert(s.entry.id.clone(), candidates.len());
                            candidates.push(Candidate {
                                entry: s.entry,
                                score: s.similarity,
                            });
                        }
                    }
                }
            }
        }

        let query_tokens = token_set(query);
        for c in &mut candidates {
            c.score += keyword_boost(&query_tokens, &c.entry);
        }

        candidates.retain(|c| filter_accepts(filter, &c.entry.metadata));
        if let Some(threshold) = options.score_threshold {
            candidates.retain(|c| c.score >= threshold);
        }

        // Stable: equal scores keep store order
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let candidates = dedup(candidates);
        let pool = candidates.len();

        let selected = match options.mmr_lambda {
            Some(lambda) => mmr_select(candidates, k, lambda, options.diversity),
            None => candidates.into_iter().take(k).collect(),
        };

        debug!(
            fetched,
            pool,
            returned = selected.len(),
            backend = self.store.backend(),
            "search complete"
        );

        selected.into_iter().map(ScoredBlock::from).collect()
    }

    async fn fetch(&self, text: &str, n: usize, filter: Option<&MetadataFilter>) -> Vec<ScoredEntry> {
        let result = tokio::time::timeout(self.query_timeout, self.store.query_text(text, n, filter))
            .await
            .unwrap_or_else(|_| {
                Err(Error::query_failed(format!(
                    "store query timed out after {:?}",
                    self.query_timeout
                )))
            });

        match result {
            Ok(hits) => hits,
            Err(e) => {
                let e = Error::query_failed(e.to_string());
                warn!(error = %e, backend = self.store.backend(), "candidate fetch failed");
                Vec::new()
            }
        }
    }

    async fn hypothetical_answer(&self, query: &str) -> Option<String> {
        let completion = self.completion.as_ref()?;
        let prompt = format!("Answer briefly and to the point: {}", query.trim());

        let result: Result<String> =
            match tokio::time::timeout(self.hyde_timeout, completion.complete(&prompt)).await {
                Ok(reply) => reply,
                Err(_) => Err(Error::completion(format!(
                    "timed out after {:?}",
                    self.hyde_timeout
                ))),
            };

        match result {
            Ok(answer) if !answer.trim().is_empty() => Some(answer.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                let e = Error::query_failed(format!("hypothetical answer: {e}"));
                warn!(error = %e, "HyDE expansion skipped");
                None
            }
        }
    }
}

/// Score added for overlap between the query's words and the candidate's
/// text and descriptive metadata. At most `KEYWORD_WEIGHT + TITLE_BONUS`.
fn keyword_boost(query_tokens: &HashSet<String>, entry: &MemoryEntry) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }

    let mut tokens = token_set(&entry.text);
    for field in BOOST_FIELDS {
        if let Some(value) = entry.meta_str(field) {
            tokens.extend(token_set(value));
        }
    }

    let mut boost = KEYWORD_WEIGHT * jaccard(query_tokens, &tokens);

    if let Some(title) = entry.metadata.get("title") {
        let title_tokens = token_set(&title.to_string());
        if !title_tokens.is_disjoint(query_tokens) {
            boost += TITLE_BONUS;
        }
    }

    boost
}

/// Drop candidates whose normalized text equals, contains or is contained in
/// the text of an earlier (higher-scored) kept candidate
fn dedup(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut kept_texts: Vec<String> = Vec::with_capacity(candidates.len());
    let mut kept = Vec::with_capacity(candidates.len());

    for c in candidates {
        let norm = normalize_for_dedup(&c.entry.text);
        let redundant = kept_texts
            .iter()
            .any(|k| k.contains(norm.as_str()) || norm.contains(k.as_str()));
        if !redundant {
            kept_texts.push(norm);
            kept.push(c);
        }
    }

    kept
}

/// Maximal Marginal Relevance over candidates sorted by score.
///
/// Seeds with the first candidate, then repeatedly adds the candidate
/// maximizing `λ·score − (1−λ)·max similarity to the selection`; on ties the
/// earliest candidate wins.
fn mmr_select(
    candidates: Vec<Candidate>,
    k: usize,
    lambda: f32,
    metric: DiversityMetric,
) -> Vec<Candidate> {
    if k == 0 || candidates.is_empty() {
        return Vec::new();
    }
    let lambda = if lambda.is_nan() { 1.0 } else { lambda.clamp(0.0, 1.0) };
    let k = k.min(candidates.len());

    let tokens: Vec<HashSet<String>> = match metric {
        DiversityMetric::Lexical => candidates.iter().map(|c| token_set(&c.entry.text)).collect(),
        DiversityMetric::Embedding => Vec::new(),
    };
    let similarity = |a: usize, b: usize| -> f32 {
        match metric {
            DiversityMetric::Lexical => jaccard(&tokens[a], &tokens[b]),
            DiversityMetric::Embedding => {
                cosine_similarity(&candidates[a].entry.embedding, &candidates[b].entry.embedding)
            }
        }
    };

    let mut selected: Vec<usize> = vec![0];
    let mut rest: Vec<usize> = (1..candidates.len()).collect();

    while selected.len() < k && !rest.is_empty() {
        let mut best_pos = 0;
        let mut best_value = f32::NEG_INFINITY;

        for (pos, &i) in rest.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|&s| similarity(i, s))
                .fold(0.0f32, f32::max);
            let value = lambda * candidates[i].score - (1.0 - lambda) * redundancy;
            if value > best_value {
                best_value = value;
                best_pos = pos;
            }
        }

        selected.push(rest.remove(best_pos));
    }

    let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
    selected
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata;

    fn candidate(id: &str, text: &str, score: f32) -> Candidate {
        Candidate {
            entry: MemoryEntry::new(id, text, vec![1.0, 0.0]),
            score,
        }
    }

    fn ids(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.entry.id.as_str()).collect()
    }

    #[test]
    fn boost_counts_text_and_title_words() {
        let query = token_set("rust memory");
        let plain = MemoryEntry::new("a", "rust memory", vec![1.0]);
        assert!((keyword_boost(&query, &plain) - KEYWORD_WEIGHT).abs() < 1e-6);

        let titled = MemoryEntry::new("b", "unrelated words", vec![1.0])
            .with_metadata(metadata! { "title" => "Rust notes" });
        let boost = keyword_boost(&query, &titled);
        // {rust} / {rust, memory, unrelated, words, notes}
        assert!((boost - (KEYWORD_WEIGHT * 0.2 + TITLE_BONUS)).abs() < 1e-6);

        assert_eq!(keyword_boost(&HashSet::new(), &plain), 0.0);
    }

    #[test]
    fn dedup_drops_equal_and_nested_texts() {
        let kept = dedup(vec![
            candidate("a", "The quick brown fox", 0.9),
            candidate("b", "the  QUICK brown fox", 0.8),
            candidate("c", "quick brown", 0.7),
            candidate("d", "The quick brown fox jumps", 0.6),
            candidate("e", "lazy dog", 0.5),
        ]);
        assert_eq!(ids(&kept), vec!["a", "e"]);
    }

    #[test]
    fn mmr_with_lambda_one_keeps_score_order() {
        let cands = vec![
            candidate("a", "alpha beta", 0.9),
            candidate("b", "alpha beta gamma", 0.8),
            candidate("c", "delta", 0.8),
            candidate("d", "epsilon", 0.1),
        ];
        let picked = mmr_select(cands, 3, 1.0, DiversityMetric::Lexical);
        assert_eq!(ids(&picked), vec!["a", "b", "c"]);
    }

    #[test]
    fn mmr_prefers_diverse_candidates() {
        let cands = vec![
            candidate("a", "alpha beta", 0.9),
            candidate("b", "alpha beta gamma", 0.85),
            candidate("c", "delta epsilon", 0.6),
        ];
        let picked = mmr_select(cands, 2, 0.5, DiversityMetric::Lexical);
        assert_eq!(ids(&picked), vec!["a", "c"]);
    }

    #[test]
    fn mmr_clamps_lambda_and_caps_at_pool_size() {
        let cands = vec![candidate("a", "x", 0.9), candidate("b", "y", 0.5)];
        let picked = mmr_select(cands.clone(), 10, 7.5, DiversityMetric::Lexical);
        assert_eq!(ids(&picked), vec!["a", "b"]);
        assert!(mmr_select(cands, 0, 0.5, DiversityMetric::Lexical).is_empty());
    }

    #[test]
    fn embedding_diversity_uses_vectors() {
        let mut a = candidate("a", "one", 0.9);
        let mut b = candidate("b", "two", 0.8);
        let mut c = candidate("c", "three", 0.7);
        a.entry.embedding = vec![1.0, 0.0];
        b.entry.embedding = vec![1.0, 0.0];
        c.entry.embedding = vec![0.0, 1.0];

        let picked = mmr_select(vec![a, b, c], 2, 0.5, DiversityMetric::Embedding);
        assert_eq!(ids(&picked), vec!["a", "c"]);
    }
}
