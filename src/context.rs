//! Prompt context assembly under a token budget

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::embedding::TokenCounter;
use crate::memory::{MemoryManager, MetadataFilter, SessionKey};
use crate::profile::ProfileStore;
use crate::retrieval::{Retriever, ScoredBlock, SearchOptions};
use crate::storage::SqliteStorage;
use crate::text::normalize_whitespace;

/// Queries starting with one of these words skip retrieval
const GREETINGS: [&str; 9] = ["hi", "hello", "hey", "привет", "здрав", "qq", "ку", "yo", "sup"];

/// Characters kept when showing a source to the user
pub const DISPLAY_LIMIT: usize = 220;

/// Retrieved context ready for injection into prompts
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalContext {
    /// `USER_PROFILE: ...` line for the filtered user
    pub profile: Option<String>,

    /// Ranked memory blocks that fit the budget
    pub blocks: Vec<ScoredBlock>,

    /// Rolling summary of the conversation
    pub summary: Option<String>,

    /// Recent turns as `role: content` lines
    pub recent: Option<String>,

    /// Total tokens in this context
    pub total_tokens: u32,
}

impl RetrievalContext {
    /// Create an empty context
    pub fn empty() -> Self {
        Self::default()
    }

    /// Check if context is empty
    pub fn is_empty(&self) -> bool {
        self.profile.is_none()
            && self.blocks.is_empty()
            && self.summary.is_none()
            && self.recent.is_none()
    }

    /// Format the context for injection into a prompt
    pub fn format_for_prompt(&self) -> String {
        let mut parts = Vec::new();

        if let Some(profile) = &self.profile {
            parts.push(profile.clone());
        }

        if !self.blocks.is_empty() {
            parts.push(format_blocks(&self.blocks));
        }

        if let Some(summary) = &self.summary {
            parts.push(format!("Conversation summary:\n{summary}"));
        }

        if let Some(recent) = &self.recent {
            parts.push(format!("Recent conversation:\n{recent}"));
        }

        parts.join("\n\n")
    }

    /// Shortened block texts for showing which memories were used
    pub fn sources_for_display(&self) -> Vec<String> {
        self.blocks
            .iter()
            .map(|b| truncate_for_display(&b.text, DISPLAY_LIMIT))
            .collect()
    }
}

fn format_blocks(blocks: &[ScoredBlock]) -> String {
    let texts: Vec<&str> = blocks.iter().map(|b| b.text.as_str()).collect();
    format!("Relevant context (top-k):\n{}", texts.join("\n\n---\n"))
}

/// Context budget manager for tracking token usage
#[derive(Debug, Clone)]
pub struct ContextBudget {
    pub limit: u32,
    pub used: u32,
    pub warning_threshold: f32,
    pub critical_threshold: f32,
}

impl ContextBudget {
    /// Create a new context budget
    pub fn new(limit: u32, warning_threshold: f32, critical_threshold: f32) -> Self {
        Self {
            limit,
            used: 0,
            warning_threshold,
            critical_threshold,
        }
    }

    /// Reserve `tokens` if they fit in what remains
    pub fn try_add(&mut self, tokens: u32) -> bool {
        if tokens > self.remaining() {
            return false;
        }
        self.used += tokens;
        true
    }

    /// Get utilization percentage
    pub fn utilization(&self) -> f32 {
        if self.limit == 0 {
            return 1.0;
        }
        self.used as f32 / self.limit as f32
    }

    /// Get remaining tokens
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    /// Get status string
    pub fn status(&self) -> &'static str {
        let utilization = self.utilization();
        if utilization >= self.critical_threshold {
            "critical"
        } else if utilization >= self.warning_threshold {
            "warning"
        } else {
            "ok"
        }
    }
}

/// Whether `query` is a greeting or too short to be worth a memory lookup
pub fn is_smalltalk(query: &str) -> bool {
    let query = query.trim();
    if query.chars().count() < 5 {
        return true;
    }
    let first_word: String = query
        .chars()
        .take_while(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    GREETINGS.contains(&first_word.as_str())
}

/// Collapse whitespace and cut to `limit` characters, marking the cut with `…`
pub fn truncate_for_display(text: &str, limit: usize) -> String {
    let text = normalize_whitespace(text);
    if text.chars().count() <= limit {
        return text;
    }
    let head: String = text.chars().take(limit).collect();
    format!("{}…", head.trim_end())
}

/// Builds prompt context from retrieval results and short-term memory
pub struct ContextBuilder {
    retriever: Arc<Retriever>,
    memory: Arc<MemoryManager>,
    counter: Option<TokenCounter>,
    options: SearchOptions,
    min_score: f32,
    max_tokens: u32,
    summaries: Option<Arc<SqliteStorage>>,
    profiles: Option<ProfileStore>,
}

impl ContextBuilder {
    pub fn new(retriever: Arc<Retriever>, memory: Arc<MemoryManager>, config: &Config) -> Self {
        let counter = match TokenCounter::cl100k() {
            Ok(counter) => Some(counter),
            Err(e) => {
                warn!(error = %e, "tokenizer unavailable, estimating token counts");
                None
            }
        };

        Self {
            retriever,
            counter,
            options: SearchOptions::from_config(config),
            min_score: config.min_score_for(memory.store().backend()),
            memory,
            max_tokens: config.context_max_tokens,
            summaries: None,
            profiles: None,
        }
    }

    /// Look up persisted summaries when the in-process cache has none
    pub fn with_summary_store(mut self, storage: Arc<SqliteStorage>) -> Self {
        self.summaries = Some(storage);
        self
    }

    /// Prepend the filtered user's profile to every context
    pub fn with_profiles(mut self, profiles: ProfileStore) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// The tldr recorded for exactly this conversation, if any
    fn recorded_summary(&self, session: &SessionKey) -> Option<String> {
        let record = self.memory.latest_summary(session).or_else(|| {
            let storage = self.summaries.as_ref()?;
            storage
                .get_summary(&session.user_id, &session.session_id)
                .map_err(|e| warn!(error = %e, "failed to load conversation summary"))
                .ok()
                .flatten()
        })?;
        Some(record.tldr).filter(|tldr| !tldr.trim().is_empty())
    }

    fn profile_block(&self, user_id: &str) -> Option<String> {
        let profiles = self.profiles.as_ref()?;
        profiles
            .prompt_block(user_id)
            .map_err(|e| warn!(error = %e, user_id, "failed to load user profile"))
            .ok()
            .flatten()
    }

    fn count(&self, text: &str) -> u32 {
        match &self.counter {
            Some(counter) => counter.count(text),
            None => TokenCounter::estimate(text),
        }
    }

    /// Assemble context for `query`.
    ///
    /// The user's profile is charged first. Blocks are added in rank order
    /// until the next one would exceed the budget; the conversation summary
    /// and then the recent turns follow if they still fit. Greetings and very
    /// short queries skip retrieval.
    ///
    /// The profile and recorded summary are looked up from the `user_id` and
    /// `session_id` in `filter`; without them only the short-term ring is
    /// summarized.
    pub async fn build(
        &self,
        query: &str,
        k: usize,
        max_tokens: Option<u32>,
        filter: Option<MetadataFilter>,
    ) -> RetrievalContext {
        let mut budget = ContextBudget::new(max_tokens.unwrap_or(self.max_tokens), 0.8, 0.95);
        let mut context = RetrievalContext::empty();

        let session = filter.as_ref().and_then(SessionKey::from_filter);
        let user_id = filter
            .as_ref()
            .and_then(|f| f.0.get("user_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if let Some(profile) = user_id.as_deref().and_then(|u| self.profile_block(u)) {
            if budget.try_add(self.count(&profile)) {
                context.profile = Some(profile);
            }
        }

        if is_smalltalk(query) {
            debug!("small talk, skipping retrieval");
        } else {
            let options = SearchOptions {
                metadata_filter: filter,
                score_threshold: Some(self.min_score),
                ..self.options.clone()
            };
            let blocks = self.retriever.search(query, k, &options).await;

            // Header and separators are charged up front
            let overhead = self.count(&format_blocks(&[]));
            if !blocks.is_empty() && budget.try_add(overhead) {
                for block in blocks {
                    let cost = self.count(&block.text) + self.count("\n\n---\n");
                    if !budget.try_add(cost) {
                        break;
                    }
                    context.blocks.push(block);
                }
                if context.blocks.is_empty() {
                    budget.used -= overhead;
                }
            }
        }

        let has_turns = !self.memory.turns().is_empty();
        let summary = match session.as_ref().and_then(|s| self.recorded_summary(s)) {
            Some(tldr) => Some(tldr),
            None if has_turns => Some(self.memory.short_summary(None)),
            None => None,
        };
        if let Some(summary) = summary {
            if budget.try_add(self.count(&summary)) {
                context.summary = Some(summary);
            }
        }

        if has_turns {
            let recent = self.memory.short_context();
            if budget.try_add(self.count(&recent)) {
                context.recent = Some(recent);
            }
        }

        context.total_tokens = budget.used;
        debug!(
            blocks = context.blocks.len(),
            tokens = budget.used,
            status = budget.status(),
            "assembled context"
        );
        context
    }
}
