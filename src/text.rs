//! Text normalization, token sets and content hashing shared across modules

use std::collections::HashSet;

use sha2::{Digest, Sha256};

/// Collapse every whitespace run to a single space and trim the ends
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized form used for deduplication: collapsed whitespace, lowercase
pub fn normalize_for_dedup(text: &str) -> String {
    normalize_whitespace(text).to_lowercase()
}

/// Lowercase alphanumeric tokens of `text`, in order of appearance
pub fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Set of lowercase alphanumeric tokens of `text`
pub fn token_set(text: &str) -> HashSet<String> {
    tokens(text).collect()
}

/// Jaccard similarity of two token sets; 0.0 when either side is empty
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f32 / union.max(1) as f32
}

/// Stable content hash used as the dedup key of facts and todos.
///
/// Whitespace and letter case do not change the hash.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(normalize_for_dedup(text).as_bytes());
    hex::encode(&digest[..8])
}

/// [`content_hash`] within an owner's namespace.
///
/// The same text hashes differently for different owners; without an owner
/// this is plain [`content_hash`].
pub fn scoped_content_hash(owner: Option<&str>, text: &str) -> String {
    let Some(owner) = owner.map(str::trim).filter(|o| !o.is_empty()) else {
        return content_hash(text);
    };
    let mut hasher = Sha256::new();
    hasher.update(owner.as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize_for_dedup(text).as_bytes());
    hex::encode(&hasher.finalize()[..8])
}
