//! Sliding-window text chunking

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::text::normalize_whitespace;

/// A window of the whitespace-normalized source text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub index: usize,
}

/// Split `text` into overlapping windows of `size` characters.
///
/// Whitespace runs are collapsed first. Window `i` starts at character
/// `i * (size - overlap)`; the last window is clipped to the end of the text.
/// Empty or whitespace-only input yields no chunks.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    if size == 0 {
        return Err(Error::invalid_input("chunk size must be greater than zero"));
    }
    if overlap >= size {
        return Err(Error::invalid_input(format!(
            "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
        )));
    }

    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Ok(Vec::new());
    }

    // Work on chars so windows never split a UTF-8 sequence
    let chars: Vec<char> = normalized.chars().collect();
    let step = size - overlap;
    let len = chars.len();

    let mut chunks = Vec::with_capacity(len / step + 1);
    let mut start = 0;
    while start < len {
        let end = (start + size).min(len);
        chunks.push(Chunk {
            text: chars[start..end].iter().collect(),
            index: chunks.len(),
        });
        if end == len {
            break;
        }
        start += step;
    }

    Ok(chunks)
}
