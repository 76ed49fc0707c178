//! Conversation turns and the bounded short-term buffer

use std::collections::VecDeque;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(Error::invalid_input(format!("Unknown role: {other}"))),
        }
    }
}

/// A single turn held in short-term memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Fixed-capacity ring of recent turns; the oldest turn is evicted first
#[derive(Debug, Clone)]
pub struct ShortTermBuffer {
    turns: VecDeque<Turn>,
    capacity: usize,
}

impl ShortTermBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, turn: Turn) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Render as `role: content` lines, oldest first
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_first() {
        let mut buffer = ShortTermBuffer::new(2);
        buffer.push(Turn::new(Role::User, "one"));
        buffer.push(Turn::new(Role::Assistant, "two"));
        buffer.push(Turn::new(Role::User, "three"));

        assert_eq!(buffer.iter().count(), 2);
        assert_eq!(buffer.render(), "assistant: two\nuser: three");
    }

    #[test]
    fn zero_capacity_still_keeps_the_latest_turn() {
        let mut buffer = ShortTermBuffer::new(0);
        buffer.push(Turn::new(Role::User, "a"));
        buffer.push(Turn::new(Role::User, "b"));
        assert_eq!(buffer.render(), "user: b");
    }

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("User".parse::<Role>().unwrap(), Role::User);
        assert_eq!(" assistant ".parse::<Role>().unwrap(), Role::Assistant);
        assert!("system".parse::<Role>().is_err());
    }
}
