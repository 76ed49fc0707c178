//! Durable per-user profiles: name, preferences, known facts and goals

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::SqliteStorage;

const PROMPT_PREFERENCES: usize = 5;
const PROMPT_FACTS: usize = 6;
const PROMPT_GOALS: usize = 3;

fn default_status() -> String {
    "active".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub title: String,
    #[serde(default = "default_status")]
    pub status: String,
    /// 0.0 - 1.0
    #[serde(default)]
    pub progress: f32,
}

/// What the assistant knows about a user across conversations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preferences: BTreeMap<String, Value>,
    #[serde(default)]
    pub facts: BTreeMap<String, Value>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: None,
            preferences: BTreeMap::new(),
            facts: BTreeMap::new(),
            goals: Vec::new(),
            updated_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.as_deref().map_or(true, |n| n.trim().is_empty())
            && self.preferences.is_empty()
            && self.facts.is_empty()
            && self.goals.is_empty()
    }

    /// Merge a patch: scalars and goals are replaced, maps are merged key by key
    pub fn apply(&mut self, patch: ProfilePatch) {
        if let Some(name) = patch.name {
            self.name = Some(name);
        }
        if let Some(preferences) = patch.preferences {
            self.preferences.extend(preferences);
        }
        if let Some(facts) = patch.facts {
            self.facts.extend(facts);
        }
        if let Some(goals) = patch.goals {
            self.goals = goals;
        }
    }

    /// One-line `USER_PROFILE: ...` summary for prompts; `None` for an empty
    /// profile
    pub fn prompt_block(&self) -> Option<String> {
        let mut parts = Vec::new();

        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            parts.push(format!("name={}", name.trim()));
        }
        if !self.preferences.is_empty() {
            parts.push(format!("prefs={}", pairs(&self.preferences, PROMPT_PREFERENCES)));
        }
        if !self.facts.is_empty() {
            parts.push(format!("facts={}", pairs(&self.facts, PROMPT_FACTS)));
        }
        if !self.goals.is_empty() {
            let titles: Vec<&str> = self
                .goals
                .iter()
                .take(PROMPT_GOALS)
                .map(|g| if g.title.is_empty() { g.id.as_str() } else { g.title.as_str() })
                .collect();
            parts.push(format!("goals={}", titles.join("; ")));
        }

        if parts.is_empty() {
            None
        } else {
            Some(format!("USER_PROFILE: {}", parts.join(" | ")))
        }
    }
}

fn pairs(map: &BTreeMap<String, Value>, limit: usize) -> String {
    map.iter()
        .take(limit)
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}:{s}"),
            other => format!("{k}:{other}"),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Partial profile update; absent fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub preferences: Option<BTreeMap<String, Value>>,
    pub facts: Option<BTreeMap<String, Value>>,
    pub goals: Option<Vec<Goal>>,
}

/// Profiles persisted in the records database
#[derive(Clone)]
pub struct ProfileStore {
    storage: Arc<SqliteStorage>,
}

impl ProfileStore {
    pub fn new(storage: Arc<SqliteStorage>) -> Self {
        Self { storage }
    }

    /// The stored profile, or an empty one for an unknown user
    pub fn get(&self, user_id: &str) -> Result<UserProfile> {
        let user_id = checked_user(user_id)?;
        Ok(self
            .storage
            .get_profile(user_id)?
            .unwrap_or_else(|| UserProfile::new(user_id)))
    }

    /// Apply `patch` to the stored profile and return the result
    pub fn patch(&self, user_id: &str, patch: ProfilePatch) -> Result<UserProfile> {
        let user_id = checked_user(user_id)?;
        let profile = self.storage.update_profile(user_id, |profile| {
            profile.apply(patch);
            profile.updated_at = Some(Utc::now());
        })?;
        debug!(user_id, "profile patched");
        Ok(profile)
    }

    /// Replace the stored profile
    pub fn put(&self, mut profile: UserProfile) -> Result<UserProfile> {
        profile.user_id = checked_user(&profile.user_id)?.to_string();
        profile.updated_at = Some(Utc::now());
        self.storage.save_profile(&profile)?;
        debug!(user_id = %profile.user_id, "profile replaced");
        Ok(profile)
    }

    /// The prompt block for a user, if they have a non-empty profile
    pub fn prompt_block(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.get(user_id)?.prompt_block())
    }
}

fn checked_user(user_id: &str) -> Result<&str> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(Error::invalid_input("user_id must not be empty"));
    }
    Ok(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, ProfileStore) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("records.db")).unwrap();
        (dir, ProfileStore::new(Arc::new(storage)))
    }

    fn goal(id: &str, title: &str) -> Goal {
        Goal {
            id: id.into(),
            title: title.into(),
            status: default_status(),
            progress: 0.0,
        }
    }

    #[test]
    fn unknown_user_gets_an_empty_profile() {
        let (_dir, store) = store();
        let profile = store.get("alice").unwrap();
        assert_eq!(profile.user_id, "alice");
        assert!(profile.is_empty());
        assert_eq!(store.prompt_block("alice").unwrap(), None);
        assert!(matches!(store.get("  "), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn patches_merge_maps_and_replace_goals() {
        let (_dir, store) = store();
        store
            .patch(
                "alice",
                ProfilePatch {
                    name: Some("Alice".into()),
                    preferences: Some(BTreeMap::from([("lang".into(), json!("en"))])),
                    goals: Some(vec![goal("g1", "Run a marathon")]),
                    ..Default::default()
                },
            )
            .unwrap();

        let profile = store
            .patch(
                "alice",
                ProfilePatch {
                    preferences: Some(BTreeMap::from([("tone".into(), json!("brief"))])),
                    facts: Some(BTreeMap::from([("city".into(), json!("Tallinn"))])),
                    goals: Some(vec![goal("g2", "Learn Rust")]),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(profile.name.as_deref(), Some("Alice"));
        assert_eq!(profile.preferences.len(), 2);
        assert_eq!(profile.goals, vec![goal("g2", "Learn Rust")]);
        assert!(profile.updated_at.is_some());
        assert_eq!(store.get("alice").unwrap(), profile);
    }

    #[test]
    fn put_replaces_the_whole_profile() {
        let (_dir, store) = store();
        store
            .patch(
                "bob",
                ProfilePatch {
                    facts: Some(BTreeMap::from([("pet".into(), json!("cat"))])),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut replacement = UserProfile::new("bob");
        replacement.name = Some("Bob".into());
        store.put(replacement).unwrap();

        let profile = store.get("bob").unwrap();
        assert_eq!(profile.name.as_deref(), Some("Bob"));
        assert!(profile.facts.is_empty());
    }

    #[test]
    fn prompt_block_lists_profile_parts() {
        let mut profile = UserProfile::new("alice");
        profile.name = Some("Alice".into());
        profile.preferences.insert("lang".into(), json!("en"));
        profile.facts.insert("age".into(), json!(34));
        profile.goals = vec![
            goal("g1", "Run a marathon"),
            goal("g2", "Learn Rust"),
            goal("g3", ""),
            goal("g4", "Ignored"),
        ];

        assert_eq!(
            profile.prompt_block().as_deref(),
            Some("USER_PROFILE: name=Alice | prefs=lang:en | facts=age:34 | goals=Run a marathon; Learn Rust; g3")
        );
    }
}
