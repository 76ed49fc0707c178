//! Rule-based extraction of subject/predicate/object facts from user messages
//!
//! Recognizes first-person statements such as "I love sushi and ramen",
//! "I live in Tallinn" or "я работаю дизайнером", in English and Russian.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const LIKES: &str = "likes";
pub const LIVES_IN: &str = "lives_in";
pub const OWNS: &str = "owns";
pub const WORKS_AS: &str = "works_as";
pub const TRAINS: &str = "trains";

// Captures stop at the end of the sentence
const LIKE_PATTERNS: [&str; 6] = [
    r"(?i)\bI (?:love|like|adore|enjoy)\s+([^.!?\n]+)",
    r"(?i)\bя люблю\s+([^.!?\n]+)",
    r"(?i)\bмне нравится\s+([^.!?\n]+)",
    r"(?i)\bобожаю\s+([^.!?\n]+)",
    r"(?i)\bкайфую от\s+([^.!?\n]+)",
    r"(?i)\bI(?:'m| am) (?:a big )?fan of\s+([^.!?\n]+)",
];

const LIVE_PATTERNS: [&str; 2] = [
    r"(?i)\bI live in\s+([\p{L}\s-]+)",
    r"(?i)\bя живу в\s+([\p{L}\s-]+)",
];

const OWN_PATTERNS: [&str; 4] = [
    r"(?i)\bI own\s+([^.!?\n]+)",
    r"(?i)\bI have (?:a|an)\s+([^.!?\n]+)",
    r"(?i)\bу меня есть\s+([^.!?\n]+)",
    r"(?i)\bя владею\s+([^.!?\n]+)",
];

const WORK_PATTERNS: [&str; 2] = [
    r"(?i)\bI work as (?:a |an )?([^.!?\n]+)",
    r"(?i)\bя работаю\s+([^.!?\n]+)",
];

const TRAIN_PATTERNS: [&str; 2] = [
    r"(?i)\bI (?:train|work out)\s+([^.!?\n]+)",
    r"(?i)\bя тренируюсь\s+([^.!?\n]+)",
];

const FOOD_MARKERS: [&str; 16] = [
    "sushi", "pizza", "pasta", "steak", "poke", "ramen", "apple", "burger", "суши", "пицц",
    "паста", "пасту", "стейк", "поке", "яблок", "яблочк",
];

const COUNTRY_MARKERS: [&str; 16] = [
    "italy", "japan", "portugal", "estonia", "lithuania", "latvia", "iceland", "malta",
    "италия", "япония", "португал", "эстони", "литв", "латв", "исланд", "малта",
];

const VEHICLE_MARKERS: [&str; 8] = [
    "bmw", "ducati", "mercedes", "audi", "porsche", "panigale", "панигале", "tesla",
];

/// One extracted fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub category: Option<String>,
}

impl Triple {
    fn new(subject: &str, predicate: &str, object: String) -> Self {
        Self {
            category: infer_category(predicate, &object).map(str::to_string),
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            object,
        }
    }
}

/// Coarse category of a fact: `food`, `country`, `location` or `vehicle`
pub fn infer_category(predicate: &str, object: &str) -> Option<&'static str> {
    let object = object.trim().to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| object.contains(m));

    if predicate == LIKES {
        if has(&FOOD_MARKERS) {
            return Some("food");
        }
        if has(&COUNTRY_MARKERS) {
            return Some("country");
        }
    }
    if predicate == LIVES_IN {
        return Some("location");
    }
    if predicate == OWNS || has(&VEHICLE_MARKERS) {
        return Some("vehicle");
    }
    None
}

/// Compiled extraction rules
pub struct TripleExtractor {
    likes: Vec<Regex>,
    lives: Vec<Regex>,
    owns: Vec<Regex>,
    works: Vec<Regex>,
    trains: Vec<Regex>,
    list_separator: Regex,
}

impl TripleExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            likes: compile(&LIKE_PATTERNS)?,
            lives: compile(&LIVE_PATTERNS)?,
            owns: compile(&OWN_PATTERNS)?,
            works: compile(&WORK_PATTERNS)?,
            trains: compile(&TRAIN_PATTERNS)?,
            list_separator: compile(&[r"(?i),|\s+and\s+|\s+и\s+"])?.remove(0),
        })
    }

    /// Facts about `subject` stated in `text`, in rule order, without duplicates
    pub fn extract(&self, text: &str, subject: &str) -> Vec<Triple> {
        let mut triples = Vec::new();

        for capture in captures(&self.likes, text) {
            for item in self.split_items(capture) {
                let lower = item.to_lowercase();
                // "I love that I live in ..." is not a preference
                if lower.starts_with("i ") || lower.starts_with("я ") {
                    continue;
                }
                triples.push(Triple::new(subject, LIKES, item));
            }
        }

        for capture in captures(&self.lives, text) {
            if let Some(place) = clean_item(capture) {
                triples.push(Triple::new(subject, LIVES_IN, place.to_lowercase()));
            }
        }

        for capture in captures(&self.owns, text) {
            for item in self.split_items(capture) {
                triples.push(Triple::new(subject, OWNS, item));
            }
        }

        for capture in captures(&self.works, text) {
            if let Some(role) = clean_item(capture) {
                triples.push(Triple::new(subject, WORKS_AS, role));
            }
        }

        for capture in captures(&self.trains, text) {
            if let Some(schedule) = clean_item(capture) {
                triples.push(Triple::new(subject, TRAINS, schedule));
            }
        }

        let mut seen = std::collections::HashSet::new();
        triples.retain(|t| seen.insert((t.predicate.clone(), t.object.to_lowercase())));
        triples
    }

    fn split_items(&self, raw: &str) -> Vec<String> {
        self.list_separator
            .split(raw)
            .filter_map(clean_item)
            .collect()
    }
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| Error::config(format!("bad extraction rule {p}: {e}"))))
        .collect()
}

fn captures<'t>(rules: &'t [Regex], text: &'t str) -> impl Iterator<Item = &'t str> + 't {
    rules
        .iter()
        .filter_map(move |rule| rule.captures(text))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
}

/// Trim punctuation and drop fragments too short to mean anything
fn clean_item(raw: &str) -> Option<String> {
    let item = raw
        .trim()
        .trim_matches(|c: char| matches!(c, '.' | '!' | '?' | ' '))
        .trim();
    if item.contains('?') || item.chars().count() < 3 {
        return None;
    }
    Some(item.split_whitespace().collect::<Vec<_>>().join(" "))
}
