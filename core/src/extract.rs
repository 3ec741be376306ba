use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use unicode_normalization::UnicodeNormalization;

use crate::error::ExtractionError;

/// Default character budget per document. Keeps extractor memory bounded.
pub const MAX_CHAR_NUM: usize = 1_000_000;

pub const PERSON: &str = "PERSON";

lazy_static! {
    // Two or more capitalized words separated by blanks: "John Doe", "Ada King Lovelace".
    static ref PROPER_NOUN_RUN: Regex = Regex::new(r"\b\p{Lu}\p{Ll}+(?:[ \t]+\p{Lu}\p{Ll}+)+\b").expect("valid regex");
}

/// Term counts of one document, in order of first occurrence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub terms: IndexMap<String, u64>,
    /// Number of matched entity occurrences; the tf denominator.
    pub total: u64,
}

impl Extraction {
    pub fn from_occurrences<I, S>(occurrences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut extraction = Self::default();
        for term in occurrences {
            *extraction.terms.entry(term.into()).or_insert(0) += 1;
            extraction.total += 1;
        }
        extraction
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Named-entity extraction. Implementations must be deterministic for identical
/// input; they are called from blocking worker threads.
pub trait EntityExtractor: Send + Sync + 'static {
    fn extract(&self, text: &str, allowed_categories: &HashSet<String>) -> Result<Extraction, ExtractionError>;
}

/// NFKC-normalize, truncate to `max_chars` and fold line breaks into single spaces.
///
/// The limit applies to the normalized text, so the result never exceeds it.
pub fn prepare_document(text: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(text.len().min(max_chars));
    let mut chars = text.nfkc().take(max_chars).peekable();
    while let Some(c) = chars.next() {
        if c == '\n' || c == '\r' {
            let before = out.chars().last().map_or(true, char::is_whitespace);
            let after = chars.peek().map_or(true, |n| n.is_whitespace());
            if !before && !after {
                out.push(' ');
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// Heuristic extractor: every run of at least two capitalized words is a PERSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProperNounExtractor;

impl EntityExtractor for ProperNounExtractor {
    fn extract(&self, text: &str, allowed_categories: &HashSet<String>) -> Result<Extraction, ExtractionError> {
        if !allowed_categories.contains(PERSON) {
            return Ok(Extraction::default());
        }
        Ok(Extraction::from_occurrences(PROPER_NOUN_RUN.find_iter(text).map(|m| m.as_str())))
    }
}

/// Dictionary extractor over a fixed entity -> category list.
#[derive(Debug, Clone)]
pub struct Gazetteer {
    categories: HashMap<String, String>,
    pattern: Option<Regex>,
}

impl Gazetteer {
    pub fn new(categories: HashMap<String, String>) -> Result<Self, ExtractionError> {
        let mut entries: Vec<&str> = categories.keys().map(String::as_str).filter(|e| !e.trim().is_empty()).collect();
        // longest first so "Ada Lovelace" wins over "Ada"
        entries.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        let pattern = if entries.is_empty() {
            None
        } else {
            let alternation = entries.iter().map(|e| regex::escape(e)).collect::<Vec<_>>().join("|");
            let re = Regex::new(&format!(r"\b(?:{alternation})\b")).map_err(|e| ExtractionError::Gazetteer(e.to_string()))?;
            Some(re)
        };
        Ok(Self { categories, pattern })
    }

    /// Load a JSON object mapping entity strings to categories.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ExtractionError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ExtractionError::Gazetteer(format!("{}: {e}", path.as_ref().display())))?;
        let categories: HashMap<String, String> =
            serde_json::from_str(&raw).map_err(|e| ExtractionError::Gazetteer(e.to_string()))?;
        Self::new(categories)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

impl EntityExtractor for Gazetteer {
    fn extract(&self, text: &str, allowed_categories: &HashSet<String>) -> Result<Extraction, ExtractionError> {
        let Some(pattern) = &self.pattern else { return Ok(Extraction::default()) };
        let matches = pattern.find_iter(text).map(|m| m.as_str()).filter(|term| {
            self.categories.get(*term).is_some_and(|category| allowed_categories.contains(category))
        });
        Ok(Extraction::from_occurrences(matches))
    }
}

/// The gazetteer at `path` when one is given, the proper-noun heuristic otherwise.
pub fn load_extractor(gazetteer: Option<&Path>) -> Result<Arc<dyn EntityExtractor>, ExtractionError> {
    match gazetteer {
        Some(path) => {
            let gazetteer = Gazetteer::from_json_file(path)?;
            tracing::info!(path = %path.display(), entries = gazetteer.len(), "loaded gazetteer");
            Ok(Arc::new(gazetteer))
        }
        None => Ok(Arc::new(ProperNounExtractor)),
    }
}
