//! Static phrase tables that override providers.
//! Loads per-language term pairs from JSON and answers exact, lower-cased
//! and whitespace-collapsed lookups.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Synchronous phrase-table lookup consulted before cache and providers.
pub trait Dictionary: Send + Sync {
    fn lookup(&self, text: &str, target_language: &str) -> Option<String>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlossaryEntry {
    pub source: String,
    pub target: String,
}

/// On-disk glossary file format.
#[derive(Debug, Deserialize)]
struct GlossaryFile {
    #[serde(default)]
    version: u32,
    language: String,
    entries: Vec<GlossaryEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum GlossaryError {
    #[error("glossary IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("glossary parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

fn collapse(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").to_lowercase()
}

/// Term pairs for one target language.
#[derive(Debug)]
pub struct Glossary {
    version: u32,
    language: String,
    exact: HashMap<String, String>,
    lower: HashMap<String, String>,
    collapsed: HashMap<String, String>,
}

impl Glossary {
    pub fn new(language: impl Into<String>, entries: Vec<GlossaryEntry>) -> Self {
        let mut glossary = Self {
            version: 0,
            language: language.into(),
            exact: HashMap::new(),
            lower: HashMap::new(),
            collapsed: HashMap::new(),
        };
        for entry in entries {
            // First entry wins for the folded forms.
            glossary
                .lower
                .entry(entry.source.to_lowercase())
                .or_insert_with(|| entry.target.clone());
            glossary
                .collapsed
                .entry(collapse(&entry.source))
                .or_insert_with(|| entry.target.clone());
            glossary.exact.insert(entry.source, entry.target);
        }
        glossary
    }

    pub fn from_json(content: &str) -> Result<Self, GlossaryError> {
        let file: GlossaryFile = serde_json::from_str(content)?;
        let mut glossary = Self::new(file.language, file.entries);
        glossary.version = file.version;
        Ok(glossary)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, GlossaryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    /// Exact match, then lower-cased, then lower-cased with whitespace
    /// runs collapsed.
    pub fn get(&self, text: &str) -> Option<&str> {
        if text.is_empty() {
            return None;
        }
        self.exact
            .get(text)
            .or_else(|| self.lower.get(&text.to_lowercase()))
            .or_else(|| self.collapsed.get(&collapse(text)))
            .map(String::as_str)
    }
}

/// Glossaries grouped by target language.
#[derive(Default)]
pub struct PhraseBook {
    glossaries: HashMap<String, Glossary>,
}

impl PhraseBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_glossary(mut self, glossary: Glossary) -> Self {
        self.insert(glossary);
        self
    }

    /// Replaces any glossary already loaded for the same language.
    pub fn insert(&mut self, glossary: Glossary) {
        self.glossaries.insert(glossary.language.clone(), glossary);
    }

    /// Load every `*.json` file in `dir`. Unreadable files are skipped.
    pub fn load_dir(dir: &Path) -> Result<Self, GlossaryError> {
        let mut book = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Glossary::load_from_file(&path) {
                Ok(glossary) => {
                    tracing::info!(
                        path = %path.display(),
                        language = glossary.language(),
                        entries = glossary.len(),
                        "glossary loaded"
                    );
                    book.insert(glossary);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping glossary"),
            }
        }
        Ok(book)
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.glossaries.keys().map(String::as_str)
    }
}

impl Dictionary for PhraseBook {
    fn lookup(&self, text: &str, target_language: &str) -> Option<String> {
        self.glossaries
            .get(target_language)
            .and_then(|g| g.get(text))
            .map(str::to_string)
    }
}
