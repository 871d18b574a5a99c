//! Translation orchestration: normalization, two-tier caching, request
//! coalescing, batching and provider fallback.

pub mod batch;
pub mod cache;
pub mod coalescer;
pub mod engine;
pub mod glossary;
pub mod known;
pub mod normalize;
pub mod queue;
pub mod service;
pub mod store;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use engine::EngineKind;

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum ResultSource {
    /// Static phrase table.
    Dictionary,
    Engine(EngineKind),
}

impl fmt::Display for ResultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultSource::Dictionary => f.write_str("dict"),
            ResultSource::Engine(kind) => f.write_str(kind.name()),
        }
    }
}

impl From<ResultSource> for String {
    fn from(source: ResultSource) -> Self {
        source.to_string()
    }
}

/// Outcome of translating one text. `translation` is `None` whenever no
/// usable translation exists, including negative cache hits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationResult {
    pub translation: Option<String>,
    pub engine: Option<ResultSource>,
    pub from_cache: bool,
}

impl TranslationResult {
    pub fn empty() -> Self {
        Self {
            translation: None,
            engine: None,
            from_cache: false,
        }
    }

    pub fn new(translation: Option<String>, engine: Option<ResultSource>, from_cache: bool) -> Self {
        Self {
            translation,
            engine,
            from_cache,
        }
    }
}

/// Streamed notification for one resolved text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialResult {
    /// Prepared source text.
    pub source: String,
    pub translation: String,
    pub engine: ResultSource,
}

pub type PartialListener = Arc<dyn Fn(PartialResult) + Send + Sync>;

/// Which part of the page a request comes from. Only used to keep queued
/// requests from different areas in separate provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Area {
    #[default]
    Page,
    Captions,
}

/// Per-call translation options.
#[derive(Clone)]
pub struct TranslateOptions {
    /// Falls back to the configured target language.
    pub target_language: Option<String>,
    /// Falls back to `"auto"`.
    pub source_language: Option<String>,
    pub area: Area,
    /// Overrides the configured default engine.
    pub engine: Option<EngineKind>,
    pub skip_dictionary: bool,
    /// Skip texts already known to be translations into the target language.
    pub skip_known_translated: bool,
    pub title_case: bool,
    pub on_partial: Option<PartialListener>,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            target_language: None,
            source_language: None,
            area: Area::Page,
            engine: None,
            skip_dictionary: false,
            skip_known_translated: true,
            title_case: false,
            on_partial: None,
        }
    }
}

impl fmt::Debug for TranslateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslateOptions")
            .field("target_language", &self.target_language)
            .field("source_language", &self.source_language)
            .field("area", &self.area)
            .field("engine", &self.engine)
            .field("skip_dictionary", &self.skip_dictionary)
            .field("skip_known_translated", &self.skip_known_translated)
            .field("title_case", &self.title_case)
            .field("on_partial", &self.on_partial.is_some())
            .finish()
    }
}

impl TranslateOptions {
    pub fn to(target_language: impl Into<String>) -> Self {
        Self {
            target_language: Some(target_language.into()),
            ..Self::default()
        }
    }

    pub fn source_language_or_auto(&self) -> &str {
        self.source_language.as_deref().unwrap_or("auto")
    }

    pub(crate) fn notify(&self, partial: impl FnOnce() -> PartialResult) {
        if let Some(listener) = &self.on_partial {
            listener(partial());
        }
    }
}

/// Provider failure. Never escapes the public translation surface; the
/// service logs it and moves on to the next engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TranslateError {
    #[error("API error: {0}")]
    Api(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("translation timeout")]
    Timeout,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}
