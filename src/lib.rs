//! Transcache: translation request orchestration.
//! Coalesces duplicate requests, batches texts per provider limits, walks a
//! provider fallback chain and keeps results in a two-tier cache.

pub mod config;
pub mod metrics;
pub mod translate;

pub use config::{CacheSettings, ConfigError, Settings, SettingsSource};
pub use metrics::{MetricSummary, MetricsRegistry};
pub use translate::engine::{EngineKind, EngineRegistry, EngineRequest, ProviderCredentials, TranslationEngine};
pub use translate::glossary::{Dictionary, Glossary, GlossaryError, PhraseBook};
pub use translate::service::{ServiceBuilder, TranslationService};
pub use translate::store::{DurableStore, MemoryStore, SqliteStore, StoreError};
pub use translate::{
    Area, PartialListener, PartialResult, ResultSource, TranslateError, TranslateOptions, TranslationResult,
};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Install the fmt subscriber. `RUST_LOG` overrides the default filter.
/// Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("transcache=info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
