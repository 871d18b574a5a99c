//! Provider capability contract, the closed set of provider kinds, and the
//! fallback chain resolver.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{TranslateError, TranslateOptions};
use crate::config::Settings;

pub const DEFAULT_MAX_ITEMS_PER_REQUEST: usize = 25;
pub const DEFAULT_MAX_CHARS_PER_REQUEST: usize = 4000;

/// The providers the service knows how to route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Google,
    Microsoft,
    Deepl,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [EngineKind::Google, EngineKind::Microsoft, EngineKind::Deepl];

    pub fn name(self) -> &'static str {
        match self {
            EngineKind::Google => "google",
            EngineKind::Microsoft => "microsoft",
            EngineKind::Deepl => "deepl",
        }
    }

    /// Batches dispatched in parallel when this engine heads the chain.
    /// DeepL rate-limits aggressively, so it gets fewer workers.
    pub fn max_concurrent_batches(self) -> usize {
        match self {
            EngineKind::Deepl => 2,
            EngineKind::Google | EngineKind::Microsoft => 3,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EngineKind {
    type Err = TranslateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(EngineKind::Google),
            "microsoft" => Ok(EngineKind::Microsoft),
            "deepl" => Ok(EngineKind::Deepl),
            other => Err(TranslateError::InvalidInput(format!("unknown engine: {other}"))),
        }
    }
}

/// Credentials forwarded to a provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCredentials {
    None,
    Deepl {
        api_key: String,
        endpoint_mode: String,
    },
    Microsoft {
        api_key: String,
        region: String,
        use_azure: bool,
    },
}

impl ProviderCredentials {
    pub fn for_engine(kind: EngineKind, settings: &Settings) -> Self {
        match kind {
            EngineKind::Google => ProviderCredentials::None,
            EngineKind::Deepl => ProviderCredentials::Deepl {
                api_key: settings.deepl.api_key.trim().to_string(),
                endpoint_mode: settings.deepl.endpoint_mode.clone(),
            },
            EngineKind::Microsoft => ProviderCredentials::Microsoft {
                api_key: settings.microsoft.api_key.clone(),
                region: settings.microsoft.region.clone(),
                use_azure: settings.microsoft.use_azure,
            },
        }
    }
}

/// Per-call options handed to a provider.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub source_language: String,
    pub target_language: String,
    pub credentials: ProviderCredentials,
}

/// A translation provider. Output must be aligned with `texts`; `None`
/// marks a text the provider could not translate.
#[async_trait]
pub trait TranslationEngine: Send + Sync {
    fn max_items_per_request(&self) -> usize {
        DEFAULT_MAX_ITEMS_PER_REQUEST
    }

    fn max_chars_per_request(&self) -> usize {
        DEFAULT_MAX_CHARS_PER_REQUEST
    }

    async fn translate(
        &self,
        texts: &[String],
        request: &EngineRequest,
    ) -> Result<Vec<Option<String>>, TranslateError>;
}

/// Engines available to the service, keyed by kind.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<EngineKind, Arc<dyn TranslationEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(mut self, kind: EngineKind, engine: Arc<dyn TranslationEngine>) -> Self {
        self.register(kind, engine);
        self
    }

    pub fn register(&mut self, kind: EngineKind, engine: Arc<dyn TranslationEngine>) {
        self.engines.insert(kind, engine);
    }

    pub fn get(&self, kind: EngineKind) -> Option<&Arc<dyn TranslationEngine>> {
        self.engines.get(&kind)
    }

    pub fn contains(&self, kind: EngineKind) -> bool {
        self.engines.contains_key(&kind)
    }
}

/// Ordered engines to try for one request. Starts with the per-call engine
/// (or the configured default), then appends `fallback_order` when the
/// selected engine permits fallback. Unregistered and uncredentialed engines
/// never appear. An empty chain means no translation can be produced.
pub fn resolve_chain(
    settings: &Settings,
    options: &TranslateOptions,
    registry: &EngineRegistry,
) -> Vec<EngineKind> {
    let selected = options.engine.unwrap_or(settings.engine);
    let mut chain = Vec::with_capacity(EngineKind::ALL.len());
    let mut add = |kind: EngineKind| {
        if chain.contains(&kind) || !registry.contains(kind) || !settings.has_credentials(kind) {
            return;
        }
        chain.push(kind);
    };

    add(selected);
    if settings.allows_fallback_from(selected) {
        for &kind in &settings.fallback_order {
            add(kind);
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl TranslationEngine for Nop {
        async fn translate(
            &self,
            texts: &[String],
            _request: &EngineRequest,
        ) -> Result<Vec<Option<String>>, TranslateError> {
            Ok(vec![None; texts.len()])
        }
    }

    fn full_registry() -> EngineRegistry {
        EngineKind::ALL
            .iter()
            .fold(EngineRegistry::new(), |reg, &kind| reg.with_engine(kind, Arc::new(Nop)))
    }

    #[test]
    fn default_chain_follows_fallback_order() {
        let settings = Settings::default();
        let chain = resolve_chain(&settings, &TranslateOptions::default(), &full_registry());
        // DeepL has no key by default.
        assert_eq!(chain, vec![EngineKind::Google, EngineKind::Microsoft]);
    }

    #[test]
    fn uncredentialed_default_is_excluded() {
        let mut settings = Settings::default();
        settings.engine = EngineKind::Deepl;
        let chain = resolve_chain(&settings, &TranslateOptions::default(), &full_registry());
        assert_eq!(chain.first(), Some(&EngineKind::Google));
        assert!(!chain.contains(&EngineKind::Deepl));
    }

    #[test]
    fn credentialed_deepl_leads_and_others_follow() {
        let mut settings = Settings::default();
        settings.engine = EngineKind::Deepl;
        settings.deepl.api_key = "secret".into();
        let chain = resolve_chain(&settings, &TranslateOptions::default(), &full_registry());
        assert_eq!(chain, vec![EngineKind::Deepl, EngineKind::Google, EngineKind::Microsoft]);
    }

    #[test]
    fn fallback_flag_pins_the_selected_engine() {
        let mut settings = Settings::default();
        settings.engine = EngineKind::Deepl;
        settings.deepl.api_key = "secret".into();
        settings.deepl.fallback_to_google = false;
        let chain = resolve_chain(&settings, &TranslateOptions::default(), &full_registry());
        assert_eq!(chain, vec![EngineKind::Deepl]);

        settings.deepl.api_key.clear();
        let chain = resolve_chain(&settings, &TranslateOptions::default(), &full_registry());
        assert!(chain.is_empty());
    }

    #[test]
    fn per_call_override_wins() {
        let settings = Settings::default();
        let options = TranslateOptions {
            engine: Some(EngineKind::Microsoft),
            ..TranslateOptions::default()
        };
        let chain = resolve_chain(&settings, &options, &full_registry());
        assert_eq!(chain, vec![EngineKind::Microsoft, EngineKind::Google]);
    }

    #[test]
    fn unregistered_engines_are_skipped() {
        let registry = EngineRegistry::new().with_engine(EngineKind::Microsoft, Arc::new(Nop));
        let chain = resolve_chain(&Settings::default(), &TranslateOptions::default(), &registry);
        assert_eq!(chain, vec![EngineKind::Microsoft]);
        assert!(resolve_chain(&Settings::default(), &TranslateOptions::default(), &EngineRegistry::new())
            .is_empty());
    }

    #[test]
    fn engine_names_parse() {
        assert_eq!("DeepL".parse::<EngineKind>().unwrap(), EngineKind::Deepl);
        assert!("yandex".parse::<EngineKind>().is_err());
    }
}
