//! Runtime settings consumed by the translation service.
//! Loaded from JSON (camelCase keys, every field optional) and published to
//! the service through a watch channel so changes apply without a restart.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::translate::engine::EngineKind;

/// Default positive TTL: 7 days.
pub const DEFAULT_CACHE_TTL_MS: u64 = 7 * 24 * 3600 * 1000;
/// Negative entries expire quickly so provider outages heal on their own.
pub const DEFAULT_NEGATIVE_TTL_MS: u64 = 2 * 60 * 1000;
pub const DEFAULT_MAX_ENTRIES: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("settings IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enabled: bool,
    pub target_language: String,
    /// Engine tried first unless a call overrides it.
    pub engine: EngineKind,
    /// Order in which the remaining engines are appended as fallbacks.
    pub fallback_order: Vec<EngineKind>,
    pub cache: CacheSettings,
    pub google: GoogleSettings,
    pub deepl: DeeplSettings,
    pub microsoft: MicrosoftSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_language: "en".into(),
            engine: EngineKind::Google,
            fallback_order: EngineKind::ALL.to_vec(),
            cache: CacheSettings::default(),
            google: GoogleSettings::default(),
            deepl: DeeplSettings::default(),
            microsoft: MicrosoftSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Whether `kind` has the credentials it needs to be called at all.
    pub fn has_credentials(&self, kind: EngineKind) -> bool {
        match kind {
            EngineKind::Deepl => !self.deepl.api_key.trim().is_empty(),
            EngineKind::Google | EngineKind::Microsoft => true,
        }
    }

    /// Whether a request pinned to `kind` may fall through to other engines.
    pub fn allows_fallback_from(&self, kind: EngineKind) -> bool {
        match kind {
            EngineKind::Google => self.google.allow_fallback,
            EngineKind::Deepl => self.deepl.fallback_to_google,
            EngineKind::Microsoft => self.microsoft.allow_fallback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl_ms: u64,
    pub negative_ttl_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl_ms: DEFAULT_CACHE_TTL_MS,
            negative_ttl_ms: DEFAULT_NEGATIVE_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoogleSettings {
    pub allow_fallback: bool,
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self { allow_fallback: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeeplSettings {
    pub api_key: String,
    /// "auto", "free" or "pro"; interpreted by the provider.
    pub endpoint_mode: String,
    pub fallback_to_google: bool,
}

impl Default for DeeplSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint_mode: "auto".into(),
            fallback_to_google: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MicrosoftSettings {
    pub api_key: String,
    pub region: String,
    pub use_azure: bool,
    pub allow_fallback: bool,
}

impl Default for MicrosoftSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            region: String::new(),
            use_azure: true,
            allow_fallback: true,
        }
    }
}

/// Live settings publisher. The service subscribes once at construction.
pub struct SettingsSource {
    tx: watch::Sender<Arc<Settings>>,
}

impl SettingsSource {
    pub fn new(initial: Settings) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    pub fn current(&self) -> Arc<Settings> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }

    /// Publish a new snapshot to every subscriber.
    pub fn update(&self, next: Settings) {
        self.tx.send_replace(Arc::new(next));
    }

    /// Edit the current snapshot in place and publish the result.
    pub fn modify(&self, edit: impl FnOnce(&mut Settings)) {
        let mut next = (*self.current()).clone();
        edit(&mut next);
        self.update(next);
    }
}

impl Default for SettingsSource {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{"targetLanguage":"fr","engine":"deepl","cache":{"maxEntries":10},"deepl":{"apiKey":"k"}}"#,
        )
        .unwrap();
        assert_eq!(settings.target_language, "fr");
        assert_eq!(settings.engine, EngineKind::Deepl);
        assert_eq!(settings.cache.max_entries, 10);
        assert_eq!(settings.cache.ttl_ms, DEFAULT_CACHE_TTL_MS);
        assert!(settings.deepl.fallback_to_google);
        assert!(settings.has_credentials(EngineKind::Deepl));
    }

    #[test]
    fn blank_deepl_key_is_not_a_credential() {
        let mut settings = Settings::default();
        settings.deepl.api_key = "   ".into();
        assert!(!settings.has_credentials(EngineKind::Deepl));
        assert!(settings.has_credentials(EngineKind::Google));
    }

    #[test]
    fn load_from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"enabled":false}"#).unwrap();
        let settings = Settings::load_from_file(&path).unwrap();
        assert!(!settings.enabled);
        assert!(Settings::load_from_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn source_publishes_updates() {
        let source = SettingsSource::default();
        let rx = source.subscribe();
        source.modify(|s| s.cache.enabled = false);
        assert!(!rx.borrow().cache.enabled);
        assert!(!source.current().cache.enabled);
    }
}
