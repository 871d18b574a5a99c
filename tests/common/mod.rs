//! Shared helpers for service-level tests: scripted engines and a quick way
//! to stand up a service around them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use transcache::{
    EngineKind, EngineRegistry, EngineRequest, Settings, SettingsSource, TranslateError, TranslationEngine,
    TranslationService,
};

type Reply = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Engine whose answers come from a closure. Records every call.
pub struct ScriptedEngine {
    reply: Box<Reply>,
    calls: AtomicUsize,
    batches: Mutex<Vec<Vec<String>>>,
    requests: Mutex<Vec<EngineRequest>>,
    failing: AtomicBool,
    latency: Duration,
    max_items: usize,
    max_chars: usize,
}

impl ScriptedEngine {
    fn with_reply(reply: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            reply: Box::new(reply),
            calls: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            latency: Duration::ZERO,
            max_items: 25,
            max_chars: 4000,
        }
    }

    /// Answers every text with `<text>`.
    pub fn wrapping() -> Self {
        Self::with_reply(|text| Some(format!("<{text}>")))
    }

    /// Answers only the listed texts.
    pub fn table(pairs: &[(&str, &str)]) -> Self {
        let table: HashMap<String, String> = pairs
            .iter()
            .map(|(src, dst)| (src.to_string(), dst.to_string()))
            .collect();
        Self::with_reply(move |text| table.get(text).cloned())
    }

    /// Never has a translation.
    pub fn silent() -> Self {
        Self::with_reply(|_| None)
    }

    /// Returns the input unchanged.
    pub fn echo() -> Self {
        Self::with_reply(|text| Some(text.to_string()))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_limits(mut self, max_items: usize, max_chars: usize) -> Self {
        self.max_items = max_items;
        self.max_chars = max_chars;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }

    pub fn last_request(&self) -> Option<EngineRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl TranslationEngine for ScriptedEngine {
    fn max_items_per_request(&self) -> usize {
        self.max_items
    }

    fn max_chars_per_request(&self) -> usize {
        self.max_chars
    }

    async fn translate(
        &self,
        texts: &[String],
        request: &EngineRequest,
    ) -> Result<Vec<Option<String>>, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().push(texts.to_vec());
        self.requests.lock().push(request.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TranslateError::Api("scripted failure".into()));
        }
        Ok(texts.iter().map(|t| (self.reply)(t)).collect())
    }
}

/// Service plus the settings source driving it.
pub struct Harness {
    pub service: TranslationService,
    pub settings: SettingsSource,
}

pub async fn harness(settings: Settings, engines: &[(EngineKind, Arc<ScriptedEngine>)]) -> Harness {
    let registry = engines.iter().fold(EngineRegistry::new(), |registry, (kind, engine)| {
        registry.with_engine(*kind, Arc::clone(engine) as Arc<dyn TranslationEngine>)
    });
    let source = SettingsSource::new(settings);
    let service = TranslationService::builder(source.subscribe())
        .engines(registry)
        .build()
        .await;
    Harness {
        service,
        settings: source,
    }
}

pub fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
