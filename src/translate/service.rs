//! Translation orchestration: glue between the normalizer, dictionary,
//! caches, coalescer, batch scheduler and single-request queue.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

use super::batch::{BatchItem, BatchScheduler, DispatchPlan, Settled};
use super::cache::{CacheKey, CacheStats, CachedValue, TranslationCache};
use super::coalescer::{RequestCoalescer, SharedOutcome};
use super::engine::{resolve_chain, EngineKind, EngineRegistry, TranslationEngine};
use super::glossary::Dictionary;
use super::known::KnownOutputTracker;
use super::normalize::{normalize, postprocess, prepare};
use super::queue::{SingleRequestQueue, SINGLE_QUEUE_DELAY};
use super::store::DurableStore;
use super::{PartialResult, ResultSource, TranslateOptions, TranslationResult};
use crate::config::Settings;
use crate::metrics::{metric_names, MetricsRegistry};

/// Assembles a [`TranslationService`].
pub struct ServiceBuilder {
    settings: watch::Receiver<Arc<Settings>>,
    engines: EngineRegistry,
    store: Option<Arc<dyn DurableStore>>,
    dictionary: Option<Arc<dyn Dictionary>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ServiceBuilder {
    pub fn engine(mut self, kind: EngineKind, engine: Arc<dyn TranslationEngine>) -> Self {
        self.engines.register(kind, engine);
        self
    }

    pub fn engines(mut self, engines: EngineRegistry) -> Self {
        self.engines = engines;
        self
    }

    /// Durable medium for the persistent cache tier. Without one the cache
    /// lives in memory only.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn dictionary(mut self, dictionary: Arc<dyn Dictionary>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Load the persisted cache and start the background tasks. Must be
    /// called from within a Tokio runtime.
    pub async fn build(self) -> TranslationService {
        let mut settings = self.settings;
        let initial = Arc::clone(&settings.borrow_and_update());
        let cache = match self.store {
            Some(store) => TranslationCache::with_store(initial.cache.clone(), store).await,
            None => Arc::new(TranslationCache::new(initial.cache.clone())),
        };
        let metrics = self.metrics.unwrap_or_default();
        let shutdown = CancellationToken::new();

        tokio::spawn(watch_settings(
            Arc::downgrade(&cache),
            settings.clone(),
            shutdown.clone(),
        ));
        let registered: Vec<EngineKind> = EngineKind::ALL
            .into_iter()
            .filter(|kind| self.engines.contains(*kind))
            .collect();
        info!(engines = ?registered, cache_capacity = cache.capacity(), "translation service ready");

        TranslationService {
            inner: Arc::new(ServiceInner {
                settings,
                scheduler: Arc::new(BatchScheduler::new(
                    self.engines,
                    Arc::clone(&cache),
                    Arc::clone(&metrics),
                )),
                cache,
                coalescer: RequestCoalescer::new(),
                known: Arc::new(KnownOutputTracker::new()),
                dictionary: self.dictionary,
                queue: SingleRequestQueue::new(),
                metrics,
                shutdown,
            }),
        }
    }
}

/// Re-derive cache settings whenever a new snapshot is published.
async fn watch_settings(
    cache: Weak<TranslationCache>,
    mut settings: watch::Receiver<Arc<Settings>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            changed = settings.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown.cancelled() => return,
        }
        let snapshot = Arc::clone(&settings.borrow_and_update());
        let Some(cache) = cache.upgrade() else {
            return;
        };
        cache.apply_settings(&snapshot.cache);
        info!(
            enabled = snapshot.enabled,
            engine = %snapshot.engine,
            target = %snapshot.target_language,
            "settings updated"
        );
    }
}

/// Entry point for translation requests. Cheap to clone.
#[derive(Clone)]
pub struct TranslationService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    settings: watch::Receiver<Arc<Settings>>,
    cache: Arc<TranslationCache>,
    scheduler: Arc<BatchScheduler>,
    coalescer: RequestCoalescer<CacheKey, Settled>,
    known: Arc<KnownOutputTracker>,
    dictionary: Option<Arc<dyn Dictionary>>,
    queue: SingleRequestQueue,
    metrics: Arc<MetricsRegistry>,
    shutdown: CancellationToken,
}

impl TranslationService {
    pub fn builder(settings: watch::Receiver<Arc<Settings>>) -> ServiceBuilder {
        ServiceBuilder {
            settings,
            engines: EngineRegistry::new(),
            store: None,
            dictionary: None,
            metrics: None,
        }
    }

    /// Translate one text. Requests arriving within a short window share
    /// provider calls with other requests carrying the same options.
    pub async fn translate(&self, text: &str, options: TranslateOptions) -> TranslationResult {
        if self.inner.shutdown.is_cancelled() {
            return TranslationResult::empty();
        }
        let enqueued = self.inner.queue.enqueue(text, options);
        if enqueued.arm_flush {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(SINGLE_QUEUE_DELAY).await;
                inner.flush_queue().await;
            });
        }
        enqueued.result().await
    }

    /// Translate `texts`, returning one result per input in input order.
    /// Never fails: anything that cannot be translated comes back empty.
    pub async fn translate_many<S: AsRef<str>>(
        &self,
        texts: &[S],
        options: TranslateOptions,
    ) -> Vec<TranslationResult> {
        let texts = texts.iter().map(|t| t.as_ref().to_string()).collect();
        self.inner.translate_many(texts, options).await
    }

    /// Answer from the dictionary and cache only. Never reaches a provider.
    pub fn peek_cached(&self, text: &str, options: &TranslateOptions) -> TranslationResult {
        let inner = &self.inner;
        let settings = inner.current_settings();
        if !settings.enabled {
            return TranslationResult::empty();
        }
        let normalized = normalize(text);
        if normalized.is_empty() {
            return TranslationResult::empty();
        }
        let prepared = prepare(&normalized);
        if prepared.is_empty() {
            return TranslationResult::empty();
        }
        let target = inner.target_language(&settings, options);
        if !options.skip_dictionary {
            if let Some(hit) = inner.dictionary_hit(&normalized, &prepared, &target, options.title_case) {
                return TranslationResult::new(Some(hit), Some(ResultSource::Dictionary), false);
            }
        }
        let chain = resolve_chain(&settings, options, inner.scheduler.engines());
        inner
            .cached(&chain, options.source_language_or_auto(), &target, &prepared)
            .unwrap_or_else(TranslationResult::empty)
    }

    /// Engine that would be tried first for `options`, if any.
    pub fn resolve_engine(&self, options: &TranslateOptions) -> Option<EngineKind> {
        let settings = self.inner.current_settings();
        resolve_chain(&settings, options, self.inner.scheduler.engines())
            .first()
            .copied()
    }

    /// Forget everything: both cache tiers, the persisted blob, in-flight
    /// registrations, remembered outputs and buffered single requests.
    pub async fn clear_all_caches(&self) {
        let inner = &self.inner;
        inner.cache.clear().await;
        inner.coalescer.clear();
        inner.known.clear();
        let drained = inner.queue.drain();
        info!(drained, "all caches cleared");
    }

    /// Stop background tasks, write out pending cache changes and resolve
    /// buffered requests. Later calls return empty results.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.shutdown.cancel();
        inner.cache.shutdown().await;
        let drained = inner.queue.drain();
        info!(drained, "translation service stopped");
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.inner.current_settings()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Requests currently being produced by a provider.
    pub fn in_flight(&self) -> usize {
        self.inner.coalescer.len()
    }
}

/// How a missed key was taken on by the current request.
enum Registration {
    /// This request produces it.
    Leader(SharedOutcome<Settled>),
    /// Another request already is.
    Follower(SharedOutcome<Settled>),
    /// It landed in the cache after the first lookup.
    Cached(TranslationResult),
}

fn settled_result(settled: &Settled, from_cache: bool) -> TranslationResult {
    match &settled.translation {
        Some(translation) => TranslationResult::new(
            Some(translation.clone()),
            settled.engine.map(ResultSource::Engine),
            from_cache,
        ),
        None => TranslationResult::empty(),
    }
}

impl ServiceInner {
    fn current_settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings.borrow())
    }

    fn target_language(&self, settings: &Settings, options: &TranslateOptions) -> String {
        options
            .target_language
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&settings.target_language)
            .to_string()
    }

    async fn flush_queue(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.queue
            .flush(move |texts, options| {
                let inner = Arc::clone(&inner);
                async move { inner.translate_many(texts, options).await }
            })
            .await;
    }

    /// Phrase-table hit for the normalized form, else the prepared form,
    /// shaped like provider output. A hit is kept even when it matches the
    /// input.
    fn dictionary_hit(&self, normalized: &str, prepared: &str, target: &str, title_case: bool) -> Option<String> {
        let dictionary = self.dictionary.as_ref()?;
        let hit = dictionary
            .lookup(normalized, target)
            .or_else(|| dictionary.lookup(prepared, target))?;
        Some(postprocess(Some(&hit), prepared, title_case).unwrap_or(hit))
    }

    /// First cache entry along the chain. Negative entries answer with no
    /// translation but still count as cached.
    fn cached(&self, chain: &[EngineKind], source: &str, target: &str, prepared: &str) -> Option<TranslationResult> {
        chain.iter().find_map(|&kind| {
            let key = CacheKey::new(kind, source, target, prepared);
            let found = match self.cache.lookup(&key)? {
                CachedValue::Translation(translation) => Some(translation),
                CachedValue::Negative => None,
            };
            Some(TranslationResult::new(found, Some(ResultSource::Engine(kind)), true))
        })
    }

    /// Count a cache answer and, when it carries a translation, remember and
    /// announce it.
    fn cache_hit(
        &self,
        result: TranslationResult,
        prepared: &str,
        target: &str,
        options: &TranslateOptions,
    ) -> TranslationResult {
        match (&result.translation, result.engine) {
            (Some(translation), Some(engine)) => {
                self.metrics.incr(metric_names::CACHE_HITS);
                self.known.remember(translation, target);
                options.notify(|| PartialResult {
                    source: prepared.to_string(),
                    translation: translation.clone(),
                    engine,
                });
            }
            _ => self.metrics.incr(metric_names::CACHE_NEGATIVE_HITS),
        }
        result
    }

    /// Join the in-flight request for `key`, or claim it. A fresh claim
    /// looks at the cache again: a batch may have settled and released the
    /// key since the first lookup. In that case the claim is resolved from
    /// the cache and nothing is dispatched.
    fn register(
        &self,
        key: &CacheKey,
        chain: &[EngineKind],
        source: &str,
        target: &str,
        prepared: &str,
        senders: &mut HashMap<CacheKey, oneshot::Sender<Settled>>,
    ) -> Registration {
        let coalesced = self.coalescer.get_or_create(key.clone(), || {
            let (tx, rx) = oneshot::channel::<Settled>();
            senders.insert(key.clone(), tx);
            async move { rx.await.unwrap_or_default() }
        });
        if !coalesced.created {
            return Registration::Follower(coalesced.outcome);
        }
        let Some(result) = self.cached(chain, source, target, prepared) else {
            return Registration::Leader(coalesced.outcome);
        };
        if let Some(reply) = senders.remove(key) {
            let engine = match result.engine {
                Some(ResultSource::Engine(kind)) => Some(kind),
                _ => None,
            };
            let _ = reply.send(Settled {
                translation: result.translation.clone(),
                engine,
            });
        }
        Registration::Cached(result)
    }

    async fn translate_many(self: &Arc<Self>, texts: Vec<String>, options: TranslateOptions) -> Vec<TranslationResult> {
        let span = tracing::debug_span!("translate_many", request_id = %Uuid::new_v4(), count = texts.len());
        self.run_many(texts, options).instrument(span).await
    }

    async fn run_many(self: &Arc<Self>, texts: Vec<String>, options: TranslateOptions) -> Vec<TranslationResult> {
        let mut results = vec![TranslationResult::empty(); texts.len()];
        let settings = self.current_settings();
        if !settings.enabled || self.shutdown.is_cancelled() {
            return results;
        }
        let timing = self.metrics.span(metric_names::TRANSLATE_MANY);
        let target = self.target_language(&settings, &options);
        let source = options.source_language_or_auto().to_string();
        let chain = resolve_chain(&settings, &options, self.scheduler.engines());
        let primary = chain.first().copied();

        let mut items: Vec<BatchItem> = Vec::new();
        let mut slots: HashMap<CacheKey, usize> = HashMap::new();
        let mut leaders: Vec<SharedOutcome<Settled>> = Vec::new();
        let mut senders: HashMap<CacheKey, oneshot::Sender<Settled>> = HashMap::new();
        let mut followers: Vec<(usize, SharedOutcome<Settled>)> = Vec::new();

        for (index, raw) in texts.iter().enumerate() {
            let normalized = normalize(raw);
            if normalized.is_empty() {
                continue;
            }
            let prepared = prepare(&normalized);
            if prepared.is_empty() {
                continue;
            }
            if options.skip_known_translated && self.known.is_known(&prepared, &target) {
                continue;
            }

            if !options.skip_dictionary {
                if let Some(hit) = self.dictionary_hit(&normalized, &prepared, &target, options.title_case) {
                    self.metrics.incr(metric_names::DICTIONARY_HITS);
                    self.known.remember(&hit, &target);
                    options.notify(|| PartialResult {
                        source: prepared.clone(),
                        translation: hit.clone(),
                        engine: ResultSource::Dictionary,
                    });
                    results[index] = TranslationResult::new(Some(hit), Some(ResultSource::Dictionary), false);
                    continue;
                }
            }

            let Some(primary) = primary else {
                continue;
            };

            if let Some(result) = self.cached(&chain, &source, &target, &prepared) {
                results[index] = self.cache_hit(result, &prepared, &target, &options);
                continue;
            }
            self.metrics.incr(metric_names::CACHE_MISSES);

            let key = CacheKey::new(primary, &source, &target, &prepared);
            if let Some(&slot) = slots.get(&key) {
                items[slot].caller_indexes.push(index);
                continue;
            }
            match self.register(&key, &chain, &source, &target, &prepared, &mut senders) {
                Registration::Leader(outcome) => {
                    slots.insert(key.clone(), items.len());
                    items.push(BatchItem {
                        key,
                        text: prepared,
                        caller_indexes: vec![index],
                    });
                    leaders.push(outcome);
                }
                Registration::Follower(outcome) => {
                    self.metrics.incr(metric_names::COALESCED_WAITS);
                    followers.push((index, outcome));
                }
                Registration::Cached(result) => {
                    results[index] = self.cache_hit(result, &prepared, &target, &options);
                }
            }
        }

        let leader_indexes: Vec<Vec<usize>> = items.iter().map(|item| item.caller_indexes.clone()).collect();
        if !items.is_empty() {
            let plan = DispatchPlan {
                chain,
                source_language: source,
                target_language: target.clone(),
                title_case: options.title_case,
                settings,
            };
            self.dispatch(items, senders, plan, &options);
        }

        for (indexes, settled) in leader_indexes.into_iter().zip(join_all(leaders).await) {
            for index in indexes {
                results[index] = settled_result(&settled, false);
            }
        }
        let (follower_indexes, outcomes): (Vec<usize>, Vec<_>) = followers.into_iter().unzip();
        for (index, settled) in follower_indexes.into_iter().zip(join_all(outcomes).await) {
            if let Some(translation) = &settled.translation {
                self.known.remember(translation, &target);
            }
            results[index] = settled_result(&settled, true);
        }

        let elapsed_us = timing.finish();
        debug!(elapsed_ms = (elapsed_us / 1000.0) as u64, "translate_many done");
        results
    }

    /// Run the batches on their own task so provider work completes and is
    /// cached even if every caller stops waiting.
    fn dispatch(
        &self,
        items: Vec<BatchItem>,
        senders: HashMap<CacheKey, oneshot::Sender<Settled>>,
        plan: DispatchPlan,
        options: &TranslateOptions,
    ) {
        let scheduler = Arc::clone(&self.scheduler);
        let known = Arc::clone(&self.known);
        let listener = options.clone();
        let senders = Mutex::new(senders);
        tokio::spawn(
            async move {
                let on_settle = |item: &BatchItem, settled: &Settled| {
                    if let (Some(translation), Some(engine)) = (&settled.translation, settled.engine) {
                        known.remember(translation, &plan.target_language);
                        listener.notify(|| PartialResult {
                            source: item.text.clone(),
                            translation: translation.clone(),
                            engine: ResultSource::Engine(engine),
                        });
                    }
                    if let Some(reply) = senders.lock().remove(&item.key) {
                        let _ = reply.send(settled.clone());
                    }
                };
                scheduler.schedule(items, &plan, &on_settle).await;
            }
            .in_current_span(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingsSource;

    #[tokio::test]
    async fn fresh_claim_rechecks_cache() {
        let source = SettingsSource::new(Settings::default());
        let service = TranslationService::builder(source.subscribe()).build().await;
        let inner = &service.inner;
        let chain = [EngineKind::Google];
        let mut senders = HashMap::new();

        let cold = CacheKey::new(EngineKind::Google, "auto", "en", "狗");
        let Registration::Leader(_) = inner.register(&cold, &chain, "auto", "en", "狗", &mut senders) else {
            panic!("an uncached key is claimed for dispatch");
        };
        assert_eq!(senders.len(), 1);

        // Stored by another request's batch after this request's first lookup.
        let warm = CacheKey::new(EngineKind::Google, "auto", "en", "猫");
        inner.cache.store(&warm, "cat", None);
        let Registration::Cached(result) = inner.register(&warm, &chain, "auto", "en", "猫", &mut senders) else {
            panic!("a key cached since the first lookup is not dispatched");
        };
        assert_eq!(result.translation.as_deref(), Some("cat"));
        assert_eq!(result.engine, Some(ResultSource::Engine(EngineKind::Google)));
        assert!(result.from_cache);
        assert_eq!(senders.len(), 1);

        for _ in 0..50 {
            if !inner.coalescer.contains(&warm) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!inner.coalescer.contains(&warm));
        assert!(inner.coalescer.contains(&cold));
    }
}
