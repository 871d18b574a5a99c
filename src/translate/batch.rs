//! Batch dispatch: group texts under the lead engine's request limits, run
//! batches on a fixed pool of workers, and walk the fallback chain for
//! whatever each engine leaves untranslated.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::cache::{CacheKey, TranslationCache};
use super::engine::{
    EngineKind, EngineRegistry, EngineRequest, ProviderCredentials, DEFAULT_MAX_CHARS_PER_REQUEST,
    DEFAULT_MAX_ITEMS_PER_REQUEST,
};
use super::normalize::postprocess;
use super::TranslateError;
use crate::config::Settings;
use crate::metrics::{metric_names, MetricsRegistry};

/// One distinct prepared text and every caller position waiting on it.
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Key under the lead engine.
    pub key: CacheKey,
    pub text: String,
    pub caller_indexes: Vec<usize>,
}

/// Final state of one item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settled {
    pub translation: Option<String>,
    /// Engine that produced `translation`.
    pub engine: Option<EngineKind>,
}

impl Settled {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Everything a dispatch needs to know about the originating request.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub chain: Vec<EngineKind>,
    pub source_language: String,
    pub target_language: String,
    pub title_case: bool,
    pub settings: Arc<Settings>,
}

impl DispatchPlan {
    fn request_for(&self, kind: EngineKind) -> EngineRequest {
        EngineRequest {
            source_language: self.source_language.clone(),
            target_language: self.target_language.clone(),
            credentials: ProviderCredentials::for_engine(kind, &self.settings),
        }
    }
}

/// Called once per item, the moment it settles.
pub type SettleFn<'a> = dyn Fn(&BatchItem, &Settled) + Send + Sync + 'a;

/// Split `items` into consecutive batches of at most `max_items` items and
/// `max_chars` characters. Input order is kept; an oversized single item
/// still gets a batch of its own.
pub fn build_batches(items: Vec<BatchItem>, max_items: usize, max_chars: usize) -> Vec<Vec<BatchItem>> {
    let max_items = max_items.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<BatchItem> = Vec::new();
    let mut chars = 0;
    for item in items {
        let len = item.text.chars().count();
        if !current.is_empty() && (current.len() >= max_items || chars + len > max_chars) {
            batches.push(std::mem::take(&mut current));
            chars = 0;
        }
        chars += len;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

pub struct BatchScheduler {
    engines: EngineRegistry,
    cache: Arc<TranslationCache>,
    metrics: Arc<MetricsRegistry>,
}

impl BatchScheduler {
    pub fn new(engines: EngineRegistry, cache: Arc<TranslationCache>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            engines,
            cache,
            metrics,
        }
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    /// Translate `items` and return their settled state, index-aligned with
    /// the input. Batch sizing and worker count follow the first engine of
    /// the chain.
    pub async fn schedule(&self, items: Vec<BatchItem>, plan: &DispatchPlan, on_settle: &SettleFn<'_>) -> Vec<Settled> {
        let total = items.len();
        let Some(&lead) = plan.chain.first() else {
            for item in &items {
                on_settle(item, &Settled::none());
            }
            return vec![Settled::none(); total];
        };

        let (max_items, max_chars) = self
            .engines
            .get(lead)
            .map(|e| (e.max_items_per_request(), e.max_chars_per_request()))
            .unwrap_or((DEFAULT_MAX_ITEMS_PER_REQUEST, DEFAULT_MAX_CHARS_PER_REQUEST));

        let mut offset = 0;
        let queue: VecDeque<(usize, Vec<BatchItem>)> = build_batches(items, max_items, max_chars)
            .into_iter()
            .map(|batch| {
                let start = offset;
                offset += batch.len();
                (start, batch)
            })
            .collect();
        let workers = lead.max_concurrent_batches().min(queue.len()).max(1);
        debug!(engine = %lead, items = total, batches = queue.len(), workers, "dispatching batches");

        let queue = &Mutex::new(queue);
        let worker_runs = (0..workers).map(|_| async move {
            let mut done = Vec::new();
            loop {
                let next = queue.lock().pop_front();
                let Some((start, batch)) = next else {
                    break;
                };
                let settled = self.run_batch(&batch, plan, on_settle).await;
                done.push((start, settled));
            }
            done
        });

        let mut results = vec![Settled::none(); total];
        for (start, settled) in join_all(worker_runs).await.into_iter().flatten() {
            for (i, item) in settled.into_iter().enumerate() {
                results[start + i] = item;
            }
        }
        results
    }

    /// Run one batch through the fallback chain. Each engine sees only the
    /// texts its predecessors left unresolved.
    async fn run_batch(&self, batch: &[BatchItem], plan: &DispatchPlan, on_settle: &SettleFn<'_>) -> Vec<Settled> {
        let span = self.metrics.span(metric_names::BATCH_DONE);
        let mut settled: Vec<Option<Settled>> = vec![None; batch.len()];
        let mut unresolved: Vec<usize> = (0..batch.len()).collect();

        for &kind in &plan.chain {
            if unresolved.is_empty() {
                break;
            }
            let subset: Vec<String> = unresolved.iter().map(|&i| batch[i].text.clone()).collect();
            let output = match self.call_engine(kind, &subset, plan).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(engine = %kind, count = subset.len(), error = %e, "engine call failed, falling through");
                    self.metrics.incr(metric_names::PROVIDER_FAILURES);
                    vec![None; subset.len()]
                }
            };

            let mut remaining = Vec::with_capacity(unresolved.len());
            for (pos, &idx) in unresolved.iter().enumerate() {
                let item = &batch[idx];
                let raw = output.get(pos).and_then(|o| o.as_deref());
                match postprocess(raw, &item.text, plan.title_case) {
                    Some(translation) => {
                        let outcome = self.settle_translated(item, translation, kind, plan);
                        on_settle(item, &outcome);
                        settled[idx] = Some(outcome);
                    }
                    None => remaining.push(idx),
                }
            }
            unresolved = remaining;
        }

        for idx in unresolved {
            let item = &batch[idx];
            self.cache.store_negative(&item.key);
            let outcome = Settled::none();
            on_settle(item, &outcome);
            settled[idx] = Some(outcome);
        }

        let elapsed_us = span.finish();
        debug!(
            count = batch.len(),
            elapsed_ms = (elapsed_us / 1000.0) as u64,
            "batch settled"
        );
        settled.into_iter().map(Option::unwrap_or_default).collect()
    }

    /// Cache under the lead engine's key and, when another engine won,
    /// under the winner's key too.
    fn settle_translated(&self, item: &BatchItem, translation: String, winner: EngineKind, plan: &DispatchPlan) -> Settled {
        self.cache.store(&item.key, &translation, None);
        if plan.chain.first() != Some(&winner) {
            let winner_key = CacheKey::new(winner, &plan.source_language, &plan.target_language, &item.text);
            self.cache.store(&winner_key, &translation, None);
        }
        Settled {
            translation: Some(translation),
            engine: Some(winner),
        }
    }

    async fn call_engine(
        &self,
        kind: EngineKind,
        texts: &[String],
        plan: &DispatchPlan,
    ) -> Result<Vec<Option<String>>, TranslateError> {
        let engine = self
            .engines
            .get(kind)
            .ok_or_else(|| TranslateError::Unavailable(kind.to_string()))?;
        let request = plan.request_for(kind);

        let start = Instant::now();
        self.metrics.incr(metric_names::PROVIDER_CALLS);
        let mut output = engine.translate(texts, &request).await?;
        self.metrics
            .record(metric_names::PROVIDER_CALL, start.elapsed().as_micros() as f64);

        if output.len() != texts.len() {
            warn!(
                engine = %kind,
                expected = texts.len(),
                got = output.len(),
                "engine output misaligned, padding with no-translation"
            );
            output.resize(texts.len(), None);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::translate::cache::CachedValue;
    use crate::translate::engine::TranslationEngine;
    use async_trait::async_trait;

    fn item(text: &str) -> BatchItem {
        BatchItem {
            key: CacheKey::new(EngineKind::Google, "auto", "en", text),
            text: text.to_string(),
            caller_indexes: vec![0],
        }
    }

    #[test]
    fn batches_respect_item_limit_in_order() {
        let items = ["a", "b", "c", "d", "e"].map(item).to_vec();
        let batches = build_batches(items, 2, 4000);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batches[2][0].text, "e");
    }

    #[test]
    fn batches_respect_char_limit() {
        let items = ["aaaa", "bbbb", "cc", "dddddddddd"].map(item).to_vec();
        let batches = build_batches(items, 25, 8);
        let texts: Vec<Vec<&str>> = batches
            .iter()
            .map(|b| b.iter().map(|i| i.text.as_str()).collect())
            .collect();
        assert_eq!(texts, vec![vec!["aaaa", "bbbb"], vec!["cc"], vec!["dddddddddd"]]);
    }

    /// Translates only texts listed in its table; fails when told to.
    struct TableEngine {
        table: Vec<(&'static str, &'static str)>,
        fail: bool,
    }

    #[async_trait]
    impl TranslationEngine for TableEngine {
        async fn translate(
            &self,
            texts: &[String],
            _request: &EngineRequest,
        ) -> Result<Vec<Option<String>>, TranslateError> {
            if self.fail {
                return Err(TranslateError::Api("boom".into()));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    self.table
                        .iter()
                        .find(|(src, _)| src == t)
                        .map(|(_, dst)| dst.to_string())
                })
                .collect())
        }
    }

    fn plan(chain: Vec<EngineKind>) -> DispatchPlan {
        DispatchPlan {
            chain,
            source_language: "auto".into(),
            target_language: "en".into(),
            title_case: false,
            settings: Arc::new(Settings::default()),
        }
    }

    #[tokio::test]
    async fn fallback_fills_gaps_and_mirrors_cache() {
        let engines = EngineRegistry::new()
            .with_engine(
                EngineKind::Google,
                Arc::new(TableEngine {
                    table: vec![("猫", "cat")],
                    fail: false,
                }),
            )
            .with_engine(
                EngineKind::Microsoft,
                Arc::new(TableEngine {
                    table: vec![("狗", "dog")],
                    fail: false,
                }),
            );
        let cache = Arc::new(TranslationCache::new(CacheSettings::default()));
        let scheduler = BatchScheduler::new(engines, Arc::clone(&cache), Arc::new(MetricsRegistry::new()));

        let settled_count = std::sync::atomic::AtomicUsize::new(0);
        let on_settle = |_: &BatchItem, _: &Settled| {
            settled_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        };
        let results = scheduler
            .schedule(
                vec![item("猫"), item("狗"), item("鱼")],
                &plan(vec![EngineKind::Google, EngineKind::Microsoft]),
                &on_settle,
            )
            .await;

        assert_eq!(results[0].translation.as_deref(), Some("cat"));
        assert_eq!(results[0].engine, Some(EngineKind::Google));
        assert_eq!(results[1].translation.as_deref(), Some("dog"));
        assert_eq!(results[1].engine, Some(EngineKind::Microsoft));
        assert_eq!(results[2], Settled::none());
        assert_eq!(settled_count.load(std::sync::atomic::Ordering::SeqCst), 3);

        let mirrored = CacheKey::new(EngineKind::Microsoft, "auto", "en", "狗");
        assert_eq!(cache.lookup(&mirrored), Some(CachedValue::Translation("dog".into())));
        assert_eq!(cache.lookup(&item("狗").key), Some(CachedValue::Translation("dog".into())));
        assert_eq!(cache.lookup(&item("鱼").key), Some(CachedValue::Negative));
    }

    #[tokio::test]
    async fn failing_engine_falls_through() {
        let engines = EngineRegistry::new()
            .with_engine(
                EngineKind::Google,
                Arc::new(TableEngine {
                    table: vec![],
                    fail: true,
                }),
            )
            .with_engine(
                EngineKind::Microsoft,
                Arc::new(TableEngine {
                    table: vec![("猫", "cat")],
                    fail: false,
                }),
            );
        let metrics = Arc::new(MetricsRegistry::new());
        let cache = Arc::new(TranslationCache::new(CacheSettings::default()));
        let scheduler = BatchScheduler::new(engines, cache, Arc::clone(&metrics));
        let results = scheduler
            .schedule(
                vec![item("猫")],
                &plan(vec![EngineKind::Google, EngineKind::Microsoft]),
                &|_: &BatchItem, _: &Settled| {},
            )
            .await;
        assert_eq!(results[0].translation.as_deref(), Some("cat"));
        assert_eq!(metrics.counter(metric_names::PROVIDER_FAILURES), 1);
    }
}
