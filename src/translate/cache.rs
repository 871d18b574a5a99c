//! Two-tier translation cache.
//! L1: bounded in-memory LRU. L2: in-memory map mirrored to a durable store
//! as one versioned JSON blob, written at most once per second.
//! Key: `engine::source::target::prepared_text`.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::EngineKind;
use super::store::DurableStore;
use crate::config::CacheSettings;
use crate::now_ms;

/// Stored value meaning "no translation available".
pub const NEGATIVE_SENTINEL: &str = "__TRANSCACHE_NO_TRANSLATION__";
/// Durable-store key holding the persisted blob.
pub const PERSIST_KEY: &str = "transcachePersistentCacheV2";
pub const CACHE_FORMAT_VERSION: u32 = 2;
/// Capacity floor for both tiers.
pub const MIN_CAPACITY: usize = 50;
const FLUSH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(engine: EngineKind, source_language: &str, target_language: &str, text: &str) -> Self {
        let source = if source_language.is_empty() {
            "auto"
        } else {
            source_language
        };
        Self(format!("{engine}::{source}::{target_language}::{text}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a lookup found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    Translation(String),
    /// A recent attempt produced nothing; do not ask again until it expires.
    Negative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub value: String,
    pub updated_at: i64,
    pub expires_at: Option<i64>,
}

impl CacheEntry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn cached_value(&self) -> CachedValue {
        if self.value == NEGATIVE_SENTINEL {
            CachedValue::Negative
        } else {
            CachedValue::Translation(self.value.clone())
        }
    }
}

/// On-disk shape of the durable tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedBlob {
    pub version: u32,
    pub updated_at: i64,
    pub entries: HashMap<String, CacheEntry>,
}

impl PersistedBlob {
    pub fn stats(&self, now: i64) -> CacheStats {
        let mut stats = CacheStats {
            entries: self.entries.len(),
            ..CacheStats::default()
        };
        for entry in self.entries.values() {
            if entry.value == NEGATIVE_SENTINEL {
                stats.negative += 1;
            }
            if entry.is_expired(now) {
                stats.expired += 1;
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub negative: usize,
    pub expired: usize,
}

struct CacheState {
    volatile: LruCache<String, CacheEntry>,
    durable: HashMap<String, CacheEntry>,
    settings: CacheSettings,
}

impl CacheState {
    fn capacity(&self) -> usize {
        self.settings.max_entries.max(MIN_CAPACITY)
    }

    /// Drop expired entries, then the least recently touched ones over capacity.
    fn prune_durable(&mut self, now: i64) -> usize {
        let before = self.durable.len();
        self.durable.retain(|_, entry| !entry.is_expired(now));

        let capacity = self.capacity();
        if self.durable.len() > capacity {
            let mut by_age: Vec<(i64, String)> = self
                .durable
                .iter()
                .map(|(key, entry)| (entry.updated_at, key.clone()))
                .collect();
            by_age.sort_unstable();
            let excess = self.durable.len() - capacity;
            for (_, key) in by_age.into_iter().take(excess) {
                self.durable.remove(&key);
            }
        }
        before - self.durable.len()
    }
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity.max(MIN_CAPACITY)).unwrap_or(NonZeroUsize::MIN)
}

pub struct TranslationCache {
    state: Mutex<CacheState>,
    store: Option<Arc<dyn DurableStore>>,
    flush_pending: AtomicBool,
    flush_tx: mpsc::UnboundedSender<()>,
    flush_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    shutdown: CancellationToken,
}

impl TranslationCache {
    /// Memory-only cache; nothing is persisted.
    pub fn new(settings: CacheSettings) -> Self {
        Self::build(settings, None)
    }

    /// Cache backed by `store`: loads the persisted blob, then starts the
    /// debounced flush loop. Store failures degrade to memory-only.
    pub async fn with_store(settings: CacheSettings, store: Arc<dyn DurableStore>) -> Arc<Self> {
        let cache = Arc::new(Self::build(settings, Some(store)));
        cache.load().await;
        if let Some(rx) = cache.flush_rx.lock().take() {
            tokio::spawn(flush_loop(Arc::downgrade(&cache), rx, cache.shutdown.clone()));
        }
        cache
    }

    fn build(settings: CacheSettings, store: Option<Arc<dyn DurableStore>>) -> Self {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(CacheState {
                volatile: LruCache::new(non_zero(settings.max_entries)),
                durable: HashMap::new(),
                settings,
            }),
            store,
            flush_pending: AtomicBool::new(false),
            flush_tx,
            flush_rx: Mutex::new(Some(flush_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Look up a live entry. L1 first; an L2 hit is promoted into L1.
    /// Expired entries are removed from both tiers and reported as a miss.
    pub fn lookup(&self, key: &CacheKey) -> Option<CachedValue> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.settings.enabled {
            return None;
        }
        let now = now_ms();
        let k = key.as_str();

        let volatile_hit = state.volatile.get_mut(k).map(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                entry.updated_at = now;
                Some(entry.cached_value())
            }
        });
        match volatile_hit {
            Some(None) => {
                state.volatile.pop(k);
                state.durable.remove(k);
                return None;
            }
            Some(Some(value)) => {
                if let Some(entry) = state.durable.get_mut(k) {
                    entry.updated_at = now;
                }
                return Some(value);
            }
            None => {}
        }

        let entry = state.durable.get_mut(k)?;
        if entry.is_expired(now) {
            state.durable.remove(k);
            return None;
        }
        entry.updated_at = now;
        let promoted = entry.clone();
        let value = promoted.cached_value();
        state.volatile.put(k.to_string(), promoted);
        Some(value)
    }

    /// Write `value` to both tiers, expiring after `ttl_ms` (or the
    /// configured TTL). No-op while caching is disabled.
    pub fn store(&self, key: &CacheKey, value: &str, ttl_ms: Option<u64>) {
        {
            let mut state = self.state.lock();
            if !state.settings.enabled {
                return;
            }
            let now = now_ms();
            let ttl = ttl_ms.unwrap_or(state.settings.ttl_ms);
            let entry = CacheEntry {
                value: value.to_string(),
                updated_at: now,
                expires_at: Some(now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX))),
            };
            state.volatile.put(key.as_str().to_string(), entry.clone());
            state.durable.insert(key.as_str().to_string(), entry);
            // No flush loop prunes a memory-only cache.
            if self.store.is_none() && state.durable.len() > state.capacity() {
                state.prune_durable(now);
            }
        }
        self.schedule_persist();
    }

    /// Record "no translation" with the short negative TTL.
    pub fn store_negative(&self, key: &CacheKey) {
        let ttl = self.state.lock().settings.negative_ttl_ms;
        self.store(key, NEGATIVE_SENTINEL, Some(ttl));
    }

    /// Resize both tiers. Shrinking evicts immediately.
    pub fn set_capacity(&self, max_entries: usize) {
        let mut state = self.state.lock();
        state.settings.max_entries = max_entries;
        state.volatile.resize(non_zero(max_entries));
        state.prune_durable(now_ms());
    }

    /// Adopt new cache settings. Disabling the cache empties the volatile tier.
    pub fn apply_settings(&self, settings: &CacheSettings) {
        let mut state = self.state.lock();
        state.settings = settings.clone();
        state.volatile.resize(non_zero(settings.max_entries));
        if !settings.enabled {
            state.volatile.clear();
        }
        let pruned = state.prune_durable(now_ms());
        debug!(
            enabled = settings.enabled,
            capacity = state.capacity(),
            pruned,
            "cache settings applied"
        );
    }

    pub fn clear_volatile(&self) {
        self.state.lock().volatile.clear();
    }

    /// Empty both tiers and delete the persisted blob. A flush already
    /// scheduled is cancelled.
    pub async fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.volatile.clear();
            state.durable.clear();
        }
        self.flush_pending.store(false, Ordering::SeqCst);
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(&[PERSIST_KEY.to_string()]).await {
                warn!(error = %e, "persisted cache removal failed");
            }
        }
    }

    pub fn volatile_len(&self) -> usize {
        self.state.lock().volatile.len()
    }

    pub fn durable_len(&self) -> usize {
        self.state.lock().durable.len()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    pub fn stats(&self) -> CacheStats {
        let now = now_ms();
        let state = self.state.lock();
        let mut stats = CacheStats {
            entries: state.durable.len(),
            ..CacheStats::default()
        };
        for entry in state.durable.values() {
            if entry.value == NEGATIVE_SENTINEL {
                stats.negative += 1;
            }
            if entry.is_expired(now) {
                stats.expired += 1;
            }
        }
        stats
    }

    fn schedule_persist(&self) {
        if self.store.is_none() || self.shutdown.is_cancelled() {
            return;
        }
        if !self.flush_pending.swap(true, Ordering::SeqCst) {
            let _ = self.flush_tx.send(());
        }
    }

    /// Prune the durable tier and write it out now.
    pub async fn flush(&self) {
        let Some(store) = &self.store else {
            return;
        };
        self.flush_pending.store(false, Ordering::SeqCst);
        let now = now_ms();
        let blob = {
            let mut state = self.state.lock();
            state.prune_durable(now);
            PersistedBlob {
                version: CACHE_FORMAT_VERSION,
                updated_at: now,
                entries: state.durable.clone(),
            }
        };
        let count = blob.entries.len();
        let encoded = match serde_json::to_string(&blob) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "cache blob encode failed");
                return;
            }
        };
        match store.set(HashMap::from([(PERSIST_KEY.to_string(), encoded)])).await {
            Ok(()) => debug!(entries = count, "persistent cache flushed"),
            Err(e) => warn!(error = %e, "persistent cache write failed, continuing in memory"),
        }
    }

    async fn load(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let mut blobs = match store.get(&[PERSIST_KEY.to_string()]).await {
            Ok(blobs) => blobs,
            Err(e) => {
                warn!(error = %e, "persistent cache read failed, continuing in memory");
                return;
            }
        };
        let Some(raw) = blobs.remove(PERSIST_KEY) else {
            return;
        };
        let blob: PersistedBlob = match serde_json::from_str(&raw) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "persistent cache blob unreadable, discarding");
                return;
            }
        };
        if blob.version != CACHE_FORMAT_VERSION {
            info!(
                found = blob.version,
                expected = CACHE_FORMAT_VERSION,
                "persistent cache format changed, discarding"
            );
            return;
        }

        let now = now_ms();
        let mut state = self.state.lock();
        state.durable.extend(blob.entries);
        let pruned = state.prune_durable(now);
        info!(entries = state.durable.len(), pruned, "persistent cache loaded");
    }

    /// Stop the flush loop and write any pending changes.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if self.flush_pending.load(Ordering::SeqCst) {
            self.flush().await;
        }
    }
}

/// Waits for a dirty signal, lets further writes pile up for `FLUSH_DELAY`,
/// then writes once.
async fn flush_loop(
    cache: Weak<TranslationCache>,
    mut rx: mpsc::UnboundedReceiver<()>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            msg = rx.recv() => {
                if msg.is_none() {
                    return;
                }
            }
            _ = shutdown.cancelled() => return,
        }

        tokio::select! {
            _ = tokio::time::sleep(FLUSH_DELAY) => {}
            _ = shutdown.cancelled() => return,
        }
        while rx.try_recv().is_ok() {}

        let Some(cache) = cache.upgrade() else {
            return;
        };
        // A clear in the meantime leaves nothing to write.
        if cache.flush_pending.load(Ordering::SeqCst) {
            cache.flush().await;
        }
    }
}
