//! Request coalescing: concurrent identical requests share one outcome.
//!
//! Each key maps to a shared future. The entry is removed when that future
//! settles, inside the future itself, so no waiter can observe the outcome
//! while the registry still advertises the request as in flight. A driver
//! task keeps every registered future polled, which means settlement (and
//! removal) happens even after all callers have stopped waiting.
//!
//! Entries carry a generation number; a settling future only removes the
//! entry it registered, never a newer one for the same key.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

pub type SharedOutcome<V> = Shared<BoxFuture<'static, V>>;

/// Result of `get_or_create`.
pub struct Coalesced<V: Clone> {
    pub outcome: SharedOutcome<V>,
    /// True when this call registered the request and so owns producing it.
    pub created: bool,
}

pub struct RequestCoalescer<K, V: Clone> {
    in_flight: Arc<Mutex<HashMap<K, (u64, SharedOutcome<V>)>>>,
    generation: AtomicU64,
}

impl<K, V> RequestCoalescer<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Return the in-flight outcome for `key`, or register the one produced
    /// by `factory`. The check and the registration happen under one lock.
    /// Must be called from within a Tokio runtime.
    pub fn get_or_create<F, Fut>(&self, key: K, factory: F) -> Coalesced<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock();
        if let Some((_, existing)) = in_flight.get(&key) {
            return Coalesced {
                outcome: existing.clone(),
                created: false,
            };
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.in_flight);
        let removal_key = key.clone();
        let work = factory();
        let outcome = async move {
            let value = work.await;
            {
                let mut in_flight = registry.lock();
                if in_flight.get(&removal_key).is_some_and(|(g, _)| *g == generation) {
                    in_flight.remove(&removal_key);
                }
            }
            value
        }
        .boxed()
        .shared();

        in_flight.insert(key, (generation, outcome.clone()));
        drop(in_flight);

        tokio::spawn(outcome.clone());
        Coalesced {
            outcome,
            created: true,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.lock().is_empty()
    }

    /// Forget every registered request. Work already running still settles
    /// and reaches the callers holding its outcome; new callers start fresh.
    pub fn clear(&self) {
        self.in_flight.lock().clear();
    }
}

impl<K, V> Default for RequestCoalescer<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn second_caller_joins_the_first() {
        let coalescer: RequestCoalescer<&'static str, u32> = RequestCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<u32>();

        let c1 = Arc::clone(&calls);
        let first = coalescer.get_or_create("k", move || {
            c1.fetch_add(1, Ordering::SeqCst);
            async move { rx.await.unwrap_or(0) }
        });
        let c2 = Arc::clone(&calls);
        let second = coalescer.get_or_create("k", move || {
            c2.fetch_add(1, Ordering::SeqCst);
            async { 99 }
        });

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(coalescer.contains(&"k"));

        tx.send(7).unwrap();
        assert_eq!(first.outcome.await, 7);
        assert_eq!(second.outcome.await, 7);
        assert!(coalescer.is_empty());
    }

    #[tokio::test]
    async fn entry_is_removed_when_nobody_waits() {
        let coalescer: RequestCoalescer<u8, Option<String>> = RequestCoalescer::new();
        let (tx, rx) = oneshot::channel::<Option<String>>();
        let created = coalescer.get_or_create(1, move || async move { rx.await.ok().flatten() });
        drop(created);
        assert_eq!(coalescer.len(), 1);

        tx.send(Some("done".into())).unwrap();
        for _ in 0..50 {
            if coalescer.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(coalescer.is_empty());
    }

    #[tokio::test]
    async fn dropped_producer_settles_with_fallback_value() {
        let coalescer: RequestCoalescer<u8, Option<String>> = RequestCoalescer::new();
        let (tx, rx) = oneshot::channel::<Option<String>>();
        let created = coalescer.get_or_create(1, move || async move { rx.await.ok().flatten() });
        drop(tx);
        assert_eq!(created.outcome.await, None);
        assert!(coalescer.is_empty());

        let fresh = coalescer.get_or_create(1, || async { Some("again".to_string()) });
        assert!(fresh.created);
        assert_eq!(fresh.outcome.await, Some("again".to_string()));
    }

    #[tokio::test]
    async fn stale_settlement_keeps_newer_entry() {
        let coalescer: RequestCoalescer<u8, u32> = RequestCoalescer::new();
        let (old_tx, old_rx) = oneshot::channel::<u32>();
        let old = coalescer.get_or_create(1, move || async move { old_rx.await.unwrap_or(0) });
        coalescer.clear();
        assert!(coalescer.is_empty());

        let (new_tx, new_rx) = oneshot::channel::<u32>();
        let new = coalescer.get_or_create(1, move || async move { new_rx.await.unwrap_or(0) });
        assert!(new.created);

        old_tx.send(1).unwrap();
        assert_eq!(old.outcome.await, 1);
        assert!(coalescer.contains(&1));

        new_tx.send(2).unwrap();
        assert_eq!(new.outcome.await, 2);
        assert!(coalescer.is_empty());
    }
}
