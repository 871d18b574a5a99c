//! Per-language record of strings that are themselves translations, so
//! output that gets fed back in (re-scanned pages, echoed captions) is not
//! translated a second time.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use super::normalize::prepare;

/// Remembered outputs per target language before the oldest is forgotten.
pub const MAX_KNOWN_PER_LANGUAGE: usize = 6000;

type Digest = [u8; 32];

#[derive(Default)]
struct Bucket {
    set: HashSet<Digest>,
    order: VecDeque<Digest>,
}

pub struct KnownOutputTracker {
    buckets: Mutex<HashMap<String, Bucket>>,
    limit: usize,
}

impl KnownOutputTracker {
    pub fn new() -> Self {
        Self::with_limit(MAX_KNOWN_PER_LANGUAGE)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    fn digest(prepared: &str) -> Digest {
        *blake3::hash(prepared.as_bytes()).as_bytes()
    }

    /// `prepared` must already be in `prepare` form.
    pub fn is_known(&self, prepared: &str, target_language: &str) -> bool {
        self.buckets
            .lock()
            .get(target_language)
            .is_some_and(|bucket| bucket.set.contains(&Self::digest(prepared)))
    }

    /// Remember `text` as output in `target_language`.
    pub fn remember(&self, text: &str, target_language: &str) {
        let prepared = prepare(text);
        if prepared.is_empty() {
            return;
        }
        let digest = Self::digest(&prepared);
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(target_language.to_string()).or_default();
        if !bucket.set.insert(digest) {
            return;
        }
        bucket.order.push_back(digest);
        while bucket.order.len() > self.limit {
            if let Some(oldest) = bucket.order.pop_front() {
                bucket.set.remove(&oldest);
            }
        }
    }

    pub fn len(&self, target_language: &str) -> usize {
        self.buckets
            .lock()
            .get(target_language)
            .map_or(0, |bucket| bucket.set.len())
    }

    pub fn clear(&self) {
        self.buckets.lock().clear();
    }
}

impl Default for KnownOutputTracker {
    fn default() -> Self {
        Self::new()
    }
}
