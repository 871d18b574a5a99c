//! Micro-batching for single-text requests: callers arriving within a short
//! window are grouped by option signature and answered by one multi-text
//! call per group.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::engine::EngineKind;
use super::normalize::prepare;
use super::{Area, PartialListener, PartialResult, TranslateOptions, TranslationResult};

/// How long a buffered request waits for company.
pub const SINGLE_QUEUE_DELAY: Duration = Duration::from_millis(16);

/// Option fields that must match exactly for two requests to share a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSignature {
    target_language: Option<String>,
    source_language: String,
    area: Area,
    engine: Option<EngineKind>,
    skip_dictionary: bool,
    skip_known_translated: bool,
}

impl QueueSignature {
    pub fn of(options: &TranslateOptions) -> Self {
        Self {
            target_language: options.target_language.clone(),
            source_language: options.source_language_or_auto().to_string(),
            area: options.area,
            engine: options.engine,
            skip_dictionary: options.skip_dictionary,
            skip_known_translated: options.skip_known_translated,
        }
    }
}

struct Pending {
    text: String,
    options: TranslateOptions,
    reply: oneshot::Sender<TranslationResult>,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Pending>,
    armed: bool,
}

/// Receiver side of an enqueued request.
pub struct Enqueued {
    pub reply: oneshot::Receiver<TranslationResult>,
    /// True when this request opened a new window; the caller must schedule
    /// a flush after `SINGLE_QUEUE_DELAY`.
    pub arm_flush: bool,
}

impl Enqueued {
    /// Wait for the answer. A request dropped without one resolves empty.
    pub async fn result(self) -> TranslationResult {
        self.reply.await.unwrap_or_else(|_| TranslationResult::empty())
    }
}

#[derive(Default)]
pub struct SingleRequestQueue {
    state: Mutex<QueueState>,
}

impl SingleRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, text: impl Into<String>, options: TranslateOptions) -> Enqueued {
        let (reply, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.pending.push(Pending {
            text: text.into(),
            options,
            reply,
        });
        let arm_flush = !state.armed;
        state.armed = true;
        Enqueued { reply: rx, arm_flush }
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    fn take(&self) -> Vec<Pending> {
        let mut state = self.state.lock();
        state.armed = false;
        std::mem::take(&mut state.pending)
    }

    /// Resolve every buffered request with "no translation".
    pub fn drain(&self) -> usize {
        let pending = self.take();
        let count = pending.len();
        for item in pending {
            let _ = item.reply.send(TranslationResult::empty());
        }
        count
    }

    /// Answer everything buffered so far. `run` receives the texts and the
    /// options of one signature group and returns index-aligned results;
    /// missing results resolve empty.
    pub async fn flush<F, Fut>(&self, run: F)
    where
        F: Fn(Vec<String>, TranslateOptions) -> Fut,
        Fut: Future<Output = Vec<TranslationResult>>,
    {
        let pending = self.take();
        if pending.is_empty() {
            return;
        }

        let mut order: Vec<QueueSignature> = Vec::new();
        let mut groups: HashMap<QueueSignature, Vec<Pending>> = HashMap::new();
        for item in pending {
            let signature = QueueSignature::of(&item.options);
            if !groups.contains_key(&signature) {
                order.push(signature.clone());
            }
            groups.entry(signature).or_default().push(item);
        }
        debug!(groups = order.len(), "flushing single-request queue");

        let runs = order.into_iter().filter_map(|sig| groups.remove(&sig)).map(|group| {
            let texts: Vec<String> = group.iter().map(|p| p.text.clone()).collect();
            let options = group_options(&group);
            let call = run(texts, options);
            async move {
                let mut results = call.await.into_iter();
                for item in group {
                    let _ = item.reply.send(results.next().unwrap_or_else(TranslationResult::empty));
                }
            }
        });
        join_all(runs).await;
    }
}

/// Options for a group call: the first member's options, with progressive
/// notifications routed back to each member whose text produced them.
fn group_options(group: &[Pending]) -> TranslateOptions {
    let mut options = group[0].options.clone();
    let listeners: Vec<(String, PartialListener)> = group
        .iter()
        .filter_map(|p| p.options.on_partial.clone().map(|l| (prepare(&p.text), l)))
        .collect();
    if listeners.is_empty() {
        options.on_partial = None;
        return options;
    }
    let fan_out: PartialListener = Arc::new(move |partial: PartialResult| {
        for (source, listener) in &listeners {
            if *source == partial.source {
                listener(partial.clone());
            }
        }
    });
    options.on_partial = Some(fan_out);
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::ResultSource;

    fn hit(text: &str) -> TranslationResult {
        TranslationResult::new(
            Some(format!("<{text}>")),
            Some(ResultSource::Engine(EngineKind::Google)),
            false,
        )
    }

    #[tokio::test]
    async fn groups_by_signature() {
        let queue = SingleRequestQueue::new();
        let a = queue.enqueue("a", TranslateOptions::to("en"));
        let b = queue.enqueue("b", TranslateOptions::to("en"));
        let c = queue.enqueue("c", TranslateOptions::to("fr"));
        assert!(a.arm_flush);
        assert!(!b.arm_flush);
        assert!(!c.arm_flush);

        let calls = Mutex::new(Vec::new());
        queue
            .flush(|texts, options| {
                calls.lock().push((texts.clone(), options.target_language.clone()));
                async move { texts.iter().map(|t| hit(t)).collect() }
            })
            .await;

        assert_eq!(
            *calls.lock(),
            vec![
                (vec!["a".to_string(), "b".to_string()], Some("en".to_string())),
                (vec!["c".to_string()], Some("fr".to_string())),
            ]
        );
        assert_eq!(a.result().await.translation.as_deref(), Some("<a>"));
        assert_eq!(b.result().await.translation.as_deref(), Some("<b>"));
        assert_eq!(c.result().await.translation.as_deref(), Some("<c>"));
        assert!(queue.enqueue("d", TranslateOptions::default()).arm_flush);
    }

    #[tokio::test]
    async fn short_results_resolve_empty() {
        let queue = SingleRequestQueue::new();
        let a = queue.enqueue("a", TranslateOptions::default());
        let b = queue.enqueue("b", TranslateOptions::default());
        queue.flush(|_, _| async { vec![hit("a")] }).await;
        assert_eq!(a.result().await.translation.as_deref(), Some("<a>"));
        assert_eq!(b.result().await, TranslationResult::empty());
    }

    #[tokio::test]
    async fn drain_resolves_everyone() {
        let queue = SingleRequestQueue::new();
        let a = queue.enqueue("a", TranslateOptions::default());
        assert_eq!(queue.drain(), 1);
        assert!(queue.is_empty());
        assert_eq!(a.result().await, TranslationResult::empty());
    }

    #[test]
    fn partials_reach_the_matching_caller() {
        let queue = SingleRequestQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let with_listener = TranslateOptions {
            on_partial: Some(Arc::new(move |p: PartialResult| sink.lock().push(p.translation))),
            ..TranslateOptions::default()
        };
        let _first = queue.enqueue("Episode12", TranslateOptions::default());
        let _second = queue.enqueue("猫", with_listener);

        let group = queue.take();
        let options = group_options(&group);
        for source in ["Episode 12", "猫"] {
            options.notify(|| PartialResult {
                source: source.to_string(),
                translation: format!("t:{source}"),
                engine: ResultSource::Engine(EngineKind::Google),
            });
        }
        assert_eq!(*seen.lock(), vec!["t:猫".to_string()]);
    }
}
