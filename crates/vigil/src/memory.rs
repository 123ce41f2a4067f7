//! In-memory document source for tests, examples, and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use vigil_core::{
    CacheError, Document, DocumentPath, DocumentSource, QueryKey, QueryTarget, Result, Snapshot,
    SnapshotSink, SourceSubscription,
};

/// Push-based in-memory document store.
///
/// Topics are keyed by the same canonical keys the cache uses, so a
/// snapshot published for a target reaches exactly the subscriptions whose
/// target normalizes to the same key. There is no query evaluation: what
/// you publish for a target is what its subscribers receive.
///
/// Every new subscription synchronously receives the topic's latest
/// snapshot, or the empty snapshot when nothing was published yet, before
/// `subscribe` returns.
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
    subscribes: AtomicUsize,
    cancels: Arc<AtomicUsize>,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<QueryKey, Topic>,
    next_subscription: u64,
}

#[derive(Default)]
struct Topic {
    latest: Option<Snapshot>,
    sinks: Vec<(u64, SnapshotSink)>,
}

impl MemorySource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            subscribes: AtomicUsize::new(0),
            cancels: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Publish the full result set for a target, replacing whatever was
    /// there. Current subscribers are notified; the snapshot is retained
    /// for future ones.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`] when the target cannot be normalized.
    pub fn publish(&self, target: impl Into<QueryTarget>, docs: Vec<Document>) -> Result<()> {
        let key = vigil_core::normalize(&target.into())?;
        let snapshot = Snapshot::new(docs);
        let sinks = {
            let mut inner = self.inner.lock();
            let topic = inner.topics.entry(key.clone()).or_default();
            topic.latest = Some(snapshot.clone());
            topic.sinks.iter().map(|(_, s)| s.clone()).collect::<Vec<_>>()
        };
        tracing::debug!("publishing {} document(s) to {}", snapshot.len(), key);
        for sink in sinks {
            sink.push(snapshot.clone());
        }
        Ok(())
    }

    /// Publish a single document's current value; `None` means it does not
    /// exist (subscribers of the path see the empty snapshot).
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`] when the path cannot be normalized.
    pub fn publish_document(&self, path: DocumentPath, doc: Option<Document>) -> Result<()> {
        self.publish(path, doc.into_iter().collect())
    }

    /// Report a failure to every current subscriber of a target. The
    /// topic's retained snapshot stays.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`] when the target cannot be normalized.
    pub fn publish_error(&self, target: impl Into<QueryTarget>, error: CacheError) -> Result<()> {
        let key = vigil_core::normalize(&target.into())?;
        let sinks = {
            let inner = self.inner.lock();
            inner.topics.get(&key).map_or_else(Vec::new, |topic| {
                topic.sinks.iter().map(|(_, s)| s.clone()).collect()
            })
        };
        tracing::debug!("publishing error to {}: {}", key, error);
        for sink in &sinks {
            sink.fail(error.clone());
        }
        Ok(())
    }

    /// Total subscriptions ever opened.
    #[must_use]
    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::Relaxed)
    }

    /// Total subscriptions cancelled.
    #[must_use]
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::Relaxed)
    }

    /// Subscriptions currently open.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.inner
            .lock()
            .topics
            .values()
            .map(|t| t.sinks.len())
            .sum()
    }
}

impl DocumentSource for MemorySource {
    fn subscribe(
        &self,
        _target: &QueryTarget,
        sink: SnapshotSink,
    ) -> Result<Box<dyn SourceSubscription>> {
        let key = sink.key().clone();
        self.subscribes.fetch_add(1, Ordering::Relaxed);
        let (id, initial) = {
            let mut inner = self.inner.lock();
            let id = inner.next_subscription;
            inner.next_subscription += 1;
            let topic = inner.topics.entry(key.clone()).or_default();
            topic.sinks.push((id, sink.clone()));
            (id, topic.latest.clone())
        };
        tracing::debug!("memory subscription {} opened for {}", id, key);

        // Initial delivery happens with no locks held: the sink may run
        // consumer callbacks, and those may call back into this source.
        sink.push(initial.unwrap_or_else(Snapshot::empty));

        Ok(Box::new(MemoryGuard {
            inner: Arc::clone(&self.inner),
            cancels: Arc::clone(&self.cancels),
            key,
            id,
            done: false,
        }))
    }
}

struct MemoryGuard {
    inner: Arc<Mutex<Inner>>,
    cancels: Arc<AtomicUsize>,
    key: QueryKey,
    id: u64,
    done: bool,
}

impl SourceSubscription for MemoryGuard {
    fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.cancels.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if let Some(topic) = inner.topics.get_mut(&self.key) {
            topic.sinks.retain(|(id, _)| *id != self.id);
        }
        tracing::debug!("memory subscription {} cancelled for {}", self.id, self.key);
    }
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
