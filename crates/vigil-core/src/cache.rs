//! The subscription registry: one shared map from canonical query keys to
//! live entries.
//!
//! All registry, entry, and consumer bookkeeping is serialized behind a
//! single mutex, because upstream pushes, attaches, and detaches originate
//! from execution contexts that are otherwise unordered. Two things run
//! outside the lock: upstream opens, so a source that delivers synchronously
//! from `subscribe` cannot deadlock, and observer fanout, so consumers can
//! reentrantly subscribe or unsubscribe from inside their own callbacks.
//! Delivery gates are committed under the lock before any callback runs, so
//! a reentrant change never double-delivers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::callback::ObserverCell;
use crate::entry::{Consumer, ConsumerId, ConsumerSink, DeliveryGate, EntryState, QueryEntry};
use crate::error::{CacheError, Result, SharedError};
use crate::handle::LiveState;
use crate::query::{normalize, QueryKey, QueryTarget};
use crate::snapshot::Snapshot;
use crate::source::{DocumentSource, SnapshotSink, SourceSubscription};

// ---------------------------------------------------------------------------
// CacheMetrics
// ---------------------------------------------------------------------------

/// Cache-wide counters. All loads are relaxed; the numbers are for
/// observability and tests, not for synchronization.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    entries_created: AtomicU64,
    entries_closed: AtomicU64,
    snapshots_applied: AtomicU64,
    errors_recorded: AtomicU64,
    deliveries: AtomicU64,
    suppressed: AtomicU64,
    stale_drops: AtomicU64,
}

impl CacheMetrics {
    /// Entries created (one per upstream subscribe attempt).
    #[must_use]
    pub fn entries_created(&self) -> u64 {
        self.entries_created.load(Ordering::Relaxed)
    }

    /// Entries closed after their last consumer detached.
    #[must_use]
    pub fn entries_closed(&self) -> u64 {
        self.entries_closed.load(Ordering::Relaxed)
    }

    /// Snapshots accepted from upstream.
    #[must_use]
    pub fn snapshots_applied(&self) -> u64 {
        self.snapshots_applied.load(Ordering::Relaxed)
    }

    /// Upstream errors recorded on entries.
    #[must_use]
    pub fn errors_recorded(&self) -> u64 {
        self.errors_recorded.load(Ordering::Relaxed)
    }

    /// States handed to consumers (fanout, warm joins, resume catch-ups).
    #[must_use]
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    /// Deliveries suppressed by an unchanged fingerprint.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Deliveries dropped because their entry was gone or superseded.
    #[must_use]
    pub fn stale_drops(&self) -> u64 {
        self.stale_drops.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// QueryCache
// ---------------------------------------------------------------------------

/// The shared live-query subscription cache.
///
/// Maps canonical query keys to entries, each owning at most one upstream
/// subscription no matter how many consumers attached. Constructed once per
/// document source and shared via [`Arc`]; subscription surfaces hang off
/// it:
///
/// ```rust,ignore
/// let cache = QueryCache::new(source);
/// let tasks = cache.live_query(Query::collection("tasks"))?;
/// let guard = cache.observe_fn(Query::collection("devices"), |state| {
///     println!("devices: {:?}", state.data().map(Snapshot::len));
/// })?;
/// ```
pub struct QueryCache {
    source: Arc<dyn DocumentSource>,
    inner: Mutex<CacheInner>,
    next_consumer: AtomicU64,
    next_generation: AtomicU64,
    metrics: CacheMetrics,
}

struct CacheInner {
    entries: FxHashMap<QueryKey, QueryEntry>,
}

/// Result of attaching a consumer: where it landed.
pub(crate) struct Attachment {
    pub(crate) key: QueryKey,
    pub(crate) id: ConsumerId,
}

impl QueryCache {
    /// Create a cache over a document source.
    #[must_use]
    pub fn new(source: Arc<dyn DocumentSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            inner: Mutex::new(CacheInner {
                entries: FxHashMap::default(),
            }),
            next_consumer: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            metrics: CacheMetrics::default(),
        })
    }

    /// Cache-wide counters.
    #[must_use]
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Number of live entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Lifecycle state of the entry for `key`, if one is live.
    #[must_use]
    pub fn entry_state(&self, key: &QueryKey) -> Option<EntryState> {
        self.inner.lock().entries.get(key).map(|e| e.state)
    }

    /// Consumers attached to `key`'s entry.
    #[must_use]
    pub fn consumer_count(&self, key: &QueryKey) -> usize {
        self.inner
            .lock()
            .entries
            .get(key)
            .map_or(0, QueryEntry::ref_count)
    }

    /// Attach a consumer to the entry for `target`, creating the entry and
    /// opening the upstream subscription when this is its first consumer.
    ///
    /// Warm joins are served here: if the entry already holds a snapshot or
    /// an error, it is delivered to the new consumer before this returns,
    /// into the watch channel for handle sinks and through the observer
    /// callback (outside the lock) for observer sinks.
    pub(crate) fn attach(
        self: &Arc<Self>,
        target: &QueryTarget,
        sink: ConsumerSink,
    ) -> Result<Attachment> {
        let key = normalize(target)?;
        let id = ConsumerId(self.next_consumer.fetch_add(1, Ordering::Relaxed));

        let mut opening = None;
        let mut warm_observer: Option<(Arc<ObserverCell>, LiveState)> = None;
        {
            let mut inner = self.inner.lock();
            let entry = inner.entries.entry(key.clone()).or_insert_with(|| {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                self.metrics.entries_created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("creating entry for {} (generation {})", key, generation);
                opening = Some(generation);
                QueryEntry::new(generation)
            });

            let mut consumer = Consumer {
                id,
                enabled: true,
                gate: DeliveryGate::default(),
                sink,
            };
            if entry.is_warm() {
                let state = entry.current_state();
                if let Some(fp) = entry.fingerprint {
                    consumer.gate.admit_snapshot(fp);
                }
                if entry.error.is_some() {
                    consumer.gate.admit_error();
                }
                self.metrics.deliveries.fetch_add(1, Ordering::Relaxed);
                match &consumer.sink {
                    ConsumerSink::Watch(tx) => {
                        tx.send_replace(state);
                    }
                    ConsumerSink::Observer(cell) => {
                        warm_observer = Some((Arc::clone(cell), state));
                    }
                }
            }
            entry.consumers.push(consumer);
        }

        if let Some(generation) = opening {
            self.open_upstream(&key, generation, target);
        }
        if let Some((cell, state)) = warm_observer {
            cell.deliver(&state);
        }

        Ok(Attachment { key, id })
    }

    /// Open the upstream subscription for a freshly created entry. Runs
    /// without the lock held: the source may deliver synchronously, and
    /// that delivery needs the lock. If the entry vanished or was replaced
    /// while the open was in flight, the fresh subscription is cancelled on
    /// the spot.
    fn open_upstream(self: &Arc<Self>, key: &QueryKey, generation: u64, target: &QueryTarget) {
        let sink = SnapshotSink::new(Arc::downgrade(self), key.clone(), generation);
        match self.source.subscribe(target, sink) {
            Ok(guard) => {
                let mut orphaned = Some(guard);
                {
                    let mut inner = self.inner.lock();
                    if let Some(entry) = inner.entries.get_mut(key) {
                        if entry.generation == generation {
                            entry.upstream = orphaned.take();
                            if entry.state == EntryState::Unopened {
                                entry.state = EntryState::Active;
                            }
                        }
                    }
                }
                if let Some(mut guard) = orphaned {
                    tracing::debug!("cancelling orphaned upstream subscription for {}", key);
                    guard.cancel();
                }
            }
            Err(error) => {
                tracing::warn!("upstream subscription for {} failed to open: {}", key, error);
                self.apply_error(key, generation, error);
            }
        }
    }

    /// Detach `id` from `key`'s entry. The last detach closes the entry:
    /// it is removed from the map and the upstream subscription cancelled,
    /// within the same detach call. Detaching an unknown consumer is a
    /// no-op, which is what makes unsubscribe idempotent.
    pub(crate) fn detach(&self, key: &QueryKey, id: ConsumerId) {
        let mut closing: Option<Box<dyn SourceSubscription>> = None;
        {
            let mut inner = self.inner.lock();
            let close_now = {
                let Some(entry) = inner.entries.get_mut(key) else {
                    return;
                };
                if !entry.remove_consumer(id) {
                    return;
                }
                entry.ref_count() == 0
            };
            if close_now {
                if let Some(mut entry) = inner.entries.remove(key) {
                    entry.state = EntryState::Closed;
                    closing = entry.upstream.take();
                    self.metrics.entries_closed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("closing entry for {} (generation {})", key, entry.generation);
                }
            }
        }
        // Cancel outside the lock; the map no longer knows the entry, so a
        // concurrent subscribe for the same key builds a fresh one.
        if let Some(mut guard) = closing {
            guard.cancel();
        }
    }

    /// Enable or disable deliveries for one consumer. Disabling skips the
    /// consumer during fanout without advancing its gate; enabling re-runs
    /// the gate against the entry's current state, so a consumer that
    /// missed anything while paused catches up immediately.
    pub(crate) fn set_enabled(&self, key: &QueryKey, id: ConsumerId, enabled: bool) {
        let mut catch_up: Option<(Arc<ObserverCell>, LiveState)> = None;
        {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(key) else {
                return;
            };
            let state = entry.current_state();
            let fingerprint = entry.fingerprint;
            let has_error = entry.error.is_some();
            let Some(consumer) = entry.consumer_mut(id) else {
                return;
            };
            if consumer.enabled == enabled {
                return;
            }
            consumer.enabled = enabled;
            if !enabled {
                return;
            }

            let mut notify = false;
            if let Some(fp) = fingerprint {
                notify |= consumer.gate.admit_snapshot(fp);
            }
            if has_error {
                consumer.gate.admit_error();
                notify = true;
            }
            if notify {
                self.metrics.deliveries.fetch_add(1, Ordering::Relaxed);
                match &consumer.sink {
                    ConsumerSink::Watch(tx) => {
                        tx.send_replace(state);
                    }
                    ConsumerSink::Observer(cell) => {
                        catch_up = Some((Arc::clone(cell), state));
                    }
                }
            }
        }
        if let Some((cell, state)) = catch_up {
            cell.deliver(&state);
        }
    }

    /// Accept a snapshot from upstream: store it wholesale, clear any
    /// recorded error, and notify every enabled consumer whose gate admits
    /// the new fingerprint. Called by [`SnapshotSink::push`].
    pub(crate) fn apply_snapshot(&self, key: &QueryKey, generation: u64, snapshot: Snapshot) {
        let fingerprint = snapshot.fingerprint();
        let mut observers: SmallVec<[(Arc<ObserverCell>, LiveState); 4]> = SmallVec::new();
        {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(key) else {
                self.metrics.stale_drops.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropping snapshot for closed entry {}", key);
                return;
            };
            if entry.generation != generation {
                self.metrics.stale_drops.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropping snapshot from superseded subscription for {}", key);
                return;
            }
            if entry.state == EntryState::Unopened {
                entry.state = EntryState::Active;
            }
            entry.snapshot = Some(snapshot);
            entry.fingerprint = Some(fingerprint);
            entry.error = None;
            self.metrics.snapshots_applied.fetch_add(1, Ordering::Relaxed);

            let state = entry.current_state();
            for consumer in &mut entry.consumers {
                if !consumer.enabled {
                    continue;
                }
                if consumer.gate.admit_snapshot(fingerprint) {
                    self.metrics.deliveries.fetch_add(1, Ordering::Relaxed);
                    match &consumer.sink {
                        ConsumerSink::Watch(tx) => {
                            tx.send_replace(state.clone());
                        }
                        ConsumerSink::Observer(cell) => {
                            observers.push((Arc::clone(cell), state.clone()));
                        }
                    }
                } else {
                    self.metrics.suppressed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        for (cell, state) in observers {
            cell.deliver(&state);
        }
    }

    /// Record an upstream error on the entry and notify every enabled
    /// consumer, fingerprint notwithstanding. The last-known-good snapshot
    /// stays. Called by [`SnapshotSink::fail`].
    pub(crate) fn apply_error(&self, key: &QueryKey, generation: u64, error: CacheError) {
        let shared: SharedError = Arc::new(error);
        let mut observers: SmallVec<[(Arc<ObserverCell>, LiveState); 4]> = SmallVec::new();
        {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(key) else {
                self.metrics.stale_drops.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropping error for closed entry {}", key);
                return;
            };
            if entry.generation != generation {
                self.metrics.stale_drops.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropping error from superseded subscription for {}", key);
                return;
            }
            if entry.state == EntryState::Unopened {
                entry.state = EntryState::Active;
            }
            entry.error = Some(Arc::clone(&shared));
            self.metrics.errors_recorded.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("upstream error recorded for {}: {}", key, shared);

            let state = entry.current_state();
            for consumer in &mut entry.consumers {
                if !consumer.enabled {
                    continue;
                }
                consumer.gate.admit_error();
                self.metrics.deliveries.fetch_add(1, Ordering::Relaxed);
                match &consumer.sink {
                    ConsumerSink::Watch(tx) => {
                        tx.send_replace(state.clone());
                    }
                    ConsumerSink::Observer(cell) => {
                        observers.push((Arc::clone(cell), state.clone()));
                    }
                }
            }
        }
        for (cell, state) in observers {
            cell.deliver(&state);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use crate::query::{Direction, FilterOp, Query};
    use crate::snapshot::{Document, FieldMap, Version};

    // --- Test source ---

    struct TestSource {
        events: Arc<StdMutex<Vec<&'static str>>>,
        sinks: StdMutex<Vec<SnapshotSink>>,
        subscribes: AtomicUsize,
        cancels: Arc<AtomicUsize>,
        reject: bool,
    }

    impl TestSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Arc::new(StdMutex::new(Vec::new())),
                sinks: StdMutex::new(Vec::new()),
                subscribes: AtomicUsize::new(0),
                cancels: Arc::new(AtomicUsize::new(0)),
                reject: false,
            })
        }

        fn rejecting() -> Arc<Self> {
            let mut source = Self::new();
            Arc::get_mut(&mut source).unwrap().reject = true;
            source
        }

        fn sink(&self, i: usize) -> SnapshotSink {
            self.sinks.lock().unwrap()[i].clone()
        }

        fn subscribe_count(&self) -> usize {
            self.subscribes.load(Ordering::Relaxed)
        }

        fn cancel_count(&self) -> usize {
            self.cancels.load(Ordering::Relaxed)
        }

        fn log(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    impl DocumentSource for TestSource {
        fn subscribe(
            &self,
            _target: &QueryTarget,
            sink: SnapshotSink,
        ) -> Result<Box<dyn SourceSubscription>> {
            self.subscribes.fetch_add(1, Ordering::Relaxed);
            self.events.lock().unwrap().push("subscribe");
            if self.reject {
                return Err(CacheError::UpstreamUnavailable("scripted failure".into()));
            }
            self.sinks.lock().unwrap().push(sink);
            Ok(Box::new(TestGuard {
                done: false,
                cancels: Arc::clone(&self.cancels),
                events: Arc::clone(&self.events),
            }))
        }
    }

    struct TestGuard {
        done: bool,
        cancels: Arc<AtomicUsize>,
        events: Arc<StdMutex<Vec<&'static str>>>,
    }

    impl SourceSubscription for TestGuard {
        fn cancel(&mut self) {
            if self.done {
                return;
            }
            self.done = true;
            self.cancels.fetch_add(1, Ordering::Relaxed);
            self.events.lock().unwrap().push("cancel");
        }
    }

    impl Drop for TestGuard {
        fn drop(&mut self) {
            self.cancel();
        }
    }

    // --- Helpers ---

    fn tasks_query() -> Query {
        Query::collection("tasks")
            .filter("team", FilterOp::Eq, "atlas")
            .order_by("createdAt", Direction::Desc)
    }

    fn doc(id: &str, version: u64) -> Document {
        Document::new(id, Version(version), FieldMap::new())
    }

    fn doc_with(id: &str, version: u64, fields: serde_json::Value) -> Document {
        Document::new(
            id,
            Version(version),
            fields.as_object().cloned().unwrap_or_default(),
        )
    }

    // --- Sharing tests ---

    #[test]
    fn test_identical_queries_share_one_upstream() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        // Same logical query, filters added in a different order.
        let a = cache.live_query(tasks_query()).unwrap();
        let b = cache
            .live_query(
                Query::collection("tasks")
                    .order_by("createdAt", Direction::Desc)
                    .filter("team", FilterOp::Eq, "atlas"),
            )
            .unwrap();

        assert_eq!(source.subscribe_count(), 1);
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(a.key(), b.key());
        assert_eq!(cache.consumer_count(a.key()), 2);
    }

    #[test]
    fn test_distinct_queries_get_distinct_entries() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        let _a = cache.live_query(tasks_query()).unwrap();
        let _b = cache
            .live_query(Query::collection("tasks").filter("team", FilterOp::Eq, "borealis"))
            .unwrap();

        assert_eq!(source.subscribe_count(), 2);
        assert_eq!(cache.entry_count(), 2);
    }

    // --- Reference counting tests ---

    #[test]
    fn test_refcount_many_attach_detach() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        let handles: Vec<_> = (0..5)
            .map(|_| cache.live_query(tasks_query()).unwrap())
            .collect();
        assert_eq!(source.subscribe_count(), 1);
        assert_eq!(cache.consumer_count(handles[0].key()), 5);

        drop(handles);
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(source.cancel_count(), 1);
    }

    #[test]
    fn test_close_then_reopen_subscribes_twice() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        let first = cache.live_query(tasks_query()).unwrap();
        drop(first);
        let _second = cache.live_query(tasks_query()).unwrap();

        assert_eq!(source.log(), vec!["subscribe", "cancel", "subscribe"]);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_detach_unknown_consumer_is_noop() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        let handle = cache.live_query(tasks_query()).unwrap();
        cache.detach(handle.key(), ConsumerId(9999));
        assert_eq!(cache.consumer_count(handle.key()), 1);
    }

    #[test]
    fn test_malformed_query_never_reaches_registry() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        let err = cache.live_query(Query::collection("")).unwrap_err();
        assert!(matches!(err, CacheError::MalformedQuery(_)));
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(source.subscribe_count(), 0);
    }

    // --- Delivery tests ---

    #[test]
    fn test_warm_join_is_synchronous() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        let first = cache.live_query(tasks_query()).unwrap();
        source
            .sink(0)
            .push(Snapshot::new(vec![doc_with("t1", 1, json!({ "title": "x" }))]));
        assert_eq!(first.state().data().map(Snapshot::len), Some(1));

        // No runtime is driving anything here: the second consumer's state
        // is populated within live_query itself.
        let second = cache.live_query(tasks_query()).unwrap();
        let state = second.state();
        assert!(!state.is_loading());
        assert_eq!(state.data().map(Snapshot::len), Some(1));
        assert_eq!(source.subscribe_count(), 1);
    }

    #[test]
    fn test_consumer_isolation_on_detach() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        let keep = cache.live_query(tasks_query()).unwrap();
        let gone = cache.live_query(tasks_query()).unwrap();
        gone.unsubscribe();

        source.sink(0).push(Snapshot::new(vec![doc("t1", 1)]));
        assert_eq!(keep.state().data().map(Snapshot::len), Some(1));
        assert_eq!(cache.consumer_count(keep.key()), 1);
        assert_eq!(source.cancel_count(), 0);
    }

    #[test]
    fn test_stale_delivery_dropped() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        let first = cache.live_query(tasks_query()).unwrap();
        let stale_sink = source.sink(0);
        drop(first);

        // Entry is gone entirely.
        stale_sink.push(Snapshot::new(vec![doc("t1", 1)]));
        assert_eq!(cache.metrics().stale_drops(), 1);

        // A fresh entry for the same key must not hear from the old feed.
        let second = cache.live_query(tasks_query()).unwrap();
        stale_sink.push(Snapshot::new(vec![doc("t1", 2)]));
        assert!(second.state().is_loading());
        assert_eq!(cache.metrics().stale_drops(), 2);

        source.sink(1).push(Snapshot::new(vec![doc("t2", 1)]));
        assert_eq!(
            second.state().data().and_then(Snapshot::first).map(Document::id),
            Some("t2")
        );
    }

    #[test]
    fn test_metrics_accounting() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        let handle = cache.live_query(tasks_query()).unwrap();
        source.sink(0).push(Snapshot::new(vec![doc("t1", 1)]));
        // Same (id, version) pair again: applied but suppressed at the gate.
        source
            .sink(0)
            .push(Snapshot::new(vec![doc_with("t1", 1, json!({ "edited": true }))]));

        let metrics = cache.metrics();
        assert_eq!(metrics.entries_created(), 1);
        assert_eq!(metrics.snapshots_applied(), 2);
        assert_eq!(metrics.deliveries(), 1);
        assert_eq!(metrics.suppressed(), 1);

        drop(handle);
        assert_eq!(cache.metrics().entries_closed(), 1);
    }

    // --- Error tests ---

    #[test]
    fn test_failed_open_marks_entry_errored() {
        let source = TestSource::rejecting();
        let cache = QueryCache::new(source.clone());

        let first = cache.live_query(tasks_query()).unwrap();
        let state = first.state();
        assert!(!state.is_loading());
        assert!(matches!(
            state.error(),
            Some(CacheError::UpstreamUnavailable(_))
        ));
        assert_eq!(cache.entry_state(first.key()), Some(EntryState::Active));

        // Future consumers of the same key observe the recorded error too.
        let second = cache.live_query(tasks_query()).unwrap();
        assert!(second.state().error().is_some());
        assert_eq!(source.subscribe_count(), 1);

        drop(first);
        drop(second);
        assert_eq!(cache.entry_count(), 0);
        // There was never an upstream guard to cancel.
        assert_eq!(source.cancel_count(), 0);
    }

    #[test]
    fn test_error_preserves_last_known_good_snapshot() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        let handle = cache.live_query(tasks_query()).unwrap();
        source.sink(0).push(Snapshot::new(vec![doc("t1", 1)]));
        source
            .sink(0)
            .fail(CacheError::UpstreamUnavailable("feed dropped".into()));

        let state = handle.state();
        assert_eq!(state.data().map(Snapshot::len), Some(1));
        assert!(state.error().is_some());

        // A successful push with the same fingerprint still clears the
        // error for consumers that saw it.
        source.sink(0).push(Snapshot::new(vec![doc("t1", 1)]));
        let state = handle.state();
        assert!(state.error().is_none());
        assert_eq!(state.data().map(Snapshot::len), Some(1));
    }

    // --- Concurrency tests ---

    #[test]
    fn test_registry_thread_safety() {
        let source = TestSource::new();
        let cache = QueryCache::new(source.clone());

        let mut threads = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            threads.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let handle = cache.live_query(tasks_query()).unwrap();
                    let _ = handle.state();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(cache.entry_count(), 0);
        assert_eq!(source.subscribe_count(), source.cancel_count());
        assert!(source.subscribe_count() >= 1);
    }
}
