//! Consumer handles fed through watch channels.
//!
//! A [`LiveQuery`] is one consumer registration on a shared cache entry.
//! The registry publishes each admitted delivery into the handle's watch
//! channel under its lock, so reads are always of a fully committed state;
//! the handle side never takes the registry lock for reads.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::cache::QueryCache;
use crate::entry::{ConsumerId, ConsumerSink};
use crate::error::{CacheError, Result, SharedError};
use crate::query::{DocumentPath, QueryKey, QueryTarget};
use crate::snapshot::{Document, Snapshot};

// ---------------------------------------------------------------------------
// LiveState
// ---------------------------------------------------------------------------

/// What one consumer currently sees for its query.
///
/// Three observable shapes: loading (neither data nor error yet), data, and
/// data-with-error. An upstream failure never erases the last-known-good
/// snapshot; the next successful snapshot clears the error.
#[derive(Debug, Clone, Default)]
pub struct LiveState {
    data: Option<Snapshot>,
    error: Option<SharedError>,
}

impl LiveState {
    pub(crate) fn new(data: Option<Snapshot>, error: Option<SharedError>) -> Self {
        Self { data, error }
    }

    /// Last-known-good snapshot, if any arrived yet.
    #[must_use]
    pub fn data(&self) -> Option<&Snapshot> {
        self.data.as_ref()
    }

    /// Most recent upstream error, until a successful snapshot clears it.
    #[must_use]
    pub fn error(&self) -> Option<&CacheError> {
        self.error.as_deref()
    }

    /// `true` until the first snapshot or error arrives.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.data.is_none() && self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// One consumer's claim on a cache entry. Releases exactly once, on the
/// first of explicit unsubscribe or drop.
pub(crate) struct Registration {
    cache: Arc<QueryCache>,
    key: QueryKey,
    id: ConsumerId,
    released: AtomicBool,
}

impl Registration {
    pub(crate) fn new(cache: Arc<QueryCache>, key: QueryKey, id: ConsumerId) -> Self {
        Self {
            cache,
            key,
            id,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn key(&self) -> &QueryKey {
        &self.key
    }

    pub(crate) fn id(&self) -> ConsumerId {
        self.id
    }

    pub(crate) fn unsubscribe(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.cache.detach(&self.key, self.id);
        }
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        if !self.released.load(Ordering::Acquire) {
            self.cache.set_enabled(&self.key, self.id, enabled);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// LiveQuery
// ---------------------------------------------------------------------------

/// Handle to a shared live query.
///
/// Obtained from [`QueryCache::live_query`]. Identical queries from any
/// number of handles share one cache entry and one upstream subscription.
/// [`state`](LiveQuery::state) reads the current value without waiting;
/// [`changed`](LiveQuery::changed) awaits the next admitted delivery.
/// Dropping the handle (or calling [`unsubscribe`](LiveQuery::unsubscribe))
/// releases its claim; the last release closes the entry and cancels the
/// upstream subscription before returning.
pub struct LiveQuery {
    pub(crate) registration: Registration,
    pub(crate) rx: watch::Receiver<LiveState>,
}

impl fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("key", self.key())
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

impl LiveQuery {
    /// Canonical key of the shared entry this handle is attached to.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        self.registration.key()
    }

    /// This handle's consumer id, unique per registration.
    #[must_use]
    pub fn id(&self) -> ConsumerId {
        self.registration.id()
    }

    /// Current state. Never blocks on upstream activity.
    #[must_use]
    pub fn state(&self) -> LiveState {
        self.rx.borrow().clone()
    }

    /// `true` until the first snapshot or error arrives.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.rx.borrow().is_loading()
    }

    /// Wait for the next delivery admitted for this consumer and return it.
    ///
    /// Deliveries suppressed by the fingerprint gate do not wake this.
    /// Returns `None` once the registration is released (this handle
    /// unsubscribed, so nothing further can arrive).
    pub async fn changed(&mut self) -> Option<LiveState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Stop deliveries to this handle without releasing its claim on the
    /// shared entry. The entry keeps following upstream for everyone else.
    pub fn pause(&self) {
        self.registration.set_enabled(false);
    }

    /// Resume deliveries. Anything missed while paused is collapsed into
    /// one immediate catch-up delivery, if the state actually changed.
    pub fn resume(&self) {
        self.registration.set_enabled(true);
    }

    /// Release this handle's claim on the shared entry. Idempotent: only
    /// the first call (or drop) releases. When this was the entry's last
    /// consumer the entry is closed and the upstream subscription cancelled
    /// before this returns.
    pub fn unsubscribe(&self) {
        self.registration.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// LiveDocument
// ---------------------------------------------------------------------------

/// Handle to a single live document.
///
/// A thin wrapper over [`LiveQuery`] whose snapshots hold at most one
/// record. [`document`](LiveDocument::document) returns `None` both while
/// loading and when the document does not exist; use
/// [`state`](LiveDocument::state) to tell the two apart.
pub struct LiveDocument {
    inner: LiveQuery,
}

impl LiveDocument {
    /// Canonical key of the shared entry this handle is attached to.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        self.inner.key()
    }

    /// This handle's consumer id.
    #[must_use]
    pub fn id(&self) -> ConsumerId {
        self.inner.id()
    }

    /// Current state; the snapshot holds one document or none.
    #[must_use]
    pub fn state(&self) -> LiveState {
        self.inner.state()
    }

    /// The document, if it currently exists.
    #[must_use]
    pub fn document(&self) -> Option<Document> {
        self.inner
            .rx
            .borrow()
            .data()
            .and_then(Snapshot::first)
            .cloned()
    }

    /// `true` until the first snapshot or error arrives.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.is_loading()
    }

    /// Wait for the next admitted delivery.
    pub async fn changed(&mut self) -> Option<LiveState> {
        self.inner.changed().await
    }

    /// Stop deliveries without releasing the shared entry.
    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Resume deliveries, catching up if anything changed while paused.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Release this handle's claim. Idempotent.
    pub fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

impl QueryCache {
    /// Subscribe a watch-channel consumer to `query`.
    ///
    /// Joins the existing entry when an identical query is already live;
    /// otherwise creates the entry and opens one upstream subscription. If
    /// the entry already holds data or an error, the returned handle sees
    /// it immediately.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`] when the query cannot be normalized;
    /// nothing is registered in that case.
    pub fn live_query(self: &Arc<Self>, query: impl Into<QueryTarget>) -> Result<LiveQuery> {
        let target = query.into();
        let (tx, rx) = watch::channel(LiveState::default());
        let attachment = self.attach(&target, ConsumerSink::Watch(tx))?;
        Ok(LiveQuery {
            registration: Registration::new(Arc::clone(self), attachment.key, attachment.id),
            rx,
        })
    }

    /// Subscribe to a single document.
    ///
    /// Shares an entry with every other subscription to the same path.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`] when the path has an empty collection
    /// or document id.
    pub fn live_document(self: &Arc<Self>, path: DocumentPath) -> Result<LiveDocument> {
        Ok(LiveDocument {
            inner: self.live_query(QueryTarget::Document(path))?,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
