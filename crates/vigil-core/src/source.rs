//! The upstream document-store contract.
//!
//! The cache talks to storage exclusively through [`DocumentSource`]: one
//! `subscribe` call per cache entry, snapshots and errors pushed back
//! through the provided [`SnapshotSink`], teardown through the returned
//! [`SourceSubscription`] guard. Query evaluation, transport, auth, and
//! persistence all live behind this seam.

use std::fmt;
use std::sync::Weak;

use crate::cache::QueryCache;
use crate::error::{CacheError, Result};
use crate::query::{QueryKey, QueryTarget};
use crate::snapshot::Snapshot;

// ---------------------------------------------------------------------------
// DocumentSource
// ---------------------------------------------------------------------------

/// A push-based document store the cache subscribes against.
///
/// # Contract
///
/// - At-least-one initial callback: every accepted subscription eventually
///   pushes a first snapshot (possibly empty) or an error through its sink.
/// - Version tokens are monotonically non-decreasing per document id; the
///   fingerprint gate relies on this.
/// - Snapshots arrive whole and already ordered; the cache never re-sorts
///   or patches.
/// - `subscribe` must not block. Slow work happens behind the sink, which
///   may be driven from any execution context.
pub trait DocumentSource: Send + Sync + 'static {
    /// Open one upstream subscription for `target`, pushing results into
    /// `sink` until the returned guard is cancelled.
    ///
    /// # Errors
    ///
    /// [`CacheError::UpstreamUnavailable`] when the subscription cannot be
    /// opened, or [`CacheError::MalformedQuery`] when the source rejects a
    /// target the normalizer could not see into (raw query text).
    fn subscribe(
        &self,
        target: &QueryTarget,
        sink: SnapshotSink,
    ) -> Result<Box<dyn SourceSubscription>>;
}

/// Cancellation guard for one upstream subscription.
///
/// The cache calls [`cancel`](SourceSubscription::cancel) exactly once, when
/// the owning entry closes. Implementations should also release their
/// resources on drop, for the case where a guard is discarded before it was
/// installed.
pub trait SourceSubscription: Send {
    /// Tear down the upstream subscription. Must not block on network
    /// completion; an in-flight final delivery is tolerated (the cache drops
    /// deliveries from superseded subscriptions).
    fn cancel(&mut self);
}

// ---------------------------------------------------------------------------
// SnapshotSink
// ---------------------------------------------------------------------------

/// Push interface handed to a [`DocumentSource`] for one upstream
/// subscription.
///
/// Cloneable and thread-safe; the source may push from any execution
/// context. Every delivery is tagged with the owning entry's generation, so
/// a sink that outlives its entry (a late snapshot racing teardown) is
/// dropped instead of resurrecting closed state.
#[derive(Clone)]
pub struct SnapshotSink {
    cache: Weak<QueryCache>,
    key: QueryKey,
    generation: u64,
}

impl SnapshotSink {
    pub(crate) fn new(cache: Weak<QueryCache>, key: QueryKey, generation: u64) -> Self {
        Self {
            cache,
            key,
            generation,
        }
    }

    /// Deliver a new snapshot, wholesale-replacing the previous one and
    /// clearing any recorded error.
    pub fn push(&self, snapshot: Snapshot) {
        if let Some(cache) = self.cache.upgrade() {
            cache.apply_snapshot(&self.key, self.generation, snapshot);
        }
    }

    /// Report an upstream failure. The last-known-good snapshot is kept;
    /// the error reaches every current and future consumer of the entry
    /// until a successful snapshot clears it.
    pub fn fail(&self, error: CacheError) {
        if let Some(cache) = self.cache.upgrade() {
            cache.apply_error(&self.key, self.generation, error);
        }
    }

    /// Key of the entry this sink feeds.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl fmt::Debug for SnapshotSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotSink")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
