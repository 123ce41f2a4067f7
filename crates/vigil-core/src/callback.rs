//! Callback-style consumers.
//!
//! Observers are invoked during fanout, strictly outside the registry lock,
//! so a callback may subscribe, unsubscribe other handles, or unsubscribe
//! itself without deadlocking. A panicking callback is caught, reported to
//! that observer's own error path, and never disturbs the entry or its
//! other consumers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::QueryCache;
use crate::entry::{ConsumerId, ConsumerSink};
use crate::error::{CacheError, Result};
use crate::handle::{LiveState, Registration};
use crate::query::{QueryKey, QueryTarget};

// ---------------------------------------------------------------------------
// QueryObserver
// ---------------------------------------------------------------------------

/// Callback-style consumer of a live query.
///
/// [`on_update`](QueryObserver::on_update) receives every admitted data
/// delivery, including the warm state handed over synchronously when the
/// observer joins an entry that already holds data.
/// [`on_error`](QueryObserver::on_error) receives every upstream error; the
/// default implementation logs it and moves on. Deliveries for one observer
/// are sequential, in entry order.
pub trait QueryObserver: Send + Sync + 'static {
    /// Handle an admitted data delivery.
    fn on_update(&self, state: &LiveState);

    /// Handle an upstream error delivery.
    fn on_error(&self, error: &CacheError) {
        tracing::warn!("live query error: {}", error);
    }
}

struct FnObserver<F> {
    f: F,
}

impl<F> QueryObserver for FnObserver<F>
where
    F: Fn(&LiveState) + Send + Sync + 'static,
{
    fn on_update(&self, state: &LiveState) {
        (self.f)(state);
    }
}

// ---------------------------------------------------------------------------
// ObserverCell
// ---------------------------------------------------------------------------

/// Shared wrapper around one observer. Fanout clones the `Arc` under the
/// registry lock and invokes the callback after releasing it; the detached
/// flag is re-checked at invocation time so an unsubscribed observer stops
/// hearing deliveries that were still queued up behind the lock.
pub(crate) struct ObserverCell {
    observer: Box<dyn QueryObserver>,
    detached: AtomicBool,
}

impl ObserverCell {
    pub(crate) fn new(observer: Box<dyn QueryObserver>) -> Arc<Self> {
        Arc::new(Self {
            observer,
            detached: AtomicBool::new(false),
        })
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Route one delivery to the observer. Errors dominate: a state
    /// carrying an error goes to `on_error`, everything else to
    /// `on_update`. Panics are contained here.
    pub(crate) fn deliver(&self, state: &LiveState) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(error) = state.error() {
                self.observer.on_error(error);
            } else {
                self.observer.on_update(state);
            }
        }));
        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            tracing::warn!("observer callback panicked: {}", message);
            let error = CacheError::ConsumerPanic(message);
            // The error path may panic too; nothing more to do then.
            let _ = panic::catch_unwind(AssertUnwindSafe(|| self.observer.on_error(&error)));
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// ObserverHandle
// ---------------------------------------------------------------------------

/// Registration handle for one observer.
///
/// Dropping it (or calling [`unsubscribe`](ObserverHandle::unsubscribe))
/// releases the observer's claim on the shared entry; the last release
/// closes the entry. Safe to unsubscribe from inside the observer's own
/// callback.
pub struct ObserverHandle {
    registration: Registration,
    cell: Arc<ObserverCell>,
}

impl ObserverHandle {
    /// Canonical key of the shared entry this observer is attached to.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        self.registration.key()
    }

    /// This observer's consumer id.
    #[must_use]
    pub fn id(&self) -> ConsumerId {
        self.registration.id()
    }

    /// Stop deliveries without releasing the claim on the shared entry.
    pub fn pause(&self) {
        self.registration.set_enabled(false);
    }

    /// Resume deliveries. Changes missed while paused are collapsed into
    /// one immediate catch-up callback.
    pub fn resume(&self) {
        self.registration.set_enabled(true);
    }

    /// Release this observer's claim. Idempotent. No new callback starts
    /// after this returns; a delivery already executing on another thread
    /// finishes on its own.
    pub fn unsubscribe(&self) {
        self.cell.detach();
        self.registration.unsubscribe();
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        // Registration's own drop releases the claim; the cell is silenced
        // first so queued fanout work cannot fire mid-teardown.
        self.cell.detach();
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

impl QueryCache {
    /// Subscribe an observer to `query`.
    ///
    /// Shares the cache entry with every other consumer of an identical
    /// query. If the entry is already warm, the observer's first callback
    /// runs before this returns.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`] when the query cannot be normalized;
    /// the observer is never invoked in that case.
    pub fn observe(
        self: &Arc<Self>,
        query: impl Into<QueryTarget>,
        observer: impl QueryObserver,
    ) -> Result<ObserverHandle> {
        let target = query.into();
        let cell = ObserverCell::new(Box::new(observer));
        let attachment = self.attach(&target, ConsumerSink::Observer(Arc::clone(&cell)))?;
        Ok(ObserverHandle {
            registration: Registration::new(Arc::clone(self), attachment.key, attachment.id),
            cell,
        })
    }

    /// Subscribe a plain closure to `query`. Errors take the default
    /// logging path; implement [`QueryObserver`] to handle them.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`] when the query cannot be normalized.
    pub fn observe_fn<F>(
        self: &Arc<Self>,
        query: impl Into<QueryTarget>,
        f: F,
    ) -> Result<ObserverHandle>
    where
        F: Fn(&LiveState) + Send + Sync + 'static,
    {
        self.observe(query, FnObserver { f })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
