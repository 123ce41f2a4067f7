//! The client facade.

use std::sync::Arc;

use vigil_core::{
    CacheMetrics, DocumentPath, DocumentSource, LiveDocument, LiveQuery, LiveQueryStream,
    LiveState, ObserverHandle, QueryCache, QueryObserver, QueryTarget, Result,
};

/// Application entry point: a shared subscription cache over one document
/// source.
///
/// All subscriptions opened through a client (and through its clones; a
/// clone is the same client) share entries by canonical query key. Identical
/// queries cost one upstream subscription total, and consumers joining an
/// already-live query see its data immediately.
#[derive(Clone)]
pub struct VigilClient {
    cache: Arc<QueryCache>,
}

impl VigilClient {
    /// Create a client over `source`.
    #[must_use]
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        tracing::debug!("vigil client created");
        Self {
            cache: QueryCache::new(source),
        }
    }

    /// Subscribe a watch-style handle to a query.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`](vigil_core::CacheError::MalformedQuery)
    /// when the query cannot be normalized.
    pub fn live_query(&self, query: impl Into<QueryTarget>) -> Result<LiveQuery> {
        self.cache.live_query(query)
    }

    /// Subscribe to a single document.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`](vigil_core::CacheError::MalformedQuery)
    /// when the path has an empty collection or document id.
    pub fn live_document(&self, path: DocumentPath) -> Result<LiveDocument> {
        self.cache.live_document(path)
    }

    /// Subscribe an observer to a query; callbacks run per admitted
    /// delivery.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`](vigil_core::CacheError::MalformedQuery)
    /// when the query cannot be normalized.
    pub fn observe(
        &self,
        query: impl Into<QueryTarget>,
        observer: impl QueryObserver,
    ) -> Result<ObserverHandle> {
        self.cache.observe(query, observer)
    }

    /// Subscribe a plain closure to a query.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`](vigil_core::CacheError::MalformedQuery)
    /// when the query cannot be normalized.
    pub fn observe_fn<F>(&self, query: impl Into<QueryTarget>, f: F) -> Result<ObserverHandle>
    where
        F: Fn(&LiveState) + Send + Sync + 'static,
    {
        self.cache.observe_fn(query, f)
    }

    /// Subscribe to a query and consume it as an async stream of states.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`](vigil_core::CacheError::MalformedQuery)
    /// when the query cannot be normalized.
    pub fn stream_query(&self, query: impl Into<QueryTarget>) -> Result<LiveQueryStream> {
        self.cache.stream_query(query)
    }

    /// Cache-wide counters.
    #[must_use]
    pub fn metrics(&self) -> &CacheMetrics {
        self.cache.metrics()
    }

    /// Number of live cache entries (distinct queries currently
    /// subscribed).
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.cache.entry_count()
    }

    /// The underlying cache, for core-level APIs.
    #[must_use]
    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }
}

// ===========================================================================
// Tests
// ===========================================================================
