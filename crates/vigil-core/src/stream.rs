//! Async stream adapter over live-query handles.
//!
//! [`LiveQueryStream`] wraps a [`LiveQuery`]'s watch channel in a
//! [`Stream`]: the current state is yielded immediately, then one item per
//! admitted delivery, with intermediate states coalesced when the consumer
//! polls slower than upstream pushes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;

use crate::cache::QueryCache;
use crate::entry::ConsumerId;
use crate::error::Result;
use crate::handle::{LiveQuery, LiveState};
use crate::query::{QueryKey, QueryTarget};

// ---------------------------------------------------------------------------
// LiveQueryStream
// ---------------------------------------------------------------------------

/// A live query consumed as an async stream of [`LiveState`] items.
///
/// Holds the consumer registration for its whole life: dropping the stream
/// releases the claim on the shared entry, exactly like dropping the handle
/// it was built from. The stream ends after
/// [`unsubscribe`](LiveQueryStream::unsubscribe).
pub struct LiveQueryStream {
    query: LiveQuery,
    inner: WatchStream<LiveState>,
}

impl LiveQueryStream {
    /// Canonical key of the shared entry this stream is attached to.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        self.query.key()
    }

    /// This stream's consumer id.
    #[must_use]
    pub fn id(&self) -> ConsumerId {
        self.query.id()
    }

    /// Release the claim on the shared entry. Idempotent; the stream
    /// yields any unseen state and then ends.
    pub fn unsubscribe(&self) {
        self.query.unsubscribe();
    }
}

impl Stream for LiveQueryStream {
    type Item = LiveState;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl LiveQuery {
    /// Convert this handle into a stream of states.
    ///
    /// The registration moves into the stream; the current state is the
    /// stream's first item.
    #[must_use]
    pub fn into_stream(self) -> LiveQueryStream {
        let rx = self.rx.clone();
        LiveQueryStream {
            query: self,
            inner: WatchStream::new(rx),
        }
    }
}

impl QueryCache {
    /// Subscribe to `query` and consume it as a stream.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedQuery`](crate::CacheError::MalformedQuery)
    /// when the query cannot be normalized.
    pub fn stream_query(
        self: &Arc<Self>,
        query: impl Into<QueryTarget>,
    ) -> Result<LiveQueryStream> {
        Ok(self.live_query(query)?.into_stream())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use crate::query::Query;
    use crate::snapshot::{Document, FieldMap, Snapshot, Version};
    use crate::source::{DocumentSource, SnapshotSink, SourceSubscription};

    struct PushSource {
        sinks: StdMutex<Vec<SnapshotSink>>,
    }

    impl PushSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sinks: StdMutex::new(Vec::new()),
            })
        }

        fn sink(&self, i: usize) -> SnapshotSink {
            self.sinks.lock().unwrap()[i].clone()
        }
    }

    impl DocumentSource for PushSource {
        fn subscribe(
            &self,
            _target: &QueryTarget,
            sink: SnapshotSink,
        ) -> Result<Box<dyn SourceSubscription>> {
            self.sinks.lock().unwrap().push(sink);
            Ok(Box::new(NoopGuard))
        }
    }

    struct NoopGuard;

    impl SourceSubscription for NoopGuard {
        fn cancel(&mut self) {}
    }

    fn doc(id: &str, version: u64) -> Document {
        Document::new(id, Version(version), FieldMap::new())
    }

    #[tokio::test]
    async fn test_stream_yields_current_state_then_updates() {
        let source = PushSource::new();
        let cache = QueryCache::new(source.clone());

        let mut stream = cache.stream_query(Query::collection("tasks")).unwrap();

        let initial = stream.next().await.unwrap();
        assert!(initial.is_loading());

        source.sink(0).push(Snapshot::new(vec![doc("t1", 1)]));
        let state = stream.next().await.unwrap();
        assert_eq!(state.data().map(Snapshot::len), Some(1));
    }

    #[tokio::test]
    async fn test_stream_stays_quiet_on_suppressed_push() {
        let source = PushSource::new();
        let cache = QueryCache::new(source.clone());

        let mut stream = cache.stream_query(Query::collection("tasks")).unwrap();
        let _ = stream.next().await;

        source.sink(0).push(Snapshot::new(vec![doc("t1", 1)]));
        let _ = stream.next().await;

        // Same fingerprint: nothing reaches the stream.
        source.sink(0).push(Snapshot::new(vec![doc("t1", 1)]));
        let timed_out = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(timed_out.is_err());

        source.sink(0).push(Snapshot::new(vec![doc("t1", 2)]));
        let state = stream.next().await.unwrap();
        assert_eq!(
            state.data().and_then(Snapshot::first).map(Document::version),
            Some(Version(2))
        );
    }

    #[tokio::test]
    async fn test_stream_ends_after_unsubscribe() {
        let source = PushSource::new();
        let cache = QueryCache::new(source.clone());

        let mut stream = cache.stream_query(Query::collection("tasks")).unwrap();
        let _ = stream.next().await;

        stream.unsubscribe();
        assert!(stream.next().await.is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_claim() {
        let source = PushSource::new();
        let cache = QueryCache::new(source.clone());

        let stream = cache.stream_query(Query::collection("tasks")).unwrap();
        assert_eq!(cache.entry_count(), 1);
        drop(stream);
        assert_eq!(cache.entry_count(), 0);
    }
}
