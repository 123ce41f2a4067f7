//! # Vigil Core
//!
//! The core engine of Vigil: a shared subscription cache sitting between
//! UI-facing consumers and a push-based document store.
//!
//! This crate provides:
//! - **Query normalization**: structurally different descriptions of the
//!   same logical query collapse to one canonical [`QueryKey`]
//! - **Registry**: one cache entry and one upstream subscription per key,
//!   reference-counted across all consumers
//! - **Fingerprinting**: snapshot identity over (id, version) pairs, so
//!   consumers only hear about pushes that changed something
//! - **Consumer surfaces**: watch-style handles, callback observers, and
//!   async streams over the same shared entries
//!
//! ## Design principles
//!
//! 1. **One entry per logical query** - normalization decides identity,
//!    never the call site
//! 2. **Synchronous lifecycle edges** - warm joins deliver before subscribe
//!    returns; the last release cancels upstream before it returns
//! 3. **Callbacks outside the lock** - consumers may subscribe and
//!    unsubscribe reentrantly from their own callbacks
//! 4. **Errors are state** - failures are recorded on the entry, broadcast
//!    to every consumer, and cleared by the next good snapshot
//!
//! ## Example
//!
//! ```rust,ignore
//! use vigil_core::{Direction, FilterOp, Query, QueryCache};
//!
//! let cache = QueryCache::new(source);
//! let board = Query::collection("tasks")
//!     .filter("team", FilterOp::Eq, "atlas")
//!     .order_by("createdAt", Direction::Desc);
//!
//! // Any number of consumers; one upstream subscription.
//! let mut handle = cache.live_query(board.clone())?;
//! let _guard = cache.observe_fn(board, |state| {
//!     println!("tasks: {:?}", state.data().map(|s| s.len()));
//! })?;
//!
//! while let Some(state) = handle.changed().await {
//!     render(state);
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod cache;
mod callback;
mod entry;
mod error;
mod handle;
mod query;
mod snapshot;
mod source;
mod stream;

pub use cache::{CacheMetrics, QueryCache};
pub use callback::{ObserverHandle, QueryObserver};
pub use entry::{ConsumerId, EntryState};
pub use error::{CacheError, Result, SharedError};
pub use handle::{LiveDocument, LiveQuery, LiveState};
pub use query::{
    normalize, Direction, DocumentPath, Filter, FilterOp, FilterValue, OrderBy, Query, QueryKey,
    QueryTarget,
};
pub use snapshot::{Document, FieldMap, Fingerprint, Snapshot, Version};
pub use source::{DocumentSource, SnapshotSink, SourceSubscription};
pub use stream::LiveQueryStream;
