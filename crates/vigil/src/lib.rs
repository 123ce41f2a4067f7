//! # Vigil
//!
//! A shared live-query subscription cache for push-based document stores.
//!
//! Vigil sits between application consumers (widgets, view models,
//! background tasks) and one upstream store. Structurally different
//! descriptions of the same logical query collapse to one canonical key;
//! each key holds exactly one upstream subscription no matter how many
//! consumers watch it; and fanout is gated on snapshot fingerprints, so
//! consumers only hear about pushes that changed something.
//!
//! # Quick Start
//!
//! ```
//! use vigil::prelude::*;
//!
//! # fn main() -> vigil::Result<()> {
//! let source = MemorySource::new();
//! let client = VigilClient::new(source.clone());
//!
//! // Two consumers of the same logical query: one upstream subscription.
//! let board = Query::collection("tasks").filter("team", FilterOp::Eq, "atlas");
//! let list = client.live_query(board.clone())?;
//! let _badge = client.observe_fn(board, |state| {
//!     println!("open tasks: {}", state.data().map_or(0, Snapshot::len));
//! })?;
//!
//! source.publish(
//!     Query::collection("tasks").filter("team", FilterOp::Eq, "atlas"),
//!     vec![Document::new("t1", Version(1), FieldMap::new())],
//! )?;
//! assert_eq!(list.state().data().map(Snapshot::len), Some(1));
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod client;
mod memory;

pub use client::VigilClient;
pub use memory::MemorySource;

// Re-export the core engine surface
pub use vigil_core::*;

/// Commonly used types and traits.
///
/// ```rust,ignore
/// use vigil::prelude::*;
/// ```
pub mod prelude {
    // Client and in-memory source
    pub use crate::{MemorySource, VigilClient};

    // Query descriptions
    pub use vigil_core::{
        Direction, DocumentPath, Filter, FilterOp, FilterValue, OrderBy, Query, QueryTarget,
    };

    // Documents and snapshots
    pub use vigil_core::{Document, FieldMap, Snapshot, Version};

    // Consumer surfaces
    pub use vigil_core::{
        LiveDocument, LiveQuery, LiveQueryStream, LiveState, ObserverHandle, QueryObserver,
    };

    // Errors
    pub use vigil_core::CacheError;

    // Standard library re-exports for convenience
    pub use std::sync::Arc;
}
