//! Error types for the subscription cache.

use std::sync::Arc;

/// Errors surfaced by the subscription cache.
///
/// [`MalformedQuery`](CacheError::MalformedQuery) is returned synchronously
/// from subscribe calls and never reaches the registry. The other kinds are
/// recorded on the affected entry and delivered to its consumers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The query description was rejected by the normalizer.
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// The upstream subscription could not be opened, or the open feed
    /// reported a failure. The entry's last-known-good snapshot, if any, is
    /// preserved.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A consumer callback panicked while handling a delivery. Reported to
    /// that consumer only; other consumers and the entry are unaffected.
    #[error("consumer callback panicked: {0}")]
    ConsumerPanic(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors are stored on entries and fanned out in shared form, so a failure
/// observed by many consumers is allocated once.
pub type SharedError = Arc<CacheError>;

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::MalformedQuery("empty collection path".into());
        assert_eq!(err.to_string(), "malformed query: empty collection path");

        let err = CacheError::UpstreamUnavailable("connection reset".into());
        assert_eq!(err.to_string(), "upstream unavailable: connection reset");
    }

    #[test]
    fn test_error_equality() {
        let a = CacheError::UpstreamUnavailable("down".into());
        let b = CacheError::UpstreamUnavailable("down".into());
        assert_eq!(a, b);
        assert_ne!(a, CacheError::MalformedQuery("down".into()));
    }
}
