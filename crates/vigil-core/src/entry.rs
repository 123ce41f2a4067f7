//! Cache entries: one upstream subscription, its latest state, and its
//! consumers.
//!
//! Entries are owned exclusively by the registry and mutated only under its
//! lock; nothing here synchronizes on its own.

use std::fmt;

use smallvec::SmallVec;
use tokio::sync::watch;

use crate::callback::ObserverCell;
use crate::error::SharedError;
use crate::handle::LiveState;
use crate::snapshot::{Fingerprint, Snapshot};
use crate::source::SourceSubscription;

// ---------------------------------------------------------------------------
// EntryState
// ---------------------------------------------------------------------------

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Created; the upstream subscription has not produced anything yet.
    Unopened,
    /// The upstream open attempt finished (successfully or not) or the
    /// first delivery arrived; state flows.
    Active,
    /// Detached from the registry after its last consumer released. Never
    /// reused: a later subscribe for the same key builds a fresh entry.
    Closed,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryState::Unopened => "unopened",
            EntryState::Active => "active",
            EntryState::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ConsumerId
// ---------------------------------------------------------------------------

/// Monotonic identifier for one consumer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DeliveryGate
// ---------------------------------------------------------------------------

/// Decides whether one consumer needs a given delivery.
///
/// Tracks the fingerprint last delivered to the consumer plus whether that
/// delivery carried an error. Data passes the gate when its fingerprint
/// differs from the last delivered one or when it clears a previously
/// delivered error; errors always pass.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeliveryGate {
    last: Option<Fingerprint>,
    errored: bool,
}

impl DeliveryGate {
    /// Commit a data delivery decision for `fingerprint`; returns whether
    /// the consumer must be notified.
    pub(crate) fn admit_snapshot(&mut self, fingerprint: Fingerprint) -> bool {
        let notify = self.errored || self.last != Some(fingerprint);
        self.last = Some(fingerprint);
        self.errored = false;
        notify
    }

    /// Commit an error delivery.
    pub(crate) fn admit_error(&mut self) {
        self.errored = true;
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Delivery channel for one consumer.
pub(crate) enum ConsumerSink {
    /// Handle-style consumer fed through a watch channel; the receiver side
    /// lives in a [`LiveQuery`](crate::LiveQuery) or
    /// [`LiveDocument`](crate::LiveDocument).
    Watch(watch::Sender<LiveState>),
    /// Callback-style consumer invoked during fanout, outside the registry
    /// lock.
    Observer(std::sync::Arc<ObserverCell>),
}

/// One attached consumer. Mutated only under the registry lock.
pub(crate) struct Consumer {
    pub(crate) id: ConsumerId,
    pub(crate) enabled: bool,
    pub(crate) gate: DeliveryGate,
    pub(crate) sink: ConsumerSink,
}

// ---------------------------------------------------------------------------
// QueryEntry
// ---------------------------------------------------------------------------

/// Registry-owned state for one query key: the upstream guard, the latest
/// snapshot and error, and the consumer set. The consumer count is the
/// entry's reference count; the registry removes the entry in the same
/// locked step that drops the count to zero.
pub(crate) struct QueryEntry {
    pub(crate) state: EntryState,
    /// Distinguishes this entry from earlier or later entries for the same
    /// key; deliveries tagged with another generation are dropped.
    pub(crate) generation: u64,
    pub(crate) upstream: Option<Box<dyn SourceSubscription>>,
    pub(crate) snapshot: Option<Snapshot>,
    pub(crate) fingerprint: Option<Fingerprint>,
    pub(crate) error: Option<SharedError>,
    pub(crate) consumers: SmallVec<[Consumer; 4]>,
}

impl QueryEntry {
    pub(crate) fn new(generation: u64) -> Self {
        Self {
            state: EntryState::Unopened,
            generation,
            upstream: None,
            snapshot: None,
            fingerprint: None,
            error: None,
            consumers: SmallVec::new(),
        }
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.consumers.len()
    }

    /// `true` once anything (data or error) has been recorded.
    pub(crate) fn is_warm(&self) -> bool {
        self.snapshot.is_some() || self.error.is_some()
    }

    pub(crate) fn current_state(&self) -> LiveState {
        LiveState::new(self.snapshot.clone(), self.error.clone())
    }

    pub(crate) fn consumer_mut(&mut self, id: ConsumerId) -> Option<&mut Consumer> {
        self.consumers.iter_mut().find(|c| c.id == id)
    }

    /// Remove a consumer; `false` when it was already gone.
    pub(crate) fn remove_consumer(&mut self, id: ConsumerId) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| c.id != id);
        self.consumers.len() != before
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // --- DeliveryGate tests ---

    #[test]
    fn test_gate_first_snapshot_admits() {
        let mut gate = DeliveryGate::default();
        assert!(gate.admit_snapshot(Fingerprint::Empty));
    }

    #[test]
    fn test_gate_suppresses_repeat_fingerprint() {
        let mut gate = DeliveryGate::default();
        assert!(gate.admit_snapshot(Fingerprint::Digest(1)));
        assert!(!gate.admit_snapshot(Fingerprint::Digest(1)));
        assert!(gate.admit_snapshot(Fingerprint::Digest(2)));
        assert!(!gate.admit_snapshot(Fingerprint::Digest(2)));
    }

    #[test]
    fn test_gate_error_then_equal_fingerprint_admits() {
        let mut gate = DeliveryGate::default();
        assert!(gate.admit_snapshot(Fingerprint::Digest(1)));
        gate.admit_error();
        // The error must be visibly cleared even though the data did not
        // change.
        assert!(gate.admit_snapshot(Fingerprint::Digest(1)));
        assert!(!gate.admit_snapshot(Fingerprint::Digest(1)));
    }

    #[test]
    fn test_gate_empty_and_digest_are_distinct() {
        let mut gate = DeliveryGate::default();
        assert!(gate.admit_snapshot(Fingerprint::Empty));
        assert!(gate.admit_snapshot(Fingerprint::Digest(0)));
        assert!(gate.admit_snapshot(Fingerprint::Empty));
    }

    // --- QueryEntry tests ---

    #[test]
    fn test_new_entry_is_unopened_and_cold() {
        let entry = QueryEntry::new(1);
        assert_eq!(entry.state, EntryState::Unopened);
        assert_eq!(entry.ref_count(), 0);
        assert!(!entry.is_warm());
        assert!(entry.current_state().is_loading());
    }

    #[test]
    fn test_remove_consumer_reports_membership() {
        let mut entry = QueryEntry::new(1);
        let (tx, _rx) = watch::channel(LiveState::default());
        entry.consumers.push(Consumer {
            id: ConsumerId(1),
            enabled: true,
            gate: DeliveryGate::default(),
            sink: ConsumerSink::Watch(tx),
        });
        assert!(entry.remove_consumer(ConsumerId(1)));
        assert!(!entry.remove_consumer(ConsumerId(1)));
        assert_eq!(entry.ref_count(), 0);
    }

    #[test]
    fn test_entry_state_display() {
        assert_eq!(EntryState::Unopened.to_string(), "unopened");
        assert_eq!(EntryState::Active.to_string(), "active");
        assert_eq!(EntryState::Closed.to_string(), "closed");
    }
}
