//! Documents, snapshots, and fingerprints.
//!
//! A [`Snapshot`] is the full result set of a live query at one point in
//! time. Snapshots are immutable once produced; each upstream push replaces
//! the previous snapshot wholesale (there is no patch model). The
//! [`Fingerprint`] summarizes a snapshot's (id, version) pairs so the cache
//! can decide "nothing relevant changed" without comparing field contents.

use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use fxhash::FxHasher;
use serde_json::{Map, Value};

/// JSON object holding a document's fields.
pub type FieldMap = Map<String, Value>;

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Opaque version token attached to a document by the upstream source.
///
/// The source must never decrease a document's version. The fingerprint gate
/// relies on this: an unchanged (id, version) pair is read as "this document
/// did not change".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A single document: identifier, version token, and fields.
///
/// Fields sit behind an `Arc`, so cloning a document never copies field
/// contents.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: String,
    version: Version,
    fields: Arc<FieldMap>,
}

impl Document {
    /// Create a document from its id, version token, and field map.
    #[must_use]
    pub fn new(id: impl Into<String>, version: Version, fields: FieldMap) -> Self {
        Self {
            id: id.into(),
            version,
            fields: Arc::new(fields),
        }
    }

    /// Document identifier, unique within its collection.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Version token supplied by the source.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// All fields of the document.
    #[must_use]
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Look up a single field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// The full, ordered result set of a live query at one point in time.
///
/// Document order is whatever the source delivered; the cache never
/// re-sorts. Cloning is cheap: the document list is shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    docs: Arc<[Document]>,
}

impl Snapshot {
    /// Build a snapshot from an ordered document list.
    #[must_use]
    pub fn new(docs: Vec<Document>) -> Self {
        Self { docs: docs.into() }
    }

    /// The empty result set.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// `true` when the snapshot holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Documents in delivery order.
    #[must_use]
    pub fn docs(&self) -> &[Document] {
        &self.docs
    }

    /// Iterate documents in delivery order.
    pub fn iter(&self) -> std::slice::Iter<'_, Document> {
        self.docs.iter()
    }

    /// First document, if any. Single-document targets hold at most one.
    #[must_use]
    pub fn first(&self) -> Option<&Document> {
        self.docs.first()
    }

    /// Fingerprint over this snapshot's (id, version) pairs.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Cheap summary of a snapshot used to decide whether consumers need to hear
/// about an upstream push.
///
/// Derived from (id, version) pairs in delivery order; field contents never
/// participate. Two snapshots with the same documents at the same versions
/// are indistinguishable here even when field values differ, so a source
/// that rewrites fields without bumping the version will not trigger
/// notifications. That leniency is a documented limitation downstream code
/// may rely on, not something to fix here.
///
/// The empty snapshot maps to [`Fingerprint::Empty`], which no non-empty
/// snapshot can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// Fingerprint of the empty snapshot.
    Empty,
    /// Digest of a non-empty snapshot's (id, version) sequence.
    Digest(u64),
}

impl Fingerprint {
    /// Compute the fingerprint of a snapshot.
    ///
    /// Pure and total: equal (id, version) sequences produce equal results,
    /// on every call, on every platform.
    #[must_use]
    pub fn of(snapshot: &Snapshot) -> Self {
        if snapshot.is_empty() {
            return Fingerprint::Empty;
        }
        let mut hasher = FxHasher::default();
        for doc in snapshot.iter() {
            // Length-prefix the id so (id, version) pair boundaries cannot
            // alias across documents.
            hasher.write_usize(doc.id.len());
            hasher.write(doc.id.as_bytes());
            hasher.write_u64(doc.version.0);
        }
        Fingerprint::Digest(hasher.finish())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Empty => write!(f, "empty"),
            Fingerprint::Digest(d) => write!(f, "{d:016x}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, version: u64) -> Document {
        Document::new(id, Version(version), FieldMap::new())
    }

    fn doc_with(id: &str, version: u64, fields: Value) -> Document {
        let map = fields.as_object().cloned().unwrap_or_default();
        Document::new(id, Version(version), map)
    }

    // --- Document tests ---

    #[test]
    fn test_document_accessors() {
        let d = doc_with("t1", 7, json!({ "title": "fix pager", "done": false }));
        assert_eq!(d.id(), "t1");
        assert_eq!(d.version(), Version(7));
        assert_eq!(d.field("title"), Some(&json!("fix pager")));
        assert_eq!(d.field("missing"), None);
        assert_eq!(d.fields().len(), 2);
    }

    #[test]
    fn test_document_clone_shares_fields() {
        let d = doc_with("t1", 1, json!({ "n": 1 }));
        let c = d.clone();
        assert_eq!(d, c);
        assert!(Arc::ptr_eq(&d.fields, &c.fields));
    }

    // --- Snapshot tests ---

    #[test]
    fn test_snapshot_order_and_access() {
        let snap = Snapshot::new(vec![doc("b", 1), doc("a", 2)]);
        assert_eq!(snap.len(), 2);
        assert!(!snap.is_empty());
        assert_eq!(snap.first().map(Document::id), Some("b"));
        let ids: Vec<&str> = snap.iter().map(Document::id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = Snapshot::empty();
        assert!(snap.is_empty());
        assert_eq!(snap.len(), 0);
        assert!(snap.first().is_none());
    }

    // --- Fingerprint tests ---

    #[test]
    fn test_fingerprint_stable_across_calls() {
        let snap = Snapshot::new(vec![doc("a", 1), doc("b", 2)]);
        assert_eq!(snap.fingerprint(), snap.fingerprint());

        let same = Snapshot::new(vec![doc("a", 1), doc("b", 2)]);
        assert_eq!(snap.fingerprint(), same.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_field_contents() {
        let before = Snapshot::new(vec![
            doc_with("a", 1, json!({ "status": "todo" })),
            doc_with("b", 2, json!({ "status": "todo" })),
        ]);
        let after = Snapshot::new(vec![
            doc_with("a", 1, json!({ "status": "done" })),
            doc_with("b", 2, json!({ "status": "done", "extra": true })),
        ]);
        assert_eq!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_versions_ids_and_order() {
        let base = Snapshot::new(vec![doc("a", 1), doc("b", 2)]);

        let bumped = Snapshot::new(vec![doc("a", 1), doc("b", 3)]);
        assert_ne!(base.fingerprint(), bumped.fingerprint());

        let renamed = Snapshot::new(vec![doc("a", 1), doc("c", 2)]);
        assert_ne!(base.fingerprint(), renamed.fingerprint());

        let reordered = Snapshot::new(vec![doc("b", 2), doc("a", 1)]);
        assert_ne!(base.fingerprint(), reordered.fingerprint());

        let shorter = Snapshot::new(vec![doc("a", 1)]);
        assert_ne!(base.fingerprint(), shorter.fingerprint());
    }

    #[test]
    fn test_fingerprint_empty_is_distinguished() {
        assert_eq!(Snapshot::empty().fingerprint(), Fingerprint::Empty);

        // A record literally named "empty" must not collide with the empty
        // snapshot's fingerprint.
        let named_empty = Snapshot::new(vec![doc("empty", 0)]);
        assert_ne!(named_empty.fingerprint(), Fingerprint::Empty);
    }

    #[test]
    fn test_fingerprint_pair_boundaries_do_not_alias() {
        // Same concatenated bytes, different (id, version) split.
        let one = Snapshot::new(vec![doc("ab", 1), doc("c", 2)]);
        let two = Snapshot::new(vec![doc("a", 1), doc("bc", 2)]);
        assert_ne!(one.fingerprint(), two.fingerprint());
    }

    #[test]
    fn test_fingerprint_display() {
        assert_eq!(Fingerprint::Empty.to_string(), "empty");
        assert_eq!(Fingerprint::Digest(0xabc).to_string(), "0000000000000abc");
    }
}
