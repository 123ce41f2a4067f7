//! Query descriptions and the key normalizer.
//!
//! A [`Query`] describes a live query over one collection: path, filter
//! predicates, and ordering. [`normalize`] reduces a [`QueryTarget`] to a
//! canonical [`QueryKey`], the identity under which the cache shares
//! upstream subscriptions. Two descriptions of the same logical query must
//! produce equal keys, so normalization sorts the AND-set of filters,
//! deduplicates repeated predicates, and sorts `In` lists, while preserving
//! order-by sequence (which is semantic). Construction is infallible;
//! everything is validated when the description is normalized.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CacheError, Result};

// ---------------------------------------------------------------------------
// FilterValue
// ---------------------------------------------------------------------------

/// Scalar (or list-of-scalars) constant a filter compares against.
///
/// The value's type is part of the query's identity: `Int(1)`, `Float(1.0)`,
/// and `Str("1")` normalize to distinct keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    /// Explicit null. Whether this matches absent fields is the source's
    /// business.
    Null,
    /// Boolean constant.
    Bool(bool),
    /// Signed integer constant.
    Int(i64),
    /// Floating-point constant. Non-finite values are rejected by the
    /// normalizer.
    Float(f64),
    /// String constant.
    Str(String),
    /// List of scalars, only valid with [`FilterOp::In`].
    List(Vec<FilterValue>),
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        FilterValue::Bool(v)
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        FilterValue::Int(v)
    }
}

impl From<i32> for FilterValue {
    fn from(v: i32) -> Self {
        FilterValue::Int(i64::from(v))
    }
}

impl From<f64> for FilterValue {
    fn from(v: f64) -> Self {
        FilterValue::Float(v)
    }
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        FilterValue::Str(v.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        FilterValue::Str(v)
    }
}

impl<T: Into<FilterValue>> From<Vec<T>> for FilterValue {
    fn from(items: Vec<T>) -> Self {
        FilterValue::List(items.into_iter().map(Into::into).collect())
    }
}

// ---------------------------------------------------------------------------
// FilterOp
// ---------------------------------------------------------------------------

/// Comparison operator in a filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Membership in a list of scalars.
    In,
}

impl FilterOp {
    fn token(self) -> &'static str {
        match self {
            FilterOp::Eq => "==",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::In => "in",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

// ---------------------------------------------------------------------------
// Filter / OrderBy
// ---------------------------------------------------------------------------

/// A single filter predicate: `field op value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field the predicate applies to.
    pub field: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Constant compared against.
    pub value: FilterValue,
}

/// Sort direction of an order-by clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// A single order-by clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field to sort by.
    pub field: String,
    /// Sort direction.
    pub direction: Direction,
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Structured description of a live query over one collection.
///
/// # Example
///
/// ```
/// use vigil_core::{Direction, FilterOp, Query};
///
/// let q = Query::collection("tasks")
///     .filter("team", FilterOp::Eq, "atlas")
///     .filter("status", FilterOp::In, vec!["todo", "doing"])
///     .order_by("createdAt", Direction::Desc);
/// assert_eq!(q.collection_path(), "tasks");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    collection: String,
    filters: Vec<Filter>,
    order: Vec<OrderBy>,
}

impl Query {
    /// Start a query over a collection path. Subcollections use
    /// slash-separated segments, e.g. `tasks/t1/comments`.
    #[must_use]
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            collection: path.into(),
            filters: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Add a filter predicate. Predicates combine as an AND-set; the order
    /// they are added in does not affect the query's identity.
    #[must_use]
    pub fn filter(
        mut self,
        field: impl Into<String>,
        op: FilterOp,
        value: impl Into<FilterValue>,
    ) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Append an order-by clause. Clause order is semantic and preserved.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Collection path this query reads.
    #[must_use]
    pub fn collection_path(&self) -> &str {
        &self.collection
    }

    /// Filter predicates in construction order.
    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Order-by clauses in construction order.
    #[must_use]
    pub fn order(&self) -> &[OrderBy] {
        &self.order
    }
}

// ---------------------------------------------------------------------------
// DocumentPath
// ---------------------------------------------------------------------------

/// Identifies a single document: collection path plus document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentPath {
    collection: String,
    id: String,
}

impl DocumentPath {
    /// Path to one document in a collection.
    #[must_use]
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Collection path.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Document id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

// ---------------------------------------------------------------------------
// QueryTarget
// ---------------------------------------------------------------------------

/// Anything the cache can subscribe to upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryTarget {
    /// A structured collection query.
    Collection(Query),
    /// A single document; snapshots hold one record or none.
    Document(DocumentPath),
    /// Verbatim query text the normalizer cannot introspect, passed through
    /// to the source untouched and keyed by its exact text. Textually
    /// identical raw queries share an entry; everything else does not, so
    /// sharing degrades but never misfires.
    Raw(String),
}

impl QueryTarget {
    /// A raw, source-interpreted query.
    #[must_use]
    pub fn raw(text: impl Into<String>) -> Self {
        QueryTarget::Raw(text.into())
    }
}

impl From<Query> for QueryTarget {
    fn from(q: Query) -> Self {
        QueryTarget::Collection(q)
    }
}

impl From<DocumentPath> for QueryTarget {
    fn from(p: DocumentPath) -> Self {
        QueryTarget::Document(p)
    }
}

// ---------------------------------------------------------------------------
// QueryKey
// ---------------------------------------------------------------------------

/// Canonical, value-comparable identity of a [`QueryTarget`].
///
/// Cheap to clone and hash. The wrapped canonical text is stable across
/// processes, which makes keys usable as log identifiers too.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Arc<str>);

impl QueryKey {
    /// Canonical text form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// normalize
// ---------------------------------------------------------------------------

/// Reduce a target to its canonical [`QueryKey`].
///
/// Deterministic in the target's logical content: filter predicates are
/// sorted and deduplicated, `In` lists are sorted and deduplicated, order-by
/// clauses keep their sequence, and value types are preserved (an integer
/// never collides with the equal-looking float or string). Raw targets are
/// keyed by their verbatim text.
///
/// # Errors
///
/// Returns [`CacheError::MalformedQuery`] when the description cannot be
/// canonicalized: empty collection path or path segment, empty field or
/// document id, non-finite float constant, empty `In` list, `In` without a
/// list, a list on a scalar operator, a nested list, or empty raw text.
pub fn normalize(target: &QueryTarget) -> Result<QueryKey> {
    let canonical = match target {
        QueryTarget::Collection(query) => canonical_query(query)?.to_string(),
        QueryTarget::Document(path) => canonical_document(path)?.to_string(),
        QueryTarget::Raw(text) => {
            if text.trim().is_empty() {
                return Err(malformed("raw query text is empty"));
            }
            format!("raw:{text}")
        }
    };
    Ok(QueryKey(canonical.into()))
}

fn canonical_query(query: &Query) -> Result<Value> {
    let path = canonical_path(&query.collection)?;

    let mut filters = Vec::with_capacity(query.filters.len());
    for filter in &query.filters {
        filters.push(canonical_filter(filter)?);
    }
    // The filter list is an AND-set: order-insensitive, repeats collapse.
    filters.sort_by_cached_key(Value::to_string);
    filters.dedup();

    let mut order = Vec::with_capacity(query.order.len());
    for clause in &query.order {
        canonical_field(&clause.field)?;
        let dir = match clause.direction {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        };
        order.push(json!({ "f": clause.field, "dir": dir }));
    }

    Ok(json!({
        "kind": "collection",
        "path": path,
        "filters": filters,
        "order": order,
    }))
}

fn canonical_document(path: &DocumentPath) -> Result<Value> {
    let collection = canonical_path(&path.collection)?;
    if path.id.is_empty() {
        return Err(malformed("empty document id"));
    }
    Ok(json!({
        "kind": "document",
        "path": collection,
        "id": path.id,
    }))
}

fn canonical_filter(filter: &Filter) -> Result<Value> {
    canonical_field(&filter.field)?;
    let value = match (filter.op, &filter.value) {
        (FilterOp::In, FilterValue::List(items)) => {
            if items.is_empty() {
                return Err(malformed("`in` filter with an empty list"));
            }
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(canonical_scalar(item)?);
            }
            // Membership is a set test: order-insensitive, repeats collapse.
            values.sort_by_cached_key(Value::to_string);
            values.dedup();
            Value::Array(values)
        }
        (FilterOp::In, _) => return Err(malformed("`in` filter requires a list value")),
        (op, FilterValue::List(_)) => {
            return Err(malformed(format!("operator `{op}` does not take a list")))
        }
        (_, scalar) => canonical_scalar(scalar)?,
    };
    Ok(json!({ "f": filter.field, "op": filter.op.token(), "v": value }))
}

fn canonical_scalar(value: &FilterValue) -> Result<Value> {
    match value {
        FilterValue::Null => Ok(Value::Null),
        FilterValue::Bool(b) => Ok(Value::Bool(*b)),
        FilterValue::Int(i) => Ok(Value::from(*i)),
        FilterValue::Float(x) => serde_json::Number::from_f64(*x)
            .map(Value::Number)
            .ok_or_else(|| malformed("non-finite float in filter")),
        FilterValue::Str(s) => Ok(Value::from(s.as_str())),
        FilterValue::List(_) => Err(malformed("nested lists are not valid filter values")),
    }
}

fn canonical_path(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Err(malformed("empty collection path"));
    }
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(malformed(format!(
            "collection path `{path}` has an empty segment"
        )));
    }
    Ok(segments)
}

fn canonical_field(field: &str) -> Result<()> {
    if field.is_empty() {
        return Err(malformed("empty field name"));
    }
    Ok(())
}

fn malformed(msg: impl Into<String>) -> CacheError {
    CacheError::MalformedQuery(msg.into())
}

// ===========================================================================
// Tests
// ===========================================================================
