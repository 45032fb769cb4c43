//! Source abstraction over a MongoDB-compatible collection.
//!
//! [`DocumentSource`] is the seam between the engine and the client
//! library: sorted cursors, an estimated count, and limit-1 bound lookups
//! are all the planner and readers need. Implementations must be
//! `Send + Sync` for use behind `Arc<dyn DocumentSource>`.

mod memory;
mod mongo;

pub use memory::MemorySource;
pub use mongo::MongoSource;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures_util::stream::BoxStream;
use parlake_types::error::Result;

/// A stream of documents in `_id` order.
pub type DocumentStream = BoxStream<'static, Result<Document>>;

/// Parameters of one sorted `find`.
#[derive(Debug, Clone)]
pub struct FindSpec {
    pub filter: Document,
    /// Sort direction on `_id`.
    pub ascending: bool,
    pub projection: Option<Document>,
    pub hint: Option<Document>,
    pub batch_size: Option<u32>,
    pub limit: Option<i64>,
    pub no_cursor_timeout: bool,
}

impl FindSpec {
    /// An ascending `_id`-sorted scan of `filter` with no other options.
    #[must_use]
    pub fn ascending(filter: Document) -> Self {
        Self {
            filter,
            ascending: true,
            projection: None,
            hint: None,
            batch_size: None,
            limit: None,
            no_cursor_timeout: false,
        }
    }
}

/// Read access to one collection.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Open an `_id`-sorted cursor.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Source`](parlake_types::error::SnapshotError)
    /// on connection or query failure.
    async fn find(&self, spec: FindSpec) -> Result<DocumentStream>;

    /// Server-side estimate of the collection's document count.
    ///
    /// # Errors
    ///
    /// Returns a source error on failure.
    async fn estimated_count(&self) -> Result<u64>;

    /// The first `_id` under `filter` in the given direction, via a
    /// limit-1 sorted index lookup.
    ///
    /// # Errors
    ///
    /// Returns a source error on failure.
    async fn first_id(&self, filter: Document, ascending: bool) -> Result<Option<Bson>>;
}

/// Conjoin filter fragments, dropping empty ones.
///
/// Zero fragments yield the match-all filter; one fragment passes through;
/// more are wrapped in `$and` so fragments constraining the same field
/// (base query plus `_id` range plus checkpoint) never clobber each other.
#[must_use]
pub fn and_filters(fragments: Vec<Document>) -> Document {
    let mut non_empty: Vec<Document> = fragments.into_iter().filter(|f| !f.is_empty()).collect();
    match non_empty.len() {
        0 => Document::new(),
        1 => non_empty.remove(0),
        _ => doc! { "$and": non_empty.into_iter().map(Bson::Document).collect::<Vec<_>>() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_filters_drops_empty_fragments() {
        assert_eq!(and_filters(vec![]), doc! {});
        assert_eq!(
            and_filters(vec![doc! {}, doc! {"a": 1}, doc! {}]),
            doc! {"a": 1}
        );
    }

    #[test]
    fn and_filters_wraps_multiple() {
        let combined = and_filters(vec![
            doc! {"status": "active"},
            doc! {"_id": {"$gt": 5}},
            doc! {"_id": {"$lte": 10}},
        ]);
        let clauses = combined.get_array("$and").unwrap();
        assert_eq!(clauses.len(), 3);
    }

    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn DocumentSource) {}
    }
}
