//! In-memory [`DocumentSource`] (for testing and offline development).
//!
//! Supports the filter shapes the engine itself emits: match-all, field
//! equality, comparison operators, and `$and` conjunctions. That is enough
//! to exercise planning, reading, and resume without a server.

use std::cmp::Ordering;
use std::sync::RwLock;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures_util::stream;
use futures_util::StreamExt;
use parlake_types::error::{Result, SnapshotError};
use parlake_types::value::cmp_bson;

use super::{DocumentSource, DocumentStream, FindSpec};

/// An `_id`-ordered in-memory collection.
pub struct MemorySource {
    docs: RwLock<Vec<Document>>,
}

impl MemorySource {
    /// Build from any iterable of documents; they are sorted by `_id`.
    #[must_use]
    pub fn new(docs: impl IntoIterator<Item = Document>) -> Self {
        let mut docs: Vec<Document> = docs.into_iter().collect();
        sort_by_id(&mut docs);
        Self {
            docs: RwLock::new(docs),
        }
    }

    /// Insert more documents, keeping `_id` order.
    pub fn insert_many(&self, extra: impl IntoIterator<Item = Document>) {
        let mut docs = self.docs.write().expect("memory source lock");
        docs.extend(extra);
        sort_by_id(&mut docs);
    }

    /// Current document count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.read().expect("memory source lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sort_by_id(docs: &mut [Document]) {
    docs.sort_by(|a, b| {
        let left = a.get("_id").unwrap_or(&Bson::Null);
        let right = b.get("_id").unwrap_or(&Bson::Null);
        cmp_bson(left, right)
    });
}

/// Evaluate the filter subset the engine emits against one document.
///
/// Missing fields never match (the engine never relies on missing == null).
fn matches(doc: &Document, filter: &Document) -> bool {
    for (key, condition) in filter {
        if key == "$and" {
            let Some(clauses) = condition.as_array() else {
                return false;
            };
            for clause in clauses {
                match clause {
                    Bson::Document(inner) if matches(doc, inner) => {}
                    _ => return false,
                }
            }
            continue;
        }
        let Some(actual) = doc.get(key) else {
            return false;
        };
        match condition {
            Bson::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                for (op, operand) in ops {
                    let ord = cmp_bson(actual, operand);
                    let ok = match op.as_str() {
                        "$gt" => ord == Ordering::Greater,
                        "$gte" => ord != Ordering::Less,
                        "$lt" => ord == Ordering::Less,
                        "$lte" => ord != Ordering::Greater,
                        "$eq" => ord == Ordering::Equal,
                        "$ne" => ord != Ordering::Equal,
                        _ => false,
                    };
                    if !ok {
                        return false;
                    }
                }
            }
            other => {
                if cmp_bson(actual, other) != Ordering::Equal {
                    return false;
                }
            }
        }
    }
    true
}

/// Apply an include-style projection (`{field: 1}`); `_id` stays unless
/// explicitly excluded.
fn project(doc: &Document, projection: &Document) -> Document {
    let id_excluded = matches!(projection.get("_id"), Some(Bson::Int32(0) | Bson::Int64(0)));
    let mut out = Document::new();
    for (key, value) in doc {
        let keep = if key == "_id" {
            !id_excluded
        } else {
            !matches!(projection.get(key), None | Some(Bson::Int32(0) | Bson::Int64(0)))
        };
        if keep {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

#[async_trait]
impl DocumentSource for MemorySource {
    async fn find(&self, spec: FindSpec) -> Result<DocumentStream> {
        let docs = self
            .docs
            .read()
            .map_err(|_| SnapshotError::Internal("memory source lock poisoned".into()))?;
        let mut selected: Vec<Document> = docs
            .iter()
            .filter(|d| matches(d, &spec.filter))
            .cloned()
            .collect();
        if !spec.ascending {
            selected.reverse();
        }
        if let Some(limit) = spec.limit {
            selected.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        if let Some(projection) = &spec.projection {
            if !projection.is_empty() {
                selected = selected.iter().map(|d| project(d, projection)).collect();
            }
        }
        Ok(stream::iter(selected.into_iter().map(Ok)).boxed())
    }

    async fn estimated_count(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    async fn first_id(&self, filter: Document, ascending: bool) -> Result<Option<Bson>> {
        let mut spec = FindSpec::ascending(filter);
        spec.ascending = ascending;
        spec.limit = Some(1);
        let mut stream = self.find(spec).await?;
        match stream.next().await {
            Some(first) => Ok(first?.get("_id").cloned()),
            None => Ok(None),
        }
    }
}
