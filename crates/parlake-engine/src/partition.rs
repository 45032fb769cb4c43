//! Partition planning over the `_id` keyspace.
//!
//! The planner divides the keyspace matched by the base query into
//! contiguous, disjoint, half-open ranges. The default strategy exploits
//! the generation-time prefix of ObjectIds: two limit-1 index lookups give
//! the time span, and each inner boundary is the first real `_id` past a
//! synthetic time-step identifier. Collections with non-ObjectId keys (or
//! a degenerate time span) fall back to cursor sampling.

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use futures_util::StreamExt;
use parlake_types::error::Result;
use parlake_types::options::SAMPLE_PER_PARTITION;
use parlake_types::value::cmp_bson;

use crate::source::{and_filters, DocumentSource, FindSpec};

/// A half-open `_id` interval: `lower < _id <= upper`, either side optional.
#[derive(Debug, Clone, PartialEq)]
pub struct IdRange {
    pub lower: Option<Bson>,
    pub upper: Option<Bson>,
}

impl IdRange {
    /// The range covering the whole keyspace.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    /// Render as a filter fragment: `{_id: {$gt: a, $lte: b}}`, either
    /// bound omitted when open, `{}` when fully unbounded.
    #[must_use]
    pub fn filter(&self) -> Document {
        let mut bounds = Document::new();
        if let Some(lower) = &self.lower {
            bounds.insert("$gt", lower.clone());
        }
        if let Some(upper) = &self.upper {
            bounds.insert("$lte", upper.clone());
        }
        if bounds.is_empty() {
            Document::new()
        } else {
            doc! { "_id": bounds }
        }
    }
}

/// Plan `n` ranges over the keys matched by `base_query`.
///
/// Fewer than `n` ranges may be returned when boundaries collapse; coverage
/// and disjointness always hold. Any source failure aborts the plan.
///
/// # Errors
///
/// Propagates source errors; no partial plan is returned.
pub async fn plan(
    source: &dyn DocumentSource,
    base_query: &Document,
    n: usize,
) -> Result<Vec<IdRange>> {
    let min_id = source.first_id(base_query.clone(), true).await?;
    let Some(min_id) = min_id else {
        // Empty keyspace: a single match-all range keeps the pipeline
        // shape uniform.
        return Ok(vec![IdRange::unbounded()]);
    };
    if n <= 1 {
        return Ok(vec![IdRange::unbounded()]);
    }
    let max_id = source
        .first_id(base_query.clone(), false)
        .await?
        .unwrap_or_else(|| min_id.clone());

    let boundaries = match (&min_id, &max_id) {
        (Bson::ObjectId(min_oid), Bson::ObjectId(max_oid)) => {
            let tmin = min_oid.timestamp().timestamp_millis() / 1000;
            let tmax = max_oid.timestamp().timestamp_millis() / 1000;
            if tmax > tmin {
                timestamp_boundaries(source, base_query, n, tmin, tmax).await?
            } else {
                sampled_boundaries(source, base_query, n).await?
            }
        }
        _ => sampled_boundaries(source, base_query, n).await?,
    };

    let boundaries = dedup_ascending(boundaries);
    tracing::debug!(
        requested = n,
        ranges = boundaries.len() + 1,
        "partition plan ready"
    );
    Ok(ranges_from_boundaries(boundaries))
}

/// Inner boundaries from the generation-time span of the `_id` bounds.
async fn timestamp_boundaries(
    source: &dyn DocumentSource,
    base_query: &Document,
    n: usize,
    tmin: i64,
    tmax: i64,
) -> Result<Vec<Bson>> {
    let step = ((tmax - tmin) / n as i64).max(1);
    let mut boundaries = Vec::with_capacity(n - 1);
    for i in 1..n {
        let t = tmin + step * i as i64;
        if t > tmax {
            break;
        }
        let synthetic = synthetic_object_id(t);
        let filter = and_filters(vec![
            base_query.clone(),
            doc! { "_id": { "$gt": synthetic } },
        ]);
        // Boundaries must be real keys so every range endpoint is a
        // document that actually exists.
        if let Some(id) = source.first_id(filter, true).await? {
            boundaries.push(id);
        }
    }
    Ok(boundaries)
}

/// An ObjectId whose generation time is `seconds` and whose remaining bytes
/// are zero: it sorts before every real id generated in that second.
fn synthetic_object_id(seconds: i64) -> Bson {
    let secs = u32::try_from(seconds).unwrap_or(u32::MAX);
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(&secs.to_be_bytes());
    Bson::ObjectId(ObjectId::from_bytes(bytes))
}

/// Fallback boundaries from a sorted `_id` scan.
async fn sampled_boundaries(
    source: &dyn DocumentSource,
    base_query: &Document,
    n: usize,
) -> Result<Vec<Bson>> {
    let estimated = source.estimated_count().await?;
    let mut spec = FindSpec::ascending(base_query.clone());
    spec.projection = Some(doc! { "_id": 1 });

    if estimated <= n as u64 * SAMPLE_PER_PARTITION {
        // Small keyspace: the first n-1 keys become endpoint ranges.
        spec.limit = Some(n as i64 - 1);
        let mut stream = source.find(spec).await?;
        let mut boundaries = Vec::with_capacity(n - 1);
        while let Some(doc) = stream.next().await {
            if let Some(id) = doc?.get("_id") {
                boundaries.push(id.clone());
            }
        }
        return Ok(boundaries);
    }

    let step = estimated / n as u64;
    let mut stream = source.find(spec).await?;
    let mut boundaries = Vec::with_capacity(n - 1);
    let mut seen = 0u64;
    while let Some(doc) = stream.next().await {
        let doc = doc?;
        seen += 1;
        if seen % step == 0 {
            if let Some(id) = doc.get("_id") {
                boundaries.push(id.clone());
            }
            if boundaries.len() == n - 1 {
                break;
            }
        }
    }
    Ok(boundaries)
}

/// Keep a strictly increasing boundary sequence; equal or out-of-order
/// boundaries would produce zero-width ranges.
fn dedup_ascending(boundaries: Vec<Bson>) -> Vec<Bson> {
    let mut out: Vec<Bson> = Vec::with_capacity(boundaries.len());
    for boundary in boundaries {
        if out
            .last()
            .map_or(true, |last| cmp_bson(&boundary, last) == std::cmp::Ordering::Greater)
        {
            out.push(boundary);
        }
    }
    out
}

/// Chain boundaries into contiguous ranges: the first range is lower-open
/// (so the minimum key is included), the last is upper-open.
fn ranges_from_boundaries(boundaries: Vec<Bson>) -> Vec<IdRange> {
    let mut ranges = Vec::with_capacity(boundaries.len() + 1);
    let mut lower: Option<Bson> = None;
    for boundary in boundaries {
        ranges.push(IdRange {
            lower: lower.clone(),
            upper: Some(boundary.clone()),
        });
        lower = Some(boundary);
    }
    ranges.push(IdRange { lower, upper: None });
    ranges
}
