//! BSON value helpers: total ordering, plain-JSON encoding, canonical JSON.
//!
//! JSON encoding here is the output encoding, not extended JSON: 64-bit
//! integers stay numbers, datetimes become RFC-3339 strings, ObjectIds
//! become their 24-character hex form. Exotic BSON types fall back to their
//! relaxed extended-JSON rendering so nothing is ever dropped.

use std::cmp::Ordering;

use bson::{Bson, Document};
use chrono::SecondsFormat;
use serde_json::Value;

/// Sort rank of a BSON type, following the server's cross-type sort order.
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Undefined => 1,
        Bson::Null => 2,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 3,
        Bson::String(_) | Bson::Symbol(_) => 4,
        Bson::Document(_) => 5,
        Bson::Array(_) => 6,
        Bson::Binary(_) => 7,
        Bson::ObjectId(_) => 8,
        Bson::Boolean(_) => 9,
        Bson::DateTime(_) => 10,
        Bson::Timestamp(_) => 11,
        Bson::RegularExpression(_) => 12,
        _ => 13,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        _ => None,
    }
}

/// Total order over BSON values, matching the order an `_id`-sorted cursor
/// returns them in. Numeric types compare across each other; everything else
/// compares within its type rank.
#[must_use]
pub fn cmp_bson(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_), _) | (_, Bson::Double(_)) => {
            match (a, b) {
                (Bson::Int32(x), Bson::Int32(y)) => x.cmp(y),
                (Bson::Int64(x), Bson::Int64(y)) => x.cmp(y),
                (Bson::Int32(x), Bson::Int64(y)) => i64::from(*x).cmp(y),
                (Bson::Int64(x), Bson::Int32(y)) => x.cmp(&i64::from(*y)),
                _ => match (as_f64(a), as_f64(b)) {
                    (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                },
            }
        }
        (Bson::String(x) | Bson::Symbol(x), Bson::String(y) | Bson::Symbol(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        (Bson::Binary(x), Bson::Binary(y)) => x.bytes.cmp(&y.bytes),
        (Bson::Array(x), Bson::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = cmp_bson(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Document(x), Bson::Document(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.cmp(yk).then_with(|| cmp_bson(xv, yv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Encode a BSON value as plain JSON for snapshot output.
#[must_use]
pub fn to_json(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::Number(i64::from(*i).into()),
        Bson::Int64(i) => Value::Number((*i).into()),
        Bson::Double(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Bson::String(s) | Bson::Symbol(s) => Value::String(s.clone()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(
            dt.to_chrono().to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        Bson::Binary(bin) => Value::String(hex::encode(&bin.bytes)),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Array(items) => Value::Array(items.iter().map(to_json).collect()),
        Bson::Document(doc) => document_to_json(doc),
        other => other.clone().into_relaxed_extjson(),
    }
}

/// Encode a whole document, preserving key order.
#[must_use]
pub fn document_to_json(doc: &Document) -> Value {
    let mut map = serde_json::Map::with_capacity(doc.len());
    for (key, value) in doc {
        map.insert(key.clone(), to_json(value));
    }
    Value::Object(map)
}

/// Serialize a JSON value with object keys sorted at every level.
///
/// Used for digests: two semantically equal configurations must hash the
/// same regardless of key insertion order.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut sorted = serde_json::Map::with_capacity(entries.len());
                for (k, v) in entries {
                    sorted.insert(k.clone(), sort(v));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Rough serialized size of a BSON value, used for queue byte accounting.
#[must_use]
pub fn approx_size(value: &Bson) -> usize {
    match value {
        Bson::Null | Bson::Undefined | Bson::Boolean(_) => 1,
        Bson::Int32(_) => 4,
        Bson::Int64(_) | Bson::Double(_) | Bson::DateTime(_) | Bson::Timestamp(_) => 8,
        Bson::ObjectId(_) => 12,
        Bson::Decimal128(_) => 16,
        Bson::String(s) | Bson::Symbol(s) => s.len() + 5,
        Bson::Binary(bin) => bin.bytes.len() + 5,
        Bson::Array(items) => items.iter().map(approx_size).sum::<usize>() + 5,
        Bson::Document(doc) => approx_document_size(doc),
        _ => 16,
    }
}

/// Rough serialized size of a document.
#[must_use]
pub fn approx_document_size(doc: &Document) -> usize {
    doc.iter()
        .map(|(k, v)| k.len() + 1 + approx_size(v))
        .sum::<usize>()
        + 5
}
