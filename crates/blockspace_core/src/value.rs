//! Conversions between `serde_json` values and yrs values.
//!
//! Props and descriptor fields are JSON at the API surface and [`Any`] inside
//! the document. Integral numbers within the safe-integer range are stored as
//! `Any::Number` (as Yjs does) and read back as JSON integers.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Number, Value};
use yrs::{Any, Array, GetString, Map, Out, ReadTxn};

/// Largest integer exactly representable as an f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Convert a JSON value into a yrs [`Any`].
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if (i as f64).abs() <= MAX_SAFE_INTEGER {
                    Any::Number(i as f64)
                } else {
                    Any::BigInt(i)
                }
            } else {
                Any::Number(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => {
            let items: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(Arc::from(items))
        }
        Value::Object(fields) => {
            let fields: HashMap<String, Any> = fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(Arc::new(fields))
        }
    }
}

/// Convert a yrs [`Any`] into JSON.
pub fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(f) => number_to_json(*f),
        Any::BigInt(i) => Value::Number(Number::from(*i)),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(
            bytes
                .iter()
                .map(|b| Value::Number(Number::from(*b)))
                .collect(),
        ),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => {
            let mut object = JsonMap::new();
            for (k, v) in fields.iter() {
                object.insert(k.clone(), any_to_json(v));
            }
            Value::Object(object)
        }
    }
}

fn number_to_json(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Convert any value read out of a document into JSON, recursing into shared
/// types. Text is flattened to its string content.
pub fn out_to_json<T: ReadTxn>(txn: &T, value: &Out) -> Value {
    match value {
        Out::Any(any) => any_to_json(any),
        Out::YText(text) => Value::String(text.get_string(txn)),
        Out::YArray(array) => Value::Array(
            array
                .iter(txn)
                .map(|item| out_to_json(txn, &item))
                .collect(),
        ),
        Out::YMap(map) => {
            let mut object = JsonMap::new();
            for (key, item) in map.iter(txn) {
                object.insert(key.to_string(), out_to_json(txn, &item));
            }
            Value::Object(object)
        }
        other => Value::String(other.clone().to_string(txn)),
    }
}

/// Read a string out of a document value, if it is one.
pub fn out_as_string<T: ReadTxn>(txn: &T, value: &Out) -> Option<String> {
    match value {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        Out::YText(text) => Some(text.get_string(txn)),
        _ => None,
    }
}

/// Read a list of string ids out of a `Y.Array` (or a plain `Any` array).
pub fn out_as_id_list<T: ReadTxn>(txn: &T, value: &Out) -> Vec<String> {
    match value {
        Out::YArray(array) => array
            .iter(txn)
            .filter_map(|item| out_as_string(txn, &item))
            .collect(),
        Out::Any(Any::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Any::String(s) => Some(s.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use yrs::{Doc, MapPrelim, Transact};

    #[test]
    fn test_integers_read_back_as_integers() {
        let any = json_to_any(&json!(1700000000000i64));
        assert_eq!(any_to_json(&any), json!(1700000000000i64));
    }

    #[test]
    fn test_floats_are_preserved() {
        let any = json_to_any(&json!(1.5));
        assert_eq!(any_to_json(&any), json!(1.5));
    }

    #[test]
    fn test_nested_objects() {
        let value = json!({ "tags": ["a", "b"], "done": false, "depth": { "n": 2 } });
        assert_eq!(any_to_json(&json_to_any(&value)), value);
    }

    #[test]
    fn test_out_to_json_reads_shared_types() {
        let doc = Doc::new();
        let root = doc.get_or_insert_map("root");
        {
            let mut txn = doc.transact_mut();
            let inner = root.insert(&mut txn, "inner", MapPrelim::default());
            inner.insert(&mut txn, "title", "hello");
            inner.insert(&mut txn, "count", 3.0);
        }

        let txn = doc.transact();
        let value = root.get(&txn, "inner").unwrap();
        assert_eq!(
            out_to_json(&txn, &value),
            json!({ "title": "hello", "count": 3 })
        );
    }
}
