//! Conversion from dynamic RPC results into typed values.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::protocol::{DuorpcError, Result};

/// Decodes a dynamic JSON value into a caller-supplied type.
///
/// The codec is schemaless, so results arrive as [`Value`]s. Decoding
/// proceeds in order:
///
/// 1. direct deserialization (covers the identity case when `T` is
///    [`Value`] and structural map-to-struct decoding honoring serde field
///    attributes);
/// 2. a string source is re-parsed as JSON (`"42"` into a number, an
///    embedded JSON document into a struct);
/// 3. weakly-typed passes over scalar leaves, applied recursively through
///    objects and arrays: strings that parse as numbers or bools become
///    numbers or bools, then numbers and bools become their string
///    renditions, so a structural mapping with mismatched field types
///    (e.g. `{"quotient": "3"}` into an integer field) still decodes;
/// 4. anything still failing surfaces as [`DuorpcError::Decode`] carrying
///    the original deserialization error.
///
/// # Example
///
/// ```
/// use duorpc_common::decode_value;
/// use serde_json::json;
///
/// let n: i64 = decode_value(json!(5)).unwrap();
/// assert_eq!(n, 5);
///
/// let s: String = decode_value(json!("pong")).unwrap();
/// assert_eq!(s, "pong");
/// ```
pub fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    let direct_err = match serde_json::from_value::<T>(value.clone()) {
        Ok(decoded) => return Ok(decoded),
        Err(e) => e,
    };

    // a string source may itself be a JSON document
    if let Value::String(s) = &value {
        if let Ok(reparsed) = serde_json::from_str::<Value>(s) {
            if let Ok(decoded) = serde_json::from_value::<T>(reparsed) {
                return Ok(decoded);
            }
        }
    }

    // weakly-typed retries over scalar leaves, in both directions
    if let Ok(decoded) = serde_json::from_value::<T>(parse_string_leaves(value.clone())) {
        return Ok(decoded);
    }
    if let Ok(decoded) = serde_json::from_value::<T>(stringify_scalar_leaves(value)) {
        return Ok(decoded);
    }

    Err(DuorpcError::Decode(direct_err.to_string()))
}

/// Replaces every string leaf that parses as an integer, float, or bool
/// with the parsed scalar, recursing through objects and arrays.
fn parse_string_leaves(value: Value) -> Value {
    match value {
        Value::String(s) => {
            if let Ok(i) = s.parse::<i64>() {
                return Value::Number(i.into());
            }
            if let Ok(f) = s.parse::<f64>() {
                if let Some(n) = serde_json::Number::from_f64(f) {
                    return Value::Number(n);
                }
            }
            if let Ok(b) = s.parse::<bool>() {
                return Value::Bool(b);
            }
            Value::String(s)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(parse_string_leaves).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, parse_string_leaves(value)))
                .collect(),
        ),
        other => other,
    }
}

/// Replaces every number and bool leaf with its string rendition,
/// recursing through objects and arrays.
fn stringify_scalar_leaves(value: Value) -> Value {
    match value {
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(stringify_scalar_leaves).collect())
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, stringify_scalar_leaves(value)))
                .collect(),
        ),
        other => other,
    }
}
