//! Conversion between JSON values and Rhai-compatible types.
//!
//! Scope construction converts the context's JSON maps into Rhai maps, and
//! snapshot serialization converts the final scope back into JSON-safe
//! values. Values Rhai can hold but JSON cannot express (function pointers,
//! timestamps, custom types) are dropped from snapshots.

use rhai::{Dynamic, Map};
use serde_json::Value;

use crate::models::JsonMap;

/// Converts a JSON value to a Rhai `Dynamic`.
///
/// Numbers that fit in Rhai's native integer type stay integral; everything
/// else becomes a float.
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else {
                n.as_f64().unwrap_or(f64::NAN).into()
            }
        }
        Value::String(s) => s.clone().into(),
        Value::Array(items) => {
            let array: Vec<Dynamic> = items.iter().map(json_to_dynamic).collect();
            array.into()
        }
        Value::Object(map) => Dynamic::from_map(json_object_to_rhai_map(map)),
    }
}

/// Converts a JSON object into a Rhai map.
pub fn json_object_to_rhai_map(map: &JsonMap) -> Map {
    map.iter().map(|(key, value)| (key.as_str().into(), json_to_dynamic(value))).collect()
}

/// Converts a Rhai `Dynamic` to a JSON value. Returns `None` for values with
/// no JSON representation.
pub fn dynamic_to_json(value: &Dynamic) -> Option<Value> {
    if value.is_unit() {
        return Some(Value::Null);
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Some(Value::Bool(b));
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Some(Value::Number(i.into()));
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        return serde_json::Number::from_f64(f).map(Value::Number);
    }
    if let Some(c) = value.clone().try_cast::<char>() {
        return Some(Value::String(c.to_string()));
    }
    if let Some(s) = value.clone().try_cast::<rhai::ImmutableString>() {
        return Some(Value::String(s.to_string()));
    }
    if let Some(array) = value.clone().try_cast::<rhai::Array>() {
        let items: Vec<Value> = array.iter().filter_map(dynamic_to_json).collect();
        return Some(Value::Array(items));
    }
    if let Some(map) = value.clone().try_cast::<Map>() {
        return Some(Value::Object(rhai_map_to_json_object(&map)));
    }
    None
}

/// Converts a Rhai map into a JSON object, dropping entries that have no JSON
/// representation.
pub fn rhai_map_to_json_object(map: &Map) -> JsonMap {
    map.iter()
        .filter_map(|(key, value)| dynamic_to_json(value).map(|v| (key.to_string(), v)))
        .collect()
}
