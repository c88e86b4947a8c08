//! JSON ⇄ interpreter value conversion.
//!
//! Binary payloads cross as `{"$binary": "<base64>"}` and become blobs
//! inside the script. They are decoded once on entry and encoded once on
//! exit; nothing in between re-encodes them.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rhai::{Array, Blob, Dynamic, ImmutableString, Map, FLOAT, INT};
use serde_json::{Map as JsonMap, Number, Value};

use crate::host::ScriptStream;

pub const BINARY_KEY: &str = "$binary";
pub const STREAM_KEY: &str = "$stream";

/// Escape one JSON-pointer reference token.
pub fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn as_binary(map: &JsonMap<String, Value>) -> Option<&str> {
    if map.len() != 1 {
        return None;
    }
    map.get(BINARY_KEY).and_then(Value::as_str)
}

/// Total decoded size of every binary payload in `value`.
pub fn binary_size(value: &Value) -> usize {
    match value {
        Value::Object(map) => match as_binary(map) {
            Some(b64) => b64.len() / 4 * 3,
            None => map.values().map(binary_size).sum(),
        },
        Value::Array(items) => items.iter().map(binary_size).sum(),
        _ => 0,
    }
}

/// Convert a host value into an interpreter value.
///
/// A `$binary` object with invalid base64 stays a plain map.
pub fn to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i as INT),
            None => Dynamic::from(n.as_f64().unwrap_or_default() as FLOAT),
        },
        Value::String(s) => Dynamic::from(ImmutableString::from(s)),
        Value::Array(items) => Dynamic::from_array(items.into_iter().map(to_dynamic).collect()),
        Value::Object(map) => {
            if let Some(bytes) = as_binary(&map).and_then(|b64| STANDARD.decode(b64).ok()) {
                return Dynamic::from_blob(bytes);
            }
            let converted: Map = map
                .into_iter()
                .map(|(k, v)| (k.into(), to_dynamic(v)))
                .collect();
            Dynamic::from_map(converted)
        }
    }
}

/// Convert an interpreter value into a host value.
///
/// Each stream encountered is replaced by a `$stream` sentinel carrying its
/// JSON-pointer path, and recorded in `streams` as `(path, stream)`.
pub fn to_json(value: Dynamic, path: &str, streams: &mut Vec<(String, ScriptStream)>) -> Value {
    if value.is::<()>() {
        return Value::Null;
    }
    if value.is::<bool>() {
        return value.try_cast::<bool>().map_or(Value::Null, Value::Bool);
    }
    if value.is::<INT>() {
        return value.try_cast::<INT>().map_or(Value::Null, |i| Value::from(i));
    }
    if value.is::<FLOAT>() {
        return value
            .try_cast::<FLOAT>()
            .and_then(|f| Number::from_f64(f as f64))
            .map_or(Value::Null, Value::Number);
    }
    if value.is::<ImmutableString>() {
        return value
            .try_cast::<ImmutableString>()
            .map_or(Value::Null, |s| Value::String(s.to_string()));
    }
    if value.is::<char>() {
        return value
            .try_cast::<char>()
            .map_or(Value::Null, |c| Value::String(c.to_string()));
    }
    if value.is::<Blob>() {
        return value.try_cast::<Blob>().map_or(Value::Null, |bytes| {
            let mut map = JsonMap::new();
            map.insert(BINARY_KEY.to_string(), Value::String(STANDARD.encode(bytes)));
            Value::Object(map)
        });
    }
    if value.is::<Array>() {
        let items = value.try_cast::<Array>().unwrap_or_default();
        return Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| to_json(item, &format!("{path}/{i}"), streams))
                .collect(),
        );
    }
    if value.is::<Map>() {
        let map = value.try_cast::<Map>().unwrap_or_default();
        return Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let child = format!("{path}/{}", escape_pointer_token(k.as_str()));
                    let converted = to_json(v, &child, streams);
                    (k.to_string(), converted)
                })
                .collect(),
        );
    }
    if value.is::<ScriptStream>() {
        return match value.try_cast::<ScriptStream>() {
            Some(stream) => {
                streams.push((path.to_string(), stream));
                let mut map = JsonMap::new();
                map.insert(STREAM_KEY.to_string(), Value::String(path.to_string()));
                Value::Object(map)
            }
            None => Value::Null,
        };
    }
    Value::String(value.to_string())
}

/// Convert a value that may not carry streams (stream items, host call
/// arguments). Nested streams become `null`.
pub fn to_plain_json(value: Dynamic) -> Value {
    let mut streams = Vec::new();
    let json = to_json(value, "", &mut streams);
    if streams.is_empty() {
        json
    } else {
        strip_streams(json)
    }
}

fn strip_streams(value: Value) -> Value {
    match value {
        Value::Object(map) if map.len() == 1 && map.contains_key(STREAM_KEY) => Value::Null,
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, strip_streams(v))).collect()),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_streams).collect()),
        other => other,
    }
}

/// JSON-pointer paths of every `$stream` sentinel in `value`.
pub fn stream_paths(value: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_stream_paths(value, &mut paths);
    paths
}

fn collect_stream_paths(value: &Value, paths: &mut Vec<String>) {
    match value {
        Value::Object(map) => match map.get(STREAM_KEY).and_then(Value::as_str) {
            Some(path) if map.len() == 1 => paths.push(path.to_string()),
            _ => map.values().for_each(|v| collect_stream_paths(v, paths)),
        },
        Value::Array(items) => items.iter().for_each(|v| collect_stream_paths(v, paths)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scalars_and_containers_survive_the_boundary() {
        let value = json!({ "a": 1, "b": [true, null, "x"], "c": { "d": 2.5 } });
        let mut streams = Vec::new();
        assert_eq!(to_json(to_dynamic(value.clone()), "", &mut streams), value);
        assert!(streams.is_empty());
    }

    #[test]
    fn binary_becomes_blob_and_back() {
        let value = json!({ "$binary": STANDARD.encode([1u8, 2, 3]) });
        let dynamic = to_dynamic(value.clone());
        assert!(dynamic.is::<Blob>());
        assert_eq!(to_plain_json(dynamic), value);
        assert_eq!(binary_size(&json!({ "img": value })), 3);
    }

    #[test]
    fn invalid_base64_stays_a_map() {
        let value = json!({ "$binary": "!!not base64!!" });
        assert!(to_dynamic(value).is::<Map>());
    }

    #[test]
    fn streams_become_sentinels_with_pointer_paths() {
        let mut map = Map::new();
        map.insert("a/b".into(), Dynamic::from(ScriptStream { id: 0 }));
        map.insert(
            "list".into(),
            Dynamic::from_array(vec![Dynamic::from(ScriptStream { id: 1 })]),
        );

        let mut streams = Vec::new();
        let json = to_json(Dynamic::from_map(map), "", &mut streams);

        assert_eq!(json["a/b"], json!({ "$stream": "/a~1b" }));
        assert_eq!(json["list"][0], json!({ "$stream": "/list/0" }));
        assert_eq!(streams.len(), 2);
        assert_eq!(stream_paths(&json), vec!["/a~1b".to_string(), "/list/0".to_string()]);
    }

    #[test]
    fn plain_conversion_drops_streams() {
        let value = Dynamic::from_array(vec![Dynamic::from(ScriptStream { id: 0 }), Dynamic::from(1 as INT)]);
        assert_eq!(to_plain_json(value), json!([null, 1]));
    }
}
