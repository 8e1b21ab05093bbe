//! Query string encoding for nested parameters.
//!
//! Objects flatten to `key[sub]=value`, arrays to repeated `key[]=value`.
//! Empty objects and arrays produce nothing, `null` produces `key=`, and
//! object keys come out sorted so the same params always encode the same way.

use serde_json::{Map, Value};
use url::form_urlencoded;

/// Encode `params` as an `application/x-www-form-urlencoded` string.
pub fn encode(params: &Map<String, Value>) -> String {
    let mut pairs = Vec::new();
    for (key, value) in sorted(params) {
        flatten(key.clone(), value, &mut pairs);
    }
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn flatten(key: String, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (sub, value) in sorted(map) {
                flatten(format!("{key}[{sub}]"), value, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten(format!("{key}[]"), item, out);
            }
        }
        Value::String(s) => out.push((key, s.clone())),
        Value::Null => out.push((key, String::new())),
        Value::Bool(b) => out.push((key, b.to_string())),
        Value::Number(n) => out.push((key, n.to_string())),
    }
}

// `Map` iterates in insertion order when serde_json's `preserve_order` is on.
fn sorted(map: &Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}
