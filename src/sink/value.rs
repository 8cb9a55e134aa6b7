//! JSON <-> Firestore typed value mapping.
//!
//! Firestore's REST surface wraps every field in a type tag
//! (`stringValue`, `integerValue`, `mapValue`, ...). Encoding is lossless for
//! strings, integers, doubles, booleans, null, arrays and nested objects.

use serde_json::{json, Map, Value};

/// Encode a JSON value as a Firestore `Value`.
pub fn to_firestore_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                // int64 travels as a decimal string.
                json!({ "integerValue": n.to_string() })
            } else {
                json!({ "doubleValue": n })
            }
        }
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(to_firestore_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({ "mapValue": { "fields": to_firestore_fields(map) } }),
    }
}

/// Encode an object's members as a Firestore `fields` map.
pub fn to_firestore_fields(map: &Map<String, Value>) -> Value {
    Value::Object(
        map.iter()
            .map(|(key, value)| (key.clone(), to_firestore_value(value)))
            .collect(),
    )
}
