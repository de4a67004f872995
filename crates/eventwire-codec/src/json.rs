use bytes::Bytes;

use crate::error::{CodecError, Result};
use crate::value::Value;
use crate::Codec;

/// Reserved object key carrying a byte string in JSON payloads.
pub const BYTES_KEY: &str = "$bytes";

const NAME: &str = "json";

/// Self-describing text codec (the default).
///
/// A payload is one JSON array. Byte strings travel as `{"$bytes": [..]}`,
/// so a map whose only key is `$bytes` cannot be sent through this codec.
/// Non-finite floats are rejected as JSON cannot represent them.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn encode(&self, values: &[Value]) -> Result<Vec<u8>> {
        let array = values.iter().map(to_json).collect::<Result<Vec<_>>>()?;
        serde_json::to_vec(&serde_json::Value::Array(array))
            .map_err(|err| CodecError::encode(NAME, err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        let parsed: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|err| CodecError::decode(NAME, err.to_string()))?;
        match parsed {
            serde_json::Value::Array(items) => items.into_iter().map(from_json).collect(),
            other => Err(CodecError::decode(
                NAME,
                format!("payload must be an array, got {}", json_kind(&other)),
            )),
        }
    }
}

fn to_json(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| CodecError::encode(NAME, format!("non-finite float {f}")))?,
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => {
            let mut obj = serde_json::Map::with_capacity(1);
            obj.insert(
                BYTES_KEY.to_string(),
                serde_json::Value::Array(b.iter().map(|byte| serde_json::Value::from(*byte)).collect()),
            );
            serde_json::Value::Object(obj)
        }
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(to_json).collect::<Result<Vec<_>>>()?)
        }
        Value::Map(map) => {
            if map.len() == 1 && map.contains_key(BYTES_KEY) {
                return Err(CodecError::encode(
                    NAME,
                    format!("map with sole key '{BYTES_KEY}' is reserved for byte strings"),
                ));
            }
            let mut obj = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                obj.insert(k.clone(), to_json(v)?);
            }
            serde_json::Value::Object(obj)
        }
    })
}

fn from_json(value: serde_json::Value) -> Result<Value> {
    Ok(match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if n.is_u64() {
                return Err(CodecError::decode(
                    NAME,
                    format!("integer {n} out of range for i64"),
                ));
            } else {
                Value::Float(
                    n.as_f64()
                        .ok_or_else(|| CodecError::decode(NAME, format!("invalid number {n}")))?,
                )
            }
        }
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(from_json).collect::<Result<Vec<_>>>()?)
        }
        serde_json::Value::Object(mut obj) => {
            if obj.len() == 1 {
                if let Some(raw) = obj.remove(BYTES_KEY) {
                    return decode_bytes(raw).map(Value::Bytes);
                }
            }
            let mut map = std::collections::BTreeMap::new();
            for (k, v) in obj {
                map.insert(k, from_json(v)?);
            }
            Value::Map(map)
        }
    })
}

fn decode_bytes(raw: serde_json::Value) -> Result<Bytes> {
    let serde_json::Value::Array(items) = raw else {
        return Err(CodecError::decode(
            NAME,
            format!("'{BYTES_KEY}' must hold an array of octets"),
        ));
    };
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| CodecError::decode(NAME, format!("invalid octet {item}")))
        })
        .collect::<Result<Vec<u8>>>()
        .map(Bytes::from)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
