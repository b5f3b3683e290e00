use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use thiserror::Error;

/// Keys that carry a device identity, in lookup order.
pub const DEVICE_ID_KEYS: [&str; 2] = ["id", "deviceid"];

/// A decoded status-report value.
///
/// Integers and floats are kept apart so that field coercion can treat them
/// deterministically; `serde_json::Value` folds both into one number type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    Map(Record),
}

pub type Record = BTreeMap<String, Value>;

impl Value {
    pub fn as_map(&self) -> Option<&Record> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            JsonValue::String(s) => Value::Str(s),
            JsonValue::Array(items) => Value::Seq(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(obj) => {
                Value::Map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Leaf value of a flattened record.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Scalar {
    /// Returns `None` for null and container values.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(Scalar::Int(*i)),
            Value::Float(f) => Some(Scalar::Float(*f)),
            Value::Str(s) => Some(Scalar::Str(s.clone())),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Null | Value::Seq(_) | Value::Map(_) => None,
        }
    }

    /// Integer coercion used for device identities. Floats and float-looking
    /// strings are truncated.
    pub fn as_device_id(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            Scalar::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            Scalar::Float(_) => None,
            Scalar::Str(s) => {
                let trimmed = s.trim();
                trimmed.parse::<i64>().ok().or_else(|| {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
            }
            Scalar::Bool(_) => None,
        }
    }
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::Int(i) => Value::Int(i),
            Scalar::Float(f) => Value::Float(f),
            Scalar::Str(s) => Value::Str(s),
            Scalar::Bool(b) => Value::Bool(b),
        }
    }
}

/// Device identity of a buffered record: the first of `id`/`deviceid` that
/// coerces to an integer.
pub fn device_id(record: &Value) -> Option<i64> {
    let map = record.as_map()?;
    DEVICE_ID_KEYS
        .iter()
        .filter_map(|key| map.get(*key))
        .find_map(|value| Scalar::from_value(value)?.as_device_id())
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn parse_payload(payload: &[u8]) -> Result<Value, PayloadError> {
    let text = std::str::from_utf8(payload)?;
    let parsed: JsonValue = serde_json::from_str(text)?;
    Ok(Value::from(parsed))
}

/// Splits a status report into per-device records. A mapping with a
/// `devices` sequence yields one record per element; anything else is a
/// single record.
pub fn split_records(report: Value) -> Vec<Value> {
    match report {
        Value::Map(mut map) if matches!(map.get("devices"), Some(Value::Seq(_))) => {
            match map.remove("devices") {
                Some(Value::Seq(devices)) => devices,
                _ => Vec::new(),
            }
        }
        other => vec![other],
    }
}
