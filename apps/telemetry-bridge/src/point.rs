use crate::flatten::FlatRecord;
use crate::telemetry::{Scalar, DEVICE_ID_KEYS};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Keys that never become fields.
const EXCLUDED_FIELDS: [&str; 5] = ["id", "deviceid", "time", "mac", "timestamp_ms"];

/// Counters and durations. The store needs a stable type per field, so these
/// are always written as integers.
const INTEGER_FIELDS: [&str; 3] = ["uptime", "freeHeap", "minFreeHeap"];

/// Flattened discovery counters (`mDNS.*`).
const INTEGER_FIELD_PREFIXES: [&str; 1] = ["mDNS"];

pub const DEVICE_TAG: &str = "device";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp_ns: i64,
}

/// Permanent validation failures; retrying the same record reproduces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidRecord {
    #[error("record has no integer id or deviceid")]
    MissingDeviceId,
    #[error("record has no usable fields")]
    NoFields,
}

pub fn device_id(flat: &FlatRecord) -> Option<i64> {
    DEVICE_ID_KEYS
        .iter()
        .filter_map(|key| flat.get(*key))
        .find_map(Scalar::as_device_id)
}

pub fn build_point(
    flat: &FlatRecord,
    measurement: &str,
    timestamp_ns: i64,
) -> Result<Point, InvalidRecord> {
    let device = device_id(flat).ok_or(InvalidRecord::MissingDeviceId)?;

    let mut fields = BTreeMap::new();
    for (key, value) in flat {
        if EXCLUDED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if !is_valid_key(key) {
            tracing::debug!(field = ?key, "skipping field with unencodable key");
            continue;
        }
        let candidate = match value {
            Scalar::Int(i) => *i as f64,
            Scalar::Float(f) => *f,
            Scalar::Str(s) if is_numeric_text(s) => match s.parse::<f64>() {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::debug!(field = %key, value = %s, error = %err, "skipping unparseable numeric field");
                    continue;
                }
            },
            Scalar::Str(s) => {
                fields.insert(key.clone(), FieldValue::Str(s.clone()));
                continue;
            }
            Scalar::Bool(b) => {
                fields.insert(key.clone(), FieldValue::Bool(*b));
                continue;
            }
        };
        if !candidate.is_finite() {
            tracing::debug!(field = %key, "skipping non-finite numeric field");
            continue;
        }
        let field = if is_integer_field(key) {
            FieldValue::Int(candidate.trunc() as i64)
        } else {
            FieldValue::Float(candidate)
        };
        fields.insert(key.clone(), field);
    }

    if fields.is_empty() {
        return Err(InvalidRecord::NoFields);
    }

    let mut tags = BTreeMap::new();
    tags.insert(DEVICE_TAG.to_string(), device.to_string());

    Ok(Point {
        measurement: measurement.to_string(),
        tags,
        fields,
        timestamp_ns,
    })
}

/// Whether `name` can be written as a measurement, tag key/value or field
/// key. Line protocol has no escape for a literal line break, and empty names
/// are rejected by the store.
pub fn is_valid_key(name: &str) -> bool {
    !name.is_empty() && !name.contains(['\n', '\r'])
}

/// Digits with at most one decimal point, and at least one digit.
fn is_numeric_text(raw: &str) -> bool {
    let mut dots = 0;
    let mut digits = 0;
    for ch in raw.chars() {
        match ch {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    digits > 0 && dots <= 1
}

fn is_integer_field(key: &str) -> bool {
    INTEGER_FIELDS.contains(&key)
        || INTEGER_FIELD_PREFIXES
            .iter()
            .any(|prefix| key.len() > prefix.len() && key.starts_with(prefix))
}

impl Point {
    pub fn line_protocol(&self) -> LineProtocol<'_> {
        LineProtocol(self)
    }
}

/// InfluxDB line-protocol rendering of a point.
pub struct LineProtocol<'a>(&'a Point);

impl fmt::Display for LineProtocol<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let point = self.0;
        write_escaped(f, &point.measurement, &[',', ' '])?;

        for (k, v) in &point.tags {
            f.write_str(",")?;
            write_escaped(f, k, &[',', '=', ' '])?;
            f.write_str("=")?;
            write_escaped(f, v, &[',', '=', ' '])?;
        }

        for (i, (k, v)) in point.fields.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { "," })?;
            write_escaped(f, k, &[',', '=', ' '])?;
            f.write_str("=")?;
            match v {
                FieldValue::Int(i) => write!(f, "{i}i")?,
                FieldValue::Float(x) => write!(f, "{x}")?,
                FieldValue::Bool(b) => write!(f, "{b}")?,
                FieldValue::Str(s) => {
                    f.write_str("\"")?;
                    write_escaped(f, s, &['"', '\\'])?;
                    f.write_str("\"")?;
                }
            }
        }

        write!(f, " {}", point.timestamp_ns)
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, raw: &str, delimiters: &[char]) -> fmt::Result {
    let mut last = 0;
    for (idx, delim) in raw.match_indices(delimiters) {
        f.write_str(&raw[last..idx])?;
        f.write_str("\\")?;
        f.write_str(delim)?;
        last = idx + delim.len();
    }
    f.write_str(&raw[last..])
}

/// Renders a batch as newline-separated line protocol.
pub fn encode_batch(points: &[Point]) -> String {
    let mut body = String::new();
    for point in points {
        body.push_str(&point.line_protocol().to_string());
        body.push('\n');
    }
    body
}
