use crate::telemetry::{Scalar, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

pub type FlatRecord = BTreeMap<String, Scalar>;

/// What to do with sequence-valued fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArrayPolicy {
    /// Skip the field and emit a warning.
    #[default]
    Drop,
    /// Recurse into each element using its index as a path segment.
    Expand,
}

impl FromStr for ArrayPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(ArrayPolicy::Drop),
            "expand" | "index" => Ok(ArrayPolicy::Expand),
            other => anyhow::bail!("unknown array policy {other:?} (expected drop or expand)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlattenOptions {
    pub separator: String,
    pub arrays: ArrayPolicy,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            separator: "_".to_string(),
            arrays: ArrayPolicy::Drop,
        }
    }
}

/// Collapses a nested record into a single-level mapping keyed by joined
/// paths. Null leaves are omitted. A non-mapping root yields an empty record.
pub fn flatten(record: &Value, options: &FlattenOptions) -> FlatRecord {
    let mut out = FlatRecord::new();
    if let Value::Map(map) = record {
        for (key, value) in map {
            flatten_into(&mut out, key.clone(), value, options);
        }
    }
    out
}

fn flatten_into(out: &mut FlatRecord, path: String, value: &Value, options: &FlattenOptions) {
    match value {
        Value::Map(map) => {
            for (key, child) in map {
                let child_path = format!("{path}{}{key}", options.separator);
                flatten_into(out, child_path, child, options);
            }
        }
        Value::Seq(items) => match options.arrays {
            ArrayPolicy::Drop => {
                tracing::warn!(field = %path, len = items.len(), "dropping sequence-valued field");
            }
            ArrayPolicy::Expand => {
                for (idx, item) in items.iter().enumerate() {
                    let child_path = format!("{path}{}{idx}", options.separator);
                    flatten_into(out, child_path, item, options);
                }
            }
        },
        Value::Null => {}
        scalar => {
            if let Some(scalar) = Scalar::from_value(scalar) {
                out.insert(path, scalar);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::parse_payload;

    fn parse(raw: &str) -> Value {
        parse_payload(raw.as_bytes()).expect("valid json")
    }

    fn as_value(flat: &FlatRecord) -> Value {
        Value::Map(
            flat.iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect(),
        )
    }

    #[test]
    fn nested_mapping_joins_with_separator() {
        let flat = flatten(&parse(r#"{"a": {"b": 1}}"#), &FlattenOptions::default());
        assert_eq!(flat.len(), 1);
        assert_eq!(flat.get("a_b"), Some(&Scalar::Int(1)));
    }

    #[test]
    fn deep_nesting_and_custom_separator() {
        let options = FlattenOptions {
            separator: ".".to_string(),
            ..FlattenOptions::default()
        };
        let flat = flatten(
            &parse(r#"{"mDNS": {"stats": {"queries": 4}}, "ok": true}"#),
            &options,
        );
        assert_eq!(flat.get("mDNS.stats.queries"), Some(&Scalar::Int(4)));
        assert_eq!(flat.get("ok"), Some(&Scalar::Bool(true)));
    }

    #[test]
    fn flattening_flat_input_is_idempotent() {
        let options = FlattenOptions::default();
        let record = parse(r#"{"id": 3, "temp": 21.5, "name": "lamp", "on": false}"#);
        let once = flatten(&record, &options);
        let twice = flatten(&as_value(&once), &options);
        assert_eq!(once, twice);
        assert_eq!(as_value(&once), record);
    }

    #[test]
    fn sequences_are_dropped_by_default() {
        let flat = flatten(
            &parse(r#"{"id": 1, "channels": [10, 20], "nested": {"list": [{"x": 1}]}}"#),
            &FlattenOptions::default(),
        );
        assert_eq!(flat.len(), 1);
        assert!(flat.contains_key("id"));
    }

    #[test]
    fn sequences_expand_by_index_when_configured() {
        let options = FlattenOptions {
            arrays: ArrayPolicy::Expand,
            ..FlattenOptions::default()
        };
        let flat = flatten(
            &parse(r#"{"channels": [10, {"level": 0.5}, [true]]}"#),
            &options,
        );
        assert_eq!(flat.get("channels_0"), Some(&Scalar::Int(10)));
        assert_eq!(flat.get("channels_1_level"), Some(&Scalar::Float(0.5)));
        assert_eq!(flat.get("channels_2_0"), Some(&Scalar::Bool(true)));
    }

    #[test]
    fn nulls_and_non_mapping_roots_produce_nothing() {
        let options = FlattenOptions::default();
        let flat = flatten(&parse(r#"{"a": null, "b": {"c": null}}"#), &options);
        assert!(flat.is_empty());
        assert!(flatten(&parse("[1, 2]"), &options).is_empty());
        assert!(flatten(&parse("17"), &options).is_empty());
    }

    #[test]
    fn array_policy_parses_from_config_strings() {
        assert_eq!("drop".parse::<ArrayPolicy>().unwrap(), ArrayPolicy::Drop);
        assert_eq!(" Expand ".parse::<ArrayPolicy>().unwrap(), ArrayPolicy::Expand);
        assert!("keep".parse::<ArrayPolicy>().is_err());
    }
}
