//! Decoder for the tagged transaction-metadata representation carried on the
//! sync stream: every value is a single-key object naming its type, maps are
//! lists of `{"k": ..., "v": ...}` pairs.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("{path}: expected a tagged value object")]
    NotTagged { path: String },

    #[error("{path}: invalid type tag {tag}")]
    InvalidTag { path: String, tag: String },

    #[error("{path}: unable to parse value as {expected}")]
    WrongShape { path: String, expected: &'static str },

    #[error("{path}: invalid hex in bytes value")]
    BadHex { path: String },
}

/// A decoded metadata value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Int(i64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<MetadataValue>),
    Map(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// Decode a whole metadata blob: a map from metadatum label to tagged value
pub fn parse_blob(blob: &serde_json::Map<String, Value>) -> Result<BTreeMap<String, MetadataValue>, MetadataError> {
    let mut results = BTreeMap::new();
    for (label, raw) in blob {
        results.insert(label.clone(), parse(&format!("/{label}/"), raw)?);
    }
    Ok(results)
}

fn parse(path: &str, raw: &Value) -> Result<MetadataValue, MetadataError> {
    let obj = raw.as_object().ok_or_else(|| MetadataError::NotTagged {
        path: path.to_string(),
    })?;
    let (tag, value) = obj.iter().next().ok_or_else(|| MetadataError::NotTagged {
        path: path.to_string(),
    })?;

    let path = format!("{path}{tag}");
    match tag.as_str() {
        "int" => parse_int(&path, value),
        "string" => parse_string(&path, value),
        "bytes" => parse_bytes(&path, value),
        "list" => parse_list(&path, value),
        "map" => parse_map(&path, value),
        other => Err(MetadataError::InvalidTag {
            path,
            tag: other.to_string(),
        }),
    }
}

fn parse_int(path: &str, value: &Value) -> Result<MetadataValue, MetadataError> {
    let n = value.as_i64().ok_or(MetadataError::WrongShape {
        path: path.to_string(),
        expected: "int",
    })?;
    Ok(MetadataValue::Int(n))
}

fn parse_string(path: &str, value: &Value) -> Result<MetadataValue, MetadataError> {
    let s = value.as_str().ok_or(MetadataError::WrongShape {
        path: path.to_string(),
        expected: "string",
    })?;
    Ok(MetadataValue::String(s.to_string()))
}

fn parse_bytes(path: &str, value: &Value) -> Result<MetadataValue, MetadataError> {
    let s = value.as_str().ok_or(MetadataError::WrongShape {
        path: path.to_string(),
        expected: "bytes",
    })?;
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|_| MetadataError::BadHex {
        path: path.to_string(),
    })?;
    Ok(MetadataValue::Bytes(bytes))
}

fn parse_list(path: &str, value: &Value) -> Result<MetadataValue, MetadataError> {
    let items = value.as_array().ok_or(MetadataError::WrongShape {
        path: path.to_string(),
        expected: "list",
    })?;
    let mut result = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        result.push(parse(&format!("{path}-{i}"), item)?);
    }
    Ok(MetadataValue::List(result))
}

fn parse_map(path: &str, value: &Value) -> Result<MetadataValue, MetadataError> {
    let pairs = value.as_array().ok_or(MetadataError::WrongShape {
        path: path.to_string(),
        expected: "map",
    })?;

    let mut result = BTreeMap::new();
    for (i, pair) in pairs.iter().enumerate() {
        let path = format!("{path}-{i}");
        let pair = pair.as_object().ok_or(MetadataError::WrongShape {
            path: path.clone(),
            expected: "map entry",
        })?;
        let key_raw = pair.get("k").ok_or(MetadataError::WrongShape {
            path: path.clone(),
            expected: "map entry with k",
        })?;
        let value_raw = pair.get("v").ok_or(MetadataError::WrongShape {
            path: path.clone(),
            expected: "map entry with v",
        })?;

        let key = match parse(&format!("{path}-k"), key_raw)? {
            MetadataValue::String(s) => s,
            // Non-string keys are forced into string form
            MetadataValue::Int(n) => n.to_string(),
            MetadataValue::Bytes(b) => hex::encode(b),
            other => format!("{other:?}"),
        };
        result.insert(key, parse(&format!("{path}-v"), value_raw)?);
    }
    Ok(MetadataValue::Map(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blob(value: Value) -> serde_json::Map<String, Value> {
        json!({ "674": value }).as_object().unwrap().clone()
    }

    #[test]
    fn parses_scalars() {
        let parsed = parse_blob(&blob(json!({"int": 42}))).unwrap();
        assert_eq!(parsed["674"], MetadataValue::Int(42));

        let parsed = parse_blob(&blob(json!({"string": "hello"}))).unwrap();
        assert_eq!(parsed["674"], MetadataValue::String("hello".into()));

        let parsed = parse_blob(&blob(json!({"bytes": "0xdeadbeef"}))).unwrap();
        assert_eq!(parsed["674"], MetadataValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn parses_nested_lists() {
        let parsed = parse_blob(&blob(json!({
            "list": [{"int": 1}, {"list": [{"string": "x"}]}]
        })))
        .unwrap();
        assert_eq!(
            parsed["674"],
            MetadataValue::List(vec![
                MetadataValue::Int(1),
                MetadataValue::List(vec![MetadataValue::String("x".into())]),
            ])
        );
    }

    #[test]
    fn parses_maps_with_coerced_keys() {
        let parsed = parse_blob(&blob(json!({
            "map": [
                {"k": {"string": "name"}, "v": {"string": "sundae"}},
                {"k": {"int": 7}, "v": {"int": 8}},
            ]
        })))
        .unwrap();
        let MetadataValue::Map(map) = &parsed["674"] else {
            panic!("expected map");
        };
        assert_eq!(map["name"], MetadataValue::String("sundae".into()));
        assert_eq!(map["7"], MetadataValue::Int(8));
    }

    #[test]
    fn rejects_unknown_tags() {
        let err = parse_blob(&blob(json!({"float": 1.0}))).unwrap_err();
        assert!(matches!(err, MetadataError::InvalidTag { .. }));
    }

    #[test]
    fn rejects_untagged_values() {
        let err = parse_blob(&blob(json!(42))).unwrap_err();
        assert!(matches!(err, MetadataError::NotTagged { .. }));
    }

    #[test]
    fn rejects_bad_hex_bytes() {
        let err = parse_blob(&blob(json!({"bytes": "zz"}))).unwrap_err();
        assert!(matches!(err, MetadataError::BadHex { .. }));
    }
}
