//! Record model and the on-disk path scheme.
//!
//! A record is one timestamped map of scalar fields, stored as one JSON file
//! whose path encodes the capture time:
//!
//! ```text
//! <root>/<year>/<month>/<day>/<hour>/<minute>/<second>.json
//! ```
//!
//! Components are plain integers (no zero padding) in UTC. On the read side
//! the path is the only source of truth for a record's timestamp; file
//! modification times are never consulted.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDate, Timelike};
use serde_json::Value;

use crate::error::{Result, StoreError};

/// Name of the timestamp key inside a record file.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// File extension of record files.
pub const RECORD_EXTENSION: &str = "json";

/// Field map of a record.
///
/// Ordered so that serialization is deterministic.
pub type Fields = BTreeMap<String, Value>;

/// One timestamped reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Capture time in seconds since the Unix epoch.
    pub timestamp: i64,
    /// Field values, excluding `timestamp`.
    pub fields: Fields,
}

impl Record {
    /// Creates a record from a timestamp and its fields.
    ///
    /// Any `timestamp` key inside `fields` is discarded in favour of the
    /// explicit timestamp.
    pub fn new(timestamp: i64, mut fields: Fields) -> Self {
        fields.remove(TIMESTAMP_KEY);
        Self { timestamp, fields }
    }

    /// Parses a record from the contents of a record file.
    ///
    /// Returns `None` if the content is not a JSON object, is empty, or has
    /// no usable `timestamp` key.
    pub fn from_json(content: &str) -> Option<Self> {
        let mut fields: Fields = serde_json::from_str(content).ok()?;
        let timestamp = fields.remove(TIMESTAMP_KEY).as_ref().and_then(value_as_i64)?;
        Some(Self { timestamp, fields })
    }

    /// Returns the record as the JSON object written to disk.
    pub fn to_json_map(&self) -> Fields {
        let mut map = self.fields.clone();
        map.insert(TIMESTAMP_KEY.to_string(), Value::from(self.timestamp));
        map
    }

    /// Serializes the record as written to disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialize`] if a value cannot be encoded.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.to_json_map()).map_err(|source| {
            StoreError::Serialize {
                timestamp: self.timestamp,
                source,
            }
            .into()
        })
    }

    /// True if both records carry the same non-timestamp fields with equal values.
    pub fn same_content(&self, other: &Record) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .all(|(key, value)| other.fields.get(key).is_some_and(|o| values_equal(value, o)))
    }
}

/// Numbers compare numerically, everything else by textual form.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => scalar_text(a) == scalar_text(b),
    }
}

/// Textual form of a scalar, with strings unquoted.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Attempts to read a value as a float.
///
/// JSON numbers and strings that parse as `f64` are numeric. Booleans,
/// nulls and containers are not.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Reads an integer timestamp from a JSON number or numeric string.
fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            #[allow(clippy::cast_possible_truncation)] // whole-second floats only
            n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Builds the relative path of a record file for a timestamp.
///
/// # Errors
///
/// Returns [`StoreError::TimestampOutOfRange`] if the timestamp has no
/// calendar representation.
pub fn relative_record_path(timestamp: i64) -> Result<PathBuf> {
    let date = DateTime::from_timestamp(timestamp, 0)
        .ok_or(StoreError::TimestampOutOfRange { timestamp })?;

    let mut path = PathBuf::new();
    path.push(date.year().to_string());
    path.push(date.month().to_string());
    path.push(date.day().to_string());
    path.push(date.hour().to_string());
    path.push(date.minute().to_string());
    path.push(format!("{}.{RECORD_EXTENSION}", date.second()));
    Ok(path)
}

/// Decodes the timestamp of a record file from its path relative to `root`.
///
/// Returns `None` when the relative path is not exactly six levels deep,
/// does not end in `.json`, has a component that is not a plain decimal
/// integer (zero padding and signs are rejected, so every timestamp has
/// exactly one path), or names an impossible date or time.
pub fn timestamp_from_path(root: &Path, path: &Path) -> Option<i64> {
    let relative = path.strip_prefix(root).ok()?;

    let mut parts = Vec::with_capacity(6);
    for component in relative.components() {
        let Component::Normal(part) = component else {
            return None;
        };
        parts.push(part.to_str()?);
    }

    let [year, month, day, hour, minute, file] = parts.as_slice() else {
        return None;
    };
    let second = file.strip_suffix(".json")?;

    let date = NaiveDate::from_ymd_opt(
        path_component(year)?,
        path_component(month)?,
        path_component(day)?,
    )?;
    let time = date.and_hms_opt(
        path_component(hour)?,
        path_component(minute)?,
        path_component(second)?,
    )?;
    Some(time.and_utc().timestamp())
}

/// Parses one path component, accepting only the form the writer produces.
fn path_component<T>(part: &str) -> Option<T>
where
    T: std::str::FromStr + ToString,
{
    let value: T = part.parse().ok()?;
    (value.to_string() == part).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_roundtrip() {
        let root = Path::new("/data/weather");
        // 2024-03-05 07:08:09 UTC
        let ts = 1_709_622_489;
        let rel = relative_record_path(ts).unwrap();
        assert_eq!(rel, PathBuf::from("2024/3/5/7/8/9.json"));
        assert_eq!(timestamp_from_path(root, &root.join(&rel)), Some(ts));
    }

    #[test]
    fn test_malformed_paths_rejected() {
        let root = Path::new("/r");
        assert_eq!(timestamp_from_path(root, Path::new("/r/2024/3/5/7/8.json")), None);
        assert_eq!(timestamp_from_path(root, Path::new("/r/2024/3/5/7/8/x.json")), None);
        assert_eq!(timestamp_from_path(root, Path::new("/r/2024/3/5/7/8/9.txt")), None);
        assert_eq!(timestamp_from_path(root, Path::new("/r/2024/13/5/7/8/9.json")), None);
        assert_eq!(timestamp_from_path(root, Path::new("/r/a/2024/3/5/7/8/9.json")), None);
        assert_eq!(timestamp_from_path(root, Path::new("/elsewhere/2024/3/5/7/8/9.json")), None);
    }

    #[test]
    fn test_non_canonical_components_rejected() {
        let root = Path::new("/r");
        assert_eq!(timestamp_from_path(root, Path::new("/r/2024/03/5/7/8/9.json")), None);
        assert_eq!(timestamp_from_path(root, Path::new("/r/2024/3/5/7/8/09.json")), None);
        assert_eq!(timestamp_from_path(root, Path::new("/r/2024/3/5/7/8/+9.json")), None);
        assert_eq!(timestamp_from_path(root, Path::new("/r/+2024/3/5/7/8/9.json")), None);
        assert_eq!(timestamp_from_path(root, Path::new("/r/2024/3/5/7/8/0.json")), Some(1_709_622_480));
    }

    #[test]
    fn test_from_json_accepts_string_and_integer_timestamps() {
        let a = Record::from_json(r#"{"timestamp":"100","temp":1.5}"#).unwrap();
        let b = Record::from_json(r#"{"timestamp":100,"temp":1.5}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.timestamp, 100);
        assert!(!a.fields.contains_key(TIMESTAMP_KEY));
    }

    #[test]
    fn test_from_json_rejects_corrupt() {
        assert!(Record::from_json("").is_none());
        assert!(Record::from_json("{not json").is_none());
        assert!(Record::from_json(r#"{"temp":1}"#).is_none());
        assert!(Record::from_json(r#"{"timestamp":"soon"}"#).is_none());
        assert!(Record::from_json("[1,2]").is_none());
    }

    #[test]
    fn test_same_content_ignores_timestamp() {
        let mut fields = Fields::new();
        fields.insert("temp".into(), json!(10));
        fields.insert("sky".into(), json!("clear"));
        let a = Record::new(100, fields.clone());
        let b = Record::new(105, fields.clone());
        assert!(a.same_content(&b));

        fields.insert("temp".into(), json!(11));
        let c = Record::new(110, fields);
        assert!(!a.same_content(&c));
    }

    #[test]
    fn test_same_content_across_number_forms() {
        let mut x = Fields::new();
        x.insert("v".into(), json!(10));
        let mut y = Fields::new();
        y.insert("v".into(), json!(10.0));
        assert!(Record::new(1, x).same_content(&Record::new(2, y)));
    }

    #[test]
    fn test_value_coercion() {
        assert_eq!(value_as_f64(&json!(2.5)), Some(2.5));
        assert_eq!(value_as_f64(&json!("3.25")), Some(3.25));
        assert_eq!(value_as_f64(&json!("cloudy")), None);
        assert_eq!(value_as_f64(&json!(true)), None);
    }

    #[test]
    fn test_to_json_is_deterministic() {
        let mut fields = Fields::new();
        fields.insert("b".into(), json!(2));
        fields.insert("a".into(), json!(1));
        let record = Record::new(42, fields);
        assert_eq!(record.to_json().unwrap(), r#"{"a":1,"b":2,"timestamp":42}"#);
    }
}
