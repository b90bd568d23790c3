//! Decoded Postgres values and their JSON/string renderings.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::Value;
use uuid::Uuid;

/// A decoded column value.
///
/// The variants mirror what the builtin decoder set can produce; user
/// defined types land in `Text` (enums), `Array` or `Composite`.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    /// Explicit SQL NULL inside arrays and composites. Top-level nulls are
    /// represented by the absence of a value on the column.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision numeric kept as its decimal text form.
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Timestamptz(DateTime<Utc>),
    Json(Value),
    Array(Vec<PgValue>),
    Composite(Vec<(String, PgValue)>),
}

impl PgValue {
    /// JSON rendering used in document bodies.
    ///
    /// Numerics keep precision where JSON can represent it and fall back to
    /// a string otherwise; binary data is hex encoded; temporal values use
    /// the formats the search engine's default date mappings accept.
    pub fn to_json(&self) -> Value {
        match self {
            PgValue::Null => Value::Null,
            PgValue::Bool(b) => Value::Bool(*b),
            PgValue::Int(n) => Value::Number((*n).into()),
            PgValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.to_string())),
            PgValue::Numeric(s) => {
                if let Ok(n) = s.parse::<i64>() {
                    Value::Number(n.into())
                } else if let Ok(f) = s.parse::<f64>() {
                    serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .unwrap_or_else(|| Value::String(s.clone()))
                } else {
                    Value::String(s.clone())
                }
            }
            PgValue::Text(s) => Value::String(s.clone()),
            PgValue::Bytes(b) => Value::String(hex::encode(b)),
            PgValue::Uuid(u) => Value::String(u.to_string()),
            PgValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            PgValue::Time(t) => Value::String(t.format("%H:%M:%S%.6f").to_string()),
            PgValue::Timestamp(ts) => {
                Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string())
            }
            PgValue::Timestamptz(ts) => {
                Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            PgValue::Json(v) => v.clone(),
            PgValue::Array(items) => Value::Array(items.iter().map(PgValue::to_json).collect()),
            PgValue::Composite(fields) => {
                let mut map = serde_json::Map::new();
                for (name, value) in fields {
                    map.insert(name.clone(), value.to_json());
                }
                Value::Object(map)
            }
        }
    }

    /// Plain-text rendering used for document ids and routing keys.
    pub fn stringify(&self) -> String {
        match self {
            PgValue::Null => String::new(),
            PgValue::Bool(b) => b.to_string(),
            PgValue::Int(n) => n.to_string(),
            PgValue::Float(f) => f.to_string(),
            PgValue::Numeric(s) | PgValue::Text(s) => s.clone(),
            PgValue::Bytes(b) => hex::encode(b),
            PgValue::Uuid(u) => u.to_string(),
            PgValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            PgValue::Time(t) => t.format("%H:%M:%S%.6f").to_string(),
            PgValue::Timestamp(ts) => ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            PgValue::Timestamptz(ts) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
            PgValue::Json(v) => v.to_string(),
            PgValue::Array(_) | PgValue::Composite(_) => self.to_json().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_json_ladder() {
        assert_eq!(PgValue::Numeric("42".into()).to_json(), json!(42));
        assert_eq!(PgValue::Numeric("1.25".into()).to_json(), json!(1.25));
        // precision beyond f64 and non-finite values stay strings
        assert_eq!(PgValue::Numeric("NaN".into()).to_json(), json!("NaN"));
    }

    #[test]
    fn test_temporal_json_formats() {
        let d = PgValue::Date(NaiveDate::from_ymd_opt(2024, 3, 7).unwrap());
        assert_eq!(d.to_json(), json!("2024-03-07"));

        let ts = PgValue::Timestamp(
            NaiveDate::from_ymd_opt(2024, 3, 7)
                .unwrap()
                .and_hms_micro_opt(1, 2, 3, 456_789)
                .unwrap(),
        );
        assert_eq!(ts.to_json(), json!("2024-03-07T01:02:03.456789"));
    }

    #[test]
    fn test_stringify() {
        assert_eq!(PgValue::Int(42).stringify(), "42");
        assert_eq!(PgValue::Text("abc".into()).stringify(), "abc");
        assert_eq!(PgValue::Bool(true).stringify(), "true");
        assert_eq!(PgValue::Null.stringify(), "");
        let u = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(
            PgValue::Uuid(u).stringify(),
            "67e55044-10b1-426f-9247-bb680e5fe0c8"
        );
    }

    #[test]
    fn test_composite_json() {
        let v = PgValue::Composite(vec![
            ("x".into(), PgValue::Int(1)),
            ("y".into(), PgValue::Null),
        ]);
        assert_eq!(v.to_json(), json!({"x": 1, "y": null}));
    }
}
