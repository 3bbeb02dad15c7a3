//! Core data types shared by the harvest engine.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Column names every store row carries, in header order.
pub const LEADING_COLUMNS: [&str; 4] = ["make", "model", "id", "url"];

/// Canonical identity of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: Option<String>,
    pub url: String,
}

/// A harvested listing ready to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub make: String,
    pub model: String,
    pub id: Option<String>,
    pub url: String,
    /// Freeform columns; the set differs between records.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Record {
    /// Create a record with no extra fields.
    pub fn new(make: &str, model: &str, id: Option<String>, url: String) -> Self {
        Self {
            make: make.to_string(),
            model: model.to_string(),
            id: id.filter(|s| !s.trim().is_empty()),
            url,
            extra: BTreeMap::new(),
        }
    }

    /// Attach extra fields. Keys that collide with a leading column are dropped.
    pub fn with_extra(mut self, extra: BTreeMap<String, String>) -> Self {
        for (key, value) in extra {
            if LEADING_COLUMNS.contains(&key.as_str()) {
                continue;
            }
            self.extra.insert(key, value);
        }
        self
    }

    /// Value for a column name, empty when the record has no such field.
    pub fn field(&self, column: &str) -> &str {
        match column {
            "make" => &self.make,
            "model" => &self.model,
            "id" => self.id.as_deref().unwrap_or(""),
            "url" => &self.url,
            other => self.extra.get(other).map(String::as_str).unwrap_or(""),
        }
    }
}

/// One pagination-growth cycle. Epoch 0 is the initial page load.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const INITIAL: Epoch = Epoch(0);

    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }

    pub fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Render a payload value as a store cell: scalars as text, containers as compact JSON.
pub fn normalize_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
        }
    }
}

/// Errors that can occur in the harvest engine.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid selector '{selector}': {reason}")]
    Selector { selector: String, reason: String },
}

/// Convenience result type.
pub type HarvestResult<T> = Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_scalars_and_containers() {
        assert_eq!(normalize_value(&json!("abc")), "abc");
        assert_eq!(normalize_value(&json!(42)), "42");
        assert_eq!(normalize_value(&json!(true)), "true");
        assert_eq!(normalize_value(&Value::Null), "");
        assert_eq!(normalize_value(&json!([1, 2])), "[1,2]");
        assert_eq!(normalize_value(&json!({"a": "b"})), r#"{"a":"b"}"#);
    }

    #[test]
    fn test_record_blank_id_is_absent() {
        let record = Record::new("Porsche", "911", Some("  ".into()), "https://x/1".into());
        assert!(record.id.is_none());
        assert_eq!(record.field("id"), "");
    }

    #[test]
    fn test_with_extra_ignores_leading_columns() {
        let mut extra = BTreeMap::new();
        extra.insert("url".to_string(), "https://evil".to_string());
        extra.insert("vin".to_string(), "WP0".to_string());
        let record = Record::new("Porsche", "911", None, "https://x/1".into()).with_extra(extra);
        assert_eq!(record.url, "https://x/1");
        assert_eq!(record.field("vin"), "WP0");
        assert_eq!(record.field("missing"), "");
    }

    #[test]
    fn test_epoch_ordering() {
        let e = Epoch::INITIAL;
        assert!(e.is_initial());
        assert!(e.next() > e);
        assert_eq!(e.next().to_string(), "1");
    }
}
