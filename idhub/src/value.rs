//! Column values and generic resource rows

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Integer,
    Text,
    Timestamp,
    Boolean,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "integer"),
            Self::Text => write!(f, "text"),
            Self::Timestamp => write!(f, "timestamp"),
            Self::Boolean => write!(f, "boolean"),
        }
    }
}

/// A single column value
///
/// Deserialization never produces `Timestamp`; timestamps arrive as text and
/// are coerced against the column type when a filter is compiled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Absent-or-blank check used when filter mappings are cleaned.
    /// `0` and `false` are real values and are kept.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Textual form used for pattern matching
    pub fn render(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Text(s) => s.clone(),
            Self::Timestamp(ts) => ts.to_rfc3339(),
        }
    }

    /// Convert to the representation a column of `ty` stores.
    ///
    /// Returns `None` when the value has no sensible reading as that type.
    pub fn coerce(&self, ty: ColumnType) -> Option<Value> {
        match (self, ty) {
            (Self::Null, _) => Some(Self::Null),

            (Self::Int(_), ColumnType::Integer) => Some(self.clone()),
            (Self::Text(s), ColumnType::Integer) => s.trim().parse().ok().map(Self::Int),
            (Self::Bool(b), ColumnType::Integer) => Some(Self::Int(i64::from(*b))),

            (Self::Text(_), ColumnType::Text) => Some(self.clone()),
            (Self::Int(v), ColumnType::Text) => Some(Self::Text(v.to_string())),
            (Self::Bool(b), ColumnType::Text) => Some(Self::Text(b.to_string())),
            (Self::Timestamp(ts), ColumnType::Text) => Some(Self::Text(ts.to_rfc3339())),

            (Self::Timestamp(_), ColumnType::Timestamp) => Some(self.clone()),
            (Self::Text(s), ColumnType::Timestamp) => parse_timestamp(s).map(Self::Timestamp),
            (Self::Int(secs), ColumnType::Timestamp) => {
                Utc.timestamp_opt(*secs, 0).single().map(Self::Timestamp)
            }

            (Self::Bool(_), ColumnType::Boolean) => Some(self.clone()),
            (Self::Int(0), ColumnType::Boolean) => Some(Self::Bool(false)),
            (Self::Int(1), ColumnType::Boolean) => Some(Self::Bool(true)),
            (Self::Text(s), ColumnType::Boolean) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Some(Self::Bool(true)),
                "false" | "0" => Some(Self::Bool(false)),
                _ => None,
            },

            _ => None,
        }
    }

    /// Ordering between values of the same type; `Null` sorts after
    /// everything, mirroring the relational default for ascending order.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _) => Ordering::Greater,
            (_, Self::Null) => Ordering::Less,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (a, b) => a.render().cmp(&b.render()),
        }
    }

    /// Comparison used by relational predicates; `None` when either side is
    /// `Null` or the types differ.
    pub fn partial_cmp_strict(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            other => write!(f, "{}", other.render()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Timestamp(ts)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = Error;

    fn try_from(json: serde_json::Value) -> Result<Self> {
        use serde_json::Value as J;
        match json {
            J::Null => Ok(Self::Null),
            J::Bool(b) => Ok(Self::Bool(b)),
            J::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .ok_or_else(|| Error::InvalidInput(format!("unsupported number {}", n))),
            J::String(s) => Ok(Self::Text(s)),
            other => Err(Error::InvalidInput(format!(
                "expected a scalar value, got {}",
                other
            ))),
        }
    }
}

/// A generic resource row
///
/// Columns live in `fields`; rows attached through eager loading live in
/// `related`, keyed by relation name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(flatten)]
    fields: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    related: BTreeMap<String, Record>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.fields.remove(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.fields.contains_key(column)
    }

    pub fn id(&self) -> Option<i64> {
        self.get("id").and_then(Value::as_i64)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    pub fn get_timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        self.get(column).and_then(Value::as_timestamp)
    }

    /// Overwrite this row's columns with every column of `changes`
    pub fn merge(&mut self, changes: Record) {
        self.fields.extend(changes.fields);
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn attach(&mut self, relation: impl Into<String>, row: Record) {
        self.related.insert(relation.into(), row);
    }

    pub fn related(&self, relation: &str) -> Option<&Record> {
        self.related.get(relation)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
            related: BTreeMap::new(),
        }
    }
}

impl TryFrom<serde_json::Map<String, serde_json::Value>> for Record {
    type Error = Error;

    fn try_from(map: serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        map.into_iter()
            .map(|(k, v)| Value::try_from(v).map(|v| (k, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_keeps_zero_and_false() {
        assert!(Value::Null.is_blank());
        assert!(Value::from("").is_blank());
        assert!(!Value::from(0).is_blank());
        assert!(!Value::from(false).is_blank());
        assert!(!Value::from("x").is_blank());
    }

    #[test]
    fn test_coerce() {
        assert_eq!(Value::from("42").coerce(ColumnType::Integer), Some(Value::Int(42)));
        assert_eq!(Value::from("abc").coerce(ColumnType::Integer), None);
        assert_eq!(Value::from(7).coerce(ColumnType::Text), Some(Value::from("7")));

        let ts = Value::from("2024-03-01T12:00:00Z")
            .coerce(ColumnType::Timestamp)
            .and_then(|v| v.as_timestamp());
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single());

        let ts = Value::from("2024-03-01 12:00:00")
            .coerce(ColumnType::Timestamp)
            .and_then(|v| v.as_timestamp());
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single());
    }

    #[test]
    fn test_sort_cmp_nulls_last() {
        assert_eq!(Value::Null.sort_cmp(&Value::Int(1)), Ordering::Greater);
        assert_eq!(Value::Int(1).sort_cmp(&Value::Int(2)), Ordering::Less);
        assert_eq!(Value::Int(1).partial_cmp_strict(&Value::Null), None);
    }

    #[test]
    fn test_record_merge() {
        let mut row = Record::new()
            .with("id", 1)
            .with("phone", "555")
            .with("email", "a@example.com");
        row.merge(Record::new().with("phone", "777"));

        assert_eq!(row.get_str("phone"), Some("777"));
        assert_eq!(row.get_str("email"), Some("a@example.com"));
        assert_eq!(row.id(), Some(1));
    }

    #[test]
    fn test_record_from_json() {
        let json = serde_json::json!({"username": "alice01", "privilege": 9, "phone": null});
        let serde_json::Value::Object(map) = json else {
            unreachable!()
        };
        let row = Record::try_from(map).unwrap();
        assert_eq!(row.get_str("username"), Some("alice01"));
        assert_eq!(row.get_i64("privilege"), Some(9));
        assert_eq!(row.get("phone"), Some(&Value::Null));
    }

    #[test]
    fn test_record_serializes_related() {
        let mut row = Record::new().with("id", 3).with("role_id", 1);
        row.attach("role", Record::new().with("id", 1).with("name", "admin"));
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["role_id"], 1);
        assert_eq!(json["related"]["role"]["name"], "admin");
    }
}
