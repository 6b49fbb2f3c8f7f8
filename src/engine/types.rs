//! Universal data types for the data-source adapters
//!
//! These types provide a normalized representation of query results across
//! PostgreSQL, MySQL, SQL Server, Snowflake, BigQuery and Redshift.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// Identifies which engine a set of credentials or an adapter targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceType {
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "sqlserver")]
    SqlServer,
    Snowflake,
    #[serde(rename = "bigquery")]
    BigQuery,
    Redshift,
}

impl DataSourceType {
    pub const ALL: [DataSourceType; 6] = [
        DataSourceType::Postgres,
        DataSourceType::MySql,
        DataSourceType::SqlServer,
        DataSourceType::Snowflake,
        DataSourceType::BigQuery,
        DataSourceType::Redshift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceType::Postgres => "postgres",
            DataSourceType::MySql => "mysql",
            DataSourceType::SqlServer => "sqlserver",
            DataSourceType::Snowflake => "snowflake",
            DataSourceType::BigQuery => "bigquery",
            DataSourceType::Redshift => "redshift",
        }
    }

    /// Human-readable engine name
    pub fn display_name(&self) -> &'static str {
        match self {
            DataSourceType::Postgres => "PostgreSQL",
            DataSourceType::MySql => "MySQL",
            DataSourceType::SqlServer => "SQL Server",
            DataSourceType::Snowflake => "Snowflake",
            DataSourceType::BigQuery => "BigQuery",
            DataSourceType::Redshift => "Redshift",
        }
    }

    /// Positional bind marker for the 0-based parameter `index`, as this
    /// engine's client expects it.
    pub fn bind_marker(&self, index: usize) -> String {
        match self {
            DataSourceType::Postgres | DataSourceType::Redshift => format!("${}", index + 1),
            _ => "?".to_string(),
        }
    }

    /// Quotes an identifier in this engine's dialect.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            DataSourceType::MySql | DataSourceType::BigQuery => {
                format!("`{}`", ident.replace('`', "``"))
            }
            DataSourceType::SqlServer => format!("[{}]", ident.replace(']', "]]")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }
}

impl fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query cancellation support level for an engine client.
///
/// `None` means a timed-out query keeps running remotely after the caller
/// stops waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSupport {
    None,
    BestEffort,
    Driver,
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(DateTime<Utc>),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use base64::{Engine, engine::general_purpose::STANDARD};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A single result row keyed by column name, in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    entries: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Sets a column value, replacing an existing column of the same name in place.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

impl Serialize for Record {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Coarse type bucket used by charting and formatting layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimpleType {
    Number,
    Text,
    Date,
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub name: String,
    /// Normalized type name (engine-agnostic)
    #[serde(rename = "type")]
    pub field_type: String,
    pub nullable: bool,
    pub length: u32,
    pub precision: u32,
    pub scale: u32,
}

/// Query execution result
#[derive(Debug, Clone, Serialize)]
pub struct AdapterQueryResult {
    /// Result rows, normalized
    pub rows: Vec<Record>,
    /// Number of rows returned
    pub row_count: usize,
    /// Column information, in result order
    pub fields: Vec<FieldMetadata>,
    /// True when the real result had more rows than the requested cap
    pub has_more_rows: bool,
}

impl AdapterQueryResult {
    pub fn empty() -> Self {
        Self {
            rows: Vec::new(),
            row_count: 0,
            fields: Vec::new(),
            has_more_rows: false,
        }
    }
}

/// Result of INSERT/UPDATE/DELETE statements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub row_count: u64,
}

/// A query-log row written by `insert_log_record`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogRecord {
    pub message_id: String,
    pub user_email: String,
    pub user_name: String,
    pub chat_id: String,
    pub chat_link: String,
    pub request_message: String,
    pub created_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub confidence_score: String,
    pub assumptions: Vec<serde_json::Value>,
}

impl LogRecord {
    pub const COLUMNS: [&'static str; 10] = [
        "message_id",
        "user_email",
        "user_name",
        "chat_id",
        "chat_link",
        "request_message",
        "created_at",
        "duration_seconds",
        "confidence_score",
        "assumptions",
    ];

    /// Values in `COLUMNS` order
    pub fn values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.message_id.clone()),
            Value::Text(self.user_email.clone()),
            Value::Text(self.user_name.clone()),
            Value::Text(self.chat_id.clone()),
            Value::Text(self.chat_link.clone()),
            Value::Text(self.request_message.clone()),
            Value::Date(self.created_at),
            Value::Int(self.duration_seconds),
            Value::Text(self.confidence_score.clone()),
            Value::Text(serde_json::Value::Array(self.assumptions.clone()).to_string()),
        ]
    }
}
