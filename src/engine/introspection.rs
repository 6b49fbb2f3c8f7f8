//! Schema discovery
//!
//! Catalog queries per engine, run through the owning adapter so they share
//! its connection, timeout and error handling.

use serde::Serialize;
use tracing::instrument;

use crate::engine::error::EngineResult;
use crate::engine::traits::DatabaseAdapter;
use crate::engine::types::{DataSourceType, Record, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaInfo {
    pub database: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub database: Option<String>,
    pub schema: String,
    pub name: String,
    /// `BASE TABLE`, `VIEW`, ...
    pub table_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub database: Option<String>,
    pub schema: String,
    pub table: String,
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub position: i64,
}

const SYSTEM_SCHEMAS: &[&str] = &[
    "information_schema",
    "pg_catalog",
    "pg_toast",
    "pg_internal",
    "mysql",
    "performance_schema",
    "sys",
];

#[derive(Debug, Clone)]
pub struct Introspector {
    data_source_type: DataSourceType,
    /// Qualifier placed before `INFORMATION_SCHEMA`, e.g. BigQuery's
    /// `region-us`
    catalog_prefix: Option<String>,
}

impl Introspector {
    pub fn new(data_source_type: DataSourceType) -> Self {
        Self {
            data_source_type,
            catalog_prefix: None,
        }
    }

    pub fn with_catalog_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.catalog_prefix = Some(prefix.into());
        self
    }

    pub fn data_source_type(&self) -> DataSourceType {
        self.data_source_type
    }

    fn catalog(&self, view: &str) -> String {
        match &self.catalog_prefix {
            Some(prefix) => format!(
                "{}.INFORMATION_SCHEMA.{view}",
                self.data_source_type.quote_ident(prefix)
            ),
            None => format!("INFORMATION_SCHEMA.{view}"),
        }
    }

    fn system_filter(&self, column: &str) -> String {
        let excluded = SYSTEM_SCHEMAS
            .iter()
            .map(|schema| format!("'{schema}'"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("LOWER({column}) NOT IN ({excluded})")
    }

    pub(crate) fn schemas_query(&self) -> String {
        format!(
            "SELECT catalog_name AS database_name, schema_name AS name FROM {} WHERE {} ORDER BY schema_name",
            self.catalog("SCHEMATA"),
            self.system_filter("schema_name")
        )
    }

    pub(crate) fn tables_query(&self, schema: Option<&str>) -> (String, Vec<Value>) {
        let mut sql = format!(
            "SELECT table_catalog AS database_name, table_schema AS schema_name, table_name AS name, table_type FROM {} WHERE {}",
            self.catalog("TABLES"),
            self.system_filter("table_schema")
        );
        let mut params = Vec::new();
        if let Some(schema) = schema {
            sql.push_str(&format!(" AND table_schema = {}", self.data_source_type.bind_marker(0)));
            params.push(Value::from(schema));
        }
        sql.push_str(" ORDER BY table_schema, table_name");
        (sql, params)
    }

    pub(crate) fn columns_query(&self, schema: Option<&str>, table: Option<&str>) -> (String, Vec<Value>) {
        let mut sql = format!(
            "SELECT table_catalog AS database_name, table_schema AS schema_name, table_name, column_name AS name, data_type, is_nullable, ordinal_position FROM {} WHERE {}",
            self.catalog("COLUMNS"),
            self.system_filter("table_schema")
        );
        let mut params = Vec::new();
        for (column, value) in [("table_schema", schema), ("table_name", table)] {
            if let Some(value) = value {
                let marker = self.data_source_type.bind_marker(params.len());
                sql.push_str(&format!(" AND {column} = {marker}"));
                params.push(Value::from(value));
            }
        }
        sql.push_str(" ORDER BY table_schema, table_name, ordinal_position");
        (sql, params)
    }

    #[instrument(skip(self, adapter), fields(data_source = %self.data_source_type))]
    pub async fn get_schemas(&self, adapter: &dyn DatabaseAdapter) -> EngineResult<Vec<SchemaInfo>> {
        let result = adapter.query(&self.schemas_query(), &[], None, None).await?;
        Ok(result
            .rows
            .iter()
            .map(|row| SchemaInfo {
                database: optional_text(row, "database_name"),
                name: text(row, "name"),
            })
            .collect())
    }

    #[instrument(skip(self, adapter), fields(data_source = %self.data_source_type))]
    pub async fn get_tables(
        &self,
        adapter: &dyn DatabaseAdapter,
        schema: Option<&str>,
    ) -> EngineResult<Vec<TableInfo>> {
        let (sql, params) = self.tables_query(schema);
        let result = adapter.query(&sql, &params, None, None).await?;
        Ok(result
            .rows
            .iter()
            .map(|row| TableInfo {
                database: optional_text(row, "database_name"),
                schema: text(row, "schema_name"),
                name: text(row, "name"),
                table_type: text(row, "table_type"),
            })
            .collect())
    }

    #[instrument(skip(self, adapter), fields(data_source = %self.data_source_type))]
    pub async fn get_columns(
        &self,
        adapter: &dyn DatabaseAdapter,
        schema: Option<&str>,
        table: Option<&str>,
    ) -> EngineResult<Vec<ColumnInfo>> {
        let (sql, params) = self.columns_query(schema, table);
        let result = adapter.query(&sql, &params, None, None).await?;
        Ok(result
            .rows
            .iter()
            .map(|row| ColumnInfo {
                database: optional_text(row, "database_name"),
                schema: text(row, "schema_name"),
                table: text(row, "table_name"),
                name: text(row, "name"),
                data_type: text(row, "data_type"),
                nullable: is_yes(field(row, "is_nullable")),
                position: match field(row, "ordinal_position") {
                    Some(Value::Int(n)) => *n,
                    Some(Value::Float(f)) => *f as i64,
                    _ => 0,
                },
            })
            .collect())
    }
}

/// Case-insensitive column lookup; Snowflake upper-cases unquoted aliases.
fn field<'a>(row: &'a Record, name: &str) -> Option<&'a Value> {
    row.iter()
        .find(|(column, _)| column.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn optional_text(row: &Record, name: &str) -> Option<String> {
    match field(row, name)? {
        Value::Null => None,
        Value::Text(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(serde_json::to_string(other).unwrap_or_default()),
    }
}

fn text(row: &Record, name: &str) -> String {
    optional_text(row, name).unwrap_or_default()
}

fn is_yes(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Text(s)) => s.eq_ignore_ascii_case("yes"),
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}
