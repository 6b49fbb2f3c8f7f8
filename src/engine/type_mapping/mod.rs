//! Engine type codes to normalized type names
//!
//! Each engine family owns one static table. Unknown codes map to `"text"`.

pub mod bigquery;
pub mod mysql;
pub mod postgres;
pub mod snowflake;
pub mod sqlserver;

use super::client::TypeCode;
use super::types::{DataSourceType, SimpleType};

pub const FALLBACK_TYPE: &str = "text";

/// Maps a raw column type code for `engine` to a normalized type name.
pub fn map_type(engine: DataSourceType, code: &TypeCode) -> &'static str {
    match engine {
        DataSourceType::Postgres | DataSourceType::Redshift => postgres::map_type(code),
        DataSourceType::MySql => by_name(code, mysql::map_type),
        DataSourceType::SqlServer => by_name(code, sqlserver::map_type),
        DataSourceType::Snowflake => by_name(code, snowflake::map_type),
        DataSourceType::BigQuery => by_name(code, bigquery::map_type),
    }
}

fn by_name(code: &TypeCode, lookup: fn(&str) -> &'static str) -> &'static str {
    match code {
        TypeCode::Name(name) => lookup(name),
        TypeCode::Oid(_) => FALLBACK_TYPE,
    }
}

/// Date keywords are checked first so "interval" is not read as "int".
pub fn simple_category(normalized: &str) -> SimpleType {
    const DATE_KEYWORDS: [&str; 3] = ["date", "time", "interval"];
    const NUMBER_KEYWORDS: [&str; 8] = [
        "int", "float", "decimal", "numeric", "double", "real", "number", "money",
    ];

    let name = normalized.to_ascii_lowercase();
    if DATE_KEYWORDS.iter().any(|keyword| name.contains(keyword)) {
        SimpleType::Date
    } else if NUMBER_KEYWORDS.iter().any(|keyword| name.contains(keyword)) {
        SimpleType::Number
    } else {
        SimpleType::Text
    }
}

/// Case-insensitive lookup in a name table, ignoring any `(n, m)` suffix.
pub(crate) fn lookup_name(table: &[(&str, &'static str)], raw: &str) -> &'static str {
    let base = raw.split('(').next().unwrap_or(raw).trim();
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(base))
        .map(|(_, normalized)| *normalized)
        .unwrap_or(FALLBACK_TYPE)
}
