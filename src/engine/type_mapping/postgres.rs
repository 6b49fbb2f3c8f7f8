//! PostgreSQL type OIDs, shared with Redshift.

use super::FALLBACK_TYPE;
use crate::engine::client::TypeCode;

/// (oid, pg type name, normalized name)
const PG_TYPES: &[(u32, &str, &str)] = &[
    (16, "bool", "boolean"),
    (17, "bytea", "bytea"),
    (18, "char", "char"),
    (19, "name", "text"),
    (20, "int8", "bigint"),
    (21, "int2", "smallint"),
    (23, "int4", "integer"),
    (25, "text", "text"),
    (26, "oid", "integer"),
    (114, "json", "json"),
    (142, "xml", "xml"),
    (600, "point", "text"),
    (700, "float4", "float"),
    (701, "float8", "double"),
    (790, "money", "money"),
    (1000, "_bool", "array"),
    (1005, "_int2", "array"),
    (1007, "_int4", "array"),
    (1009, "_text", "array"),
    (1015, "_varchar", "array"),
    (1016, "_int8", "array"),
    (1021, "_float4", "array"),
    (1022, "_float8", "array"),
    (1042, "bpchar", "char"),
    (1043, "varchar", "varchar"),
    (1082, "date", "date"),
    (1083, "time", "time"),
    (1114, "timestamp", "timestamp"),
    (1184, "timestamptz", "timestamptz"),
    (1186, "interval", "interval"),
    (1266, "timetz", "time"),
    (1700, "numeric", "decimal"),
    (2950, "uuid", "uuid"),
    (3802, "jsonb", "jsonb"),
    // Redshift
    (3999, "geometry", "geometry"),
    (4000, "super", "json"),
];

pub fn map_type(code: &TypeCode) -> &'static str {
    match code {
        TypeCode::Oid(oid) => PG_TYPES
            .iter()
            .find(|(known, _, _)| known == oid)
            .map(|(_, _, normalized)| *normalized)
            .unwrap_or(FALLBACK_TYPE),
        TypeCode::Name(name) => PG_TYPES
            .iter()
            .find(|(_, pg_name, _)| pg_name.eq_ignore_ascii_case(name))
            .map(|(_, _, normalized)| *normalized)
            .unwrap_or(FALLBACK_TYPE),
    }
}
