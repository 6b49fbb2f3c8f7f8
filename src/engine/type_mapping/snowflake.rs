use super::lookup_name;

/// Covers both SQL type names and the lower-case names the Snowflake
/// result metadata reports (`fixed`, `real`, `text`).
const SNOWFLAKE_TYPES: &[(&str, &str)] = &[
    ("NUMBER", "decimal"),
    ("DECIMAL", "decimal"),
    ("NUMERIC", "decimal"),
    ("FIXED", "decimal"),
    ("INT", "integer"),
    ("INTEGER", "integer"),
    ("BIGINT", "bigint"),
    ("SMALLINT", "smallint"),
    ("TINYINT", "smallint"),
    ("BYTEINT", "smallint"),
    ("FLOAT", "float"),
    ("FLOAT4", "float"),
    ("FLOAT8", "double"),
    ("DOUBLE", "double"),
    ("DOUBLE PRECISION", "double"),
    ("REAL", "double"),
    ("VARCHAR", "varchar"),
    ("CHAR", "char"),
    ("CHARACTER", "char"),
    ("STRING", "text"),
    ("TEXT", "text"),
    ("BINARY", "bytea"),
    ("VARBINARY", "bytea"),
    ("BOOLEAN", "boolean"),
    ("DATE", "date"),
    ("DATETIME", "timestamp"),
    ("TIME", "time"),
    ("TIMESTAMP", "timestamp"),
    ("TIMESTAMP_NTZ", "timestamp"),
    ("TIMESTAMP_LTZ", "timestamptz"),
    ("TIMESTAMP_TZ", "timestamptz"),
    ("VARIANT", "json"),
    ("OBJECT", "json"),
    ("ARRAY", "array"),
    ("GEOGRAPHY", "geography"),
    ("GEOMETRY", "geometry"),
];

pub fn map_type(name: &str) -> &'static str {
    lookup_name(SNOWFLAKE_TYPES, name)
}
