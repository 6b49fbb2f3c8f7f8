use super::lookup_name;

const BIGQUERY_TYPES: &[(&str, &str)] = &[
    ("INT64", "bigint"),
    ("INTEGER", "bigint"),
    ("FLOAT64", "double"),
    ("FLOAT", "double"),
    ("NUMERIC", "decimal"),
    ("BIGNUMERIC", "decimal"),
    ("BOOL", "boolean"),
    ("BOOLEAN", "boolean"),
    ("STRING", "text"),
    ("BYTES", "bytea"),
    ("DATE", "date"),
    ("DATETIME", "timestamp"),
    ("TIME", "time"),
    ("TIMESTAMP", "timestamptz"),
    ("INTERVAL", "interval"),
    ("JSON", "json"),
    ("RECORD", "json"),
    ("STRUCT", "json"),
    ("ARRAY", "array"),
    ("GEOGRAPHY", "geography"),
];

pub fn map_type(name: &str) -> &'static str {
    lookup_name(BIGQUERY_TYPES, name)
}
