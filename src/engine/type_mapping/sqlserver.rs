use super::lookup_name;

const SQLSERVER_TYPES: &[(&str, &str)] = &[
    ("bit", "boolean"),
    ("tinyint", "smallint"),
    ("smallint", "smallint"),
    ("int", "integer"),
    ("bigint", "bigint"),
    ("decimal", "decimal"),
    ("numeric", "decimal"),
    ("money", "money"),
    ("smallmoney", "money"),
    ("float", "double"),
    ("real", "float"),
    ("date", "date"),
    ("time", "time"),
    ("datetime", "timestamp"),
    ("datetime2", "timestamp"),
    ("smalldatetime", "timestamp"),
    ("datetimeoffset", "timestamptz"),
    ("char", "char"),
    ("nchar", "char"),
    ("varchar", "varchar"),
    ("nvarchar", "varchar"),
    ("text", "text"),
    ("ntext", "text"),
    ("binary", "bytea"),
    ("varbinary", "bytea"),
    ("image", "bytea"),
    ("uniqueidentifier", "uuid"),
    ("xml", "xml"),
    ("sql_variant", "text"),
];

pub fn map_type(name: &str) -> &'static str {
    lookup_name(SQLSERVER_TYPES, name)
}
