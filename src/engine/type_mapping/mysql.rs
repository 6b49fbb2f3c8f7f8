use super::lookup_name;

const MYSQL_TYPES: &[(&str, &str)] = &[
    ("TINYINT", "smallint"),
    ("TINYINT UNSIGNED", "smallint"),
    ("SMALLINT", "smallint"),
    ("SMALLINT UNSIGNED", "integer"),
    ("MEDIUMINT", "integer"),
    ("MEDIUMINT UNSIGNED", "integer"),
    ("INT", "integer"),
    ("INT UNSIGNED", "bigint"),
    ("INTEGER", "integer"),
    ("BIGINT", "bigint"),
    ("BIGINT UNSIGNED", "bigint"),
    ("DECIMAL", "decimal"),
    ("NUMERIC", "decimal"),
    ("FLOAT", "float"),
    ("DOUBLE", "double"),
    ("BIT", "boolean"),
    ("BOOLEAN", "boolean"),
    ("DATE", "date"),
    ("DATETIME", "timestamp"),
    ("TIMESTAMP", "timestamptz"),
    ("TIME", "time"),
    ("YEAR", "integer"),
    ("CHAR", "char"),
    ("VARCHAR", "varchar"),
    ("TINYTEXT", "text"),
    ("TEXT", "text"),
    ("MEDIUMTEXT", "text"),
    ("LONGTEXT", "text"),
    ("BINARY", "bytea"),
    ("VARBINARY", "bytea"),
    ("TINYBLOB", "bytea"),
    ("BLOB", "bytea"),
    ("MEDIUMBLOB", "bytea"),
    ("LONGBLOB", "bytea"),
    ("ENUM", "varchar"),
    ("SET", "varchar"),
    ("JSON", "json"),
    ("GEOMETRY", "geometry"),
];

pub fn map_type(name: &str) -> &'static str {
    lookup_name(MYSQL_TYPES, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_mysql_names() {
        assert_eq!(map_type("INT"), "integer");
        assert_eq!(map_type("BIGINT UNSIGNED"), "bigint");
        assert_eq!(map_type("DATETIME"), "timestamp");
        assert_eq!(map_type("varchar"), "varchar");
        assert_eq!(map_type("NULL"), "text");
    }
}
