//! Connection credentials
//!
//! One tagged variant per engine. The `type` field picks the variant and
//! therefore the set of required fields.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::{DataSourceError, EngineResult};
use super::types::DataSourceType;

pub const POSTGRES_DEFAULT_PORT: u16 = 5432;
pub const REDSHIFT_DEFAULT_PORT: u16 = 5439;
pub const MYSQL_DEFAULT_PORT: u16 = 3306;
pub const SQLSERVER_DEFAULT_PORT: u16 = 1433;
pub const REDSHIFT_CONNECTION_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 30_000;
pub const BIGQUERY_DEFAULT_LOCATION: &str = "US";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "postgres")]
    Postgres(PostgresCredentials),
    #[serde(rename = "mysql")]
    MySql(MySqlCredentials),
    #[serde(rename = "sqlserver")]
    SqlServer(SqlServerCredentials),
    #[serde(rename = "snowflake")]
    Snowflake(SnowflakeCredentials),
    #[serde(rename = "bigquery")]
    BigQuery(BigQueryCredentials),
    #[serde(rename = "redshift")]
    Redshift(PostgresCredentials),
}

/// TLS setting: a plain toggle or explicit options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SslConfig {
    Enabled(bool),
    Options {
        #[serde(default = "default_true")]
        reject_unauthorized: bool,
        #[serde(default)]
        ca: Option<String>,
    },
}

impl SslConfig {
    pub fn is_enabled(&self) -> bool {
        match self {
            SslConfig::Enabled(enabled) => *enabled,
            SslConfig::Options { .. } => true,
        }
    }

    pub fn verifies_certificate(&self) -> bool {
        match self {
            SslConfig::Enabled(_) => false,
            SslConfig::Options {
                reject_unauthorized,
                ..
            } => *reject_unauthorized,
        }
    }

    pub fn ca(&self) -> Option<&str> {
        match self {
            SslConfig::Options { ca, .. } => ca.as_deref(),
            SslConfig::Enabled(_) => None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Shared by the PostgreSQL and Redshift variants; defaults differ per variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostgresCredentials {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub default_database: Option<String>,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub ssl: Option<SslConfig>,
    #[serde(default)]
    pub connection_timeout: Option<u64>,
}

impl PostgresCredentials {
    /// `database` wins over the legacy `default_database`.
    pub fn database_name(&self) -> Option<&str> {
        non_blank(self.database.as_deref()).or_else(|| non_blank(self.default_database.as_deref()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MySqlCredentials {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub default_database: Option<String>,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub ssl: Option<SslConfig>,
    #[serde(default)]
    pub connection_timeout: Option<u64>,
}

impl MySqlCredentials {
    pub fn database_name(&self) -> Option<&str> {
        non_blank(self.database.as_deref()).or_else(|| non_blank(self.default_database.as_deref()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlServerCredentials {
    pub server: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub default_database: Option<String>,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default = "default_true")]
    pub encrypt: bool,
    #[serde(default)]
    pub trust_server_certificate: bool,
    #[serde(default)]
    pub request_timeout: Option<u64>,
    #[serde(default)]
    pub connection_timeout: Option<u64>,
}

impl SqlServerCredentials {
    pub fn database_name(&self) -> Option<&str> {
        non_blank(self.database.as_deref()).or_else(|| non_blank(self.default_database.as_deref()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnowflakeCredentials {
    pub account_id: String,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub warehouse_id: Option<String>,
    #[serde(default)]
    pub default_database: Option<String>,
    #[serde(default)]
    pub default_schema: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BigQueryCredentials {
    pub project_id: String,
    /// Inline JSON (string or object) or a path to a key file
    #[serde(default, skip_serializing)]
    pub service_account_key: Option<serde_json::Value>,
    #[serde(default)]
    pub key_file_path: Option<String>,
    #[serde(default)]
    pub default_dataset: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// Where a BigQuery client should read its service account from.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceAccount {
    Inline(serde_json::Value),
    File(PathBuf),
    /// Application default credentials
    Ambient,
}

impl BigQueryCredentials {
    pub fn location(&self) -> &str {
        non_blank(self.location.as_deref()).unwrap_or(BIGQUERY_DEFAULT_LOCATION)
    }

    /// A string key is parsed as JSON first and treated as a path otherwise.
    pub fn service_account(&self) -> ServiceAccount {
        match &self.service_account_key {
            Some(key @ serde_json::Value::Object(_)) => ServiceAccount::Inline(key.clone()),
            Some(serde_json::Value::String(raw)) if !raw.trim().is_empty() => {
                match serde_json::from_str::<serde_json::Value>(raw) {
                    Ok(parsed @ serde_json::Value::Object(_)) => ServiceAccount::Inline(parsed),
                    _ => ServiceAccount::File(PathBuf::from(raw.trim())),
                }
            }
            _ => match non_blank(self.key_file_path.as_deref()) {
                Some(path) => ServiceAccount::File(PathBuf::from(path)),
                None => ServiceAccount::Ambient,
            },
        }
    }
}

impl Credentials {
    pub fn data_source_type(&self) -> DataSourceType {
        match self {
            Credentials::Postgres(_) => DataSourceType::Postgres,
            Credentials::MySql(_) => DataSourceType::MySql,
            Credentials::SqlServer(_) => DataSourceType::SqlServer,
            Credentials::Snowflake(_) => DataSourceType::Snowflake,
            Credentials::BigQuery(_) => DataSourceType::BigQuery,
            Credentials::Redshift(_) => DataSourceType::Redshift,
        }
    }

    /// Fails closed on missing or blank required fields.
    pub fn validate(&self) -> EngineResult<()> {
        let engine = self.data_source_type();
        match self {
            Credentials::Postgres(c) | Credentials::Redshift(c) => {
                require(engine, "host", &c.host)?;
                require(engine, "username", &c.username)?;
                if c.database_name().is_none() {
                    return Err(DataSourceError::configuration(format!(
                        "{} credentials require either database or default_database",
                        engine.display_name()
                    )));
                }
                require_port(engine, c.port)
            }
            Credentials::MySql(c) => {
                require(engine, "host", &c.host)?;
                require(engine, "username", &c.username)?;
                require_port(engine, c.port)
            }
            Credentials::SqlServer(c) => {
                require(engine, "server", &c.server)?;
                require(engine, "username", &c.username)?;
                if c.database_name().is_none() {
                    return Err(DataSourceError::configuration(
                        "SQL Server credentials require either database or default_database",
                    ));
                }
                require_port(engine, c.port)
            }
            Credentials::Snowflake(c) => {
                require(engine, "account_id", &c.account_id)?;
                require(engine, "username", &c.username)?;
                require(engine, "password", &c.password)
            }
            Credentials::BigQuery(c) => require(engine, "project_id", &c.project_id),
        }
    }

    /// Identity of the remote session these credentials open.
    pub fn fingerprint(&self) -> String {
        match self {
            Credentials::Postgres(c) | Credentials::Redshift(c) => format!(
                "{}:{}:{}:{}",
                c.host,
                c.port.unwrap_or_default(),
                c.username,
                c.database_name().unwrap_or_default()
            ),
            Credentials::MySql(c) => format!(
                "{}:{}:{}:{}",
                c.host,
                c.port.unwrap_or_default(),
                c.username,
                c.database_name().unwrap_or_default()
            ),
            Credentials::SqlServer(c) => format!(
                "{}:{}:{}:{}",
                c.server,
                c.port.unwrap_or_default(),
                c.username,
                c.database_name().unwrap_or_default()
            ),
            Credentials::Snowflake(c) => format!(
                "{}:{}:{}:{}",
                c.account_id,
                c.username,
                c.warehouse_id.as_deref().unwrap_or_default(),
                c.default_database.as_deref().unwrap_or_default()
            ),
            Credentials::BigQuery(c) => format!("{}:{}", c.project_id, c.location()),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn require(engine: DataSourceType, field: &str, value: &str) -> EngineResult<()> {
    if value.trim().is_empty() {
        return Err(DataSourceError::configuration(format!(
            "{} credentials are missing required field '{field}'",
            engine.display_name()
        )));
    }
    Ok(())
}

fn require_port(engine: DataSourceType, port: Option<u16>) -> EngineResult<()> {
    if port == Some(0) {
        return Err(DataSourceError::configuration(format!(
            "{} credentials have an invalid port 0",
            engine.display_name()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::ErrorKind;

    fn parse(json: &str) -> Credentials {
        serde_json::from_str(json).expect("credentials should parse")
    }

    #[test]
    fn parses_tagged_variants() {
        let creds = parse(
            r#"{"type":"redshift","host":"cluster.example.com","username":"admin","password":"pw","database":"dev"}"#,
        );
        assert_eq!(creds.data_source_type(), DataSourceType::Redshift);
        assert!(creds.validate().is_ok());

        let creds = parse(
            r#"{"type":"sqlserver","server":"mssql","username":"sa","password":"pw","default_database":"master"}"#,
        );
        match &creds {
            Credentials::SqlServer(c) => {
                assert!(c.encrypt);
                assert!(!c.trust_server_certificate);
                assert_eq!(c.database_name(), Some("master"));
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn postgres_requires_a_database() {
        let creds = parse(r#"{"type":"postgres","host":"localhost","username":"u","password":"p"}"#);
        let err = creds.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);

        let creds = parse(
            r#"{"type":"postgres","host":"localhost","username":"u","password":"p","default_database":"legacy"}"#,
        );
        assert!(creds.validate().is_ok());
    }

    #[test]
    fn blank_required_fields_fail_closed() {
        let creds = Credentials::Snowflake(SnowflakeCredentials {
            account_id: "  ".into(),
            username: "u".into(),
            password: "p".into(),
            ..Default::default()
        });
        let err = creds.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert!(err.message().contains("account_id"));
    }

    #[test]
    fn passwords_are_not_serialized() {
        let creds = parse(r#"{"type":"mysql","host":"db","username":"u","password":"secret"}"#);
        let json = serde_json::to_string(&creds).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains(r#""type":"mysql""#));
    }

    #[test]
    fn ssl_accepts_bool_or_options() {
        let creds = parse(
            r#"{"type":"postgres","host":"h","username":"u","database":"d","ssl":{"reject_unauthorized":false}}"#,
        );
        let Credentials::Postgres(pg) = creds else {
            panic!("expected postgres");
        };
        let ssl = pg.ssl.expect("ssl should be set");
        assert!(ssl.is_enabled());
        assert!(!ssl.verifies_certificate());
    }

    #[test]
    fn snowflake_fingerprint_covers_session_identity() {
        let base = SnowflakeCredentials {
            account_id: "acme".into(),
            username: "analyst".into(),
            password: "pw".into(),
            warehouse_id: Some("COMPUTE_WH".into()),
            default_database: Some("SALES".into()),
            ..Default::default()
        };
        let a = Credentials::Snowflake(base.clone());
        let b = Credentials::Snowflake(SnowflakeCredentials {
            warehouse_id: Some("OTHER_WH".into()),
            ..base
        });
        assert_eq!(a.fingerprint(), "acme:analyst:COMPUTE_WH:SALES");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn bigquery_service_account_resolution() {
        let inline = BigQueryCredentials {
            project_id: "proj".into(),
            service_account_key: Some(serde_json::Value::String(
                r#"{"client_email":"svc@proj.iam"}"#.into(),
            )),
            ..Default::default()
        };
        assert!(matches!(inline.service_account(), ServiceAccount::Inline(_)));
        assert_eq!(inline.location(), "US");

        let path = BigQueryCredentials {
            project_id: "proj".into(),
            service_account_key: Some(serde_json::Value::String("/keys/svc.json".into())),
            ..Default::default()
        };
        assert_eq!(
            path.service_account(),
            ServiceAccount::File(PathBuf::from("/keys/svc.json"))
        );

        let ambient = BigQueryCredentials {
            project_id: "proj".into(),
            ..Default::default()
        };
        assert_eq!(ambient.service_account(), ServiceAccount::Ambient);
    }
}
