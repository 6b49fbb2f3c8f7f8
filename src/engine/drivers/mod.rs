//! Engine adapters
//!
//! One `DatabaseAdapter` per engine. They differ in how they obtain a
//! connection (plain connect, pool, warm cache) and in their row-limit
//! strategy; the execution pipeline below is shared.

pub mod bigquery;
pub mod mysql;
pub mod postgres;
pub mod redshift;
pub mod snowflake;
pub mod sqlserver;

use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;

use crate::engine::client::ClientConnection;
use crate::engine::credentials::Credentials;
use crate::engine::error::{ClassifyExt, DataSourceError, EngineResult, ErrorContext};
use crate::engine::introspection::Introspector;
use crate::engine::row_limit::{build_result, effective_limit, execute_limited, RowLimitStrategy};
use crate::engine::timeout::{resolve_timeout, with_timeout};
use crate::engine::types::{AdapterQueryResult, DataSourceType, Value, WriteResult};

pub use bigquery::BigQueryAdapter;
pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use redshift::RedshiftAdapter;
pub use snowflake::SnowflakeAdapter;
pub use sqlserver::SqlServerAdapter;

/// Runs a read query on `conn`: statement timeout, row limiting under the
/// client-side deadline, then type mapping and normalization.
pub(crate) async fn run_query(
    engine: DataSourceType,
    conn: &Arc<dyn ClientConnection>,
    strategy: RowLimitStrategy,
    sql: &str,
    params: &[Value],
    max_rows: Option<i64>,
    timeout_ms: u64,
) -> EngineResult<AdapterQueryResult> {
    let limit = effective_limit(max_rows);
    let context = ErrorContext::new(engine, "query");

    let limited = with_timeout(timeout_ms, conn, async {
        conn.set_statement_timeout(timeout_ms)
            .await
            .classify_err(context)?;
        execute_limited(conn, strategy, sql, params, limit)
            .await
            .classify_err(context)
    })
    .await?;

    Ok(build_result(engine, limited))
}

pub(crate) async fn run_write(
    engine: DataSourceType,
    conn: &Arc<dyn ClientConnection>,
    sql: &str,
    params: &[Value],
    timeout_ms: u64,
) -> EngineResult<WriteResult> {
    let context = ErrorContext::new(engine, "execute");

    let row_count = with_timeout(timeout_ms, conn, async {
        conn.set_statement_timeout(timeout_ms)
            .await
            .classify_err(context)?;
        conn.execute(sql, params).await.classify_err(context)
    })
    .await?;

    Ok(WriteResult { row_count })
}

/// Trivial round trip used by `test_connection`.
pub(crate) async fn probe(conn: &Arc<dyn ClientConnection>) -> bool {
    conn.query("SELECT 1", &[], Some(1)).await.is_ok()
}

pub(crate) fn effective_timeout(requested: Option<u64>, default_ms: u64) -> u64 {
    resolve_timeout(requested, default_ms)
}

/// The single live connection of a plain (non-pooled) adapter.
pub(crate) struct ConnectionSlot {
    engine: DataSourceType,
    conn: RwLock<Option<Arc<dyn ClientConnection>>>,
}

impl ConnectionSlot {
    pub fn new(engine: DataSourceType) -> Self {
        Self {
            engine,
            conn: RwLock::new(None),
        }
    }

    pub fn get(&self) -> EngineResult<Arc<dyn ClientConnection>> {
        self.conn
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| DataSourceError::not_connected(self.engine))
    }

    pub fn set(&self, conn: Arc<dyn ClientConnection>) -> Option<Arc<dyn ClientConnection>> {
        match self.conn.write() {
            Ok(mut guard) => guard.replace(conn),
            Err(poisoned) => poisoned.into_inner().replace(conn),
        }
    }

    pub fn take(&self) -> Option<Arc<dyn ClientConnection>> {
        match self.conn.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.conn.read().map(|guard| guard.is_some()).unwrap_or(false)
    }
}

/// Rejects credentials of another engine, then validates required fields.
pub(crate) fn expect_credentials(
    expected: DataSourceType,
    credentials: &Credentials,
) -> EngineResult<()> {
    let actual = credentials.data_source_type();
    if actual != expected {
        return Err(DataSourceError::invalid_credentials_type(expected, actual));
    }
    credentials.validate()
}

/// Lazily built introspector, available once the adapter is connected.
pub(crate) fn introspector(
    cell: &OnceCell<Arc<Introspector>>,
    connected: bool,
    build: impl FnOnce() -> Introspector,
) -> EngineResult<Arc<Introspector>> {
    if !connected {
        return Err(DataSourceError::configuration(
            "Adapter must be initialized before introspection",
        ));
    }
    Ok(cell.get_or_init(|| Arc::new(build())).clone())
}

/// Closes a connection, logging instead of failing.
pub(crate) async fn close_quietly(engine: DataSourceType, conn: Arc<dyn ClientConnection>) {
    if let Err(err) = conn.close().await {
        tracing::warn!(data_source = %engine, error = %err, "Failed to close connection");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::engine::credentials::{
        BigQueryCredentials, Credentials, MySqlCredentials, PostgresCredentials,
        SnowflakeCredentials, SqlServerCredentials,
    };

    pub fn postgres() -> Credentials {
        Credentials::Postgres(PostgresCredentials {
            host: "db.internal".into(),
            username: "reader".into(),
            password: "secret".into(),
            database: Some("analytics".into()),
            ..Default::default()
        })
    }

    pub fn redshift() -> Credentials {
        Credentials::Redshift(PostgresCredentials {
            host: "cluster.redshift.amazonaws.com".into(),
            username: "admin".into(),
            password: "secret".into(),
            database: Some("dev".into()),
            ..Default::default()
        })
    }

    pub fn mysql() -> Credentials {
        Credentials::MySql(MySqlCredentials {
            host: "mysql.internal".into(),
            username: "reader".into(),
            password: "secret".into(),
            default_database: Some("shop".into()),
            ..Default::default()
        })
    }

    pub fn sqlserver() -> Credentials {
        Credentials::SqlServer(SqlServerCredentials {
            server: "mssql.internal".into(),
            username: "sa".into(),
            password: "secret".into(),
            database: Some("sales".into()),
            encrypt: true,
            ..Default::default()
        })
    }

    pub fn snowflake() -> Credentials {
        Credentials::Snowflake(SnowflakeCredentials {
            account_id: "acme-eu1".into(),
            username: "analyst".into(),
            password: "secret".into(),
            warehouse_id: Some("COMPUTE_WH".into()),
            default_database: Some("ANALYTICS".into()),
            ..Default::default()
        })
    }

    pub fn bigquery() -> Credentials {
        Credentials::BigQuery(BigQueryCredentials {
            project_id: "acme-analytics".into(),
            ..Default::default()
        })
    }
}
