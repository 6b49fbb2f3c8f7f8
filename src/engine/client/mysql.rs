//! MySQL client over a sqlx `MySqlPool`
//!
//! Every statement records the server connection id it runs on. When a
//! deadline drops a statement before it finishes, that id is kept so
//! `cancel` can issue `KILL QUERY` for it, and only it, from another pooled
//! connection.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use rust_decimal::Decimal;
use sqlx::mysql::{
    MySql, MySqlArguments, MySqlColumn, MySqlConnectOptions, MySqlPool, MySqlPoolOptions,
    MySqlRow, MySqlSslMode,
};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Column, Executor, Row, Statement, TypeInfo};
use tracing::{debug, warn};

use super::{
    CancelGate, ClientConnection, ClientError, ClientResult, Connector, RawColumn, RawResultSet, RawRow,
    TypeCode,
};
use crate::engine::credentials::{
    Credentials, SslConfig, DEFAULT_CONNECTION_TIMEOUT_MS, MYSQL_DEFAULT_PORT,
};
use crate::engine::types::{CancelSupport, Value};

const MAX_POOL_CONNECTIONS: u32 = 5;

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlConnector;

impl MySqlConnector {
    pub fn connect_options(credentials: &Credentials) -> ClientResult<(MySqlConnectOptions, Duration)> {
        let Credentials::MySql(c) = credentials else {
            return Err(ClientError::message(format!(
                "Invalid credentials type for the MySQL client: {}",
                credentials.data_source_type()
            )));
        };

        let mut options = MySqlConnectOptions::new()
            .host(&c.host)
            .port(c.port.unwrap_or(MYSQL_DEFAULT_PORT))
            .username(&c.username)
            .password(&c.password);
        if let Some(database) = c.database_name() {
            options = options.database(database);
        }

        let ssl = c.ssl.clone().unwrap_or(SslConfig::Enabled(false));
        options = match &ssl {
            SslConfig::Enabled(false) => options.ssl_mode(MySqlSslMode::Preferred),
            SslConfig::Enabled(true) => options.ssl_mode(MySqlSslMode::Required),
            SslConfig::Options { .. } if ssl.verifies_certificate() => {
                options.ssl_mode(MySqlSslMode::VerifyIdentity)
            }
            SslConfig::Options { .. } => options.ssl_mode(MySqlSslMode::Required),
        };
        if let Some(ca) = ssl.ca() {
            options = options.ssl_ca_from_pem(ca.as_bytes().to_vec());
        }

        let timeout = Duration::from_millis(
            c.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT_MS),
        );
        Ok((options, timeout))
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, credentials: &Credentials) -> ClientResult<Arc<dyn ClientConnection>> {
        let (options, connect_timeout) = Self::connect_options(credentials)?;
        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .acquire_timeout(connect_timeout)
            .connect_with(options)
            .await?;
        Ok(Arc::new(MySqlClient::new(pool)))
    }
}

pub struct MySqlClient {
    pool: MySqlPool,
    /// Connection ids whose statement was dropped before it finished
    abandoned: Arc<StdMutex<Vec<u64>>>,
    gate: CancelGate,
}

/// Tracks one statement. Dropped without `finish`, the statement was
/// abandoned mid-flight and its connection id is queued for `KILL QUERY`.
struct RunningQuery {
    abandoned: Arc<StdMutex<Vec<u64>>>,
    connection_id: u64,
    finished: bool,
}

impl RunningQuery {
    fn new(abandoned: Arc<StdMutex<Vec<u64>>>, connection_id: u64) -> Self {
        Self {
            abandoned,
            connection_id,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for RunningQuery {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(mut abandoned) = self.abandoned.lock() {
            abandoned.push(self.connection_id);
        }
    }
}

impl MySqlClient {
    pub fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
            abandoned: Arc::new(StdMutex::new(Vec::new())),
            gate: CancelGate::default(),
        }
    }

    async fn checkout(&self) -> ClientResult<(PoolConnection<MySql>, RunningQuery)> {
        self.gate.wait().await;
        let mut conn = self.pool.acquire().await?;
        let connection_id: u64 = sqlx::query_scalar("SELECT CONNECTION_ID()")
            .fetch_one(&mut *conn)
            .await?;
        Ok((conn, RunningQuery::new(self.abandoned.clone(), connection_id)))
    }

    async fn kill_abandoned(&self) -> ClientResult<()> {
        let connection_ids = match self.abandoned.lock() {
            Ok(mut abandoned) => std::mem::take(&mut *abandoned),
            Err(_) => Vec::new(),
        };
        if connection_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.acquire().await?;
        for connection_id in connection_ids {
            let kill = format!("KILL QUERY {connection_id}");
            if let Err(err) = sqlx::query(&kill).execute(&mut *conn).await {
                warn!(connection_id, error = %err, "KILL QUERY failed");
            } else {
                debug!(connection_id, "Cancel requested");
            }
        }
        Ok(())
    }
}

fn bind_param<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(b),
        Value::Int(i) => query.bind(i),
        Value::Float(f) => query.bind(f),
        Value::Text(s) => query.bind(s),
        Value::Date(dt) => query.bind(dt),
        Value::Bytes(b) => query.bind(b),
        Value::Json(j) => query.bind(j),
        Value::Array(_) => query.bind(Option::<String>::None),
    }
}

fn build_query<'q>(sql: &'q str, params: &'q [Value]) -> Query<'q, MySql, MySqlArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| bind_param(query, value))
}

fn raw_columns(columns: &[MySqlColumn]) -> Vec<RawColumn> {
    columns
        .iter()
        .map(|col| RawColumn::new(col.name(), TypeCode::Name(col.type_info().name().to_string())))
        .collect()
}

fn convert_row(row: &MySqlRow) -> RawRow {
    (0..row.columns().len())
        .map(|idx| extract_value(row, idx))
        .collect()
}

/// Unsigned first so BIGINT UNSIGNED survives; decimals stay textual.
fn extract_value(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v
            .map(|u| i64::try_from(u).map(Value::Int).unwrap_or_else(|_| Value::Text(u.to_string())))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
        return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u16>, _>(idx) {
        return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u8>, _>(idx) {
        return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
        return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(Value::Date).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v.map(|dt| Value::Date(dt.and_utc())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
        return v
            .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
        return v.map(Value::Json).unwrap_or(Value::Null);
    }

    Value::Null
}

#[async_trait]
impl ClientConnection for MySqlClient {
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
        max_results: Option<usize>,
    ) -> ClientResult<RawResultSet> {
        let (mut conn, running) = self.checkout().await?;

        let result: ClientResult<RawResultSet> = async {
            let rows: Vec<MySqlRow> = match max_results {
                Some(limit) => {
                    build_query(sql, params)
                        .fetch(&mut *conn)
                        .take(limit)
                        .try_collect()
                        .await?
                }
                None => build_query(sql, params).fetch_all(&mut *conn).await?,
            };

            let columns = match rows.first() {
                Some(first) => raw_columns(first.columns()),
                None => {
                    let statement = (&mut *conn).prepare(sql).await?;
                    raw_columns(statement.columns())
                }
            };
            Ok(RawResultSet {
                columns,
                rows: rows.iter().map(convert_row).collect(),
            })
        }
        .await;

        running.finish();
        result
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> ClientResult<u64> {
        let (mut conn, running) = self.checkout().await?;
        let result = build_query(sql, params).execute(&mut *conn).await;
        running.finish();
        Ok(result?.rows_affected())
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::Driver
    }

    fn cancel_requested(&self) {
        self.gate.mark();
    }

    async fn cancel(&self) -> ClientResult<()> {
        let result = self.kill_abandoned().await;
        self.gate.settle();
        result
    }

    async fn close(&self) -> ClientResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
