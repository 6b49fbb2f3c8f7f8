//! PostgreSQL wire-protocol client (PostgreSQL and Redshift)
//!
//! One dedicated `PgConnection` per client. Cursors run inside a transaction
//! on that connection; cancellation opens a second connection and calls
//! `pg_cancel_backend` with the first one's backend pid. New statements wait
//! for a pending cancel so it cannot hit the wrong statement.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgColumn, PgConnectOptions, PgConnection, PgRow, PgSslMode, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor, Row, Statement, TypeInfo};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::{
    CancelGate, ClientConnection, ClientError, ClientResult, Connector, RawColumn, RawResultSet,
    RawRow, RowCursor, TypeCode,
};
use crate::engine::credentials::{
    Credentials, PostgresCredentials, SslConfig, DEFAULT_CONNECTION_TIMEOUT_MS,
    POSTGRES_DEFAULT_PORT, REDSHIFT_CONNECTION_TIMEOUT_MS, REDSHIFT_DEFAULT_PORT,
};
use crate::engine::types::{CancelSupport, Value};

/// Connects PostgreSQL and Redshift credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

impl PgConnector {
    /// Connection options plus the connect timeout, with per-engine defaults.
    pub fn connect_options(credentials: &Credentials) -> ClientResult<(PgConnectOptions, Duration)> {
        let (c, port, ssl, timeout_ms): (&PostgresCredentials, u16, SslConfig, u64) = match credentials {
            Credentials::Postgres(c) => (
                c,
                c.port.unwrap_or(POSTGRES_DEFAULT_PORT),
                c.ssl.clone().unwrap_or(SslConfig::Enabled(false)),
                c.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT_MS),
            ),
            Credentials::Redshift(c) => (
                c,
                c.port.unwrap_or(REDSHIFT_DEFAULT_PORT),
                c.ssl.clone().unwrap_or(SslConfig::Enabled(true)),
                c.connection_timeout.unwrap_or(REDSHIFT_CONNECTION_TIMEOUT_MS),
            ),
            other => {
                return Err(ClientError::message(format!(
                    "Invalid credentials type for the PostgreSQL client: {}",
                    other.data_source_type()
                )))
            }
        };

        let database = c
            .database_name()
            .ok_or_else(|| ClientError::message("Invalid configuration: no database given"))?;

        let mut options = PgConnectOptions::new()
            .host(&c.host)
            .port(port)
            .username(&c.username)
            .password(&c.password)
            .database(database);

        options = match &ssl {
            SslConfig::Enabled(false) => options.ssl_mode(PgSslMode::Prefer),
            SslConfig::Enabled(true) => options.ssl_mode(PgSslMode::Require),
            SslConfig::Options { .. } if ssl.verifies_certificate() => {
                options.ssl_mode(PgSslMode::VerifyFull)
            }
            SslConfig::Options { .. } => options.ssl_mode(PgSslMode::Require),
        };
        if let Some(ca) = ssl.ca() {
            options = options.ssl_root_cert_from_pem(ca.as_bytes().to_vec());
        }
        if let Some(schema) = c.schema.as_deref().filter(|s| !s.trim().is_empty()) {
            options = options.options([("search_path", schema)]);
        }

        Ok((options, Duration::from_millis(timeout_ms)))
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, credentials: &Credentials) -> ClientResult<Arc<dyn ClientConnection>> {
        let (options, connect_timeout) = Self::connect_options(credentials)?;
        let client = PgClient::connect(options, connect_timeout).await?;
        Ok(Arc::new(client))
    }
}

pub struct PgClient {
    conn: Arc<Mutex<Option<PgConnection>>>,
    options: PgConnectOptions,
    connect_timeout: Duration,
    backend_pid: i32,
    cursor_seq: AtomicU64,
    gate: CancelGate,
    /// Set while a cursor transaction is open; cleared by its COMMIT/ROLLBACK
    open_transaction: Arc<AtomicBool>,
}

type Session = OwnedMutexGuard<Option<PgConnection>>;

impl PgClient {
    pub async fn connect(options: PgConnectOptions, connect_timeout: Duration) -> ClientResult<Self> {
        let mut conn = open(&options, connect_timeout).await?;
        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut conn)
            .await?;
        debug!(backend_pid, "PostgreSQL connection established");

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            options,
            connect_timeout,
            backend_pid,
            cursor_seq: AtomicU64::new(0),
            gate: CancelGate::default(),
            open_transaction: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Locks the connection once no cancel is pending. A transaction left
    /// open by a cursor that never closed is rolled back first.
    async fn session(&self) -> ClientResult<Session> {
        self.gate.wait().await;
        let mut guard = self.conn.clone().lock_owned().await;
        let conn = guard.as_mut().ok_or(ClientError::Closed)?;
        if self.open_transaction.swap(false, Ordering::SeqCst) {
            warn!(backend_pid = self.backend_pid, "Rolling back transaction left by an unclosed cursor");
            if let Err(err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                self.open_transaction.store(true, Ordering::SeqCst);
                return Err(err.into());
            }
        }
        Ok(guard)
    }

    async fn cancel_backend(&self) -> ClientResult<()> {
        let mut conn = open(&self.options, self.connect_timeout).await?;
        sqlx::query("SELECT pg_cancel_backend($1)")
            .bind(self.backend_pid)
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        debug!(backend_pid = self.backend_pid, "Cancel requested");
        Ok(())
    }
}

async fn open(options: &PgConnectOptions, connect_timeout: Duration) -> ClientResult<PgConnection> {
    match tokio::time::timeout(connect_timeout, PgConnection::connect_with(options)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ClientError::connect_timeout(connect_timeout)),
    }
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(b),
        Value::Int(i) => query.bind(i),
        Value::Float(f) => query.bind(f),
        Value::Text(s) => query.bind(s),
        Value::Date(dt) => query.bind(dt),
        Value::Bytes(b) => query.bind(b),
        Value::Json(j) => query.bind(j),
        // No array binding; sent as NULL
        Value::Array(_) => query.bind(Option::<String>::None),
    }
}

fn build_query<'q>(sql: &'q str, params: &'q [Value]) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| bind_param(query, value))
}

fn raw_columns(columns: &[PgColumn]) -> Vec<RawColumn> {
    columns
        .iter()
        .map(|col| {
            let info = col.type_info();
            let type_code = match info.oid() {
                Some(oid) => TypeCode::Oid(oid.0),
                None => TypeCode::Name(info.name().to_string()),
            };
            RawColumn::new(col.name(), type_code)
        })
        .collect()
}

fn convert_row(row: &PgRow) -> RawRow {
    (0..row.columns().len())
        .map(|idx| extract_value(row, idx))
        .collect()
}

/// Integers are tried before bool so small ints are not misread.
fn extract_value(row: &PgRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
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
    // Numeric comes back as text and is coerced during normalization
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
            .map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
        return v.map(|u| Value::Text(u.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
        return v.map(Value::Json).unwrap_or(Value::Null);
    }

    Value::Null
}

/// Column metadata for a statement that produced no rows.
async fn describe(conn: &mut PgConnection, sql: &str) -> ClientResult<Vec<RawColumn>> {
    let statement = (&mut *conn).prepare(sql).await?;
    Ok(raw_columns(statement.columns()))
}

#[async_trait]
impl ClientConnection for PgClient {
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
        max_results: Option<usize>,
    ) -> ClientResult<RawResultSet> {
        let mut guard = self.session().await?;
        let conn = guard.as_mut().ok_or(ClientError::Closed)?;

        let rows: Vec<PgRow> = match max_results {
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
            None => describe(conn, sql).await?,
        };
        Ok(RawResultSet {
            columns,
            rows: rows.iter().map(convert_row).collect(),
        })
    }

    async fn open_cursor(&self, sql: &str, params: &[Value]) -> ClientResult<Box<dyn RowCursor>> {
        let mut guard = self.session().await?;
        let conn = guard.as_mut().ok_or(ClientError::Closed)?;

        let name = format!(
            "qoredb_cursor_{}",
            self.cursor_seq.fetch_add(1, Ordering::Relaxed)
        );
        let body = sql.trim().trim_end_matches(';');
        let declare = format!("DECLARE {name} NO SCROLL CURSOR FOR {body}");

        self.open_transaction.store(true, Ordering::SeqCst);
        sqlx::query("BEGIN").execute(&mut *conn).await?;
        if let Err(err) = build_query(&declare, params).execute(&mut *conn).await {
            match sqlx::query("ROLLBACK").execute(&mut *conn).await {
                Ok(_) => self.open_transaction.store(false, Ordering::SeqCst),
                Err(rollback) => {
                    warn!(error = %rollback, "Failed to roll back after cursor declaration error")
                }
            }
            return Err(err.into());
        }

        Ok(Box::new(PgCursor {
            guard,
            open_transaction: self.open_transaction.clone(),
            name,
            sql: body.to_string(),
            columns: Vec::new(),
            described: false,
            open: true,
        }))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> ClientResult<u64> {
        let mut guard = self.session().await?;
        let conn = guard.as_mut().ok_or(ClientError::Closed)?;
        let result = build_query(sql, params).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    async fn set_statement_timeout(&self, timeout_ms: u64) -> ClientResult<()> {
        let mut guard = self.session().await?;
        let conn = guard.as_mut().ok_or(ClientError::Closed)?;
        let statement = format!("SET statement_timeout = {timeout_ms}");
        sqlx::query(&statement).execute(&mut *conn).await?;
        Ok(())
    }

    async fn ping(&self) -> bool {
        let Ok(mut guard) = self.session().await else {
            return false;
        };
        match guard.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::Driver
    }

    fn cancel_requested(&self) {
        self.gate.mark();
    }

    async fn cancel(&self) -> ClientResult<()> {
        let result = self.cancel_backend().await;
        self.gate.settle();
        result
    }

    async fn close(&self) -> ClientResult<()> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close().await?;
        }
        Ok(())
    }
}

struct PgCursor {
    guard: Session,
    open_transaction: Arc<AtomicBool>,
    name: String,
    sql: String,
    columns: Vec<RawColumn>,
    described: bool,
    open: bool,
}

#[async_trait]
impl RowCursor for PgCursor {
    fn columns(&self) -> &[RawColumn] {
        &self.columns
    }

    async fn read(&mut self, max: usize) -> ClientResult<Vec<RawRow>> {
        let conn = self.guard.as_mut().ok_or(ClientError::Closed)?;
        let fetch = format!("FETCH FORWARD {max} FROM {}", self.name);
        let rows: Vec<PgRow> = sqlx::query(&fetch).fetch_all(&mut *conn).await?;

        if !self.described {
            self.columns = match rows.first() {
                Some(first) => raw_columns(first.columns()),
                None => describe(conn, &self.sql).await?,
            };
            self.described = true;
        }
        Ok(rows.iter().map(convert_row).collect())
    }

    async fn close(&mut self) -> ClientResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let conn = self.guard.as_mut().ok_or(ClientError::Closed)?;

        let close_sql = format!("CLOSE {}", self.name);
        let closed = sqlx::query(&close_sql).execute(&mut *conn).await;
        match closed {
            Ok(_) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                self.open_transaction.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                // Transaction is aborted; ROLLBACK clears it
                sqlx::query("ROLLBACK").execute(&mut *conn).await?;
                self.open_transaction.store(false, Ordering::SeqCst);
                Err(err.into())
            }
        }
    }
}
