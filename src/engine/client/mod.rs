//! Database client boundary
//!
//! Adapters never talk to a driver directly. They go through these traits,
//! which only expose connect / query / cursor / stream / execute / cancel /
//! close. The built-in bindings cover the engines that have a driver in the
//! crate; Snowflake and BigQuery connectors are supplied by the caller.

pub mod mysql;
pub mod postgres;
pub mod sqlserver;

#[cfg(test)]
pub mod mock;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::warn;

use super::credentials::Credentials;
use super::types::{CancelSupport, Value};

/// Engine type identifier as the driver reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeCode {
    /// Numeric type OID (PostgreSQL wire protocol)
    Oid(u32),
    /// Engine type name
    Name(String),
}

/// Column metadata as returned by the driver, before type mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawColumn {
    pub name: String,
    pub type_code: TypeCode,
    pub nullable: Option<bool>,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

impl RawColumn {
    pub fn new(name: impl Into<String>, type_code: TypeCode) -> Self {
        Self {
            name: name.into(),
            type_code,
            nullable: None,
            length: None,
            precision: None,
            scale: None,
        }
    }
}

/// One row of raw values, positionally matching the columns.
pub type RawRow = Vec<Value>;

#[derive(Debug, Clone, Default)]
pub struct RawResultSet {
    pub columns: Vec<RawColumn>,
    pub rows: Vec<RawRow>,
}

/// Events emitted by a row stream, in order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Columns(Vec<RawColumn>),
    Row(RawRow),
    Done,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Tiberius(#[from] tiberius::error::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Connection is closed")]
    Closed,
    #[error("{0} is not supported by this client")]
    Unsupported(&'static str),
    #[error("{0}")]
    Message(String),
}

impl ClientError {
    pub fn message(message: impl Into<String>) -> Self {
        ClientError::Message(message.into())
    }

    pub fn connect_timeout(waited: std::time::Duration) -> Self {
        ClientError::Message(format!(
            "Server unreachable: no connection after {}ms",
            waited.as_millis()
        ))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A server-side cursor. Must be closed by the caller.
#[async_trait]
pub trait RowCursor: Send {
    /// Columns of the cursor's result; empty until known.
    fn columns(&self) -> &[RawColumn];

    /// Reads up to `max` rows. Fewer than `max` means the cursor is drained.
    async fn read(&mut self, max: usize) -> ClientResult<Vec<RawRow>>;

    async fn close(&mut self) -> ClientResult<()>;
}

/// An event-driven row source that can be paused and cancelled mid-flight.
#[async_trait]
pub trait RowStream: Send {
    /// Next event, or `None` once the stream has ended.
    async fn next_event(&mut self) -> Option<ClientResult<StreamEvent>>;

    /// Stops pulling rows from the server; buffered events are still delivered.
    fn pause(&mut self);

    /// Asks the stream to wind down. A `Done` event follows.
    async fn cancel(&mut self) -> ClientResult<()>;
}

/// A live connection to one data source.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Runs a query, stopping after `max_results` rows when given.
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
        max_results: Option<usize>,
    ) -> ClientResult<RawResultSet>;

    async fn open_cursor(&self, _sql: &str, _params: &[Value]) -> ClientResult<Box<dyn RowCursor>> {
        Err(ClientError::Unsupported("server-side cursors"))
    }

    async fn open_stream(&self, _sql: &str, _params: &[Value]) -> ClientResult<Box<dyn RowStream>> {
        Err(ClientError::Unsupported("row streaming"))
    }

    /// Runs a statement and returns the affected-row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> ClientResult<u64>;

    /// Server-side statement timeout, for engines that have one.
    async fn set_statement_timeout(&self, _timeout_ms: u64) -> ClientResult<()> {
        Ok(())
    }

    /// Liveness probe; never fails.
    async fn ping(&self) -> bool;

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::None
    }

    /// Called the moment a deadline fires, before `cancel` is spawned.
    /// Clients with real cancellation hold back new statements from here
    /// until their `cancel` has run.
    fn cancel_requested(&self) {}

    /// Cancels the statement that was abandoned when its deadline fired.
    async fn cancel(&self) -> ClientResult<()> {
        Err(ClientError::Unsupported("query cancellation"))
    }

    async fn close(&self) -> ClientResult<()>;
}

/// Opens connections for one engine.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> ClientResult<Arc<dyn ClientConnection>>;
}

/// Longest time new statements wait for a pending cancel.
pub const CANCEL_SETTLE_LIMIT: Duration = Duration::from_secs(10);

/// Keeps a cancel from landing on the statement that runs after the one it
/// was meant for. `mark` when the deadline fires, `settle` once the cancel
/// has been sent, and `wait` before starting anything new.
#[derive(Debug, Default)]
pub struct CancelGate {
    pending: AtomicUsize,
    settled: Notify,
}

impl CancelGate {
    pub fn mark(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn settle(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.settled.notify_waiters();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    /// Returns once no cancel is pending, or after `CANCEL_SETTLE_LIMIT`.
    pub async fn wait(&self) {
        let settled = async {
            loop {
                let notified = self.settled.notified();
                if !self.is_pending() {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(CANCEL_SETTLE_LIMIT, settled).await.is_err() {
            warn!("Pending cancel did not settle in time; continuing");
        }
    }
}

/// Rewrites positional `?` placeholders with `name(index)`.
pub(crate) fn rewrite_placeholders(sql: &str, name: impl Fn(usize) -> String) -> String {
    let mut rewritten = String::with_capacity(sql.len() + 16);
    let mut index = 0;
    for ch in sql.chars() {
        if ch == '?' {
            rewritten.push_str(&name(index));
            index += 1;
        } else {
            rewritten.push(ch);
        }
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_positional_placeholders() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = ?";
        assert_eq!(
            rewrite_placeholders(sql, |i| format!("@param{i}")),
            "SELECT * FROM t WHERE a = @param0 AND b = @param1"
        );
        assert_eq!(
            rewrite_placeholders(sql, |i| format!("@P{}", i + 1)),
            "SELECT * FROM t WHERE a = @P1 AND b = @P2"
        );
        assert_eq!(rewrite_placeholders("SELECT 1", |i| i.to_string()), "SELECT 1");
    }

    #[tokio::test]
    async fn gate_holds_statements_until_the_cancel_settles() {
        let gate = Arc::new(CancelGate::default());
        gate.wait().await;

        gate.mark();
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        gate.settle();
        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!gate.is_pending());

        gate.settle();
        assert!(!gate.is_pending());
    }
}
