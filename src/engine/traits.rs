//! DatabaseAdapter trait definition
//!
//! The single contract every engine adapter implements. Callers see only
//! this trait and `DataSourceError`; driver quirks stay behind it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::credentials::Credentials;
use crate::engine::error::EngineResult;
use crate::engine::introspection::Introspector;
use crate::engine::row_limit::RowLimitStrategy;
use crate::engine::types::{
    AdapterQueryResult, CancelSupport, DataSourceType, LogRecord, Value, WriteResult,
};

/// Core trait that all engine adapters implement
///
/// Adapters are shared behind `Arc`, so every method takes `&self` and the
/// connection state lives behind interior locks.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn data_source_type(&self) -> DataSourceType;

    /// How the adapter enforces row limits
    fn row_limit_strategy(&self) -> RowLimitStrategy;

    /// Whether a timed-out query is actually stopped on the server
    fn cancel_support(&self) -> CancelSupport;

    fn is_connected(&self) -> bool;

    /// Validates `credentials` and opens the adapter's connection (or pool).
    ///
    /// Fails with `ConfigurationError` for credentials of another engine
    /// or missing fields, and with a classified driver error otherwise.
    async fn initialize(&self, credentials: &Credentials) -> EngineResult<()>;

    /// Runs a read query.
    ///
    /// `max_rows` absent or `<= 0` returns everything. `timeout_ms` absent
    /// or `0` uses the adapter default.
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
        max_rows: Option<i64>,
        timeout_ms: Option<u64>,
    ) -> EngineResult<AdapterQueryResult>;

    /// Runs a statement and reports the affected-row count.
    async fn execute_write(
        &self,
        sql: &str,
        params: &[Value],
        timeout_ms: Option<u64>,
    ) -> EngineResult<WriteResult>;

    /// Round-trips a trivial query. Never fails; errors read as `false`.
    async fn test_connection(&self) -> bool;

    /// Releases the adapter's connections. Never fails.
    async fn close(&self);

    /// Schema discovery for this adapter, created on first use.
    fn introspect(&self) -> EngineResult<Arc<Introspector>>;

    /// Appends one conversation log row to `database.schema.table`.
    async fn insert_log_record(
        &self,
        database: &str,
        schema: &str,
        table: &str,
        record: &LogRecord,
    ) -> EngineResult<WriteResult> {
        let sql = log_insert_sql(self.data_source_type(), database, schema, table);
        self.execute_write(&sql, &record.values(), None).await
    }
}

/// Parameterized INSERT for `LogRecord::COLUMNS`; blank qualifiers are
/// left out.
pub fn log_insert_sql(engine: DataSourceType, database: &str, schema: &str, table: &str) -> String {
    let target = [database, schema, table]
        .iter()
        .filter(|part| !part.trim().is_empty())
        .map(|part| engine.quote_ident(part))
        .collect::<Vec<_>>()
        .join(".");
    let columns = LogRecord::COLUMNS
        .iter()
        .map(|column| engine.quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    let markers = (0..LogRecord::COLUMNS.len())
        .map(|index| engine.bind_marker(index))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {target} ({columns}) VALUES ({markers})")
}
