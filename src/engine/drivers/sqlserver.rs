//! SQL Server adapter
//!
//! Rows arrive as a stream. Once the row after `max_rows` shows up the
//! stream is paused and cancelled; the TDS client cannot interrupt the
//! statement itself, so a timed-out query may keep running server-side.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{info, instrument};

use super::{
    close_quietly, effective_timeout, expect_credentials, introspector, probe, run_query,
    run_write, ConnectionSlot,
};
use crate::engine::client::Connector;
use crate::engine::credentials::Credentials;
use crate::engine::error::{ClassifyExt, EngineResult, ErrorContext};
use crate::engine::introspection::Introspector;
use crate::engine::row_limit::RowLimitStrategy;
use crate::engine::timeout::SQLSERVER_QUERY_TIMEOUT_MS;
use crate::engine::traits::DatabaseAdapter;
use crate::engine::types::{
    AdapterQueryResult, CancelSupport, DataSourceType, Value, WriteResult,
};

const ENGINE: DataSourceType = DataSourceType::SqlServer;

pub struct SqlServerAdapter {
    connector: Arc<dyn Connector>,
    default_timeout_ms: u64,
    slot: ConnectionSlot,
    introspector: OnceCell<Arc<Introspector>>,
}

impl SqlServerAdapter {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            default_timeout_ms: SQLSERVER_QUERY_TIMEOUT_MS,
            slot: ConnectionSlot::new(ENGINE),
            introspector: OnceCell::new(),
        }
    }

    pub fn with_query_timeout(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }
}

#[async_trait]
impl DatabaseAdapter for SqlServerAdapter {
    fn data_source_type(&self) -> DataSourceType {
        ENGINE
    }

    fn row_limit_strategy(&self) -> RowLimitStrategy {
        RowLimitStrategy::StreamCancel
    }

    fn cancel_support(&self) -> CancelSupport {
        self.slot
            .get()
            .map(|conn| conn.cancel_support())
            .unwrap_or(CancelSupport::None)
    }

    fn is_connected(&self) -> bool {
        self.slot.is_set()
    }

    #[instrument(skip(self, credentials), fields(data_source = %ENGINE))]
    async fn initialize(&self, credentials: &Credentials) -> EngineResult<()> {
        expect_credentials(ENGINE, credentials)?;
        let conn = self
            .connector
            .connect(credentials)
            .await
            .classify_err(ErrorContext::new(ENGINE, "initialize"))?;
        if let Some(previous) = self.slot.set(conn) {
            close_quietly(ENGINE, previous).await;
        }
        info!("SQL Server adapter connected");
        Ok(())
    }

    #[instrument(skip(self, sql, params), fields(data_source = %ENGINE))]
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
        max_rows: Option<i64>,
        timeout_ms: Option<u64>,
    ) -> EngineResult<AdapterQueryResult> {
        let conn = self.slot.get()?;
        let timeout_ms = effective_timeout(timeout_ms, self.default_timeout_ms);
        run_query(ENGINE, &conn, self.row_limit_strategy(), sql, params, max_rows, timeout_ms).await
    }

    #[instrument(skip(self, sql, params), fields(data_source = %ENGINE))]
    async fn execute_write(
        &self,
        sql: &str,
        params: &[Value],
        timeout_ms: Option<u64>,
    ) -> EngineResult<WriteResult> {
        let conn = self.slot.get()?;
        let timeout_ms = effective_timeout(timeout_ms, self.default_timeout_ms);
        run_write(ENGINE, &conn, sql, params, timeout_ms).await
    }

    async fn test_connection(&self) -> bool {
        match self.slot.get() {
            Ok(conn) => probe(&conn).await,
            Err(_) => false,
        }
    }

    async fn close(&self) {
        if let Some(conn) = self.slot.take() {
            close_quietly(ENGINE, conn).await;
        }
    }

    fn introspect(&self) -> EngineResult<Arc<Introspector>> {
        introspector(&self.introspector, self.is_connected(), || {
            Introspector::new(ENGINE)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::client::mock::{MockConnector, MockScript};
    use crate::engine::client::{RawColumn, TypeCode};
    use crate::engine::drivers::test_support;
    use crate::engine::error::ErrorKind;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    fn script(rows: usize) -> MockScript {
        MockScript::rows(rows)
            .with_columns(vec![
                RawColumn::new("id", TypeCode::Name("int".into())),
                RawColumn::new("name", TypeCode::Name("nvarchar".into())),
                RawColumn::new("amount", TypeCode::Name("money".into())),
            ])
            .cancel_support(CancelSupport::None)
    }

    async fn connected(script: MockScript) -> (Arc<MockConnector>, SqlServerAdapter) {
        let connector = MockConnector::new(script);
        let adapter = SqlServerAdapter::new(connector.clone());
        adapter.initialize(&test_support::sqlserver()).await.unwrap();
        (connector, adapter)
    }

    #[tokio::test]
    async fn stream_is_cancelled_after_the_limit() {
        let (connector, adapter) = connected(script(50)).await;

        let result = adapter.query("SELECT * FROM Orders", &[], Some(10), None).await.unwrap();
        assert_eq!(result.row_count, 10);
        assert!(result.has_more_rows);

        let probe = &connector.connection(0).probe;
        assert_eq!(probe.stream_pauses.load(Ordering::SeqCst), 1);
        assert_eq!(probe.stream_cancels.load(Ordering::SeqCst), 1);
        assert_eq!(probe.stream_rows_delivered.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn unlimited_stream_reads_to_done() {
        let (_, adapter) = connected(script(8)).await;
        let result = adapter.query("SELECT * FROM Orders", &[], None, None).await.unwrap();
        assert_eq!(result.row_count, 8);
        assert!(!result.has_more_rows);
        assert_eq!(result.fields[2].field_type, "money");
    }

    #[tokio::test]
    async fn times_out_without_asking_the_server_to_cancel() {
        let (connector, adapter) = connected(script(1).hanging()).await;
        assert_eq!(adapter.cancel_support(), CancelSupport::None);

        let started = Instant::now();
        let err = adapter.query("WAITFOR DELAY '01:00'", &[], None, Some(40)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryTimeout);
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.connection(0).probe.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn login_failures_are_authentication_errors() {
        let connector = MockConnector::new(script(0));
        connector.fail_connects(Some("Login failed for user 'sa'."));
        let adapter = SqlServerAdapter::new(connector);

        let err = adapter.initialize(&test_support::sqlserver()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationError);
    }
}
