//! MySQL adapter
//!
//! The client has no cursor, so reads run unbounded and are sliced in
//! memory. The full result is paid for remotely even when `max_rows` is
//! small.

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
use crate::engine::timeout::DEFAULT_QUERY_TIMEOUT_MS;
use crate::engine::traits::DatabaseAdapter;
use crate::engine::types::{
    AdapterQueryResult, CancelSupport, DataSourceType, Value, WriteResult,
};

const ENGINE: DataSourceType = DataSourceType::MySql;

pub struct MySqlAdapter {
    connector: Arc<dyn Connector>,
    default_timeout_ms: u64,
    slot: ConnectionSlot,
    introspector: OnceCell<Arc<Introspector>>,
}

impl MySqlAdapter {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            default_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
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
impl DatabaseAdapter for MySqlAdapter {
    fn data_source_type(&self) -> DataSourceType {
        ENGINE
    }

    fn row_limit_strategy(&self) -> RowLimitStrategy {
        RowLimitStrategy::Materialize
    }

    fn cancel_support(&self) -> CancelSupport {
        self.slot
            .get()
            .map(|conn| conn.cancel_support())
            .unwrap_or(CancelSupport::Driver)
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
        info!("MySQL adapter connected");
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
