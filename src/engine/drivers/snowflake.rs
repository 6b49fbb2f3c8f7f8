//! Snowflake adapter
//!
//! Snowflake logins are slow, so the adapter borrows its connection from an
//! injected `WarmConnectionCache`. Closing the adapter leaves a cached
//! connection alive for the next adapter with the same credentials.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{debug, info, instrument};

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
use crate::engine::warm_cache::WarmConnectionCache;

const ENGINE: DataSourceType = DataSourceType::Snowflake;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnowflakeConnectionStats {
    pub connected: bool,
    pub credential_key: Option<String>,
    pub is_warm_connection: bool,
    pub warm_age_ms: Option<u128>,
}

pub struct SnowflakeAdapter {
    connector: Arc<dyn Connector>,
    warm_cache: Arc<WarmConnectionCache>,
    default_timeout_ms: u64,
    slot: ConnectionSlot,
    fingerprint: RwLock<Option<String>>,
    introspector: OnceCell<Arc<Introspector>>,
}

impl SnowflakeAdapter {
    pub fn new(connector: Arc<dyn Connector>, warm_cache: Arc<WarmConnectionCache>) -> Self {
        Self {
            connector,
            warm_cache,
            default_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            slot: ConnectionSlot::new(ENGINE),
            fingerprint: RwLock::new(None),
            introspector: OnceCell::new(),
        }
    }

    pub fn with_query_timeout(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    fn set_fingerprint(&self, fingerprint: Option<String>) {
        match self.fingerprint.write() {
            Ok(mut guard) => *guard = fingerprint,
            Err(poisoned) => *poisoned.into_inner() = fingerprint,
        }
    }

    pub async fn connection_stats(&self) -> SnowflakeConnectionStats {
        let is_warm_connection = match self.slot.get() {
            Ok(conn) => self.warm_cache.holds(&conn).await,
            Err(_) => false,
        };
        SnowflakeConnectionStats {
            connected: self.is_connected(),
            credential_key: self.fingerprint.read().ok().and_then(|guard| guard.clone()),
            is_warm_connection,
            warm_age_ms: self.warm_cache.stats().await.age_ms,
        }
    }
}

#[async_trait]
impl DatabaseAdapter for SnowflakeAdapter {
    fn data_source_type(&self) -> DataSourceType {
        ENGINE
    }

    fn row_limit_strategy(&self) -> RowLimitStrategy {
        RowLimitStrategy::NativeCap
    }

    fn cancel_support(&self) -> CancelSupport {
        self.slot
            .get()
            .map(|conn| conn.cancel_support())
            .unwrap_or(CancelSupport::BestEffort)
    }

    fn is_connected(&self) -> bool {
        self.slot.is_set()
    }

    #[instrument(skip(self, credentials), fields(data_source = %ENGINE))]
    async fn initialize(&self, credentials: &Credentials) -> EngineResult<()> {
        expect_credentials(ENGINE, credentials)?;
        let conn = self
            .warm_cache
            .checkout(credentials, self.connector.as_ref())
            .await
            .classify_err(ErrorContext::new(ENGINE, "initialize"))?;
        if let Some(previous) = self.slot.set(conn) {
            if !self.warm_cache.retains(&previous).await {
                close_quietly(ENGINE, previous).await;
            }
        }
        self.set_fingerprint(Some(credentials.fingerprint()));
        info!("Snowflake adapter connected");
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
        let Some(conn) = self.slot.take() else {
            return;
        };
        self.set_fingerprint(None);
        if self.warm_cache.retains(&conn).await {
            debug!("Keeping warm Snowflake connection for reuse");
        } else {
            close_quietly(ENGINE, conn).await;
        }
    }

    fn introspect(&self) -> EngineResult<Arc<Introspector>> {
        introspector(&self.introspector, self.is_connected(), || {
            Introspector::new(ENGINE)
        })
    }
}
