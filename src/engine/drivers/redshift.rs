//! Redshift adapter
//!
//! Redshift speaks the PostgreSQL protocol but its client is a bare
//! connection factory, so the adapter keeps its own bounded pool. Every
//! operation checks a handle out and gives it back, whatever the outcome.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{info, instrument};

use super::{effective_timeout, expect_credentials, introspector, probe, run_query, run_write};
use crate::engine::client::Connector;
use crate::engine::credentials::Credentials;
use crate::engine::error::{DataSourceError, EngineResult};
use crate::engine::introspection::Introspector;
use crate::engine::pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
use crate::engine::row_limit::RowLimitStrategy;
use crate::engine::timeout::DEFAULT_QUERY_TIMEOUT_MS;
use crate::engine::traits::DatabaseAdapter;
use crate::engine::types::{
    AdapterQueryResult, CancelSupport, DataSourceType, Value, WriteResult,
};

const ENGINE: DataSourceType = DataSourceType::Redshift;

pub struct RedshiftAdapter {
    connector: Arc<dyn Connector>,
    pool_config: PoolConfig,
    default_timeout_ms: u64,
    pool: RwLock<Option<Arc<ConnectionPool>>>,
    introspector: OnceCell<Arc<Introspector>>,
}

impl RedshiftAdapter {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            pool_config: PoolConfig::default(),
            default_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            pool: RwLock::new(None),
            introspector: OnceCell::new(),
        }
    }

    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn with_query_timeout(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    fn pool(&self) -> EngineResult<Arc<ConnectionPool>> {
        self.pool
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| DataSourceError::not_connected(ENGINE))
    }

    fn replace_pool(&self, pool: Option<Arc<ConnectionPool>>) -> Option<Arc<ConnectionPool>> {
        match self.pool.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, pool),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), pool),
        }
    }

    async fn checkout(&self) -> EngineResult<(Arc<ConnectionPool>, PooledConnection)> {
        let pool = self.pool()?;
        let handle = pool.acquire_default().await?;
        Ok((pool, handle))
    }

    pub async fn pool_stats(&self) -> Option<PoolStats> {
        let pool = self.pool().ok()?;
        Some(pool.stats().await)
    }
}

#[async_trait]
impl DatabaseAdapter for RedshiftAdapter {
    fn data_source_type(&self) -> DataSourceType {
        ENGINE
    }

    fn row_limit_strategy(&self) -> RowLimitStrategy {
        RowLimitStrategy::ServerCursor
    }

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::Driver
    }

    fn is_connected(&self) -> bool {
        self.pool.read().map(|guard| guard.is_some()).unwrap_or(false)
    }

    #[instrument(skip(self, credentials), fields(data_source = %ENGINE))]
    async fn initialize(&self, credentials: &Credentials) -> EngineResult<()> {
        expect_credentials(ENGINE, credentials)?;
        let pool = ConnectionPool::new(
            self.pool_config.clone(),
            self.connector.clone(),
            credentials.clone(),
        );
        pool.initialize().await?;
        if let Some(previous) = self.replace_pool(Some(pool)) {
            previous.close().await;
        }
        info!("Redshift adapter connected");
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
        let timeout_ms = effective_timeout(timeout_ms, self.default_timeout_ms);
        let (pool, handle) = self.checkout().await?;
        let result = run_query(
            ENGINE,
            handle.connection(),
            self.row_limit_strategy(),
            sql,
            params,
            max_rows,
            timeout_ms,
        )
        .await;
        pool.release(handle).await;
        result
    }

    #[instrument(skip(self, sql, params), fields(data_source = %ENGINE))]
    async fn execute_write(
        &self,
        sql: &str,
        params: &[Value],
        timeout_ms: Option<u64>,
    ) -> EngineResult<WriteResult> {
        let timeout_ms = effective_timeout(timeout_ms, self.default_timeout_ms);
        let (pool, handle) = self.checkout().await?;
        let result = run_write(ENGINE, handle.connection(), sql, params, timeout_ms).await;
        pool.release(handle).await;
        result
    }

    async fn test_connection(&self) -> bool {
        let Ok((pool, handle)) = self.checkout().await else {
            return false;
        };
        let ok = probe(handle.connection()).await;
        pool.release(handle).await;
        ok
    }

    async fn close(&self) {
        if let Some(pool) = self.replace_pool(None) {
            pool.close().await;
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
    use crate::engine::drivers::test_support;
    use crate::engine::error::ErrorKind;
    use std::time::Duration;

    fn adapter(connector: &Arc<MockConnector>, max: usize) -> RedshiftAdapter {
        RedshiftAdapter::new(connector.clone()).with_pool_config(
            PoolConfig::default()
                .with_min_connections(1)
                .with_max_connections(max)
                .with_acquire_timeout(Duration::from_millis(100))
                .with_sweep_interval(Duration::from_secs(3600)),
        )
    }

    #[tokio::test]
    async fn initialize_warms_the_pool() {
        let connector = MockConnector::new(MockScript::rows(3));
        let adapter = adapter(&connector, 4);
        adapter.initialize(&test_support::redshift()).await.unwrap();

        assert!(adapter.is_connected());
        let stats = adapter.pool_stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn postgres_credentials_are_rejected() {
        let connector = MockConnector::new(MockScript::rows(3));
        let adapter = adapter(&connector, 4);
        let err = adapter.initialize(&test_support::postgres()).await.unwrap_err();
        assert_eq!(err.message(), "Invalid credentials type. Expected redshift, got postgres");
    }

    #[tokio::test]
    async fn handles_return_to_the_pool_after_success_and_failure() {
        let connector = MockConnector::new(MockScript::rows(30));
        let adapter = adapter(&connector, 2);
        adapter.initialize(&test_support::redshift()).await.unwrap();

        let result = adapter.query("SELECT * FROM events", &[], Some(5), None).await.unwrap();
        assert_eq!(result.row_count, 5);
        assert!(result.has_more_rows);
        assert_eq!(adapter.pool_stats().await.unwrap().in_use, 0);

        connector.connection(0).set_healthy(false);
        connector.set_script(MockScript::rows(0).failing("column \"nope\" does not exist"));
        let err = adapter.query("SELECT nope FROM events", &[], None, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryExecutionError);

        let stats = adapter.pool_stats().await.unwrap();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn timed_out_queries_still_release_their_handle() {
        let connector = MockConnector::new(MockScript::rows(1).hanging());
        let adapter = adapter(&connector, 1);
        adapter.initialize(&test_support::redshift()).await.unwrap();

        let err = adapter.query("SELECT 1", &[], None, Some(30)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryTimeout);
        assert_eq!(adapter.pool_stats().await.unwrap().in_use, 0);
    }

    #[tokio::test]
    async fn close_drains_the_pool() {
        let connector = MockConnector::new(MockScript::rows(1));
        let adapter = adapter(&connector, 2);
        adapter.initialize(&test_support::redshift()).await.unwrap();
        assert!(adapter.test_connection().await);

        adapter.close().await;
        assert!(!adapter.is_connected());
        assert!(connector.connection(0).is_closed());
        assert!(!adapter.test_connection().await);
        assert!(adapter.pool_stats().await.is_none());
    }
}
