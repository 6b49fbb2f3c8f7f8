//! Connector registry and adapter factory
//!
//! Connectors are registered per engine; the factory picks the adapter for a
//! credentials variant, wires it to the registered connector and the shared
//! settings, and initializes it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::instrument;

use crate::engine::client::mysql::MySqlConnector;
use crate::engine::client::postgres::PgConnector;
use crate::engine::client::sqlserver::SqlServerConnector;
use crate::engine::client::Connector;
use crate::engine::credentials::Credentials;
use crate::engine::drivers::{
    BigQueryAdapter, MySqlAdapter, PostgresAdapter, RedshiftAdapter, SnowflakeAdapter,
    SqlServerAdapter,
};
use crate::engine::error::{DataSourceError, EngineResult};
use crate::engine::traits::DatabaseAdapter;
use crate::engine::types::DataSourceType;
use crate::engine::warm_cache::WarmConnectionCache;
use crate::settings::AdapterSettings;

/// Connectors available to the factory, keyed by engine
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<DataSourceType, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the connectors backed by drivers in this crate:
    /// PostgreSQL, Redshift, MySQL and SQL Server. Snowflake and BigQuery
    /// connectors must be registered by the caller.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        let pg: Arc<dyn Connector> = Arc::new(PgConnector);
        registry.register(DataSourceType::Postgres, pg.clone());
        registry.register(DataSourceType::Redshift, pg);
        registry.register(DataSourceType::MySql, Arc::new(MySqlConnector));
        registry.register(DataSourceType::SqlServer, Arc::new(SqlServerConnector));
        registry
    }

    pub fn register(&mut self, engine: DataSourceType, connector: Arc<dyn Connector>) {
        self.connectors.insert(engine, connector);
    }

    pub fn get(&self, engine: DataSourceType) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&engine).cloned()
    }

    pub fn list(&self) -> Vec<DataSourceType> {
        let mut engines: Vec<_> = self.connectors.keys().copied().collect();
        engines.sort_by_key(|engine| engine.as_str());
        engines
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

/// Builds initialized adapters. Holds the warm cache shared by every
/// Snowflake adapter it creates.
#[derive(Clone)]
pub struct AdapterFactory {
    connectors: ConnectorRegistry,
    settings: AdapterSettings,
    warm_cache: Arc<WarmConnectionCache>,
}

impl AdapterFactory {
    pub fn new(connectors: ConnectorRegistry, settings: AdapterSettings) -> Self {
        let warm_cache = Arc::new(WarmConnectionCache::new(settings.warm_reuse_window()));
        Self {
            connectors,
            settings,
            warm_cache,
        }
    }

    pub fn with_warm_cache(mut self, warm_cache: Arc<WarmConnectionCache>) -> Self {
        self.warm_cache = warm_cache;
        self
    }

    pub fn warm_cache(&self) -> &Arc<WarmConnectionCache> {
        &self.warm_cache
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    /// The adapter for `engine`, not yet initialized.
    pub fn build(&self, engine: DataSourceType) -> EngineResult<Arc<dyn DatabaseAdapter>> {
        let connector = self.connectors.get(engine).ok_or_else(|| {
            DataSourceError::configuration(format!(
                "No {} connector is registered",
                engine.display_name()
            ))
        })?;
        let timeout_ms = self.settings.default_query_timeout_ms;

        let adapter: Arc<dyn DatabaseAdapter> = match engine {
            DataSourceType::Postgres => {
                Arc::new(PostgresAdapter::new(connector).with_query_timeout(timeout_ms))
            }
            DataSourceType::MySql => {
                Arc::new(MySqlAdapter::new(connector).with_query_timeout(timeout_ms))
            }
            DataSourceType::SqlServer => Arc::new(
                SqlServerAdapter::new(connector)
                    .with_query_timeout(self.settings.sqlserver_query_timeout_ms),
            ),
            DataSourceType::Snowflake => Arc::new(
                SnowflakeAdapter::new(connector, self.warm_cache.clone())
                    .with_query_timeout(timeout_ms),
            ),
            DataSourceType::BigQuery => {
                Arc::new(BigQueryAdapter::new(connector).with_query_timeout(timeout_ms))
            }
            DataSourceType::Redshift => Arc::new(
                RedshiftAdapter::new(connector)
                    .with_pool_config(self.settings.pool_config())
                    .with_query_timeout(timeout_ms),
            ),
        };
        Ok(adapter)
    }

    /// Selects the adapter from the credentials variant and initializes it.
    #[instrument(skip(self, credentials), fields(data_source = %credentials.data_source_type()))]
    pub async fn create_adapter(&self, credentials: &Credentials) -> EngineResult<Arc<dyn DatabaseAdapter>> {
        let adapter = self.build(credentials.data_source_type())?;
        adapter.initialize(credentials).await?;
        Ok(adapter)
    }
}

/// One-shot factory with default settings.
pub async fn create_adapter(
    credentials: &Credentials,
    connectors: &ConnectorRegistry,
) -> EngineResult<Arc<dyn DatabaseAdapter>> {
    AdapterFactory::new(connectors.clone(), AdapterSettings::default())
        .create_adapter(credentials)
        .await
}
