//! Data Source Manager
//!
//! Named data sources with lazily created adapters. This is the single
//! place where adapters live; callers address them by name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{instrument, warn};

use crate::engine::credentials::Credentials;
use crate::engine::error::{format_for_user, DataSourceError, EngineResult, ErrorKind};
use crate::engine::introspection::{ColumnInfo, Introspector, SchemaInfo, TableInfo};
use crate::engine::registry::{AdapterFactory, ConnectorRegistry};
use crate::engine::traits::DatabaseAdapter;
use crate::engine::types::{AdapterQueryResult, DataSourceType, FieldMetadata, Record, Value};
use crate::settings::AdapterSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    pub credentials: Credentials,
}

impl DataSourceConfig {
    pub fn new(name: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            name: name.into(),
            credentials,
        }
    }

    pub fn data_source_type(&self) -> DataSourceType {
        self.credentials.data_source_type()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSourceManagerConfig {
    pub data_sources: Vec<DataSourceConfig>,
    #[serde(default)]
    pub default_data_source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub max_rows: Option<i64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }

    pub fn on(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = Some(data_source.into());
        self
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_max_rows(mut self, max_rows: i64) -> Self {
        self.options.max_rows = Some(max_rows);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Failure as shown to callers: the fixed user sentence, never driver text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&DataSourceError> for QueryError {
    fn from(error: &DataSourceError) -> Self {
        Self {
            kind: error.kind(),
            message: format_for_user(error).to_string(),
            retryable: error.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    pub rows: Vec<Record>,
    pub columns: Vec<FieldMetadata>,
    pub row_count: usize,
    pub has_more_rows: bool,
    pub execution_time_ms: u64,
    pub data_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
}

impl QueryResponse {
    fn failure(data_source: Option<String>, error: &DataSourceError, started: Instant) -> Self {
        Self {
            success: false,
            rows: Vec::new(),
            columns: Vec::new(),
            row_count: 0,
            has_more_rows: false,
            execution_time_ms: started.elapsed().as_millis() as u64,
            data_source,
            error: Some(QueryError::from(error)),
        }
    }
}

pub struct DataSourceManager {
    factory: AdapterFactory,
    default_data_source: Option<String>,
    data_sources: RwLock<BTreeMap<String, DataSourceConfig>>,
    adapters: RwLock<HashMap<String, Arc<dyn DatabaseAdapter>>>,
    /// Serializes adapter creation so one name never gets two adapters
    creating: Mutex<()>,
}

impl DataSourceManager {
    pub fn new(config: DataSourceManagerConfig, factory: AdapterFactory) -> Self {
        let data_sources = config
            .data_sources
            .into_iter()
            .map(|ds| (ds.name.clone(), ds))
            .collect();
        Self {
            factory,
            default_data_source: config.default_data_source,
            data_sources: RwLock::new(data_sources),
            adapters: RwLock::new(HashMap::new()),
            creating: Mutex::new(()),
        }
    }

    /// Manager over the connectors shipped with the crate, using settings
    /// from the user config file and environment.
    pub fn with_builtin_drivers(config: DataSourceManagerConfig) -> Self {
        let factory = AdapterFactory::new(
            ConnectorRegistry::with_builtin_drivers(),
            AdapterSettings::load(),
        );
        Self::new(config, factory)
    }

    pub fn factory(&self) -> &AdapterFactory {
        &self.factory
    }

    /// Explicit name, then the configured default, then the only configured
    /// data source.
    async fn resolve(&self, requested: Option<&str>) -> EngineResult<String> {
        let data_sources = self.data_sources.read().await;

        if let Some(name) = requested.filter(|n| !n.trim().is_empty()) {
            return if data_sources.contains_key(name) {
                Ok(name.to_string())
            } else {
                Err(DataSourceError::configuration(format!(
                    "Specified data source '{}' not found",
                    name
                )))
            };
        }

        if let Some(name) = &self.default_data_source {
            return if data_sources.contains_key(name) {
                Ok(name.clone())
            } else {
                Err(DataSourceError::configuration(format!(
                    "Default data source '{}' not found",
                    name
                )))
            };
        }

        match data_sources.len() {
            1 => Ok(data_sources.keys().next().cloned().unwrap_or_default()),
            0 => Err(DataSourceError::configuration("No data sources configured")),
            _ => Err(DataSourceError::configuration(
                "No data source specified and no default data source configured",
            )),
        }
    }

    async fn adapter(&self, name: &str) -> EngineResult<Arc<dyn DatabaseAdapter>> {
        if let Some(adapter) = self.adapters.read().await.get(name) {
            return Ok(adapter.clone());
        }

        let _creating = self.creating.lock().await;
        if let Some(adapter) = self.adapters.read().await.get(name) {
            return Ok(adapter.clone());
        }

        let credentials = self
            .data_sources
            .read()
            .await
            .get(name)
            .map(|ds| ds.credentials.clone())
            .ok_or_else(|| {
                DataSourceError::configuration(format!("Data source '{}' not found", name))
            })?;

        let adapter = self.factory.create_adapter(&credentials).await?;
        self.adapters
            .write()
            .await
            .insert(name.to_string(), adapter.clone());
        Ok(adapter)
    }

    /// Runs a request and wraps the outcome in a response envelope. Never
    /// fails; errors come back with `success: false`.
    #[instrument(skip(self, request), fields(data_source = ?request.data_source))]
    pub async fn execute(&self, request: QueryRequest) -> QueryResponse {
        let started = Instant::now();

        let name = match self.resolve(request.data_source.as_deref()).await {
            Ok(name) => name,
            Err(err) => {
                warn!(error = %err, "Could not resolve data source");
                return QueryResponse::failure(request.data_source, &err, started);
            }
        };

        let outcome: EngineResult<AdapterQueryResult> = async {
            let adapter = self.adapter(&name).await?;
            adapter
                .query(
                    &request.sql,
                    &request.params,
                    request.options.max_rows,
                    request.options.timeout_ms,
                )
                .await
        }
        .await;

        match outcome {
            Ok(result) => QueryResponse {
                success: true,
                row_count: result.row_count,
                has_more_rows: result.has_more_rows,
                rows: result.rows,
                columns: result.fields,
                execution_time_ms: started.elapsed().as_millis() as u64,
                data_source: Some(name),
                error: None,
            },
            Err(err) => {
                warn!(data_source = %name, kind = %err.kind(), error = %err, "Query failed");
                QueryResponse::failure(Some(name), &err, started)
            }
        }
    }

    /// Adapter and introspector for `name` (or the default data source).
    pub async fn introspect(
        &self,
        name: Option<&str>,
    ) -> EngineResult<(Arc<dyn DatabaseAdapter>, Arc<Introspector>)> {
        let name = self.resolve(name).await?;
        let adapter = self.adapter(&name).await?;
        let introspector = adapter.introspect()?;
        Ok((adapter, introspector))
    }

    pub async fn get_schemas(&self, name: Option<&str>) -> EngineResult<Vec<SchemaInfo>> {
        let (adapter, introspector) = self.introspect(name).await?;
        introspector.get_schemas(adapter.as_ref()).await
    }

    pub async fn get_tables(
        &self,
        name: Option<&str>,
        schema: Option<&str>,
    ) -> EngineResult<Vec<TableInfo>> {
        let (adapter, introspector) = self.introspect(name).await?;
        introspector.get_tables(adapter.as_ref(), schema).await
    }

    pub async fn get_columns(
        &self,
        name: Option<&str>,
        schema: Option<&str>,
        table: Option<&str>,
    ) -> EngineResult<Vec<ColumnInfo>> {
        let (adapter, introspector) = self.introspect(name).await?;
        introspector.get_columns(adapter.as_ref(), schema, table).await
    }

    /// False when the adapter cannot be created or the round trip fails.
    #[instrument(skip(self))]
    pub async fn test_connection(&self, name: &str) -> bool {
        match self.adapter(name).await {
            Ok(adapter) => adapter.test_connection().await,
            Err(err) => {
                warn!(error = %err, "Connection test failed");
                false
            }
        }
    }

    pub async fn test_all(&self) -> BTreeMap<String, bool> {
        let names = self.data_sources().await;
        let mut results = BTreeMap::new();
        for name in names {
            let ok = self.test_connection(&name).await;
            results.insert(name, ok);
        }
        results
    }

    pub async fn data_sources(&self) -> Vec<String> {
        self.data_sources.read().await.keys().cloned().collect()
    }

    pub async fn data_source_config(&self, name: &str) -> Option<DataSourceConfig> {
        self.data_sources.read().await.get(name).cloned()
    }

    pub async fn data_sources_by_type(&self, engine: DataSourceType) -> Vec<DataSourceConfig> {
        self.data_sources
            .read()
            .await
            .values()
            .filter(|ds| ds.data_source_type() == engine)
            .cloned()
            .collect()
    }

    /// Registers a data source and connects to it; rolled back if the
    /// connection fails.
    #[instrument(skip(self, config), fields(name = %config.name))]
    pub async fn add_data_source(&self, config: DataSourceConfig) -> EngineResult<()> {
        let name = config.name.clone();
        {
            let mut data_sources = self.data_sources.write().await;
            if data_sources.contains_key(&name) {
                return Err(DataSourceError::configuration(format!(
                    "Data source with name '{}' already exists",
                    name
                )));
            }
            data_sources.insert(name.clone(), config);
        }

        if let Err(err) = self.adapter(&name).await {
            self.data_sources.write().await.remove(&name);
            return Err(err);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove_data_source(&self, name: &str) {
        let adapter = self.adapters.write().await.remove(name);
        if let Some(adapter) = adapter {
            adapter.close().await;
        }
        self.data_sources.write().await.remove(name);
    }

    /// Swaps the credentials of `name` and reconnects. The previous
    /// credentials are restored if the new ones fail.
    #[instrument(skip(self, credentials))]
    pub async fn update_data_source(&self, name: &str, credentials: Credentials) -> EngineResult<()> {
        let previous = {
            let mut data_sources = self.data_sources.write().await;
            let entry = data_sources.get_mut(name).ok_or_else(|| {
                DataSourceError::configuration(format!("Data source '{}' not found", name))
            })?;
            std::mem::replace(&mut entry.credentials, credentials)
        };

        let stale = self.adapters.write().await.remove(name);
        if let Some(adapter) = stale {
            adapter.close().await;
        }

        if let Err(err) = self.adapter(name).await {
            if let Some(entry) = self.data_sources.write().await.get_mut(name) {
                entry.credentials = previous;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Closes every adapter. Configurations are kept; adapters are
    /// recreated on next use.
    pub async fn close(&self) {
        let adapters: Vec<_> = self.adapters.write().await.drain().map(|(_, a)| a).collect();
        join_all(adapters.iter().map(|adapter| adapter.close())).await;
    }
}
