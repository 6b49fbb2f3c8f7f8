//! BigQuery adapter
//!
//! BigQuery takes named parameters only, so positional `?` markers are
//! rewritten to `@param0, @param1, ...` before the query reaches the
//! client. Row limits use the job's native `maxResults`.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{info, instrument};

use super::{
    close_quietly, effective_timeout, expect_credentials, introspector, probe, run_query,
    run_write, ConnectionSlot,
};
use crate::engine::client::{rewrite_placeholders, Connector};
use crate::engine::credentials::Credentials;
use crate::engine::error::{ClassifyExt, EngineResult, ErrorContext};
use crate::engine::introspection::Introspector;
use crate::engine::row_limit::RowLimitStrategy;
use crate::engine::timeout::DEFAULT_QUERY_TIMEOUT_MS;
use crate::engine::traits::DatabaseAdapter;
use crate::engine::types::{
    AdapterQueryResult, CancelSupport, DataSourceType, Value, WriteResult,
};

const ENGINE: DataSourceType = DataSourceType::BigQuery;

/// `?` placeholders to BigQuery named parameters. Without parameters the
/// text is left alone, so literal `?` characters survive.
pub fn to_named_parameters(sql: &str, params: &[Value]) -> String {
    if params.is_empty() {
        return sql.to_string();
    }
    rewrite_placeholders(sql, |index| format!("@param{index}"))
}

pub struct BigQueryAdapter {
    connector: Arc<dyn Connector>,
    default_timeout_ms: u64,
    slot: ConnectionSlot,
    location: RwLock<Option<String>>,
    introspector: OnceCell<Arc<Introspector>>,
}

impl BigQueryAdapter {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            default_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            slot: ConnectionSlot::new(ENGINE),
            location: RwLock::new(None),
            introspector: OnceCell::new(),
        }
    }

    pub fn with_query_timeout(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    fn region(&self) -> String {
        let location = self
            .location
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_else(|| crate::engine::credentials::BIGQUERY_DEFAULT_LOCATION.to_string());
        format!("region-{}", location.to_lowercase())
    }
}

#[async_trait]
impl DatabaseAdapter for BigQueryAdapter {
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
            .connector
            .connect(credentials)
            .await
            .classify_err(ErrorContext::new(ENGINE, "initialize"))?;
        if let Some(previous) = self.slot.set(conn) {
            close_quietly(ENGINE, previous).await;
        }
        if let (Credentials::BigQuery(c), Ok(mut location)) = (credentials, self.location.write()) {
            *location = Some(c.location().to_string());
        }
        info!("BigQuery adapter connected");
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
        let sql = to_named_parameters(sql, params);
        run_query(ENGINE, &conn, self.row_limit_strategy(), &sql, params, max_rows, timeout_ms).await
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
        let sql = to_named_parameters(sql, params);
        run_write(ENGINE, &conn, &sql, params, timeout_ms).await
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
            Introspector::new(ENGINE).with_catalog_prefix(self.region())
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
    use crate::engine::types::LogRecord;

    fn script(rows: usize) -> MockScript {
        MockScript::rows(rows).with_columns(vec![
            RawColumn::new("id", TypeCode::Name("INT64".into())),
            RawColumn::new("name", TypeCode::Name("STRING".into())),
            RawColumn::new("amount", TypeCode::Name("NUMERIC".into())),
        ])
    }

    async fn connected(script: MockScript) -> (Arc<MockConnector>, BigQueryAdapter) {
        let connector = MockConnector::new(script);
        let adapter = BigQueryAdapter::new(connector.clone());
        adapter.initialize(&test_support::bigquery()).await.unwrap();
        (connector, adapter)
    }

    #[tokio::test]
    async fn positional_parameters_become_named() {
        let (connector, adapter) = connected(script(3)).await;

        adapter
            .query(
                "SELECT * FROM sales.orders WHERE region = ? AND total > ?",
                &[Value::from("emea"), Value::Int(100)],
                Some(2),
                None,
            )
            .await
            .unwrap();

        let (sql, params, max_results) = connector.connection(0).probe.last_query().unwrap();
        assert_eq!(sql, "SELECT * FROM sales.orders WHERE region = @param0 AND total > @param1");
        assert_eq!(params.len(), 2);
        assert_eq!(max_results, Some(3));
    }

    #[tokio::test]
    async fn question_marks_survive_without_parameters() {
        let (connector, adapter) = connected(script(1)).await;

        adapter
            .query("SELECT JSON_QUERY(payload, '$.a?') AS a, '?' AS q FROM t", &[], None, None)
            .await
            .unwrap();

        let (sql, _, _) = connector.connection(0).probe.last_query().unwrap();
        assert_eq!(sql, "SELECT JSON_QUERY(payload, '$.a?') AS a, '?' AS q FROM t");
    }

    #[tokio::test]
    async fn hanging_query_times_out_and_is_cancelled() {
        let (connector, adapter) = connected(script(1).hanging()).await;

        let started = std::time::Instant::now();
        let err = adapter.query("SELECT 1", &[], None, Some(50)).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), ErrorKind::QueryTimeout);
        assert!(elapsed >= std::time::Duration::from_millis(50));
        assert!(elapsed < std::time::Duration::from_millis(1_000), "took {elapsed:?}");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let probe = &connector.connection(0).probe;
        assert_eq!(probe.cancels.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn has_more_rows_only_when_the_extra_row_exists() {
        let (_, adapter) = connected(script(3)).await;

        let capped = adapter.query("SELECT 1", &[], Some(2), None).await.unwrap();
        assert_eq!(capped.row_count, 2);
        assert!(capped.has_more_rows);

        let exact = adapter.query("SELECT 1", &[], Some(3), None).await.unwrap();
        assert_eq!(exact.row_count, 3);
        assert!(!exact.has_more_rows);
        assert_eq!(exact.fields[0].field_type, "bigint");
    }

    #[tokio::test]
    async fn log_records_use_named_parameters() {
        let (connector, adapter) = connected(script(0).affected(1)).await;
        let record = LogRecord {
            message_id: "m-9".into(),
            ..Default::default()
        };
        adapter.insert_log_record("acme-analytics", "logs", "chat", &record).await.unwrap();

        let (sql, _, _) = connector.connection(0).probe.last_query().unwrap();
        assert!(sql.starts_with("INSERT INTO `acme-analytics`.`logs`.`chat`"));
        assert!(sql.ends_with("VALUES (@param0, @param1, @param2, @param3, @param4, @param5, @param6, @param7, @param8, @param9)"));
    }

    #[tokio::test]
    async fn introspection_is_scoped_to_the_location() {
        let connector = MockConnector::new(script(0));
        let adapter = BigQueryAdapter::new(connector);
        let mut credentials = test_support::bigquery();
        if let Credentials::BigQuery(c) = &mut credentials {
            c.location = Some("EU".into());
        }
        adapter.initialize(&credentials).await.unwrap();

        let (sql, _) = adapter.introspect().unwrap().tables_query(None);
        assert!(sql.contains("`region-eu`.INFORMATION_SCHEMA.TABLES"));
    }

    #[tokio::test]
    async fn close_disconnects() {
        let (_, adapter) = connected(script(0)).await;
        adapter.close().await;
        assert!(!adapter.test_connection().await);

        let err = adapter.query("SELECT 1", &[], None, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }
}
