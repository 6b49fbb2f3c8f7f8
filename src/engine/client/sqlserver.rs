//! SQL Server client (tiberius)
//!
//! The TDS connection is not shareable, so it lives behind an async mutex.
//! Row streams are driven by a background task that owns the lock for the
//! lifetime of the stream and forwards events over a bounded channel.
//! Cancelling a stream stops reading the result; the statement itself keeps
//! running on the server until it finishes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, ColumnData, ColumnType, Config, EncryptionLevel, QueryItem, ToSql};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use super::{
    rewrite_placeholders, ClientConnection, ClientError, ClientResult, Connector, RawColumn,
    RawResultSet, RawRow, RowStream, StreamEvent, TypeCode,
};
use crate::engine::credentials::{Credentials, DEFAULT_CONNECTION_TIMEOUT_MS, SQLSERVER_DEFAULT_PORT};
use crate::engine::types::{CancelSupport, Value};

type TdsClient = Client<Compat<TcpStream>>;

/// Events buffered between the driver task and the consumer.
const STREAM_BUFFER: usize = 256;

#[derive(Debug, Default, Clone, Copy)]
pub struct SqlServerConnector;

impl SqlServerConnector {
    pub fn build_config(credentials: &Credentials) -> ClientResult<(Config, Duration)> {
        let Credentials::SqlServer(c) = credentials else {
            return Err(ClientError::message(format!(
                "Invalid credentials type for the SQL Server client: {}",
                credentials.data_source_type()
            )));
        };

        let mut config = Config::new();
        config.host(&c.server);
        config.port(c.port.unwrap_or(SQLSERVER_DEFAULT_PORT));
        config.authentication(AuthMethod::sql_server(&c.username, &c.password));
        if let Some(database) = c.database_name() {
            config.database(database);
        }
        if let Some(instance) = c.instance.as_deref().filter(|i| !i.trim().is_empty()) {
            config.instance_name(instance);
        }
        config.encryption(if c.encrypt {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        });
        if c.trust_server_certificate {
            config.trust_cert();
        }

        let timeout = Duration::from_millis(
            c.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT_MS),
        );
        Ok((config, timeout))
    }
}

#[async_trait]
impl Connector for SqlServerConnector {
    async fn connect(&self, credentials: &Credentials) -> ClientResult<Arc<dyn ClientConnection>> {
        let (config, connect_timeout) = Self::build_config(credentials)?;
        let connect = async {
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true).ok();
            let client = Client::connect(config, tcp.compat_write()).await?;
            Ok::<_, ClientError>(client)
        };
        let client = match tokio::time::timeout(connect_timeout, connect).await {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::connect_timeout(connect_timeout)),
        };
        debug!("SQL Server connection established");
        Ok(Arc::new(SqlServerClient {
            client: Arc::new(Mutex::new(Some(client))),
        }))
    }
}

pub struct SqlServerClient {
    client: Arc<Mutex<Option<TdsClient>>>,
}

impl ToSql for Value {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            Value::Null | Value::Array(_) => ColumnData::String(None),
            Value::Bool(b) => ColumnData::Bit(Some(*b)),
            Value::Int(i) => ColumnData::I64(Some(*i)),
            Value::Float(f) => ColumnData::F64(Some(*f)),
            Value::Text(s) => ColumnData::String(Some(s.as_str().into())),
            Value::Date(dt) => ColumnData::String(Some(dt.to_rfc3339().into())),
            Value::Bytes(b) => ColumnData::Binary(Some(b.as_slice().into())),
            Value::Json(j) => ColumnData::String(Some(j.to_string().into())),
        }
    }
}

/// `?` placeholders become tiberius' `@P1, @P2, ...`
fn to_tds_sql(sql: &str) -> String {
    rewrite_placeholders(sql, |index| format!("@P{}", index + 1))
}

fn type_name(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Bit | ColumnType::Bitn => "bit",
        ColumnType::Int1 => "tinyint",
        ColumnType::Int2 => "smallint",
        ColumnType::Int4 | ColumnType::Intn => "int",
        ColumnType::Int8 => "bigint",
        ColumnType::Float4 => "real",
        ColumnType::Float8 | ColumnType::Floatn => "float",
        ColumnType::Money | ColumnType::Money4 => "money",
        ColumnType::Decimaln => "decimal",
        ColumnType::Numericn => "numeric",
        ColumnType::Datetime | ColumnType::Datetimen => "datetime",
        ColumnType::Datetime4 => "smalldatetime",
        ColumnType::Datetime2 => "datetime2",
        ColumnType::DatetimeOffsetn => "datetimeoffset",
        ColumnType::Daten => "date",
        ColumnType::Timen => "time",
        ColumnType::Guid => "uniqueidentifier",
        ColumnType::BigVarChar => "varchar",
        ColumnType::BigChar => "char",
        ColumnType::NVarchar => "nvarchar",
        ColumnType::NChar => "nchar",
        ColumnType::Text => "text",
        ColumnType::NText => "ntext",
        ColumnType::BigVarBin => "varbinary",
        ColumnType::BigBinary => "binary",
        ColumnType::Image => "image",
        ColumnType::Xml => "xml",
        _ => "sql_variant",
    }
}

fn raw_columns(columns: &[tiberius::Column]) -> Vec<RawColumn> {
    columns
        .iter()
        .map(|col| {
            RawColumn::new(
                col.name(),
                TypeCode::Name(type_name(col.column_type()).to_string()),
            )
        })
        .collect()
}

fn convert_cell(data: &ColumnData<'_>) -> Value {
    match data {
        ColumnData::Bit(Some(b)) => Value::Bool(*b),
        ColumnData::U8(Some(v)) => Value::Int(*v as i64),
        ColumnData::I16(Some(v)) => Value::Int(*v as i64),
        ColumnData::I32(Some(v)) => Value::Int(*v as i64),
        ColumnData::I64(Some(v)) => Value::Int(*v),
        ColumnData::F32(Some(v)) => Value::Float(*v as f64),
        ColumnData::F64(Some(v)) => Value::Float(*v),
        // Exact decimal text; normalization turns it into a number
        ColumnData::Numeric(Some(n)) => {
            match Decimal::try_from_i128_with_scale(n.value(), n.scale() as u32) {
                Ok(decimal) => Value::Text(decimal.to_string()),
                Err(_) => Value::Float(n.value() as f64 / 10f64.powi(n.scale() as i32)),
            }
        }
        ColumnData::String(Some(s)) => Value::Text(s.to_string()),
        ColumnData::Guid(Some(g)) => Value::Text(g.to_string()),
        ColumnData::Binary(Some(b)) => Value::Bytes(b.to_vec()),
        ColumnData::Xml(Some(xml)) => Value::Text(xml.to_string()),
        _ => Value::Null,
    }
}

fn convert_row(row: &tiberius::Row) -> RawRow {
    row.cells()
        .enumerate()
        .map(|(i, (_col, data))| match data {
            ColumnData::DateTime(Some(_))
            | ColumnData::SmallDateTime(Some(_))
            | ColumnData::DateTime2(Some(_)) => row
                .try_get::<chrono::NaiveDateTime, _>(i)
                .ok()
                .flatten()
                .map(|dt| Value::Date(dt.and_utc()))
                .unwrap_or(Value::Null),
            ColumnData::DateTimeOffset(Some(_)) => row
                .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                .ok()
                .flatten()
                .map(Value::Date)
                .unwrap_or(Value::Null),
            ColumnData::Date(Some(_)) => row
                .try_get::<chrono::NaiveDate, _>(i)
                .ok()
                .flatten()
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
            ColumnData::Time(Some(_)) => row
                .try_get::<chrono::NaiveTime, _>(i)
                .ok()
                .flatten()
                .map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null),
            _ => convert_cell(data),
        })
        .collect()
}

#[async_trait]
impl ClientConnection for SqlServerClient {
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
        max_results: Option<usize>,
    ) -> ClientResult<RawResultSet> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(ClientError::Closed)?;

        let tds_sql = to_tds_sql(sql);
        let bound: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let mut stream = client.query(tds_sql.as_str(), &bound).await?;

        let mut result = RawResultSet::default();
        while let Some(item) = stream.try_next().await? {
            match item {
                QueryItem::Metadata(meta) if meta.result_index() == 0 => {
                    result.columns = raw_columns(meta.columns());
                }
                QueryItem::Metadata(_) => break,
                QueryItem::Row(row) => {
                    if max_results.is_some_and(|limit| result.rows.len() >= limit) {
                        break;
                    }
                    result.rows.push(convert_row(&row));
                }
            }
        }
        Ok(result)
    }

    async fn open_stream(&self, sql: &str, params: &[Value]) -> ClientResult<Box<dyn RowStream>> {
        let guard = self.client.clone().lock_owned().await;
        if guard.is_none() {
            return Err(ClientError::Closed);
        }

        let (events_tx, events_rx) = mpsc::channel(STREAM_BUFFER);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let tds_sql = to_tds_sql(sql);
        let params = params.to_vec();

        tokio::spawn(async move {
            let mut guard = guard;
            let mut cancel_rx = cancel_rx;
            let Some(client) = guard.as_mut() else {
                return;
            };
            let bound: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
            let mut stream = match client.query(tds_sql.as_str(), &bound).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = events_tx.send(Err(err.into())).await;
                    return;
                }
            };

            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => {
                        debug!("SQL Server stream cancelled");
                        break;
                    }
                    item = stream.try_next() => match item {
                        Ok(Some(QueryItem::Metadata(meta))) => {
                            if meta.result_index() > 0 {
                                break;
                            }
                            let columns = raw_columns(meta.columns());
                            if events_tx.send(Ok(StreamEvent::Columns(columns))).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(QueryItem::Row(row))) => {
                            if events_tx.send(Ok(StreamEvent::Row(convert_row(&row)))).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            let _ = events_tx.send(Err(err.into())).await;
                            return;
                        }
                    }
                }
            }
            drop(stream);
            let _ = events_tx.send(Ok(StreamEvent::Done)).await;
        });

        Ok(Box::new(ChannelRowStream {
            events: events_rx,
            cancel: Some(cancel_tx),
            paused: false,
        }))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> ClientResult<u64> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(ClientError::Closed)?;
        let tds_sql = to_tds_sql(sql);
        let bound: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let result = client.execute(tds_sql.as_str(), &bound).await?;
        Ok(result.total())
    }

    async fn ping(&self) -> bool {
        let mut guard = self.client.lock().await;
        let Some(client) = guard.as_mut() else {
            return false;
        };
        let alive = match client.simple_query("SELECT 1").await {
            Ok(stream) => stream.into_results().await.is_ok(),
            Err(_) => false,
        };
        alive
    }

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::None
    }

    async fn close(&self) -> ClientResult<()> {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            client.close().await?;
        }
        Ok(())
    }
}

/// Consumer side of a driver-task row stream.
struct ChannelRowStream {
    events: mpsc::Receiver<ClientResult<StreamEvent>>,
    cancel: Option<oneshot::Sender<()>>,
    paused: bool,
}

#[async_trait]
impl RowStream for ChannelRowStream {
    async fn next_event(&mut self) -> Option<ClientResult<StreamEvent>> {
        self.events.recv().await
    }

    fn pause(&mut self) {
        // The bounded channel applies backpressure once we stop reading
        self.paused = true;
    }

    async fn cancel(&mut self) -> ClientResult<()> {
        if let Some(cancel) = self.cancel.take() {
            if cancel.send(()).is_err() {
                warn!("SQL Server stream already finished before cancel");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_placeholders_for_tds() {
        assert_eq!(
            to_tds_sql("SELECT * FROM t WHERE id = ? AND name = ?"),
            "SELECT * FROM t WHERE id = @P1 AND name = @P2"
        );
    }

    #[test]
    fn values_bind_as_tds_column_data() {
        assert!(matches!(Value::Int(5).to_sql(), ColumnData::I64(Some(5))));
        assert!(matches!(Value::Null.to_sql(), ColumnData::String(None)));
        assert!(matches!(Value::Bool(true).to_sql(), ColumnData::Bit(Some(true))));
    }

    #[test]
    fn decimal_cells_keep_precision_as_text() {
        let numeric = tiberius::numeric::Numeric::new_with_scale(123_450, 2);
        assert_eq!(
            convert_cell(&ColumnData::Numeric(Some(numeric))),
            Value::Text("1234.50".into())
        );
    }

    #[test]
    fn config_requires_sqlserver_credentials() {
        let creds = Credentials::Postgres(Default::default());
        assert!(SqlServerConnector::build_config(&creds).is_err());
    }
}
