//! Scripted in-memory client used by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ClientConnection, ClientError, ClientResult, Connector, RawColumn, RawResultSet, RawRow,
    RowCursor, RowStream, StreamEvent, TypeCode,
};
use crate::engine::credentials::Credentials;
use crate::engine::types::{CancelSupport, Value};

#[derive(Debug, Clone)]
pub struct MockScript {
    pub columns: Vec<RawColumn>,
    pub rows: Vec<RawRow>,
    /// Every query and statement sleeps this long before answering
    pub delay: Option<Duration>,
    /// Cursor reads sleep this long before answering
    pub read_delay: Option<Duration>,
    pub fail_with: Option<String>,
    /// Cursor reads fail after this many successful batches
    pub cursor_fail_after: Option<usize>,
    pub affected_rows: u64,
    pub cancel_support: CancelSupport,
}

impl MockScript {
    /// `count` rows of (id INT4, name TEXT, amount NUMERIC-as-text)
    pub fn rows(count: usize) -> Self {
        let columns = vec![
            RawColumn::new("id", TypeCode::Oid(23)),
            RawColumn::new("name", TypeCode::Oid(25)),
            RawColumn::new("amount", TypeCode::Oid(1700)),
        ];
        let rows = (1..=count)
            .map(|i| {
                vec![
                    Value::Int(i as i64),
                    Value::Text(format!("row-{i}")),
                    Value::Text(format!("{i}.50")),
                ]
            })
            .collect();
        Self {
            columns,
            rows,
            delay: None,
            read_delay: None,
            fail_with: None,
            cursor_fail_after: None,
            affected_rows: 0,
            cancel_support: CancelSupport::Driver,
        }
    }

    pub fn with_columns(mut self, columns: Vec<RawColumn>) -> Self {
        self.columns = columns;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.delay = Some(Duration::from_secs(3600));
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn hanging_reads(mut self) -> Self {
        self.read_delay = Some(Duration::from_secs(3600));
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_string());
        self
    }

    pub fn cancel_support(mut self, support: CancelSupport) -> Self {
        self.cancel_support = support;
        self
    }

    pub fn affected(mut self, rows: u64) -> Self {
        self.affected_rows = rows;
        self
    }
}

/// What a test can observe about one mock connection.
#[derive(Default)]
pub struct MockProbe {
    pub queries: StdMutex<Vec<(String, Vec<Value>, Option<usize>)>>,
    pub cursor_batches: StdMutex<Vec<usize>>,
    pub cursors_opened: AtomicUsize,
    pub cursors_closed: AtomicUsize,
    pub streams_opened: AtomicUsize,
    pub stream_pauses: AtomicUsize,
    pub stream_cancels: AtomicUsize,
    pub stream_rows_delivered: AtomicUsize,
    pub statement_timeouts: StdMutex<Vec<u64>>,
    pub cancel_marks: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl MockProbe {
    pub fn last_query(&self) -> Option<(String, Vec<Value>, Option<usize>)> {
        self.queries.lock().unwrap().last().cloned()
    }
}

pub struct MockConnection {
    pub id: usize,
    script: MockScript,
    pub healthy: AtomicBool,
    pub ping_hangs: AtomicBool,
    pub closed: AtomicBool,
    pub probe: Arc<MockProbe>,
}

impl MockConnection {
    pub fn new(id: usize, script: MockScript) -> Self {
        Self {
            id,
            script,
            healthy: AtomicBool::new(true),
            ping_hangs: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            probe: Arc::new(MockProbe::default()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_ping_hangs(&self, hangs: bool) {
        self.ping_hangs.store(hangs, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn simulate(&self) -> ClientResult<()> {
        if let Some(delay) = self.script.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.script.fail_with {
            Some(message) => Err(ClientError::message(message.clone())),
            None => Ok(()),
        }
    }

    fn record(&self, sql: &str, params: &[Value], max_results: Option<usize>) {
        self.probe
            .queries
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec(), max_results));
    }
}

#[async_trait]
impl ClientConnection for MockConnection {
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
        max_results: Option<usize>,
    ) -> ClientResult<RawResultSet> {
        self.record(sql, params, max_results);
        self.simulate().await?;
        let rows = match max_results {
            Some(limit) => self.script.rows.iter().take(limit).cloned().collect(),
            None => self.script.rows.clone(),
        };
        Ok(RawResultSet {
            columns: self.script.columns.clone(),
            rows,
        })
    }

    async fn open_cursor(&self, sql: &str, params: &[Value]) -> ClientResult<Box<dyn RowCursor>> {
        self.record(sql, params, None);
        self.simulate().await?;
        self.probe.cursors_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCursor {
            columns: self.script.columns.clone(),
            rows: self.script.rows.iter().cloned().collect(),
            fail_after: self.script.cursor_fail_after,
            read_delay: self.script.read_delay,
            batches_read: 0,
            probe: self.probe.clone(),
        }))
    }

    async fn open_stream(&self, sql: &str, params: &[Value]) -> ClientResult<Box<dyn RowStream>> {
        self.record(sql, params, None);
        self.simulate().await?;
        self.probe.streams_opened.fetch_add(1, Ordering::SeqCst);
        let mut events: VecDeque<StreamEvent> = VecDeque::new();
        events.push_back(StreamEvent::Columns(self.script.columns.clone()));
        events.extend(self.script.rows.iter().cloned().map(StreamEvent::Row));
        Ok(Box::new(MockStream {
            events,
            cancelled: false,
            finished: false,
            probe: self.probe.clone(),
        }))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> ClientResult<u64> {
        self.record(sql, params, None);
        self.simulate().await?;
        Ok(self.script.affected_rows)
    }

    async fn set_statement_timeout(&self, timeout_ms: u64) -> ClientResult<()> {
        self.probe.statement_timeouts.lock().unwrap().push(timeout_ms);
        Ok(())
    }

    async fn ping(&self) -> bool {
        if self.ping_hangs.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        !self.is_closed() && self.healthy.load(Ordering::SeqCst)
    }

    fn cancel_support(&self) -> CancelSupport {
        self.script.cancel_support
    }

    fn cancel_requested(&self) {
        self.probe.cancel_marks.fetch_add(1, Ordering::SeqCst);
    }

    async fn cancel(&self) -> ClientResult<()> {
        self.probe.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> ClientResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockCursor {
    columns: Vec<RawColumn>,
    rows: VecDeque<RawRow>,
    fail_after: Option<usize>,
    read_delay: Option<Duration>,
    batches_read: usize,
    probe: Arc<MockProbe>,
}

#[async_trait]
impl RowCursor for MockCursor {
    fn columns(&self) -> &[RawColumn] {
        &self.columns
    }

    async fn read(&mut self, max: usize) -> ClientResult<Vec<RawRow>> {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_after.is_some_and(|limit| self.batches_read >= limit) {
            return Err(ClientError::message("cursor read failed"));
        }
        self.batches_read += 1;
        self.probe.cursor_batches.lock().unwrap().push(max);
        let take = max.min(self.rows.len());
        Ok(self.rows.drain(..take).collect())
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.probe.cursors_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockStream {
    events: VecDeque<StreamEvent>,
    cancelled: bool,
    finished: bool,
    probe: Arc<MockProbe>,
}

#[async_trait]
impl RowStream for MockStream {
    async fn next_event(&mut self) -> Option<ClientResult<StreamEvent>> {
        if self.finished {
            return None;
        }
        if self.cancelled {
            self.finished = true;
            return Some(Ok(StreamEvent::Done));
        }
        match self.events.pop_front() {
            Some(event) => {
                if matches!(event, StreamEvent::Row(_)) {
                    self.probe.stream_rows_delivered.fetch_add(1, Ordering::SeqCst);
                }
                Some(Ok(event))
            }
            None => {
                self.finished = true;
                Some(Ok(StreamEvent::Done))
            }
        }
    }

    fn pause(&mut self) {
        self.probe.stream_pauses.fetch_add(1, Ordering::SeqCst);
    }

    async fn cancel(&mut self) -> ClientResult<()> {
        self.probe.stream_cancels.fetch_add(1, Ordering::SeqCst);
        self.cancelled = true;
        Ok(())
    }
}

/// Hands out scripted connections and remembers each one.
pub struct MockConnector {
    script: StdMutex<MockScript>,
    connect_error: StdMutex<Option<String>>,
    connect_delay: StdMutex<Option<Duration>>,
    connects: AtomicUsize,
    connections: StdMutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub fn new(script: MockScript) -> Arc<Self> {
        Arc::new(Self {
            script: StdMutex::new(script),
            connect_error: StdMutex::new(None),
            connect_delay: StdMutex::new(None),
            connects: AtomicUsize::new(0),
            connections: StdMutex::new(Vec::new()),
        })
    }

    pub fn set_script(&self, script: MockScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn fail_connects(&self, message: Option<&str>) {
        *self.connect_error.lock().unwrap() = message.map(str::to_string);
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _credentials: &Credentials) -> ClientResult<Arc<dyn ClientConnection>> {
        let id = self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let error = self.connect_error.lock().unwrap().clone();
        if let Some(message) = error {
            return Err(ClientError::message(message));
        }
        let script = self.script.lock().unwrap().clone();
        let conn = Arc::new(MockConnection::new(id, script));
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}
