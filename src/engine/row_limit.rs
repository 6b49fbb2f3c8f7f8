//! Row-limiting strategies
//!
//! Every strategy fetches at most `max_rows + 1` rows so `has_more_rows` can
//! be reported exactly. Which one an adapter uses depends on what its client
//! can do: cap natively, page through a server cursor, stream with early
//! cancel, or materialize everything and slice.

use std::sync::Arc;

use tracing::{debug, warn};

use super::client::{
    ClientConnection, ClientResult, RawColumn, RawRow, RowCursor, RowStream, StreamEvent,
};
use super::normalize::normalize_record;
use super::type_mapping::map_type;
use super::types::{AdapterQueryResult, DataSourceType, FieldMetadata, Record, Value};

/// Largest batch requested from a server cursor.
pub const CURSOR_BATCH_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLimitStrategy {
    /// Client accepts a row cap; ask for `max_rows + 1`
    NativeCap,
    /// Page through a server-side cursor
    ServerCursor,
    /// Fetch everything, then slice in memory
    Materialize,
    /// Consume a row stream and cancel it after `max_rows + 1`
    StreamCancel,
}

/// Rows collected under a limit.
#[derive(Debug, Clone, Default)]
pub struct LimitedRows {
    pub columns: Vec<RawColumn>,
    pub rows: Vec<RawRow>,
    pub has_more_rows: bool,
}

/// Absent or non-positive limits mean "no limit".
pub fn effective_limit(max_rows: Option<i64>) -> Option<usize> {
    max_rows
        .filter(|rows| *rows > 0)
        .and_then(|rows| usize::try_from(rows).ok())
}

/// Drops the probe row, if present, and reports whether it was there.
pub fn truncate_rows<T>(mut rows: Vec<T>, limit: Option<usize>) -> (Vec<T>, bool) {
    match limit {
        Some(limit) if rows.len() > limit => {
            rows.truncate(limit);
            (rows, true)
        }
        _ => (rows, false),
    }
}

pub async fn execute_limited(
    conn: &Arc<dyn ClientConnection>,
    strategy: RowLimitStrategy,
    sql: &str,
    params: &[Value],
    limit: Option<usize>,
) -> ClientResult<LimitedRows> {
    match strategy {
        RowLimitStrategy::NativeCap => {
            let result = conn.query(sql, params, limit.map(|l| l + 1)).await?;
            let (rows, has_more_rows) = truncate_rows(result.rows, limit);
            Ok(LimitedRows {
                columns: result.columns,
                rows,
                has_more_rows,
            })
        }
        RowLimitStrategy::Materialize => {
            let result = conn.query(sql, params, None).await?;
            let (rows, has_more_rows) = truncate_rows(result.rows, limit);
            Ok(LimitedRows {
                columns: result.columns,
                rows,
                has_more_rows,
            })
        }
        RowLimitStrategy::ServerCursor => {
            let cursor = conn.open_cursor(sql, params).await?;
            read_cursor(cursor, limit).await
        }
        RowLimitStrategy::StreamCancel => {
            let stream = conn.open_stream(sql, params).await?;
            drain_stream(stream, limit).await
        }
    }
}

/// Owns a cursor while it is being read. If the read is abandoned (the
/// deadline dropped the future) the cursor is closed on a background task.
struct CursorGuard(Option<Box<dyn RowCursor>>);

impl Drop for CursorGuard {
    fn drop(&mut self) {
        let Some(mut cursor) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match cursor.close().await {
                        Ok(()) => debug!("Closed abandoned cursor"),
                        Err(err) => warn!(error = %err, "Failed to close abandoned cursor"),
                    }
                });
            }
            Err(_) => warn!("Cursor abandoned outside a runtime; it was not closed"),
        }
    }
}

/// Reads a cursor in batches of `min(limit, CURSOR_BATCH_CAP) + 1`. The
/// cursor is closed on every path, including when this future is dropped.
pub async fn read_cursor(
    cursor: Box<dyn RowCursor>,
    limit: Option<usize>,
) -> ClientResult<LimitedRows> {
    let mut guard = CursorGuard(Some(cursor));
    let (result, closed) = match guard.0.as_deref_mut() {
        Some(cursor) => {
            let result = collect_batches(cursor, limit).await;
            (result, cursor.close().await)
        }
        None => (Ok(LimitedRows::default()), Ok(())),
    };
    // Closed above; nothing left for the guard to do
    guard.0 = None;

    match (result, closed) {
        (Ok(rows), Ok(())) => Ok(rows),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!(error = %close_err, "Failed to close cursor after read error");
            Err(err)
        }
    }
}

async fn collect_batches(
    cursor: &mut dyn RowCursor,
    limit: Option<usize>,
) -> ClientResult<LimitedRows> {
    let batch_size = match limit {
        Some(limit) => limit.min(CURSOR_BATCH_CAP) + 1,
        None => CURSOR_BATCH_CAP,
    };

    let mut rows: Vec<RawRow> = Vec::new();
    let mut has_more_rows = false;
    loop {
        let batch = cursor.read(batch_size).await?;
        let short = batch.len() < batch_size;
        rows.extend(batch);

        if let Some(limit) = limit {
            if rows.len() > limit {
                rows.truncate(limit);
                has_more_rows = true;
                break;
            }
        }
        if short {
            break;
        }
    }

    Ok(LimitedRows {
        columns: cursor.columns().to_vec(),
        rows,
        has_more_rows,
    })
}

/// Consumes a stream; on the row after `limit` it pauses and cancels, then
/// drains to the `Done` event.
pub async fn drain_stream(
    mut stream: Box<dyn RowStream>,
    limit: Option<usize>,
) -> ClientResult<LimitedRows> {
    let mut collected = LimitedRows::default();
    let mut cancelled = false;

    while let Some(event) = stream.next_event().await {
        match event? {
            StreamEvent::Columns(columns) => collected.columns = columns,
            StreamEvent::Row(_) if cancelled => {}
            StreamEvent::Row(row) => {
                if limit.is_some_and(|limit| collected.rows.len() >= limit) {
                    collected.has_more_rows = true;
                    cancelled = true;
                    stream.pause();
                    stream.cancel().await?;
                    debug!(rows = collected.rows.len(), "Row limit reached, stream cancelled");
                } else {
                    collected.rows.push(row);
                }
            }
            StreamEvent::Done => break,
        }
    }
    Ok(collected)
}

/// Maps raw columns and rows into the uniform result shape.
pub fn build_result(engine: DataSourceType, limited: LimitedRows) -> AdapterQueryResult {
    let fields: Vec<FieldMetadata> = limited
        .columns
        .iter()
        .map(|col| FieldMetadata {
            name: col.name.clone(),
            field_type: map_type(engine, &col.type_code).to_string(),
            nullable: col.nullable.unwrap_or(true),
            length: col.length.unwrap_or(0),
            precision: col.precision.unwrap_or(0),
            scale: col.scale.unwrap_or(0),
        })
        .collect();

    let rows: Vec<Record> = limited
        .rows
        .into_iter()
        .map(|values| {
            let record = values
                .into_iter()
                .enumerate()
                .map(|(idx, value)| {
                    let name = limited
                        .columns
                        .get(idx)
                        .map(|col| col.name.clone())
                        .unwrap_or_else(|| format!("column_{idx}"));
                    (name, value)
                })
                .collect();
            normalize_record(record)
        })
        .collect();

    AdapterQueryResult {
        row_count: rows.len(),
        rows,
        fields,
        has_more_rows: limited.has_more_rows,
    }
}
