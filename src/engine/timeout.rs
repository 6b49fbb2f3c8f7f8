//! Query deadline enforcement
//!
//! Execution races a timer. When the timer wins the caller gets a
//! `QueryTimeout` immediately; cancellation of the remote statement is then
//! requested in the background if the client supports it at all. The
//! client is told synchronously first so it can hold back new statements
//! until that cancel has landed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::client::ClientConnection;
use super::error::{DataSourceError, EngineResult};
use super::types::CancelSupport;

pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 60_000;
pub const SQLSERVER_QUERY_TIMEOUT_MS: u64 = 120_000;

/// Zero or absent means "use the adapter default".
pub fn resolve_timeout(requested: Option<u64>, default_ms: u64) -> u64 {
    match requested {
        Some(ms) if ms > 0 => ms,
        _ => default_ms,
    }
}

/// Runs `operation` under a `timeout_ms` deadline.
pub async fn with_timeout<T, F>(
    timeout_ms: u64,
    conn: &Arc<dyn ClientConnection>,
    operation: F,
) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), operation).await {
        Ok(result) => result,
        Err(_) => {
            request_cancel(conn);
            Err(DataSourceError::query_timeout(timeout_ms))
        }
    }
}

fn request_cancel(conn: &Arc<dyn ClientConnection>) {
    match conn.cancel_support() {
        CancelSupport::None => {
            warn!("Query timed out; this engine cannot cancel it, so it may keep running remotely");
        }
        support => {
            conn.cancel_requested();
            let conn = conn.clone();
            tokio::spawn(async move {
                match conn.cancel().await {
                    Ok(()) => debug!(?support, "Cancelled timed-out query"),
                    Err(err) => warn!(error = %err, "Failed to cancel timed-out query"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::client::mock::{MockConnection, MockScript};
    use crate::engine::error::ErrorKind;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn connection(script: MockScript) -> (Arc<MockConnection>, Arc<dyn ClientConnection>) {
        let mock = Arc::new(MockConnection::new(0, script));
        let conn: Arc<dyn ClientConnection> = mock.clone();
        (mock, conn)
    }

    #[test]
    fn resolves_default_for_absent_or_zero() {
        assert_eq!(resolve_timeout(None, 60_000), 60_000);
        assert_eq!(resolve_timeout(Some(0), 60_000), 60_000);
        assert_eq!(resolve_timeout(Some(250), 60_000), 250);
    }

    #[tokio::test]
    async fn fast_operations_complete() {
        let (_, conn) = connection(MockScript::rows(1));
        let result = with_timeout(1_000, &conn, async { Ok::<_, DataSourceError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn hanging_operation_times_out_near_deadline() {
        let (mock, conn) = connection(MockScript::rows(1).hanging());
        let started = Instant::now();

        let result = with_timeout(50, &conn, async {
            conn.query("SELECT 1", &[], None)
                .await
                .map_err(|e| crate::engine::error::classify(e, None))
        })
        .await;

        let elapsed = started.elapsed();
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryTimeout);
        assert!(err.is_retryable());
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(1_000), "took {elapsed:?}");
        // Marked before the caller sees the error
        assert_eq!(mock.probe.cancel_marks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.probe.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn engines_without_cancellation_are_not_asked() {
        let (mock, conn) =
            connection(MockScript::rows(1).hanging().cancel_support(CancelSupport::None));

        let err = with_timeout(20, &conn, async {
            conn.execute("UPDATE t SET a = 1", &[])
                .await
                .map_err(|e| crate::engine::error::classify(e, None))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::QueryTimeout);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.probe.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(mock.probe.cancel_marks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn operation_errors_pass_through() {
        let (_, conn) = connection(MockScript::rows(0));
        let err = with_timeout(1_000, &conn, async {
            Err::<(), _>(DataSourceError::configuration("bad"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }
}
