//! Warm connection cache
//!
//! Holds at most one live connection for engines with expensive handshakes
//! (Snowflake). A cached connection is reused only while its credentials
//! fingerprint matches, it is younger than the reuse window and it still
//! answers a liveness probe.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::client::{ClientConnection, ClientResult, Connector};
use super::credentials::Credentials;

pub const DEFAULT_REUSE_WINDOW: Duration = Duration::from_secs(5 * 60);

struct WarmSlot {
    conn: Arc<dyn ClientConnection>,
    fingerprint: String,
    last_used_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WarmCacheStats {
    pub has_connection: bool,
    /// Time since the cached connection was last handed out or retained
    pub age_ms: Option<u128>,
}

pub struct WarmConnectionCache {
    reuse_window: Duration,
    slot: Mutex<Option<WarmSlot>>,
}

impl Default for WarmConnectionCache {
    fn default() -> Self {
        Self::new(DEFAULT_REUSE_WINDOW)
    }
}

impl WarmConnectionCache {
    pub fn new(reuse_window: Duration) -> Self {
        Self {
            reuse_window,
            slot: Mutex::new(None),
        }
    }

    /// Returns the cached connection when it is still usable for
    /// `credentials`, otherwise opens a new one with `connector` and caches
    /// that instead. The lock is held across the connect so concurrent
    /// callers share a single handshake.
    pub async fn checkout(
        &self,
        credentials: &Credentials,
        connector: &dyn Connector,
    ) -> ClientResult<Arc<dyn ClientConnection>> {
        let fingerprint = credentials.fingerprint();
        let mut slot = self.slot.lock().await;

        if let Some(cached) = slot.as_mut() {
            let fresh = cached.fingerprint == fingerprint
                && cached.last_used_at.elapsed() < self.reuse_window;
            if fresh && cached.conn.ping().await {
                cached.last_used_at = Instant::now();
                debug!(data_source = %credentials.data_source_type(), "Reusing warm connection");
                return Ok(cached.conn.clone());
            }
        }

        if let Some(stale) = slot.take() {
            debug!("Discarding stale warm connection");
            if let Err(err) = stale.conn.close().await {
                warn!(error = %err, "Failed to close stale warm connection");
            }
        }

        let conn = connector.connect(credentials).await?;
        *slot = Some(WarmSlot {
            conn: conn.clone(),
            fingerprint,
            last_used_at: Instant::now(),
        });
        Ok(conn)
    }

    /// True when `conn` is the cached connection.
    pub async fn holds(&self, conn: &Arc<dyn ClientConnection>) -> bool {
        let slot = self.slot.lock().await;
        matches!(slot.as_ref(), Some(cached) if same_connection(&cached.conn, conn))
    }

    /// Called when an adapter lets go of `conn`. Returns true when the cache
    /// keeps it warm; the caller must then leave it open. A cached
    /// connection past the reuse window is evicted instead and the caller
    /// closes it.
    pub async fn retains(&self, conn: &Arc<dyn ClientConnection>) -> bool {
        let mut slot = self.slot.lock().await;
        let Some(cached) = slot
            .as_mut()
            .filter(|cached| same_connection(&cached.conn, conn))
        else {
            return false;
        };
        if cached.last_used_at.elapsed() < self.reuse_window {
            cached.last_used_at = Instant::now();
            return true;
        }
        debug!("Warm connection outlived the reuse window; evicting");
        *slot = None;
        false
    }

    /// Closes and forgets the cached connection.
    pub async fn cleanup(&self) {
        let taken = self.slot.lock().await.take();
        if let Some(cached) = taken {
            if let Err(err) = cached.conn.close().await {
                warn!(error = %err, "Failed to close warm connection");
            }
        }
    }

    pub async fn stats(&self) -> WarmCacheStats {
        let slot = self.slot.lock().await;
        WarmCacheStats {
            has_connection: slot.is_some(),
            age_ms: slot.as_ref().map(|cached| cached.last_used_at.elapsed().as_millis()),
        }
    }
}

fn same_connection(a: &Arc<dyn ClientConnection>, b: &Arc<dyn ClientConnection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
