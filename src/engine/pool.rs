//! Bounded connection pool
//!
//! Used for engines whose client is a bare connection factory. Handles move
//! `idle -> in use -> idle` and are evicted when unhealthy or idle for too
//! long. Acquirers that find the pool at capacity wait in FIFO order.
//!
//! All state lives behind one mutex; connecting, probing and closing happen
//! outside it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::client::{ClientConnection, Connector};
use super::credentials::Credentials;
use super::error::{classify, DataSourceError, EngineResult, ErrorContext};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    /// Idle handles older than this are evicted by the sweep
    pub idle_timeout: Duration,
    /// Default wait used by `acquire_default`
    pub acquire_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// A handle checked out of the pool. Give it back with `release`.
pub struct PooledConnection {
    id: u64,
    conn: Arc<dyn ClientConnection>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &Arc<dyn ClientConnection> {
        &self.conn
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").field("id", &self.id).finish()
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub pending: usize,
}

struct Slot {
    conn: Arc<dyn ClientConnection>,
    in_use: bool,
    last_used_at: Instant,
}

/// What a parked acquirer is woken with.
enum Wakeup {
    /// A released or freshly opened handle
    Handle(PooledConnection),
    /// Capacity freed up; a creation is reserved for this acquirer
    Create,
}

type WakeupSender = oneshot::Sender<EngineResult<Wakeup>>;
type WakeupReceiver = oneshot::Receiver<EngineResult<Wakeup>>;

struct Waiter {
    id: u64,
    sender: WakeupSender,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<u64, Slot>,
    waiters: VecDeque<Waiter>,
    /// Connections being opened right now; they count toward the bound
    pending: usize,
    closed: bool,
}

impl PoolState {
    fn size(&self) -> usize {
        self.slots.len() + self.pending
    }

    /// Gives `handle` to the longest waiter still listening. Returns the
    /// handle back when nobody is waiting.
    fn hand_off(&mut self, mut handle: PooledConnection) -> Option<PooledConnection> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.sender.send(Ok(Wakeup::Handle(handle))) {
                Ok(()) => return None,
                Err(Ok(Wakeup::Handle(returned))) => handle = returned,
                Err(_) => return None,
            }
        }
        Some(handle)
    }

    /// Reserves free capacity for waiters, oldest first, and wakes them to
    /// open their own connection.
    fn grant_capacity(&mut self, max: usize) {
        while self.size() < max {
            let Some(waiter) = self.waiters.pop_front() else {
                return;
            };
            self.pending += 1;
            if waiter.sender.send(Ok(Wakeup::Create)).is_err() {
                self.pending -= 1;
            }
        }
    }
}

enum Step {
    Probe(u64, Arc<dyn ClientConnection>),
    Create,
    Wait(u64, WakeupReceiver),
}

pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    credentials: Credentials,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>, credentials: Credentials) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            credentials,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
            sweeper: StdMutex::new(None),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn error_context(&self, operation: &'static str) -> ErrorContext<'static> {
        ErrorContext::new(self.credentials.data_source_type(), operation)
    }

    /// Opens `min_connections` in parallel and starts the health sweep.
    #[instrument(skip(self), fields(min = self.config.min_connections, max = self.config.max_connections))]
    pub async fn initialize(self: &Arc<Self>) -> EngineResult<()> {
        let wanted = self.config.min_connections.min(self.config.max_connections);
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(DataSourceError::pool_closed());
            }
            state.pending += wanted;
        }

        let attempts = join_all((0..wanted).map(|_| self.connector.connect(&self.credentials))).await;

        let mut opened = Vec::new();
        let mut first_error = None;
        for attempt in attempts {
            match attempt {
                Ok(conn) => opened.push(conn),
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => warn!(error = %err, "Additional pool connection failed"),
            }
        }

        if let Some(err) = first_error {
            self.state.lock().await.pending -= wanted;
            destroy_all(opened).await;
            return Err(classify(err, Some(self.error_context("initialize"))));
        }

        let leftovers = {
            let mut state = self.state.lock().await;
            state.pending -= wanted;
            if state.closed {
                opened
            } else {
                let now = Instant::now();
                for conn in opened {
                    let id = self.next_id();
                    state.slots.insert(
                        id,
                        Slot {
                            conn,
                            in_use: false,
                            last_used_at: now,
                        },
                    );
                }
                Vec::new()
            }
        };
        if !leftovers.is_empty() {
            destroy_all(leftovers).await;
            return Err(DataSourceError::pool_closed());
        }

        self.start_sweeper();
        info!(connections = wanted, "Connection pool initialized");
        Ok(())
    }

    fn start_sweeper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if pool.is_closed().await {
                    break;
                }
                pool.sweep().await;
            }
        });
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(previous) = sweeper.replace(handle) {
                previous.abort();
            }
        }
    }

    async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn acquire_default(&self) -> EngineResult<PooledConnection> {
        self.acquire(self.config.acquire_timeout).await
    }

    /// Checks out a healthy handle, opening one if below capacity, or waits
    /// in line until `timeout` elapses.
    pub async fn acquire(&self, timeout: Duration) -> EngineResult<PooledConnection> {
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() >= deadline {
                return Err(DataSourceError::acquisition_timeout(timeout.as_millis()));
            }

            let step = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(DataSourceError::pool_closed());
                }
                let size = state.size();
                let idle = state
                    .slots
                    .iter_mut()
                    .filter(|(_, slot)| !slot.in_use)
                    .max_by_key(|(_, slot)| slot.last_used_at)
                    .map(|(id, slot)| {
                        // Reserved while probing so nobody else takes it
                        slot.in_use = true;
                        (*id, slot.conn.clone())
                    });

                match idle {
                    Some((id, conn)) => Step::Probe(id, conn),
                    None if size < self.config.max_connections => {
                        state.pending += 1;
                        Step::Create
                    }
                    None => {
                        let (sender, receiver) = oneshot::channel();
                        let id = self.next_id();
                        state.waiters.push_back(Waiter { id, sender });
                        Step::Wait(id, receiver)
                    }
                }
            };

            match step {
                Step::Probe(id, conn) => {
                    match tokio::time::timeout_at(deadline, conn.ping()).await {
                        Ok(true) => {
                            debug!(handle = id, "Reusing pooled connection");
                            return Ok(PooledConnection { id, conn });
                        }
                        Ok(false) => {
                            warn!(handle = id, "Evicting unhealthy pooled connection");
                            self.evict(id, conn).await;
                        }
                        Err(_) => {
                            warn!(handle = id, "Health probe outlived the acquire timeout; evicting");
                            self.evict(id, conn).await;
                            return Err(DataSourceError::acquisition_timeout(timeout.as_millis()));
                        }
                    }
                }
                Step::Create => return self.create_in_use().await,
                Step::Wait(waiter_id, receiver) => {
                    return self.wait_in_line(waiter_id, receiver, deadline, timeout).await;
                }
            }
        }
    }

    /// Drops a handle from the pool and passes the freed capacity on to
    /// waiters. Closing happens in the background since the handle may be
    /// hung.
    async fn evict(&self, id: u64, conn: Arc<dyn ClientConnection>) {
        {
            let mut state = self.state.lock().await;
            state.slots.remove(&id);
            state.grant_capacity(self.config.max_connections);
        }
        tokio::spawn(destroy(conn));
    }

    /// Gives back a creation reserved for an acquirer that is no longer
    /// waiting.
    async fn return_reservation(&self) {
        let mut state = self.state.lock().await;
        state.pending -= 1;
        state.grant_capacity(self.config.max_connections);
    }

    async fn create_in_use(&self) -> EngineResult<PooledConnection> {
        let created = self.connector.connect(&self.credentials).await;

        let mut state = self.state.lock().await;
        state.pending -= 1;
        match created {
            Ok(conn) if state.closed => {
                drop(state);
                destroy(conn).await;
                Err(DataSourceError::pool_closed())
            }
            Ok(conn) => {
                let id = self.next_id();
                state.slots.insert(
                    id,
                    Slot {
                        conn: conn.clone(),
                        in_use: true,
                        last_used_at: Instant::now(),
                    },
                );
                debug!(handle = id, size = state.size(), "Opened pooled connection");
                Ok(PooledConnection { id, conn })
            }
            Err(err) => {
                state.grant_capacity(self.config.max_connections);
                drop(state);
                Err(classify(err, Some(self.error_context("acquire"))))
            }
        }
    }

    async fn wait_in_line(
        &self,
        waiter_id: u64,
        mut receiver: WakeupReceiver,
        deadline: Instant,
        timeout: Duration,
    ) -> EngineResult<PooledConnection> {
        match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(Ok(Ok(Wakeup::Handle(handle)))) => Ok(handle),
            Ok(Ok(Ok(Wakeup::Create))) => self.create_in_use().await,
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(DataSourceError::pool_closed()),
            Err(_) => {
                let still_queued = {
                    let mut state = self.state.lock().await;
                    let before = state.waiters.len();
                    state.waiters.retain(|waiter| waiter.id != waiter_id);
                    state.waiters.len() != before
                };
                // Lost the race with a wakeup: pass it on
                if !still_queued {
                    match receiver.try_recv() {
                        Ok(Ok(Wakeup::Handle(handle))) => self.release(handle).await,
                        Ok(Ok(Wakeup::Create)) => self.return_reservation().await,
                        _ => {}
                    }
                }
                Err(DataSourceError::acquisition_timeout(timeout.as_millis()))
            }
        }
    }

    /// Returns a handle. It goes straight to the longest waiter if any;
    /// otherwise it becomes idle. Handles this pool does not know are closed.
    pub async fn release(&self, handle: PooledConnection) {
        let mut state = self.state.lock().await;
        if !state.slots.contains_key(&handle.id) {
            drop(state);
            warn!(handle = handle.id, "Released connection is not part of this pool; closing it");
            destroy(handle.conn).await;
            return;
        }

        let id = handle.id;
        let now = Instant::now();
        if let Some(slot) = state.slots.get_mut(&id) {
            slot.last_used_at = now;
        }
        if state.hand_off(handle).is_some() {
            if let Some(slot) = state.slots.get_mut(&id) {
                slot.in_use = false;
            }
        } else {
            debug!(handle = id, "Handed connection to waiting acquirer");
        }
    }

    /// Evicts expired idle handles and tops the pool back up to
    /// `min_connections`. Creation failures are logged, not returned.
    pub async fn sweep(&self) {
        let expired: Vec<Arc<dyn ClientConnection>> = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            let idle_timeout = self.config.idle_timeout;
            let ids: Vec<u64> = state
                .slots
                .iter()
                .filter(|(_, slot)| !slot.in_use && slot.last_used_at.elapsed() > idle_timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.slots.remove(&id))
                .map(|slot| slot.conn)
                .collect()
        };
        if !expired.is_empty() {
            debug!(count = expired.len(), "Evicting idle pooled connections");
            destroy_all(expired).await;
        }

        let deficit = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            let deficit = self.config.min_connections.saturating_sub(state.size());
            state.pending += deficit;
            deficit
        };
        if deficit == 0 {
            return;
        }

        let attempts = join_all((0..deficit).map(|_| self.connector.connect(&self.credentials))).await;

        let mut leftovers = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.pending -= deficit;
            for attempt in attempts {
                match attempt {
                    Ok(conn) if state.closed => leftovers.push(conn),
                    Ok(conn) => {
                        let id = self.next_id();
                        state.slots.insert(
                            id,
                            Slot {
                                conn: conn.clone(),
                                in_use: true,
                                last_used_at: Instant::now(),
                            },
                        );
                        if state.hand_off(PooledConnection { id, conn }).is_some() {
                            if let Some(slot) = state.slots.get_mut(&id) {
                                slot.in_use = false;
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "Health sweep could not replenish the pool"),
                }
            }
        }
        destroy_all(leftovers).await;
    }

    /// Rejects new acquires, fails every waiter and destroys all handles.
    /// Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let (slots, waiters) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.slots),
                std::mem::take(&mut state.waiters),
            )
        };

        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }

        for waiter in waiters {
            let _ = waiter.sender.send(Err(DataSourceError::pool_closed()));
        }

        let count = slots.len();
        destroy_all(slots.into_values().map(|slot| slot.conn).collect()).await;
        info!(connections = count, "Connection pool closed");
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let in_use = state.slots.values().filter(|slot| slot.in_use).count();
        PoolStats {
            total: state.slots.len(),
            idle: state.slots.len() - in_use,
            in_use,
            waiting: state.waiters.len(),
            pending: state.pending,
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

async fn destroy(conn: Arc<dyn ClientConnection>) {
    if let Err(err) = conn.close().await {
        warn!(error = %err, "Failed to close pooled connection");
    }
}

async fn destroy_all(conns: Vec<Arc<dyn ClientConnection>>) {
    join_all(conns.into_iter().map(destroy)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::client::mock::{MockConnector, MockScript};
    use crate::engine::credentials::PostgresCredentials;
    use crate::engine::error::ErrorKind;
    use std::collections::HashSet;

    fn credentials() -> Credentials {
        Credentials::Redshift(PostgresCredentials {
            host: "cluster".into(),
            username: "admin".into(),
            database: Some("dev".into()),
            ..Default::default()
        })
    }

    fn pool(config: PoolConfig) -> (Arc<MockConnector>, Arc<ConnectionPool>) {
        let connector = MockConnector::new(MockScript::rows(1));
        let pool = ConnectionPool::new(config, connector.clone(), credentials());
        (connector, pool)
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig::default()
            .with_min_connections(min)
            .with_max_connections(max)
            .with_sweep_interval(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn initialize_opens_min_connections() {
        let (connector, pool) = pool(config(3, 5));
        pool.initialize().await.unwrap();

        assert_eq!(connector.connect_count(), 3);
        let stats = pool.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.idle, 3);
    }

    #[tokio::test]
    async fn initialize_failure_is_classified() {
        let (connector, pool) = pool(config(2, 5));
        connector.fail_connects(Some("password authentication failed for user \"admin\""));

        let err = pool.initialize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationError);
        assert!(!err.is_retryable());
        assert_eq!(pool.stats().await.pending, 0);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out_at_deadline() {
        let (_, pool) = pool(config(0, 2));
        let first = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let second = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let started = Instant::now();
        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), ErrorKind::ConnectionAcquisitionTimeout);
        assert!(err.is_retryable());
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
        assert_eq!(pool.stats().await.waiting, 0);

        pool.release(first).await;
        pool.release(second).await;
        assert_eq!(pool.stats().await.idle, 2);
    }

    #[tokio::test]
    async fn release_hands_off_to_waiters_in_fifo_order() {
        let (_, pool) = pool(config(0, 1));
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let held_id = held.id();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        for label in 0..3 {
            let pool = pool.clone();
            let order_tx = order_tx.clone();
            tasks.push(tokio::spawn(async move {
                let handle = pool.acquire(Duration::from_secs(5)).await.unwrap();
                order_tx.send(label).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                pool.release(handle).await;
            }));
            // Make sure each waiter is queued before the next one
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pool.stats().await.waiting, 3);

        pool.release(held).await;
        for task in tasks {
            task.await.unwrap();
        }

        let order: Vec<i32> = std::iter::from_fn(|| order_rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        let again = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.id(), held_id);
    }

    #[tokio::test]
    async fn unhealthy_idle_handles_are_evicted_on_acquire() {
        let (connector, pool) = pool(config(2, 2));
        pool.initialize().await.unwrap();
        for conn in connector.connections() {
            conn.set_healthy(false);
        }

        let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.connect_count(), 3);
        assert!(connector.connection(0).is_closed());
        assert!(connector.connection(1).is_closed());
        assert!(handle.connection().ping().await);
        assert_eq!(pool.stats().await.total, 1);
    }

    #[tokio::test]
    async fn failed_creation_frees_capacity_for_the_next_waiter() {
        let (connector, pool) = pool(config(0, 1));
        connector.set_connect_delay(Some(Duration::from_millis(50)));
        connector.fail_connects(Some("connection refused"));

        let first = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let started = Instant::now();
        let second = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_millis(500)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().await.waiting, 1);

        let err = first.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        connector.fail_connects(None);

        let handle = second.await.unwrap().unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
        assert_eq!(connector.connect_count(), 2);
        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.pending, 0);
        pool.release(handle).await;
    }

    #[tokio::test]
    async fn evicted_handle_frees_capacity_for_a_waiter() {
        let (connector, pool) = pool(config(1, 1));
        pool.initialize().await.unwrap();
        connector.connection(0).set_ping_hangs(true);

        // The first acquirer reserves the idle handle and stalls on its probe
        let prober = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_millis(50)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_millis(500)).await })
        };

        let err = prober.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionAcquisitionTimeout);

        let handle = waiter.await.unwrap().unwrap();
        assert!(handle.connection().ping().await);
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(pool.stats().await.total, 1);
        pool.release(handle).await;
    }

    #[tokio::test]
    async fn hung_health_probe_is_bounded_by_the_acquire_timeout() {
        let (connector, pool) = pool(config(1, 1));
        pool.initialize().await.unwrap();
        connector.connection(0).set_ping_hangs(true);

        let started = Instant::now();
        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), ErrorKind::ConnectionAcquisitionTimeout);
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
        assert_eq!(pool.stats().await.total, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(connector.connection(0).is_closed());

        // The freed slot is usable again
        let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.connect_count(), 2);
        pool.release(handle).await;
    }

    #[tokio::test]
    async fn size_never_exceeds_max_and_no_double_acquire() {
        let (connector, pool) = pool(config(0, 4));
        let in_flight = Arc::new(tokio::sync::Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let in_flight = in_flight.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let handle = pool.acquire(Duration::from_secs(5)).await.unwrap();
                    assert!(in_flight.lock().await.insert(handle.id()), "handle acquired twice");
                    assert!(pool.stats().await.total <= 4);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    in_flight.lock().await.remove(&handle.id());
                    pool.release(handle).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(connector.connect_count() <= 4);
        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 0);
        assert!(stats.total <= 4);
    }

    #[tokio::test]
    async fn unknown_handles_are_destroyed() {
        let (_, other) = pool(config(0, 2));
        let (connector, pool) = pool(config(0, 2));
        let foreign = other.acquire(Duration::from_secs(1)).await.unwrap();
        let foreign_conn = foreign.connection().clone();

        pool.release(foreign).await;
        assert!(!foreign_conn.ping().await);
        assert_eq!(pool.stats().await.total, 0);
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_and_tops_up() {
        let (connector, pool) = pool(config(1, 3).with_idle_timeout(Duration::from_millis(10)));
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(a).await;
        pool.release(b).await;
        assert_eq!(pool.stats().await.idle, 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.sweep().await;

        let stats = pool.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(connector.connect_count(), 3);
        assert!(connector.connection(0).is_closed());
        assert!(connector.connection(1).is_closed());
    }

    #[tokio::test]
    async fn sweep_logs_top_up_failures() {
        let (connector, pool) = pool(config(2, 3));
        connector.fail_connects(Some("connection refused"));
        pool.sweep().await;
        assert_eq!(pool.stats().await.total, 0);
        assert_eq!(pool.stats().await.pending, 0);
    }

    #[tokio::test]
    async fn close_fails_waiters_and_destroys_everything() {
        let (connector, pool) = pool(config(0, 1));
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close().await;
        pool.close().await;

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionPoolError);
        assert!(connector.connection(0).is_closed());

        let err = pool.acquire(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionPoolError);

        // Releasing after close only closes the handle
        pool.release(held).await;
        assert_eq!(pool.stats().await.total, 0);
    }
}
