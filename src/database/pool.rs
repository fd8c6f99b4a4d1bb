//! # Connection Pool
//!
//! A bounded set of reusable store handles with overflow and age-based
//! recycling.
//!
//! - Up to `pool_size` base connections are created lazily and returned to the
//!   idle set on release.
//! - Beyond that, up to `max_overflow` overflow connections are created on
//!   demand and closed on release.
//! - When both are taken, `acquire` returns [`PoolUnavailable::Exhausted`]
//!   immediately instead of waiting.
//!
//! One lock guards the idle set and every counter. Slots are reserved under the
//! lock and the connection is then created or closed outside it, so a slow
//! store never blocks other callers from seeing an accurate pool state.

use crate::config::PoolConfig;
use crate::database::pool_stats::{PoolCounters, PoolStats, PoolStatsSource};
use crate::database::{ConnectionManager, SqliteConnectionManager};
use crate::error::{RiskwatchError, RiskwatchResult};
use crate::lifecycle::ShutdownSignal;
use crate::logging::log_pool_operation;
use crate::metrics;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Why `acquire` could not hand out a connection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolUnavailable {
    /// Every base and overflow slot is in use
    #[error("connection pool exhausted ({active} active of {max_connections})")]
    Exhausted {
        active: usize,
        max_connections: usize,
    },

    /// The store refused to open a new connection
    #[error("failed to create connection: {reason}")]
    CreationFailed { reason: String },

    #[error("connection pool is closed")]
    Closed,
}

impl PoolUnavailable {
    fn reason_label(&self) -> &'static str {
        match self {
            PoolUnavailable::Exhausted { .. } => "exhausted",
            PoolUnavailable::CreationFailed { .. } => "creation_failed",
            PoolUnavailable::Closed => "closed",
        }
    }
}

impl From<PoolUnavailable> for RiskwatchError {
    fn from(err: PoolUnavailable) -> Self {
        RiskwatchError::DatabaseError(err.to_string())
    }
}

/// Base connections are recycled, overflow connections are closed on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Base,
    Overflow,
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Idle connections closed for exceeding the recycle age
    pub recycled: usize,
    /// Replacements successfully opened
    pub replaced: usize,
    /// Replacements that failed to open
    pub failed: usize,
}

struct IdleConnection<C> {
    conn: C,
    id: u64,
    created_at: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,

    /// Base slots in use: idle, checked out or being (re)created
    base_count: usize,

    /// Overflow slots in use: checked out or being created
    overflow_count: usize,

    /// Connections currently owned by callers
    active: usize,

    next_id: u64,
    closed: bool,
    counters: PoolCounters,
}

impl<C> PoolState<C> {
    fn release_slot(&mut self, kind: ConnectionKind) {
        match kind {
            ConnectionKind::Base => self.base_count = self.base_count.saturating_sub(1),
            ConnectionKind::Overflow => {
                self.overflow_count = self.overflow_count.saturating_sub(1)
            }
        }
    }

    fn mark_checked_out(&mut self, elapsed: Duration, slow_threshold: Duration) {
        self.active += 1;
        self.counters.peak_active = self.counters.peak_active.max(self.active);
        self.counters.record_acquire(elapsed, slow_threshold);
    }
}

/// A slot counted in `base_count` or `overflow_count` that no caller owns yet
///
/// Dropping it gives the slot back, so an `acquire` cancelled while a
/// connection is being created, validated or recycled leaves the pool whole.
/// Never drop one while holding the state lock.
struct SlotReservation<'a, M: ConnectionManager> {
    pool: &'a PoolInner<M>,
    kind: ConnectionKind,
    armed: bool,
}

impl<'a, M: ConnectionManager> SlotReservation<'a, M> {
    fn new(pool: &'a PoolInner<M>, kind: ConnectionKind) -> Self {
        Self {
            pool,
            kind,
            armed: true,
        }
    }

    /// The slot now belongs to a connection; keep it counted
    fn disarm(mut self) -> ConnectionKind {
        self.armed = false;
        self.kind
    }
}

impl<M: ConnectionManager> Drop for SlotReservation<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().release_slot(self.kind);
        }
    }
}

/// What `acquire` decided to do while holding the lock
enum Checkout<C> {
    Ready(IdleConnection<C>),
    Recycle(IdleConnection<C>),
    Verify(IdleConnection<C>),
    Create(ConnectionKind),
}

struct PoolInner<M: ConnectionManager> {
    name: String,
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
}

impl<M: ConnectionManager> PoolInner<M> {
    /// Return a raw connection to the pool. Hands back the connection if it
    /// must be closed instead.
    fn check_in(
        &self,
        conn: M::Connection,
        id: u64,
        created_at: Instant,
        kind: ConnectionKind,
    ) -> Option<M::Connection> {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);

        let to_close = match kind {
            ConnectionKind::Overflow => {
                state.release_slot(kind);
                Some(conn)
            }
            ConnectionKind::Base if state.closed || state.idle.len() >= self.config.pool_size => {
                state.release_slot(kind);
                Some(conn)
            }
            ConnectionKind::Base => {
                state.idle.push_back(IdleConnection {
                    conn,
                    id,
                    created_at,
                });
                None
            }
        };

        let (active, idle) = (state.active, state.idle.len());
        drop(state);

        log_pool_operation(
            "release",
            active,
            idle,
            Some(if to_close.is_some() { "closed" } else { "returned_to_idle" }),
        );
        to_close
    }
}

/// Bounded connection pool over a [`ConnectionManager`]
///
/// Cloning is cheap and every clone shares the same pool.
pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("manager", &self.inner.manager)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Pool over the embedded SQLite store
pub type SqliteConnectionPool = ConnectionPool<SqliteConnectionManager>;

impl ConnectionPool<SqliteConnectionManager> {
    /// Build a SQLite pool from `config.database_url`
    pub fn sqlite(config: PoolConfig) -> RiskwatchResult<Self> {
        let manager = SqliteConnectionManager::new(config.database_url.clone());
        Self::new("sqlite", manager, config)
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Create an empty pool. Connections are opened on demand or by [`warm_up`](Self::warm_up).
    pub fn new(name: impl Into<String>, manager: M, config: PoolConfig) -> RiskwatchResult<Self> {
        config.validate()?;
        let name = name.into();

        info!(
            pool = %name,
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            recycle_time_ms = config.recycle_time_ms,
            "Connection pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                manager,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    base_count: 0,
                    overflow_count: 0,
                    active: 0,
                    next_id: 0,
                    closed: false,
                    counters: PoolCounters::default(),
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Check out a connection without waiting
    ///
    /// Idle connections past the recycle age are closed and replaced before
    /// handoff. Creation failures are counted and reported, never fatal.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolUnavailable> {
        let start = Instant::now();
        let config = &self.inner.config;

        let checkout = {
            let mut state = self.inner.state.lock();
            if state.closed {
                drop(state);
                return Err(self.unavailable(PoolUnavailable::Closed));
            }

            if let Some(idle) = state.idle.pop_back() {
                if idle.created_at.elapsed() > config.recycle_time() {
                    Checkout::Recycle(idle)
                } else if config.validate_on_checkout {
                    Checkout::Verify(idle)
                } else {
                    state.mark_checked_out(start.elapsed(), self.slow_threshold());
                    Checkout::Ready(idle)
                }
            } else if state.base_count < config.pool_size {
                state.base_count += 1;
                Checkout::Create(ConnectionKind::Base)
            } else if state.overflow_count < config.max_overflow {
                state.overflow_count += 1;
                Checkout::Create(ConnectionKind::Overflow)
            } else {
                state.counters.exhausted_count += 1;
                let active = state.active;
                drop(state);
                return Err(self.unavailable(PoolUnavailable::Exhausted {
                    active,
                    max_connections: config.max_connections(),
                }));
            }
        };

        let pooled = match checkout {
            Checkout::Ready(idle) => {
                self.wrap(idle.conn, idle.id, idle.created_at, ConnectionKind::Base)
            }
            Checkout::Recycle(idle) => {
                let reservation = SlotReservation::new(&self.inner, ConnectionKind::Base);
                debug!(
                    pool = %self.inner.name,
                    connection_id = idle.id,
                    age_ms = idle.created_at.elapsed().as_millis() as u64,
                    "Recycling aged connection before handoff"
                );
                self.inner.manager.close(idle.conn).await;
                self.inner.state.lock().counters.recycled_connections += 1;
                metrics::pool_recycled_total().add(1, &[]);

                self.open_and_hand_off(reservation, start).await?
            }
            Checkout::Verify(mut idle) => {
                let reservation = SlotReservation::new(&self.inner, ConnectionKind::Base);
                if self.inner.manager.is_valid(&mut idle.conn).await {
                    self.hand_off(idle.conn, idle.id, idle.created_at, reservation, start)
                        .await?
                } else {
                    warn!(
                        pool = %self.inner.name,
                        connection_id = idle.id,
                        "Idle connection failed validation; replacing"
                    );
                    self.inner.manager.close(idle.conn).await;
                    self.open_and_hand_off(reservation, start).await?
                }
            }
            Checkout::Create(kind) => {
                let reservation = SlotReservation::new(&self.inner, kind);
                self.open_and_hand_off(reservation, start).await?
            }
        };

        let elapsed = start.elapsed();
        metrics::pool_acquisitions_total().add(1, &[]);
        metrics::pool_acquire_duration().record(elapsed.as_secs_f64() * 1000.0, &[]);

        let stats = self.stats();
        log_pool_operation(
            "acquire",
            stats.active_connections,
            stats.idle_connections,
            pooled.is_overflow().then_some("overflow"),
        );

        Ok(pooled)
    }

    /// Return a connection to the pool
    ///
    /// Overflow connections are closed. Base connections go back to the idle
    /// set unless the pool is closed or the idle set is already full.
    pub async fn release(&self, conn: PooledConnection<M>) {
        conn.release().await;
    }

    /// Execute a statement on a checked-out connection, counting it in the stats
    pub async fn execute(&self, conn: &mut PooledConnection<M>, sql: &str) -> RiskwatchResult<u64> {
        let result = self.inner.manager.execute(&mut **conn, sql).await;
        self.record_queries(1);
        result
    }

    /// Count statements run directly on a checked-out connection
    pub fn record_queries(&self, count: u64) {
        self.inner.state.lock().counters.total_queries += count;
    }

    /// Consistent snapshot taken under the pool lock
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total_connections: state.base_count + state.overflow_count,
            active_connections: state.active,
            idle_connections: state.idle.len(),
            overflow_connections: state.overflow_count,
            failed_connections: state.counters.failed_connections,
            total_queries: state.counters.total_queries,
            total_acquisitions: state.counters.total_acquisitions,
            average_acquire_time: state.counters.average_acquire_time(),
            max_acquire_time: state.counters.max_acquire_time,
            slow_acquires: state.counters.slow_acquires,
            exhausted_count: state.counters.exhausted_count,
            recycled_connections: state.counters.recycled_connections,
            peak_active: state.counters.peak_active,
            max_connections: self.inner.config.max_connections(),
            closed: state.closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Open idle connections until `min_idle` are available
    ///
    /// Returns how many were opened. Stops at the first creation failure.
    pub async fn warm_up(&self) -> Result<usize, PoolUnavailable> {
        let target = self.inner.config.min_idle;
        let mut created = 0;

        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolUnavailable::Closed);
                }
                if state.idle.len() >= target || state.base_count >= self.inner.config.pool_size {
                    break;
                }
                state.base_count += 1;
            }
            let reservation = SlotReservation::new(&self.inner, ConnectionKind::Base);

            let (conn, id, created_at) = self.open().await?;
            if let Some(conn) = self.park_idle(conn, id, created_at, reservation) {
                self.inner.manager.close(conn).await;
                return Err(PoolUnavailable::Closed);
            }
            created += 1;
        }

        debug!(pool = %self.inner.name, created = created, "Pool warm-up complete");
        Ok(created)
    }

    /// Close and replace idle connections older than the recycle age
    ///
    /// The aged connections are removed under the lock with their slots kept
    /// reserved; closing and reopening happen outside it.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let recycle_time = self.inner.config.recycle_time();
        let mut report = MaintenanceReport::default();

        let stale: VecDeque<IdleConnection<M::Connection>> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return report;
            }
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|idle| idle.created_at.elapsed() > recycle_time);
            state.idle = fresh;
            state.counters.recycled_connections += stale.len() as u64;
            stale
        };

        if stale.is_empty() {
            return report;
        }
        let reservations: Vec<_> = stale
            .iter()
            .map(|_| SlotReservation::new(&self.inner, ConnectionKind::Base))
            .collect();

        for idle in stale {
            self.inner.manager.close(idle.conn).await;
            report.recycled += 1;
        }
        metrics::pool_recycled_total().add(report.recycled as u64, &[]);

        for reservation in reservations {
            match self.open().await {
                Ok((conn, id, created_at)) => {
                    if let Some(conn) = self.park_idle(conn, id, created_at, reservation) {
                        self.inner.manager.close(conn).await;
                    } else {
                        report.replaced += 1;
                    }
                }
                Err(_) => report.failed += 1,
            }
        }

        info!(
            pool = %self.inner.name,
            recycled = report.recycled,
            replaced = report.replaced,
            failed = report.failed,
            "Pool maintenance pass complete"
        );
        report
    }

    /// Periodic maintenance until `shutdown` is triggered
    pub async fn run_maintenance_loop(self, shutdown: Arc<ShutdownSignal>) {
        let mut interval = tokio::time::interval(self.inner.config.maintenance_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        info!(pool = %self.inner.name, "Pool maintenance loop started");
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    self.run_maintenance().await;
                }
            }
        }
        info!(pool = %self.inner.name, "Pool maintenance loop stopped");
    }

    /// Close every idle connection and refuse further checkouts
    ///
    /// Connections still checked out are closed when they are released.
    pub async fn close_all(&self) {
        let drained: Vec<M::Connection> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).map(|idle| idle.conn).collect();
            state.base_count = state.base_count.saturating_sub(drained.len());
            drained
        };

        let closed = drained.len();
        for conn in drained {
            self.inner.manager.close(conn).await;
        }

        let stats = self.stats();
        info!(
            pool = %self.inner.name,
            closed = closed,
            still_active = stats.active_connections,
            "Connection pool closed"
        );
    }

    fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.inner.config.slow_acquire_threshold_ms)
    }

    fn unavailable(&self, err: PoolUnavailable) -> PoolUnavailable {
        metrics::pool_unavailable_total()
            .add(1, &[KeyValue::new("reason", err.reason_label())]);
        warn!(pool = %self.inner.name, error = %err, "Connection unavailable");
        err
    }

    /// Open a connection for an already reserved slot
    ///
    /// On failure the caller's reservation is dropped, which frees the slot.
    async fn open(&self) -> Result<(M::Connection, u64, Instant), PoolUnavailable> {
        match self.inner.manager.create().await {
            Ok(conn) => {
                let id = {
                    let mut state = self.inner.state.lock();
                    state.next_id += 1;
                    state.next_id
                };
                Ok((conn, id, Instant::now()))
            }
            Err(e) => {
                self.inner.state.lock().counters.failed_connections += 1;
                Err(self.unavailable(PoolUnavailable::CreationFailed {
                    reason: e.to_string(),
                }))
            }
        }
    }

    async fn open_and_hand_off(
        &self,
        reservation: SlotReservation<'_, M>,
        start: Instant,
    ) -> Result<PooledConnection<M>, PoolUnavailable> {
        let (conn, id, created_at) = self.open().await?;
        self.hand_off(conn, id, created_at, reservation, start).await
    }

    /// Mark a reserved slot as checked out, unless the pool closed meanwhile
    async fn hand_off(
        &self,
        conn: M::Connection,
        id: u64,
        created_at: Instant,
        reservation: SlotReservation<'_, M>,
        start: Instant,
    ) -> Result<PooledConnection<M>, PoolUnavailable> {
        let closed = {
            let mut state = self.inner.state.lock();
            if !state.closed {
                state.mark_checked_out(start.elapsed(), self.slow_threshold());
            }
            state.closed
        };

        if closed {
            drop(reservation);
            self.inner.manager.close(conn).await;
            return Err(self.unavailable(PoolUnavailable::Closed));
        }
        let kind = reservation.disarm();
        Ok(self.wrap(conn, id, created_at, kind))
    }

    /// Put a freshly opened base connection in the idle set. Returns it if the
    /// pool closed meanwhile.
    fn park_idle(
        &self,
        conn: M::Connection,
        id: u64,
        created_at: Instant,
        reservation: SlotReservation<'_, M>,
    ) -> Option<M::Connection> {
        {
            let mut state = self.inner.state.lock();
            if !state.closed {
                state.idle.push_back(IdleConnection {
                    conn,
                    id,
                    created_at,
                });
                drop(state);
                reservation.disarm();
                return None;
            }
        }
        drop(reservation);
        Some(conn)
    }

    fn wrap(
        &self,
        conn: M::Connection,
        id: u64,
        created_at: Instant,
        kind: ConnectionKind,
    ) -> PooledConnection<M> {
        PooledConnection {
            conn: Some(conn),
            id,
            created_at,
            kind,
            pool: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> PoolStatsSource for ConnectionPool<M> {
    fn pool_stats(&self) -> PoolStats {
        self.stats()
    }
}

/// A connection checked out of a [`ConnectionPool`]
///
/// Dereferences to the raw connection. Hand it back with
/// [`ConnectionPool::release`]; a connection that is simply dropped is
/// reclaimed as well, with a warning.
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    id: u64,
    created_at: Instant,
    kind: ConnectionKind,
    pool: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Identifier unique within the owning pool
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn is_overflow(&self) -> bool {
        self.kind == ConnectionKind::Overflow
    }

    /// Return this connection to the pool it came from
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(conn) = self.pool.check_in(conn, self.id, self.created_at, self.kind) {
                self.pool.manager.close(conn).await;
            }
        }
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `release` and `drop` take the connection, and both consume the guard
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection already returned"))
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled connection already returned"))
    }
}

impl<M: ConnectionManager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("age", &self.age())
            .finish()
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        warn!(
            pool = %self.pool.name,
            connection_id = self.id,
            "Pooled connection dropped without release; reclaiming"
        );

        if let Some(conn) = self.pool.check_in(conn, self.id, self.created_at, self.kind) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let pool = Arc::clone(&self.pool);
                    handle.spawn(async move { pool.manager.close(conn).await });
                }
                // No runtime to close on; dropping the handle releases it
                Err(_) => drop(conn),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Debug, Default)]
    struct FakeManager {
        next: AtomicU64,
        fail_create: AtomicBool,
        invalid: AtomicBool,
        closed: AtomicU64,
        create_delay_ms: AtomicU64,
    }

    #[derive(Debug)]
    struct FakeConnection {
        serial: u64,
    }

    #[async_trait]
    impl ConnectionManager for FakeManager {
        type Connection = FakeConnection;

        async fn create(&self) -> RiskwatchResult<FakeConnection> {
            let delay = self.create_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(RiskwatchError::DatabaseError("store offline".to_string()));
            }
            Ok(FakeConnection {
                serial: self.next.fetch_add(1, Ordering::SeqCst),
            })
        }

        async fn is_valid(&self, _conn: &mut FakeConnection) -> bool {
            !self.invalid.load(Ordering::SeqCst)
        }

        async fn close(&self, _conn: FakeConnection) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        async fn execute(&self, _conn: &mut FakeConnection, _sql: &str) -> RiskwatchResult<u64> {
            Ok(1)
        }
    }

    fn pool(pool_size: usize, max_overflow: usize) -> ConnectionPool<FakeManager> {
        let config = PoolConfig {
            pool_size,
            max_overflow,
            min_idle: 0,
            recycle_time_ms: 60_000,
            ..Default::default()
        };
        ConnectionPool::new("test", FakeManager::default(), config).unwrap()
    }

    #[tokio::test]
    async fn test_exhaustion_and_release() {
        let pool = pool(2, 0);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolUnavailable::Exhausted { active: 2, max_connections: 2 }));

        pool.release(a).await;
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().active_connections, 2);

        pool.release(b).await;
        pool.release(c).await;
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.exhausted_count, 1);
        assert_eq!(stats.peak_active, 2);
    }

    #[tokio::test]
    async fn test_overflow_connections_are_closed_on_release() {
        let pool = pool(1, 1);

        let base = pool.acquire().await.unwrap();
        let overflow = pool.acquire().await.unwrap();
        assert!(!base.is_overflow());
        assert!(overflow.is_overflow());
        assert!(pool.acquire().await.is_err());

        pool.release(overflow).await;
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().overflow_connections, 0);

        pool.release(base).await;
        let stats = pool.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.idle_connections, 1);
    }

    #[tokio::test]
    async fn test_creation_failure_is_counted_not_fatal() {
        let pool = pool(2, 0);
        pool.manager().fail_create.store(true, Ordering::SeqCst);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolUnavailable::CreationFailed { .. }));

        let stats = pool.stats();
        assert_eq!(stats.failed_connections, 1);
        assert_eq!(stats.total_connections, 0);

        pool.manager().fail_create.store(false, Ordering::SeqCst);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_idle_connection_is_replaced_on_acquire() {
        let pool = pool(1, 0);
        let conn = pool.acquire().await.unwrap();
        let first_serial = conn.serial;
        pool.release(conn).await;

        tokio::time::advance(Duration::from_secs(61)).await;

        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.serial, first_serial);
        assert!(conn.age() <= pool.config().recycle_time());
        assert_eq!(pool.stats().recycled_connections, 1);
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_replaces_only_aged_connections() {
        let pool = pool(3, 0);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        let c = pool.acquire().await.unwrap();
        let d = pool.acquire().await.unwrap();
        let e = pool.acquire().await.unwrap();
        pool.release(c).await;
        pool.release(d).await;
        pool.release(e).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = pool.run_maintenance().await;
        // Only the connection created after the first advance is still fresh
        assert_eq!(report.recycled, 2);
        assert_eq!(report.replaced, 2);
        assert_eq!(report.failed, 0);

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 3);
        assert_eq!(stats.total_connections, 3);
    }

    #[tokio::test]
    async fn test_validate_on_checkout_replaces_invalid_connection() {
        let config = PoolConfig {
            pool_size: 1,
            max_overflow: 0,
            min_idle: 0,
            validate_on_checkout: true,
            ..Default::default()
        };
        let pool = ConnectionPool::new("test", FakeManager::default(), config).unwrap();

        let conn = pool.acquire().await.unwrap();
        let serial = conn.serial;
        pool.release(conn).await;

        pool.manager().invalid.store(true, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.serial, serial);
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_is_reclaimed() {
        let pool = pool(1, 0);
        {
            let _conn = pool.acquire().await.unwrap();
            assert!(pool.acquire().await.is_err());
        }
        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_warm_up_and_close_all() {
        let config = PoolConfig {
            pool_size: 4,
            max_overflow: 0,
            min_idle: 3,
            ..Default::default()
        };
        let pool = ConnectionPool::new("test", FakeManager::default(), config).unwrap();

        assert_eq!(pool.warm_up().await.unwrap(), 3);
        assert_eq!(pool.stats().idle_connections, 3);
        assert_eq!(pool.warm_up().await.unwrap(), 0);

        let held = pool.acquire().await.unwrap();
        pool.close_all().await;
        assert!(pool.is_closed());
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.acquire().await.unwrap_err(), PoolUnavailable::Closed);

        pool.release(held).await;
        let stats = pool.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_gives_back_its_slot() {
        let pool = pool(1, 0);
        pool.manager().create_delay_ms.store(200, Ordering::SeqCst);

        let outcome = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
        assert!(outcome.is_err(), "acquire should still be creating");

        let stats = pool.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);

        pool.manager().create_delay_ms.store(0, Ordering::SeqCst);
        let conn = pool.acquire().await.expect("slot returned after cancellation");
        pool.release(conn).await;
        assert_eq!(pool.stats().idle_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_recycle_gives_back_its_slot() {
        let pool = pool(1, 0);
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        pool.manager().create_delay_ms.store(200, Ordering::SeqCst);
        let outcome = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
        assert!(outcome.is_err());

        // The aged handle was closed and its replacement abandoned
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total_connections, 0);

        pool.manager().create_delay_ms.store(0, Ordering::SeqCst);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_maintenance_keeps_slot_counts_accurate() {
        let pool = pool(2, 0);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        pool.manager().create_delay_ms.store(200, Ordering::SeqCst);
        let outcome = tokio::time::timeout(Duration::from_millis(10), pool.run_maintenance()).await;
        assert!(outcome.is_err());
        assert_eq!(pool.stats().total_connections, 0);

        pool.manager().create_delay_ms.store(0, Ordering::SeqCst);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;
    }

    #[tokio::test]
    async fn test_execute_counts_queries() {
        let pool = pool(1, 0);
        let mut conn = pool.acquire().await.unwrap();
        pool.execute(&mut conn, "SELECT 1").await.unwrap();
        pool.execute(&mut conn, "SELECT 2").await.unwrap();
        pool.release(conn).await;
        assert_eq!(pool.stats().total_queries, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checkouts_never_share() {
        let pool = pool(4, 4);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.acquire().await }));
        }

        let mut held = Vec::new();
        for handle in handles {
            held.push(handle.await.unwrap().unwrap());
        }
        let ids: HashSet<u64> = held.iter().map(|c| c.id()).collect();
        assert_eq!(ids.len(), 8);
        assert!(pool.acquire().await.is_err());

        for conn in held {
            pool.release(conn).await;
        }
    }
}
