//! Bounded pool of vendor sessions.
//!
//! All pool state (idle set, busy set, in-flight handshakes and the waiter
//! queue) lives in one [`PoolState`] behind one mutex; every transition
//! happens while holding it, which is what keeps
//! `idle + busy + connecting <= capacity`.
//!
//! Checkouts are handed out as [`PooledConnection`] guards. Dropping a guard
//! returns the connection, so a cancelled or panicking caller cannot leak a
//! slot. Waiters are served strictly in arrival order: a returned connection
//! (or a freed slot) goes to the oldest live waiter before anyone else.
//!
//! ```text
//! connecting ──► busy ⇄ idle
//!     │            │     │
//!     ▼            ▼     ▼
//!   closed ◄──── closing ◄┘
//! ```

use crate::config::PoolConfig;
use crate::error::HsmError;
use crate::vendor::{VendorAdapter, VendorEndpoint, VendorError, VendorSession};

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

pub type ConnectionId = u64;

// ---------------------------------------------------------------------------
// Connection state machine
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Idle,
    Busy,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Busy)
                | (Connecting, Idle)
                | (Connecting, Closed)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Idle, Closing)
                | (Busy, Closing)
                | (Closing, Closed)
        )
    }
}

/// A live vendor session owned by the pool.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    session: VendorSession,
    state: ConnectionState,
    checkouts: u64,
}

impl Connection {
    fn new(id: ConnectionId, session: VendorSession) -> Self {
        Self {
            id,
            session,
            state: ConnectionState::Connecting,
            checkouts: 0,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            tracing::error!(
                connection = self.id,
                from = ?self.state,
                to = ?next,
                "invalid connection state transition"
            );
        }
        if next == ConnectionState::Busy {
            self.checkouts += 1;
        }
        self.state = next;
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

/// What a waiter is woken with.
enum Grant {
    /// An idle connection, already checked out to the waiter.
    Connection(PooledConnection),
    /// A free slot; the waiter opens its own connection.
    Slot(SlotReservation),
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    opened: u64,
    closed: u64,
    handshake_failures: u64,
    timeouts: u64,
    checkouts: u64,
}

struct PoolState {
    idle: VecDeque<Connection>,
    /// Checked-out connections. Sessions are kept so shutdown can force them
    /// closed.
    busy: HashMap<ConnectionId, VendorSession>,
    /// Handshakes in flight; they hold a slot.
    connecting: usize,
    waiters: VecDeque<Waiter>,
    closed: bool,
    next_connection: ConnectionId,
    next_waiter: u64,
    counters: Counters,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.busy.len() + self.connecting
    }

    fn drained(&self) -> bool {
        self.busy.is_empty() && self.connecting == 0
    }

    /// Move a connection to the busy set.
    fn check_out(&mut self, conn: &mut Connection) {
        conn.transition(ConnectionState::Busy);
        self.busy.insert(conn.id, conn.session.clone());
        self.counters.checkouts += 1;
    }
}

struct PoolInner {
    adapter: Arc<dyn VendorAdapter>,
    endpoint: VendorEndpoint,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Signalled when the last busy connection comes back after shutdown.
    drained: Notify,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn notify_if_drained(&self, state: &PoolState) {
        if state.closed && state.drained() {
            self.drained.notify_waiters();
        }
    }

    /// Hand idle connections and free slots to waiters, oldest first.
    /// Must be called with the state lock held.
    fn dispatch(self: &Arc<Self>, state: &mut PoolState) {
        while !state.waiters.is_empty() {
            let has_idle = !state.idle.is_empty();
            if !has_idle && state.total() >= self.config.capacity {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            // Abandoned by a cancelled acquire.
            if waiter.tx.is_closed() {
                continue;
            }

            let grant = match state.idle.pop_front() {
                Some(mut conn) => {
                    state.check_out(&mut conn);
                    Grant::Connection(PooledConnection::new(conn, self.clone()))
                }
                None => {
                    state.connecting += 1;
                    Grant::Slot(SlotReservation::new(self.clone()))
                }
            };

            // The receiver may have gone away since the check above. Undo
            // without running the guards' Drop, which would re-enter the lock.
            if let Err(grant) = waiter.tx.send(grant) {
                match grant {
                    Grant::Connection(guard) => {
                        if let Some(mut conn) = guard.into_connection() {
                            state.busy.remove(&conn.id);
                            state.counters.checkouts -= 1;
                            conn.transition(ConnectionState::Idle);
                            state.idle.push_front(conn);
                        }
                    }
                    Grant::Slot(slot) => {
                        slot.disarm();
                        state.connecting -= 1;
                    }
                }
            }
        }
    }

    /// Return a checked-out connection.
    fn release(self: &Arc<Self>, mut conn: Connection, healthy: bool) -> ReleaseOutcome {
        let mut to_close = None;
        let outcome = {
            let mut state = self.lock();
            let outcome = if state.busy.remove(&conn.id).is_none() {
                // Force-closed by shutdown while checked out.
                ReleaseOutcome::Discarded
            } else if state.closed || !healthy {
                state.counters.closed += 1;
                to_close = Some(conn);
                ReleaseOutcome::Closed
            } else {
                conn.transition(ConnectionState::Idle);
                state.idle.push_back(conn);
                ReleaseOutcome::Idle
            };
            self.dispatch(&mut state);
            self.notify_if_drained(&state);
            outcome
        };

        if let Some(conn) = to_close {
            if !healthy {
                tracing::warn!(connection = conn.id, "closing unhealthy pool connection");
            }
            self.close_detached(conn);
        }
        outcome
    }

    /// Close without waiting for the vendor. Used from Drop paths.
    fn close_detached(&self, mut conn: Connection) {
        conn.transition(ConnectionState::Closing);
        let adapter = self.adapter.clone();
        let session = conn.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || adapter.disconnect(&session));
            }
            Err(_) => adapter.disconnect(&session),
        }
        conn.transition(ConnectionState::Closed);
        tracing::debug!(connection = conn.id, checkouts = conn.checkouts, "pool connection closed");
    }

    async fn disconnect(&self, session: VendorSession) {
        let adapter = self.adapter.clone();
        if tokio::task::spawn_blocking(move || adapter.disconnect(&session))
            .await
            .is_err()
        {
            tracing::warn!("vendor disconnect panicked");
        }
    }

    /// Open a connection into a reserved slot. The result is checked out.
    async fn connect(self: &Arc<Self>, slot: SlotReservation) -> Result<PooledConnection, HsmError> {
        let adapter = self.adapter.clone();
        let endpoint = self.endpoint.clone();
        let session = match tokio::task::spawn_blocking(move || adapter.connect(&endpoint)).await {
            Ok(result) => result,
            Err(join) => Err(VendorError::panicked(join)),
        };

        let opened = {
            let mut state = self.lock();
            slot.disarm();
            state.connecting -= 1;

            match session {
                Ok(session) if state.closed => {
                    self.notify_if_drained(&state);
                    Err(session)
                }
                Ok(session) => {
                    let id = state.next_connection;
                    state.next_connection += 1;
                    state.counters.opened += 1;
                    let mut conn = Connection::new(id, session);
                    state.check_out(&mut conn);
                    Ok(conn)
                }
                Err(e) => {
                    // Handshake failed: the connection never existed. Its slot
                    // goes to the oldest waiter, which opens its own.
                    state.counters.handshake_failures += 1;
                    self.dispatch(&mut state);
                    self.notify_if_drained(&state);
                    tracing::warn!(code = %e.code, error = %e.message, "pool connection handshake failed");
                    return Err(e.into_hsm(self.adapter.name()));
                }
            }
        };

        match opened {
            Ok(conn) => {
                tracing::debug!(connection = conn.id, "pool connection opened");
                Ok(PooledConnection::new(conn, self.clone()))
            }
            Err(session) => {
                self.disconnect(session).await;
                Err(HsmError::PoolClosed)
            }
        }
    }

    /// Open a connection on a separate task so the caller can give up
    /// waiting without abandoning a half-open session.
    async fn open(
        self: &Arc<Self>,
        slot: SlotReservation,
        deadline: Instant,
        started: Instant,
    ) -> Result<PooledConnection, HsmError> {
        let (tx, mut rx) = oneshot::channel();
        let inner = self.clone();
        tokio::spawn(async move {
            let result = inner.connect(slot).await;
            // If nobody is listening the guard inside is dropped here and
            // returns the connection to the pool.
            let _ = tx.send(result);
        });

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HsmError::PoolClosed),
            Err(_) => {
                rx.close();
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(self.timed_out(started)),
                }
            }
        }
    }

    fn timed_out(&self, started: Instant) -> HsmError {
        let waited = started.elapsed();
        self.lock().counters.timeouts += 1;
        tracing::warn!(waited_ms = waited.as_millis() as u64, "pool acquire timed out");
        HsmError::PoolTimeout { waited }
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// A reserved but not yet opened slot. Dropping it frees the slot.
struct SlotReservation {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl SlotReservation {
    fn new(pool: Arc<PoolInner>) -> Self {
        Self { pool, armed: true }
    }

    /// Caller has taken over the slot accounting.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.lock();
            state.connecting -= 1;
            self.pool.dispatch(&mut state);
            self.pool.notify_if_drained(&state);
        }
    }
}

/// What happened to a checkout on release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Back in the idle set (or straight to a waiter).
    Idle,
    /// Reported unhealthy, or the pool is shutting down; disconnected.
    Closed,
    /// Already force-closed by shutdown.
    Discarded,
    /// This checkout was released before; nothing changed.
    AlreadyReleased,
}

/// Exclusive checkout of one pooled connection.
///
/// Released exactly once: explicitly through [`release`](Self::release), or
/// as healthy when dropped.
pub struct PooledConnection {
    id: ConnectionId,
    session: VendorSession,
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<PoolInner>) -> Self {
        Self {
            id: conn.id,
            session: conn.session.clone(),
            conn: Some(conn),
            pool,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session(&self) -> &VendorSession {
        &self.session
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Return the connection. `healthy = false` closes it permanently.
    pub fn release(&mut self, healthy: bool) -> ReleaseOutcome {
        match self.conn.take() {
            Some(conn) => self.pool.release(conn, healthy),
            None => ReleaseOutcome::AlreadyReleased,
        }
    }

    fn into_connection(mut self) -> Option<Connection> {
        self.conn.take()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, true);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub busy: usize,
    pub connecting: usize,
    pub waiting: usize,
    pub opened: u64,
    pub closed: u64,
    pub handshake_failures: u64,
    pub timeouts: u64,
    pub checkouts: u64,
    pub shut_down: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub waiters_failed: usize,
    pub idle_closed: usize,
    /// Busy connections still out when the grace period ended.
    pub forced_closed: usize,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(adapter: Arc<dyn VendorAdapter>, endpoint: VendorEndpoint, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                adapter,
                endpoint,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    busy: HashMap::new(),
                    connecting: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                    next_connection: 1,
                    next_waiter: 0,
                    counters: Counters::default(),
                }),
                drained: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    /// Check out a connection, waiting at most `timeout` for one.
    ///
    /// Idle connections are reused first; below capacity a new one is
    /// opened; otherwise the caller queues behind earlier waiters.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection, HsmError> {
        let started = Instant::now();
        let deadline = started + timeout;

        let queued = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(HsmError::PoolClosed);
            }
            if let Some(mut conn) = state.idle.pop_front() {
                state.check_out(&mut conn);
                return Ok(PooledConnection::new(conn, self.inner.clone()));
            }
            if state.total() < self.inner.config.capacity {
                state.connecting += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let id = state.next_waiter;
                state.next_waiter += 1;
                state.waiters.push_back(Waiter { id, tx });
                Some((id, rx))
            }
        };

        let grant = match queued {
            None => Grant::Slot(SlotReservation::new(self.inner.clone())),
            Some((waiter_id, mut rx)) => match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(Ok(grant)) => grant,
                Ok(Err(_)) => return Err(HsmError::PoolClosed),
                Err(_) => {
                    let mut state = self.inner.lock();
                    if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
                        state.waiters.remove(pos);
                        drop(state);
                        return Err(self.inner.timed_out(started));
                    }
                    drop(state);
                    // Served between the deadline and taking the lock.
                    match rx.try_recv() {
                        Ok(grant) => grant,
                        Err(_) => return Err(HsmError::PoolClosed),
                    }
                }
            },
        };

        match grant {
            Grant::Connection(conn) => Ok(conn),
            Grant::Slot(slot) => self.inner.open(slot, deadline, started).await,
        }
    }

    /// Release a checkout. Equivalent to [`PooledConnection::release`].
    pub fn release(&self, conn: &mut PooledConnection, healthy: bool) -> ReleaseOutcome {
        conn.release(healthy)
    }

    /// Open up to `count` idle connections ahead of demand. Failures are
    /// logged; returns how many were opened.
    pub async fn warm_up(&self, count: usize) -> usize {
        let mut opened = 0;
        for _ in 0..count {
            let slot = {
                let mut state = self.inner.lock();
                if state.closed || state.total() >= self.inner.config.capacity {
                    break;
                }
                state.connecting += 1;
                SlotReservation::new(self.inner.clone())
            };
            match self.inner.connect(slot).await {
                Ok(mut conn) => {
                    conn.release(true);
                    opened += 1;
                }
                Err(e) => tracing::warn!(error = %e, "pool warm-up connection failed"),
            }
        }
        opened
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            capacity: self.inner.config.capacity,
            idle: state.idle.len(),
            busy: state.busy.len(),
            connecting: state.connecting,
            waiting: state.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
            opened: state.counters.opened,
            closed: state.counters.closed,
            handshake_failures: state.counters.handshake_failures,
            timeouts: state.counters.timeouts,
            checkouts: state.counters.checkouts,
            shut_down: state.closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Fail every waiter, close idle connections now and busy ones once
    /// they return or the grace period runs out, whichever comes first.
    pub async fn shutdown(&self) -> ShutdownReport {
        let (waiters, idle) = {
            let mut state = self.inner.lock();
            if state.closed {
                return ShutdownReport::default();
            }
            state.closed = true;
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            let idle: Vec<Connection> = state.idle.drain(..).collect();
            state.counters.closed += idle.len() as u64;
            (waiters, idle)
        };
        // Dropping the senders wakes each waiter with PoolClosed.
        let waiters_failed = waiters.len();
        drop(waiters);

        let idle_closed = idle.len();
        for mut conn in idle {
            conn.transition(ConnectionState::Closing);
            self.inner.disconnect(conn.session.clone()).await;
            conn.transition(ConnectionState::Closed);
        }

        let deadline = Instant::now() + self.inner.config.shutdown_grace();
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.lock().drained() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let forced: Vec<(ConnectionId, VendorSession)> = {
            let mut state = self.inner.lock();
            let forced: Vec<_> = state.busy.drain().collect();
            state.counters.closed += forced.len() as u64;
            forced
        };
        for (id, session) in &forced {
            tracing::warn!(connection = id, "force-closing busy connection after grace period");
            self.inner.disconnect(session.clone()).await;
        }

        tracing::info!(
            waiters_failed,
            idle_closed,
            forced_closed = forced.len(),
            "connection pool shut down"
        );
        ShutdownReport {
            waiters_failed,
            idle_closed,
            forced_closed: forced.len(),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").field("stats", &self.stats()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthMethod;
    use crate::vendor::SoftToken;

    fn pool(capacity: usize) -> (ConnectionPool, Arc<SoftToken>) {
        let token = Arc::new(SoftToken::simulated(1));
        let endpoint = VendorEndpoint {
            address: "slot:0".into(),
            auth: AuthMethod::None,
            credential: None,
        };
        let config = PoolConfig {
            capacity,
            shutdown_grace_ms: 100,
            ..PoolConfig::default()
        };
        (ConnectionPool::new(token.clone(), endpoint, config), token)
    }

    #[test]
    fn transition_table() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Idle));
        assert!(!Closed.can_transition_to(Idle));
        assert!(!Connecting.can_transition_to(Closing));
    }

    #[tokio::test]
    async fn reuses_idle_connection() {
        let (pool, token) = pool(2);
        let mut c = pool.acquire(Duration::from_millis(500)).await.unwrap();
        let id = c.id();
        assert_eq!(c.release(true), ReleaseOutcome::Idle);

        let c2 = pool.acquire(Duration::from_millis(500)).await.unwrap();
        assert_eq!(c2.id(), id);
        assert_eq!(pool.stats().opened, 1);
        assert_eq!(token.open_sessions(), 1);
    }

    #[tokio::test]
    async fn double_release_is_ignored() {
        let (pool, _) = pool(1);
        let mut c = pool.acquire(Duration::from_millis(500)).await.unwrap();
        assert_eq!(pool.release(&mut c, true), ReleaseOutcome::Idle);
        assert_eq!(pool.release(&mut c, true), ReleaseOutcome::AlreadyReleased);
        drop(c);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.busy, 0);
    }

    #[tokio::test]
    async fn unhealthy_release_closes() {
        let (pool, _) = pool(1);
        let mut c = pool.acquire(Duration::from_millis(500)).await.unwrap();
        assert_eq!(c.release(false), ReleaseOutcome::Closed);
        let stats = pool.stats();
        assert_eq!(stats.idle + stats.busy, 0);
        assert_eq!(stats.closed, 1);

        // lazily replaced
        let c = pool.acquire(Duration::from_millis(500)).await.unwrap();
        assert_ne!(c.id(), 1);
    }

    #[tokio::test]
    async fn dropped_guard_returns_connection() {
        let (pool, _) = pool(1);
        {
            let _c = pool.acquire(Duration::from_millis(500)).await.unwrap();
            assert_eq!(pool.stats().busy, 1);
        }
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn warm_up_fills_idle_set() {
        let (pool, token) = pool(3);
        assert_eq!(pool.warm_up(5).await, 3);
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(token.open_sessions(), 3);
    }

    #[tokio::test]
    async fn shutdown_closes_idle_and_rejects_acquire() {
        let (pool, token) = pool(2);
        pool.warm_up(2).await;
        let report = pool.shutdown().await;
        assert_eq!(report.idle_closed, 2);
        assert_eq!(token.open_sessions(), 0);
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)).await,
            Err(HsmError::PoolClosed)
        ));
    }
}
