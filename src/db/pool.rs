//! Connection pool for one backend target.
//!
//! The pool owns a bounded set of live connections. All state changes (idle
//! set, busy count, waiter queue) go through one mutex-guarded critical
//! section, so `|idle| + |busy| <= max_size` holds at every point where the
//! lock is released. `busy` counts handles checked out and slots reserved for
//! connections still being created.
//!
//! Waiters are served strictly FIFO: a released handle, or a freed slot, goes
//! directly to the longest-waiting caller before it can reach the idle set.

use crate::backend::{Connection, ConnectionFactory};
use crate::error::{DbError, DbResult};
use crate::models::Capabilities;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Validated pool sizing and timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    /// Idle handles unused for longer than this are evicted (never below `min_size`).
    pub idle_ttl: Duration,
    pub health_check_interval: Duration,
    /// Ping idle handles before handing them out.
    pub test_before_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_ttl: Duration::from_secs(600),
            health_check_interval: Duration::from_secs(30),
            test_before_acquire: false,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> DbResult<()> {
        if self.max_size == 0 {
            return Err(DbError::invalid_input("pool max_size must be greater than 0"));
        }
        if self.min_size > self.max_size {
            return Err(DbError::invalid_input(format!(
                "pool min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(DbError::invalid_input(
                "pool health_check_interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// A live connection plus its pool bookkeeping.
pub struct ConnectionHandle {
    id: u64,
    created_at: Instant,
    last_used_at: Instant,
    healthy: bool,
    conn: Box<dyn Connection>,
}

impl ConnectionHandle {
    fn new(id: u64, conn: Box<dyn Connection>) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            healthy: true,
            conn,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("healthy", &self.healthy)
            .finish_non_exhaustive()
    }
}

/// What a waiter is handed: a ready handle, or a reserved slot to fill.
enum Grant {
    Handle(ConnectionHandle),
    Slot,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<ConnectionHandle>,
    busy: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    closed: bool,
}

impl PoolState {
    /// Hand `grant` to the oldest live waiter; returns it if nobody took it.
    fn hand_off(&mut self, mut grant: Grant) -> Option<Grant> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }

    fn prune_waiters(&mut self) {
        while self.waiters.front().is_some_and(|w| w.is_closed()) {
            self.waiters.pop_front();
        }
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    discarded: AtomicU64,
    evicted: AtomicU64,
    timeouts: AtomicU64,
    acquired: AtomicU64,
}

struct Shared {
    target: String,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    counters: Counters,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return a checked-out handle. Unhealthy handles are discarded and their
    /// slot passed on.
    fn release(&self, handle: ConnectionHandle, healthy: bool) {
        self.check_in(handle, healthy, true);
    }

    fn check_in(&self, mut handle: ConnectionHandle, healthy: bool, touch: bool) {
        handle.healthy = healthy;
        if touch {
            handle.last_used_at = Instant::now();
        }
        let mut state = self.lock();

        if !healthy || state.closed {
            let passed_on = !state.closed && state.hand_off(Grant::Slot).is_none();
            if !passed_on {
                state.busy = state.busy.saturating_sub(1);
            }
            drop(state);
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(target_id = %self.target, connection_id = handle.id, "Discarding connection");
            close_in_background(handle);
            return;
        }

        if let Some(Grant::Handle(handle)) = state.hand_off(Grant::Handle(handle)) {
            state.busy = state.busy.saturating_sub(1);
            state.idle.push_back(handle);
        }
    }

    /// Give back a reserved slot whose connection was never created.
    fn release_slot(&self) {
        let mut state = self.lock();
        if state.closed || state.hand_off(Grant::Slot).is_some() {
            state.busy = state.busy.saturating_sub(1);
        }
    }

    fn return_grant(&self, grant: Grant) {
        match grant {
            Grant::Handle(handle) => self.release(handle, true),
            Grant::Slot => self.release_slot(),
        }
    }

    async fn open_connection(&self) -> DbResult<ConnectionHandle> {
        let conn = self.factory.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(target_id = %self.target, connection_id = id, "Created connection");
        Ok(ConnectionHandle::new(id, conn))
    }
}

/// Close a dropped connection without blocking the caller.
fn close_in_background(mut handle: ConnectionHandle) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = handle.conn.close().await {
                debug!(connection_id = handle.id, error = %e, "Error closing connection");
            }
        });
    }
}

/// Releases a reserved slot unless disarmed.
struct SlotGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_slot();
        }
    }
}

/// Recovers a grant that raced with a waiter giving up.
struct Waiter<'a> {
    shared: &'a Shared,
    rx: oneshot::Receiver<Grant>,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(grant) = self.rx.try_recv() {
            self.shared.return_grant(grant);
        }
    }
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub evicted: usize,
    pub failed_probes: usize,
    pub replenished: usize,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub target: String,
    pub idle: usize,
    pub busy: usize,
    pub waiters: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub created: u64,
    pub discarded: u64,
    pub evicted: u64,
    pub timeouts: u64,
    pub acquired: u64,
    pub closed: bool,
}

/// A bounded pool of connections to one target.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("target", &self.shared.target)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create an empty pool. No connections are opened and no background task
    /// is started; see [`Pool::connect`].
    pub fn new(
        target: impl Into<String>,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> DbResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                target: target.into(),
                config,
                factory,
                state: Mutex::new(PoolState::default()),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
                maintenance: Mutex::new(None),
            }),
        })
    }

    /// Create a pool, open `min_size` connections and start the background
    /// maintenance task.
    pub async fn connect(
        target: impl Into<String>,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> DbResult<Self> {
        let pool = Self::new(target, config, factory)?;
        pool.replenish().await?;
        pool.start_maintenance();
        info!(
            target_id = %pool.shared.target,
            min_size = pool.shared.config.min_size,
            max_size = pool.shared.config.max_size,
            "Pool ready"
        );
        Ok(pool)
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.shared.factory.capabilities()
    }

    /// Acquire with the configured acquire timeout.
    pub async fn get(&self) -> DbResult<PooledConnection> {
        self.acquire(self.shared.config.acquire_timeout).await
    }

    /// Acquire with the configured timeout, shortened to the caller's deadline.
    pub async fn acquire_by(&self, deadline: Option<Instant>) -> DbResult<PooledConnection> {
        let timeout = match deadline {
            Some(d) => self
                .shared
                .config
                .acquire_timeout
                .min(d.saturating_duration_since(Instant::now())),
            None => self.shared.config.acquire_timeout,
        };
        self.acquire(timeout).await
    }

    /// Acquire a connection, waiting at most `timeout`.
    ///
    /// Fails with `PoolTimeout` when no handle frees up in time, or with the
    /// factory's error when a new connection cannot be opened.
    pub async fn acquire(&self, timeout: Duration) -> DbResult<PooledConnection> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.reserve(deadline).await? {
                Grant::Handle(handle) => {
                    let mut conn = PooledConnection::new(handle, Arc::clone(&self.shared));
                    if self.shared.config.test_before_acquire {
                        let probe = conn.connection()?.ping().await;
                        if let Err(e) = conn.settle(probe) {
                            warn!(
                                target_id = %self.shared.target,
                                connection_id = conn.id(),
                                error = %e,
                                "Idle connection failed pre-acquire ping"
                            );
                            conn.mark_broken();
                            drop(conn);
                            continue;
                        }
                    }
                    self.shared.counters.acquired.fetch_add(1, Ordering::Relaxed);
                    return Ok(conn);
                }
                Grant::Slot => {
                    let mut guard = SlotGuard {
                        shared: &self.shared,
                        armed: true,
                    };
                    let opened =
                        tokio::time::timeout_at(deadline, self.shared.open_connection()).await;
                    let handle = match opened {
                        Ok(result) => result?,
                        Err(_) => {
                            self.shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                            return Err(DbError::pool_timeout(
                                &self.shared.target,
                                timeout.as_millis() as u64,
                            ));
                        }
                    };
                    guard.armed = false;
                    self.shared.counters.acquired.fetch_add(1, Ordering::Relaxed);
                    return Ok(PooledConnection::new(handle, Arc::clone(&self.shared)));
                }
            }
        }
    }

    /// Take an idle handle or a free slot, or queue until one is handed over.
    async fn reserve(&self, deadline: Instant) -> DbResult<Grant> {
        let rx = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(DbError::connection_fatal(format!(
                    "pool for '{}' is closed",
                    self.shared.target
                )));
            }
            state.prune_waiters();
            if state.waiters.is_empty() {
                if let Some(handle) = state.idle.pop_back() {
                    state.busy += 1;
                    return Ok(Grant::Handle(handle));
                }
                if state.idle.len() + state.busy < self.shared.config.max_size {
                    state.busy += 1;
                    return Ok(Grant::Slot);
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let started = Instant::now();
        let mut waiter = Waiter {
            shared: &self.shared,
            rx,
        };
        match tokio::time::timeout_at(deadline, &mut waiter.rx).await {
            Ok(Ok(grant)) => Ok(grant),
            Ok(Err(_)) => Err(DbError::connection_fatal(format!(
                "pool for '{}' closed while waiting",
                self.shared.target
            ))),
            Err(_) => {
                self.shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!(target_id = %self.shared.target, waited_ms, "Timed out waiting for connection");
                Err(DbError::pool_timeout(&self.shared.target, waited_ms))
            }
        }
    }

    /// Return a handle with an explicit health verdict.
    pub fn release(&self, conn: PooledConnection, healthy: bool) {
        conn.release(healthy);
    }

    /// Evict expired idle handles, probe the rest and refill to `min_size`.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            evicted: self.evict_idle(),
            ..MaintenanceReport::default()
        };
        report.failed_probes = self.probe_idle().await;
        report.replenished = match self.replenish().await {
            Ok(n) => n,
            Err(e) => {
                warn!(target_id = %self.shared.target, error = %e, "Failed to replenish pool");
                0
            }
        };
        report
    }

    fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let ttl = self.shared.config.idle_ttl;
        let min = self.shared.config.min_size;
        let mut evicted = Vec::new();
        {
            let mut state = self.shared.lock();
            // Oldest entries sit at the front of the idle queue
            while state.idle.len() + state.busy > min {
                let expired = state
                    .idle
                    .front()
                    .is_some_and(|h| now.duration_since(h.last_used_at) > ttl);
                if !expired {
                    break;
                }
                if let Some(handle) = state.idle.pop_front() {
                    evicted.push(handle);
                }
            }
        }
        let count = evicted.len();
        for handle in evicted {
            debug!(target_id = %self.shared.target, connection_id = handle.id, "Evicting idle connection");
            close_in_background(handle);
        }
        if count > 0 {
            self.shared
                .counters
                .evicted
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Ping every idle handle; failed ones are discarded.
    async fn probe_idle(&self) -> usize {
        let handles: Vec<ConnectionHandle> = {
            let mut state = self.shared.lock();
            let handles: Vec<_> = state.idle.drain(..).collect();
            state.busy += handles.len();
            handles
        };
        let mut failed = 0;
        for mut handle in handles {
            let healthy = match handle.conn.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        target_id = %self.shared.target,
                        connection_id = handle.id,
                        error = %e,
                        "Health probe failed"
                    );
                    failed += 1;
                    false
                }
            };
            // Probing is not use; keep the idle clock running
            self.shared.check_in(handle, healthy, false);
        }
        failed
    }

    /// Open connections until `idle + busy >= min_size`.
    async fn replenish(&self) -> DbResult<usize> {
        let mut opened = 0;
        loop {
            {
                let mut state = self.shared.lock();
                if state.closed || state.idle.len() + state.busy >= self.shared.config.min_size {
                    return Ok(opened);
                }
                state.busy += 1;
            }
            let mut guard = SlotGuard {
                shared: &self.shared,
                armed: true,
            };
            let handle = self.shared.open_connection().await?;
            guard.armed = false;
            self.shared.release(handle, true);
            opened += 1;
        }
    }

    fn start_maintenance(&self) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let interval = self.shared.config.health_check_interval;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if shared.lock().closed {
                    break;
                }
                let report = Pool { shared }.run_maintenance().await;
                if report != MaintenanceReport::default() {
                    debug!(
                        evicted = report.evicted,
                        failed_probes = report.failed_probes,
                        replenished = report.replenished,
                        "Pool maintenance"
                    );
                }
            }
        });
        let mut slot = self
            .shared
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let c = &self.shared.counters;
        PoolStats {
            target: self.shared.target.clone(),
            idle: state.idle.len(),
            busy: state.busy,
            waiters: state.live_waiters(),
            min_size: self.shared.config.min_size,
            max_size: self.shared.config.max_size,
            created: c.created.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            acquired: c.acquired.load(Ordering::Relaxed),
            closed: state.closed,
        }
    }

    /// Shut the pool down: fail pending waiters, close idle handles, stop
    /// maintenance. Checked-out handles are discarded when they come back.
    pub async fn close(&self) {
        let idle: Vec<ConnectionHandle> = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.waiters.clear();
            state.idle.drain(..).collect()
        };
        if let Some(task) = self
            .shared
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        for mut handle in idle {
            if let Err(e) = handle.conn.close().await {
                debug!(connection_id = handle.id, error = %e, "Error closing connection");
            }
        }
        info!(target_id = %self.shared.target, "Pool closed");
    }
}

/// A checked-out connection.
///
/// Dropping it returns the handle to the pool. The handle is discarded instead
/// when it was marked broken, or when it is dropped in the middle of a backend
/// call (see [`PooledConnection::connection`]).
pub struct PooledConnection {
    handle: Option<ConnectionHandle>,
    shared: Arc<Shared>,
    broken: bool,
    in_call: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("target", &self.shared.target)
            .field("handle", &self.handle)
            .field("broken", &self.broken)
            .finish()
    }
}

impl PooledConnection {
    fn new(handle: ConnectionHandle, shared: Arc<Shared>) -> Self {
        Self {
            handle: Some(handle),
            shared,
            broken: false,
            in_call: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.as_ref().map(|h| h.id).unwrap_or_default()
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }

    pub fn capabilities(&self) -> Capabilities {
        self.handle
            .as_ref()
            .map(|h| h.conn.capabilities())
            .unwrap_or_else(|| self.shared.factory.capabilities())
    }

    pub fn backend_name(&self) -> &'static str {
        self.handle
            .as_ref()
            .map(|h| h.conn.backend_name())
            .unwrap_or("unknown")
    }

    /// Borrow the backend connection for one call.
    ///
    /// The call is considered in flight until its result is passed to
    /// [`settle`](Self::settle); a handle dropped in between is discarded.
    pub fn connection(&mut self) -> DbResult<&mut (dyn Connection + 'static)> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| DbError::internal("pooled connection already released"))?;
        self.in_call = true;
        Ok(handle.conn.as_mut())
    }

    /// Finish a call started with [`connection`](Self::connection).
    ///
    /// Connection-level failures and timeouts mark the handle broken.
    pub fn settle<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        self.in_call = false;
        if let Err(e) = &result {
            if matches!(
                e.kind(),
                crate::error::ErrorKind::Connection | crate::error::ErrorKind::Timeout
            ) {
                self.broken = true;
            }
        }
        result
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Return the handle to the pool with an explicit health verdict.
    pub fn release(mut self, healthy: bool) {
        if !healthy {
            self.broken = true;
        }
        self.give_back();
    }

    fn give_back(&mut self) {
        if let Some(handle) = self.handle.take() {
            let healthy = !self.broken && !self.in_call;
            self.shared.release(handle, healthy);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.in_call {
            debug!(
                target_id = %self.shared.target,
                connection_id = self.id(),
                "Connection dropped mid-call; discarding"
            );
        }
        self.give_back();
    }
}
