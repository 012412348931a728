//! Connection pool management.
//!
//! A [`Pool`] owns the physical connections to one [`ConnectionTarget`].
//! Opening a pool never connects; connections are established on demand
//! when a caller acquires one and are returned through [`PooledConnection`].
//!
//! Limits:
//! - max-open caps concurrently existing physical connections. Every
//!   checked-out connection (and every connection being established) holds a
//!   semaphore permit, and a new connection is only dialed when no idle one
//!   is available, so the cap holds without a global lock.
//! - max-idle caps warm connections; surplus connections are closed on
//!   release and reported as [`CloseReason::MaxIdleExceeded`].
//! - max-lifetime and max-idle-time are enforced on checkout, on release and
//!   by a background reaper holding only a weak reference to the pool.

use crate::config::PoolOptions;
use crate::db::backend::{BackendConnection, Connector};
use crate::db::dialect::ConnectionTarget;
use crate::db::instrument::InstrumentSink;
use crate::error::{BackendError, DbError, DbResult};
use crate::models::{CloseReason, PoolEvent};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Effective pool limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// `None` = unlimited
    pub max_open: Option<u32>,
    pub max_idle: u32,
    pub max_lifetime: Option<Duration>,
    pub max_idle_time: Option<Duration>,
}

impl PoolLimits {
    pub fn from_options(options: &PoolOptions) -> Self {
        Self {
            max_open: options.max_open(),
            max_idle: options.max_idle_or_default(),
            max_lifetime: options.conn_max_lifetime(),
            max_idle_time: options.conn_max_idle_time(),
        }
    }

    /// How often the reaper runs, `None` when nothing can expire.
    pub fn reap_interval(&self) -> Option<Duration> {
        let shortest = match (self.max_lifetime, self.max_idle_time) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return None,
        };
        Some((shortest / 2).max(MIN_REAP_INTERVAL))
    }

    fn capacity(&self) -> usize {
        self.max_open
            .map(|n| n as usize)
            .unwrap_or(Semaphore::MAX_PERMITS)
    }
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self::from_options(&PoolOptions::default())
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Physical connections currently open (idle + checked out)
    pub open: usize,
    pub idle: usize,
    /// Callers currently holding (or establishing) a connection
    pub in_use: usize,
    pub max_open: Option<u32>,
    pub max_idle: u32,
}

struct Live<T> {
    conn: T,
    id: u64,
    created_at: Instant,
    last_used: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PoolInner<C: Connector> {
    target: ConnectionTarget,
    connector: Arc<C>,
    limits: PoolLimits,
    slots: Arc<Semaphore>,
    /// Most recently used at the back
    idle: Mutex<VecDeque<Live<C::Connection>>>,
    open: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    sink: Arc<dyn InstrumentSink>,
    /// Reaper task handle. Uses std::sync::Mutex for synchronous storage.
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to a connection pool.
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("target", &self.inner.target)
            .field("limits", &self.inner.limits)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Pool<C> {
    /// Create a pool without connecting.
    ///
    /// Limits apply from this point on. When called inside a tokio runtime
    /// and a lifetime or idle-time limit is set, a reaper task is started.
    pub fn open(
        target: ConnectionTarget,
        connector: Arc<C>,
        limits: PoolLimits,
        sink: Arc<dyn InstrumentSink>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            slots: Arc::new(Semaphore::new(limits.capacity())),
            target,
            connector,
            limits,
            idle: Mutex::new(VecDeque::new()),
            open: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            sink,
            reaper: Mutex::new(None),
        });

        if let (Some(period), Ok(handle)) = (
            limits.reap_interval(),
            tokio::runtime::Handle::try_current(),
        ) {
            // Weak reference; the task exits once the pool is dropped
            let weak = Arc::downgrade(&inner);
            let task = handle.spawn(reap_task(weak, period));
            *lock(&inner.reaper) = Some(task);
        }

        debug!(
            dialect = %inner.target.dialect(),
            max_open = ?limits.max_open,
            max_idle = limits.max_idle,
            max_lifetime = ?limits.max_lifetime,
            "Connection pool opened"
        );

        Self { inner }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.inner.target
    }

    pub fn limits(&self) -> PoolLimits {
        self.inner.limits
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let idle = lock(&self.inner.idle).len();
        PoolStats {
            open: self.inner.open.load(Ordering::Acquire),
            idle,
            in_use: self
                .inner
                .limits
                .capacity()
                .saturating_sub(self.inner.slots.available_permits()),
            max_open: self.inner.limits.max_open,
            max_idle: self.inner.limits.max_idle,
        }
    }

    /// Check out a connection, waiting at most `timeout` for a free slot and
    /// for a new connection to be established.
    ///
    /// Fails with `PoolTimeout` on expiry, `ManagerClosed` once the pool is
    /// closed and `ConnectFailed` when dialing fails.
    pub async fn acquire(&self, timeout: Option<Duration>) -> DbResult<PooledConnection<C>> {
        if self.is_closed() {
            return Err(DbError::ManagerClosed);
        }
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.acquire_inner())
                .await
                .map_err(|_| DbError::pool_timeout(limit))?,
            None => self.acquire_inner().await,
        }
    }

    async fn acquire_inner(&self) -> DbResult<PooledConnection<C>> {
        let permit = Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .map_err(|_| DbError::ManagerClosed)?;

        loop {
            let candidate = lock(&self.inner.idle).pop_back();
            let Some(live) = candidate else {
                break;
            };
            match self.inner.expiry(&live, Instant::now()) {
                Some(reason) => self.inner.close_live(live, reason).await,
                None => return Ok(PooledConnection::new(live, permit, &self.inner)),
            }
        }

        let live = self.inner.connect().await?;
        Ok(PooledConnection::new(live, permit, &self.inner))
    }

    /// Prove the backend is reachable: check out a connection and ping it.
    ///
    /// A connection whose ping fails is discarded.
    pub async fn verify(&self, timeout: Option<Duration>) -> DbResult<()> {
        let mut conn = self.acquire(timeout).await?;
        let result = conn.ping().await;
        match result {
            Ok(()) => {
                conn.release().await;
                Ok(())
            }
            Err(e) => {
                conn.discard().await;
                Err(DbError::verify_failed(self.inner.target.redact(&e.message)))
            }
        }
    }

    /// Close idle connections that outlived a limit. Returns how many were
    /// closed.
    ///
    /// A connection is only closed while a slot is free, so reaping never
    /// pushes the pool above max-open.
    pub async fn reap_expired(&self) -> usize {
        self.inner.reap_expired().await
    }

    /// Close the pool.
    ///
    /// Waiters fail with `ManagerClosed`, idle connections are closed now and
    /// checked-out connections are closed when released. A second call fails
    /// with `ManagerClosed`.
    pub async fn close(&self) -> DbResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(DbError::ManagerClosed);
        }
        self.inner.slots.close();

        if let Some(handle) = lock(&self.inner.reaper).take() {
            handle.abort();
        }

        // Drain under lock, close outside lock
        let drained: Vec<_> = lock(&self.inner.idle).drain(..).collect();
        let count = drained.len();
        for live in drained {
            self.inner.close_live(live, CloseReason::PoolClosed).await;
        }
        self.inner.connector.close_target(&self.inner.target).await;

        info!(
            dialect = %self.inner.target.dialect(),
            closed_idle = count,
            still_open = self.inner.open.load(Ordering::Acquire),
            "Connection pool closed"
        );
        Ok(())
    }

    /// Scrub the password from a backend message.
    pub fn redact(&self, text: &str) -> String {
        self.inner.target.redact(text)
    }
}

impl<C: Connector> PoolInner<C> {
    fn expiry(&self, live: &Live<C::Connection>, now: Instant) -> Option<CloseReason> {
        if let Some(max) = self.limits.max_lifetime {
            if now.saturating_duration_since(live.created_at) >= max {
                return Some(CloseReason::LifetimeExpired);
            }
        }
        if let Some(max) = self.limits.max_idle_time {
            if now.saturating_duration_since(live.last_used) >= max {
                return Some(CloseReason::IdleTimeout);
            }
        }
        None
    }

    async fn connect(&self) -> DbResult<Live<C::Connection>> {
        let conn = self.connector.connect(&self.target).await.map_err(|e| {
            DbError::connect_failed(
                self.target.redact(&e.message),
                connection_suggestion(&e),
            )
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open.fetch_add(1, Ordering::AcqRel);
        self.sink
            .on_pool_event(&PoolEvent::Opened { connection_id: id });

        let now = Instant::now();
        Ok(Live {
            conn,
            id,
            created_at: now,
            last_used: now,
        })
    }

    async fn close_live(&self, live: Live<C::Connection>, reason: CloseReason) {
        let Live {
            conn,
            id,
            created_at,
            ..
        } = live;
        self.open.fetch_sub(1, Ordering::AcqRel);
        // Reported on drop, so a caller cancelled mid-close still emits it
        let mut notice = CloseNotice {
            sink: &*self.sink,
            connection_id: id,
            reason,
            created_at,
            error: None,
        };
        if let Err(e) = conn.close().await {
            notice.error = Some(self.target.redact(&e.message));
        }
    }

    /// Return a connection after use. The caller still holds its slot.
    async fn put_back(&self, mut live: Live<C::Connection>, broken: bool) {
        let now = Instant::now();
        let reason = if broken {
            Some(CloseReason::Broken)
        } else {
            self.limits
                .max_lifetime
                .filter(|max| now.saturating_duration_since(live.created_at) >= *max)
                .map(|_| CloseReason::LifetimeExpired)
        };
        if let Some(reason) = reason {
            self.close_live(live, reason).await;
            return;
        }

        live.last_used = now;
        let rejected = {
            let mut idle = lock(&self.idle);
            // Checked under the idle lock so close() cannot miss this connection
            if self.closed.load(Ordering::Acquire) {
                Some((live, CloseReason::PoolClosed))
            } else if idle.len() < self.limits.max_idle as usize {
                idle.push_back(live);
                None
            } else {
                Some((live, CloseReason::MaxIdleExceeded))
            }
        };
        if let Some((live, reason)) = rejected {
            self.close_live(live, reason).await;
        }
    }

    async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut idle = lock(&self.idle);
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut expired = Vec::new();
            for live in idle.drain(..) {
                match self.expiry(&live, now) {
                    Some(reason) => match Arc::clone(&self.slots).try_acquire_owned() {
                        Ok(permit) => expired.push((live, reason, permit)),
                        Err(_) => keep.push_back(live),
                    },
                    None => keep.push_back(live),
                }
            }
            *idle = keep;
            expired
        };

        let count = expired.len();
        for (live, reason, permit) in expired {
            self.close_live(live, reason).await;
            drop(permit);
        }
        if count > 0 {
            debug!(closed = count, "Reaped expired idle connections");
        }
        count
    }
}

/// Emits `PoolEvent::Closed` when dropped.
struct CloseNotice<'a> {
    sink: &'a dyn InstrumentSink,
    connection_id: u64,
    reason: CloseReason,
    created_at: Instant,
    error: Option<String>,
}

impl Drop for CloseNotice<'_> {
    fn drop(&mut self) {
        self.sink.on_pool_event(&PoolEvent::Closed {
            connection_id: self.connection_id,
            reason: self.reason,
            age: self.created_at.elapsed(),
            error: self.error.take(),
        });
    }
}

async fn reap_task<C: Connector>(weak: Weak<PoolInner<C>>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;

        // Exit once every pool handle is gone
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        inner.reap_expired().await;

        // Drop strong reference before sleeping to allow pool deallocation
        drop(inner);
    }
}

fn connection_suggestion(err: &BackendError) -> &'static str {
    let lower = err.message.to_lowercase();
    if lower.contains("password") || lower.contains("authentication") || lower.contains("access denied") {
        "Check username and password"
    } else if lower.contains("refused") || lower.contains("i/o error") {
        "Check that the database server is running and reachable"
    } else if lower.contains("tls") || lower.contains("ssl") {
        "Check the sslmode setting and server certificates"
    } else if lower.contains("unable to open database") {
        "Check the database file path and permissions"
    } else {
        "Check the connection settings"
    }
}

/// A checked-out physical connection.
///
/// Call [`release`](Self::release) (or [`discard`](Self::discard)) when
/// done. Dropping it still returns the connection, via a spawned task.
pub struct PooledConnection<C: Connector> {
    live: Option<Live<C::Connection>>,
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("released", &self.live.is_none())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PooledConnection<C> {
    fn new(live: Live<C::Connection>, permit: OwnedSemaphorePermit, inner: &Arc<PoolInner<C>>) -> Self {
        Self {
            live: Some(live),
            permit: Some(permit),
            inner: Arc::clone(inner),
        }
    }

    /// Identifier of the physical connection, unique within the pool.
    pub fn id(&self) -> u64 {
        self.live.as_ref().map(|l| l.id).unwrap_or_default()
    }

    /// Time since the physical connection was established.
    pub fn age(&self) -> Duration {
        self.live
            .as_ref()
            .map(|l| l.created_at.elapsed())
            .unwrap_or_default()
    }

    /// Get the underlying physical connection.
    pub fn connection_mut(&mut self) -> Result<&mut C::Connection, BackendError> {
        self.live
            .as_mut()
            .map(|l| &mut l.conn)
            .ok_or_else(|| BackendError::broken("connection already released"))
    }

    pub async fn ping(&mut self) -> Result<(), BackendError> {
        self.connection_mut()?.ping().await
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) {
        self.finish(false).await;
    }

    /// Close the connection instead of returning it; use after a failure that
    /// left it in an unknown state.
    pub async fn discard(mut self) {
        self.finish(true).await;
    }

    async fn finish(&mut self, broken: bool) {
        if let Some(live) = self.live.take() {
            self.inner.put_back(live, broken).await;
        }
        // The slot is freed only after the connection is pooled or closed
        self.permit.take();
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        let permit = self.permit.take();
        let id = live.id;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    inner.put_back(live, false).await;
                    drop(permit);
                });
                warn!(
                    connection_id = id,
                    "Connection released via Drop - consider using explicit release()"
                );
            }
            Err(_) => {
                // No runtime to close gracefully; the driver drops the socket
                self.inner.open.fetch_sub(1, Ordering::AcqRel);
                let Live {
                    conn, created_at, ..
                } = live;
                drop(conn);
                drop(permit);
                self.inner.sink.on_pool_event(&PoolEvent::Closed {
                    connection_id: id,
                    reason: CloseReason::Abandoned,
                    age: created_at.elapsed(),
                    error: None,
                });
                warn!(
                    connection_id = id,
                    "Connection dropped outside a runtime and closed without a handshake"
                );
            }
        }
    }
}
