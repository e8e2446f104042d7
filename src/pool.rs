//! Bounded connection pool.
//!
//! Split into:
//! - state: the synchronous bookkeeping (free list, in-use set, waiter queue)
//! - connection: the [`PooledConnection`] guard handed to callers
//!
//! Acquirers that find the pool full queue up and are served strictly first come first
//! served: a released connection goes straight to the longest waiter instead of back to
//! the free list, and capacity freed by a discarded connection becomes a slot for that
//! waiter to open a new one.

mod connection;
mod state;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use tokio::sync::{Notify, oneshot};

use crate::config::PoolOptions;
use crate::connection::Connection;
use crate::driver::Driver;
use crate::error::OdbcMiddlewareError;

pub use connection::PooledConnection;
use state::{Checkout, Grant, PoolState, is_expired};

/// Create a pool and open `options.minsize` connections up front.
///
/// # Errors
/// Returns [`OdbcMiddlewareError::Config`] for invalid sizes, or the first connect error
/// hit while filling the pool (connections already opened are closed again).
pub async fn create_pool(
    driver: Arc<dyn Driver>,
    dsn: impl Into<String>,
    options: PoolOptions,
) -> Result<Pool, OdbcMiddlewareError> {
    Pool::new(driver, dsn, options).await
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub free: usize,
    pub in_use: usize,
    /// Connections being opened right now.
    pub pending: usize,
    /// Acquirers queued for a connection.
    pub waiting: usize,
    pub minsize: usize,
    pub maxsize: usize,
    pub closing: bool,
    pub closed: bool,
}

/// A bounded set of reusable connections to one DSN.
///
/// Cloning is cheap; every clone refers to the same pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    driver: Arc<dyn Driver>,
    dsn: String,
    options: PoolOptions,
    state: Mutex<PoolState>,
    drained: Notify,
}

impl Pool {
    /// See [`create_pool`].
    ///
    /// # Errors
    /// See [`create_pool`].
    pub async fn new(
        driver: Arc<dyn Driver>,
        dsn: impl Into<String>,
        options: PoolOptions,
    ) -> Result<Self, OdbcMiddlewareError> {
        options.validate()?;
        let pool = Self {
            shared: Arc::new(Shared {
                driver,
                dsn: dsn.into(),
                state: Mutex::new(PoolState::new(options.maxsize)),
                options,
                drained: Notify::new(),
            }),
        };
        if let Err(err) = pool.fill(pool.minsize()).await {
            tracing::warn!(error = %err, "pool prefill failed, closing");
            pool.close().await;
            pool.wait_closed().await?;
            return Err(err);
        }
        tracing::debug!(
            minsize = pool.minsize(),
            maxsize = pool.maxsize(),
            "pool created"
        );
        Ok(pool)
    }

    /// Take a connection, opening one if there is room, otherwise waiting for a release.
    ///
    /// Waiting respects `acquire_timeout` when configured. Dropping the returned future
    /// while it waits gives up the place in the queue without disturbing anything.
    ///
    /// # Errors
    /// [`OdbcMiddlewareError::PoolClosed`] once [`close`](Self::close) has started,
    /// [`OdbcMiddlewareError::AcquireTimeout`] on timeout, or the connect error when a
    /// new connection had to be opened.
    pub async fn acquire(&self) -> Result<PooledConnection, OdbcMiddlewareError> {
        match self.shared.options.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, self.checkout(true))
                .await
                .map_err(|_| OdbcMiddlewareError::AcquireTimeout(limit))?,
            None => self.checkout(true).await,
        }
    }

    /// Like [`acquire`](Self::acquire) but with an explicit bound on the whole wait.
    ///
    /// # Errors
    /// See [`acquire`](Self::acquire).
    pub async fn acquire_timeout(
        &self,
        limit: Duration,
    ) -> Result<PooledConnection, OdbcMiddlewareError> {
        tokio::time::timeout(limit, self.checkout(true))
            .await
            .map_err(|_| OdbcMiddlewareError::AcquireTimeout(limit))?
    }

    /// Take a connection without queueing.
    ///
    /// # Errors
    /// [`OdbcMiddlewareError::PoolExhausted`] when every slot is taken or other acquirers
    /// are already queued; otherwise as [`acquire`](Self::acquire).
    pub async fn try_acquire(&self) -> Result<PooledConnection, OdbcMiddlewareError> {
        self.checkout(false).await
    }

    /// Return a connection. Equivalent to [`PooledConnection::release`].
    ///
    /// # Errors
    /// Usage error if `conn` came from another pool; otherwise the close error of a
    /// connection that had to be discarded.
    pub async fn release(&self, conn: PooledConnection) -> Result<(), OdbcMiddlewareError> {
        if !conn.belongs_to(&self.shared) {
            return Err(OdbcMiddlewareError::usage(
                "connection was not acquired from this pool",
            ));
        }
        conn.release().await
    }

    /// Start closing: refuse new acquires, fail queued ones, and close idle connections.
    ///
    /// Connections still in use are closed when they are released.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.shared.lock();
            let idle = state.close();
            self.shared.after_change(&state);
            idle
        };
        tracing::debug!(idle = idle.len(), "pool closing");
        self.shared.discard_all(idle).await;
    }

    /// Wait until every connection has been closed. Only valid after [`close`](Self::close).
    ///
    /// # Errors
    /// Usage error when called before `close`.
    pub async fn wait_closed(&self) -> Result<(), OdbcMiddlewareError> {
        loop {
            let drained = self.shared.drained.notified();
            {
                let mut state = self.shared.lock();
                if !state.is_closing() {
                    return Err(OdbcMiddlewareError::usage(
                        "wait_closed() should be called after close()",
                    ));
                }
                if state.is_drained() {
                    state.mark_closed();
                    return Ok(());
                }
            }
            drained.await;
        }
    }

    /// [`close`](Self::close) followed by [`wait_closed`](Self::wait_closed).
    ///
    /// # Errors
    /// See [`wait_closed`](Self::wait_closed).
    pub async fn shutdown(&self) -> Result<(), OdbcMiddlewareError> {
        self.close().await;
        self.wait_closed().await
    }

    /// Close every idle connection; in-use ones are untouched.
    pub async fn clear(&self) {
        let idle = {
            let mut state = self.shared.lock();
            state.take_free()
        };
        tracing::debug!(idle = idle.len(), "pool cleared");
        self.shared.discard_all(idle).await;
    }

    /// Acquire, run `body`, then commit or roll back and release.
    ///
    /// # Errors
    /// The acquire error, the body's error, or the commit error when the body succeeded.
    pub async fn scoped<T, F>(&self, body: F) -> Result<T, OdbcMiddlewareError>
    where
        F: for<'r> FnOnce(
            &'r mut PooledConnection,
        ) -> BoxFuture<'r, Result<T, OdbcMiddlewareError>>,
    {
        let conn = self.acquire().await?;
        crate::scope::scoped(conn, body).await
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus {
            size: state.size(),
            free: state.free_len(),
            in_use: state.in_use_len(),
            pending: state.pending(),
            waiting: state.waiting(),
            minsize: self.minsize(),
            maxsize: self.maxsize(),
            closing: state.is_closing(),
            closed: state.is_closed(),
        }
    }

    /// Free plus in-use plus being opened.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.lock().size()
    }

    #[must_use]
    pub fn free_size(&self) -> usize {
        self.shared.lock().free_len()
    }

    #[must_use]
    pub fn in_use_size(&self) -> usize {
        self.shared.lock().in_use_len()
    }

    #[must_use]
    pub fn minsize(&self) -> usize {
        self.shared.options.minsize
    }

    #[must_use]
    pub fn maxsize(&self) -> usize {
        self.shared.options.maxsize
    }

    #[must_use]
    pub fn echo(&self) -> bool {
        self.shared.options.connect.echo
    }

    /// True once [`wait_closed`](Self::wait_closed) has observed the pool drained.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().is_closed()
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.shared.lock().is_closing()
    }

    async fn fill(&self, count: usize) -> Result<(), OdbcMiddlewareError> {
        for _ in 0..count {
            if !self.shared.lock().reserve() {
                break;
            }
            let slot = Reservation::new(&self.shared);
            let opened = self.shared.open().await;
            slot.settle(opened, true)?;
        }
        Ok(())
    }

    async fn checkout(&self, wait: bool) -> Result<PooledConnection, OdbcMiddlewareError> {
        let recycle = self.shared.options.pool_recycle;
        let step = self.shared.lock().checkout(recycle, wait);
        match step {
            Checkout::Ready(conn) => Ok(self.hand_out(conn)),
            Checkout::Expired(conn) => {
                tracing::debug!(connection = conn.id(), "recycling expired connection");
                let slot = Reservation::new(&self.shared);
                self.shared.discard(conn);
                self.open_into(slot).await
            }
            Checkout::Open => {
                let slot = Reservation::new(&self.shared);
                self.open_into(slot).await
            }
            Checkout::Wait { id, grant } => {
                let mut waiter = Waiter {
                    shared: &self.shared,
                    id,
                    grant: Some(grant),
                };
                match waiter.wait().await? {
                    Grant::Slot => self.open_into(Reservation::new(&self.shared)).await,
                    Grant::Connection(conn) if is_expired(&conn, recycle) => {
                        tracing::debug!(connection = conn.id(), "recycling expired connection");
                        self.shared.lock().expire_in_use(&conn);
                        let slot = Reservation::new(&self.shared);
                        self.shared.discard(conn);
                        self.open_into(slot).await
                    }
                    Grant::Connection(conn) => Ok(self.hand_out(conn)),
                }
            }
            Checkout::Exhausted => Err(OdbcMiddlewareError::PoolExhausted {
                max: self.maxsize(),
            }),
            Checkout::Closed => Err(OdbcMiddlewareError::PoolClosed),
        }
    }

    async fn open_into(
        &self,
        slot: Reservation<'_>,
    ) -> Result<PooledConnection, OdbcMiddlewareError> {
        let opened = self.shared.open().await;
        let conn = slot.settle(opened, false)?;
        Ok(self.hand_out(conn))
    }

    fn hand_out(&self, conn: Connection) -> PooledConnection {
        conn.touch();
        PooledConnection::new(conn, Arc::clone(&self.shared))
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("dsn", &self.shared.dsn)
            .field("status", &self.status())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake `wait_closed` once a closing pool has nothing left.
    fn after_change(&self, state: &PoolState) {
        if state.is_closing() && state.is_drained() {
            self.drained.notify_waiters();
        }
    }

    async fn open(&self) -> Result<Connection, OdbcMiddlewareError> {
        Connection::open(
            Arc::clone(&self.driver),
            self.dsn.clone(),
            &self.options.connect,
        )
        .await
    }

    /// Give back an in-use connection, closing it in the background if it cannot be reused.
    ///
    /// A connection with calls still running on its worker (abandoned by a cancelled or
    /// timed-out caller) stays in use until they finish; only then is it handed on.
    pub(crate) fn release(self: &Arc<Self>, conn: Connection) {
        if conn.is_closed() {
            self.give_back(conn);
            return;
        }
        let pending = conn.pending_calls();
        if pending == 0 {
            conn.reset_detached(|| {});
            self.give_back(conn);
            return;
        }
        tracing::debug!(
            connection = conn.id(),
            pending,
            "release deferred until pending calls finish"
        );
        let shared = Arc::clone(self);
        let handle = conn.share();
        conn.reset_detached(move || shared.give_back(handle));
    }

    /// Like [`release`](Self::release), but waits out pending calls and the close of a
    /// discarded connection.
    pub(crate) async fn release_now(
        self: &Arc<Self>,
        conn: Connection,
    ) -> Result<(), OdbcMiddlewareError> {
        if !conn.is_closed() {
            let fallback = ReleaseOnDrop {
                shared: self,
                conn: Some(conn.share()),
            };
            if let Err(err) = conn.reset().await {
                tracing::debug!(connection = conn.id(), error = %err, "reset on release failed");
                conn.mark_broken();
            }
            fallback.disarm();
        }
        match self.release_state(conn) {
            Some(unusable) => self.discard_now(unusable).await,
            None => Ok(()),
        }
    }

    fn give_back(self: &Arc<Self>, conn: Connection) {
        if let Some(unusable) = self.release_state(conn) {
            self.discard(unusable);
        }
    }

    pub(crate) fn detach(&self, conn: &Connection) {
        let mut state = self.lock();
        state.detach(conn);
        self.after_change(&state);
    }

    fn release_state(&self, conn: Connection) -> Option<Connection> {
        let mut state = self.lock();
        let unusable = state.release(conn);
        self.after_change(&state);
        unusable
    }

    /// Close without waiting. The discard must already be counted in the state.
    fn discard(self: &Arc<Self>, conn: Connection) {
        tracing::debug!(connection = conn.id(), "discarding connection");
        let shared = Arc::clone(self);
        conn.close_detached(move || shared.discard_done());
    }

    async fn discard_now(&self, conn: Connection) -> Result<(), OdbcMiddlewareError> {
        let _done = DiscardDone(self);
        tracing::debug!(connection = conn.id(), "discarding connection");
        conn.close().await
    }

    async fn discard_all(&self, conns: Vec<Connection>) {
        let results = join_all(conns.into_iter().map(|conn| self.discard_now(conn))).await;
        for err in results.into_iter().filter_map(Result::err) {
            tracing::warn!(error = %err, "closing pooled connection failed");
        }
    }

    fn discard_done(&self) {
        let mut state = self.lock();
        state.discard_done();
        self.after_change(&state);
    }
}

/// Marks one discard finished when dropped, even if the close was abandoned.
struct DiscardDone<'a>(&'a Shared);

impl Drop for DiscardDone<'_> {
    fn drop(&mut self) {
        self.0.discard_done();
    }
}

/// Falls back to a background release if an awaited release is cancelled mid-reset.
struct ReleaseOnDrop<'a> {
    shared: &'a Arc<Shared>,
    conn: Option<Connection>,
}

impl ReleaseOnDrop<'_> {
    fn disarm(mut self) {
        self.conn = None;
    }
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(conn);
        }
    }
}

/// A reserved creation slot; given back if dropped before [`settle`](Self::settle).
struct Reservation<'a> {
    shared: &'a Arc<Shared>,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(shared: &'a Arc<Shared>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn settle(
        mut self,
        opened: Result<Connection, OdbcMiddlewareError>,
        to_free: bool,
    ) -> Result<Connection, OdbcMiddlewareError> {
        self.armed = false;
        let mut state = self.shared.lock();
        match opened {
            Ok(conn) => {
                let accepted = state.fill_slot(&conn, to_free);
                self.shared.after_change(&state);
                drop(state);
                if accepted {
                    Ok(conn)
                } else {
                    self.shared.discard(conn);
                    Err(OdbcMiddlewareError::PoolClosed)
                }
            }
            Err(err) => {
                state.abandon_slot();
                self.shared.after_change(&state);
                Err(err)
            }
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            state.abandon_slot();
            self.shared.after_change(&state);
        }
    }
}

/// A place in the acquire queue; leaving it early hands any grant on.
struct Waiter<'a> {
    shared: &'a Arc<Shared>,
    id: u64,
    grant: Option<oneshot::Receiver<Grant>>,
}

impl Waiter<'_> {
    async fn wait(&mut self) -> Result<Grant, OdbcMiddlewareError> {
        let Some(grant) = self.grant.as_mut() else {
            return Err(OdbcMiddlewareError::PoolClosed);
        };
        let received = grant.await;
        self.grant = None;
        received.map_err(|_| OdbcMiddlewareError::PoolClosed)
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let Some(mut grant) = self.grant.take() else {
            return;
        };
        let unusable = {
            let mut state = self.shared.lock();
            if state.cancel_wait(self.id) {
                None
            } else {
                let returned = grant.try_recv().ok().and_then(|grant| state.return_grant(grant));
                self.shared.after_change(&state);
                returned
            }
        };
        if let Some(conn) = unusable {
            self.shared.discard(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryDriver;

    fn options(min: usize, max: usize) -> PoolOptions {
        PoolOptions::builder().minsize(min).maxsize(max).finish()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejects_invalid_sizes() {
        let driver = MemoryDriver::new();
        let err = create_pool(driver.handle(), "memory", options(3, 2))
            .await
            .expect_err("maxsize below minsize");
        assert!(matches!(err, OdbcMiddlewareError::Config(_)));
        assert_eq!(driver.connects(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn prefill_failure_closes_what_was_opened() {
        let driver = MemoryDriver::new();
        driver.fail_connect_after(2);
        let err = create_pool(driver.handle(), "memory", options(4, 4))
            .await
            .expect_err("third connect fails");
        assert!(err.is_driver_error());
        assert_eq!(driver.open_connections(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dropped_guard_returns_connection() -> Result<(), OdbcMiddlewareError> {
        let driver = MemoryDriver::new();
        let pool = create_pool(driver.handle(), "memory", options(0, 1)).await?;
        let first_id = {
            let conn = pool.acquire().await?;
            assert_eq!(pool.in_use_size(), 1);
            conn.id()
        };
        assert_eq!(pool.free_size(), 1);
        let again = pool.acquire().await?;
        assert_eq!(again.id(), first_id);
        again.release().await?;
        pool.shutdown().await
    }

    #[tokio::test(flavor = "current_thread")]
    async fn release_rejects_foreign_connection() -> Result<(), OdbcMiddlewareError> {
        let driver = MemoryDriver::new();
        let a = create_pool(driver.handle(), "memory", options(0, 1)).await?;
        let b = create_pool(driver.handle(), "memory", options(0, 1)).await?;
        let conn = a.acquire().await?;
        let err = b.release(conn).await.expect_err("foreign connection");
        assert!(matches!(err, OdbcMiddlewareError::Usage(_)));
        a.shutdown().await?;
        b.shutdown().await
    }

    #[tokio::test(flavor = "current_thread")]
    async fn clear_closes_idle_connections_only() -> Result<(), OdbcMiddlewareError> {
        let driver = MemoryDriver::new();
        let pool = create_pool(driver.handle(), "memory", options(2, 3)).await?;
        let held = pool.acquire().await?;
        pool.clear().await;
        assert_eq!(pool.free_size(), 0);
        assert_eq!(pool.in_use_size(), 1);
        assert_eq!(driver.open_connections(), 1);
        held.release().await?;
        pool.shutdown().await
    }
}
