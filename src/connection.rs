//! Async wrapper around one native connection.
//!
//! Every native call for a connection runs on that connection's own bridge worker, in
//! submission order. The wrapper keeps a little bookkeeping on the async side (closed and
//! broken flags, timestamps, cached autocommit) so pools can inspect it without a round
//! trip to the worker.

mod session;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::time::Instant;

use crate::bridge::Bridge;
use crate::config::ConnectOptions;
use crate::cursor::Cursor;
use crate::driver::{Driver, InfoType, NativeConnection};
use crate::error::OdbcMiddlewareError;
use crate::types::Value;

pub(crate) use session::Session;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Open a connection to `dsn` through `driver`.
///
/// The native connect runs on a fresh worker thread. When `options.after_created` is set
/// it runs against the new connection before it is returned; if the hook fails the
/// connection is closed and the hook's error is returned.
///
/// # Errors
/// Returns the driver's connect error, the hook's error, or
/// [`OdbcMiddlewareError::Worker`] if the worker thread cannot be started.
pub async fn connect(
    driver: Arc<dyn Driver>,
    dsn: impl Into<String>,
    options: ConnectOptions,
) -> Result<Connection, OdbcMiddlewareError> {
    Connection::open(driver, dsn.into(), &options).await
}

/// An open connection whose blocking calls run off the async scheduler.
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    id: u64,
    dsn: String,
    echo: bool,
    login_timeout: Option<Duration>,
    pub(crate) bridge: Bridge<Session>,
    created_at: Instant,
    /// Nanoseconds after `created_at` of the last completed call.
    last_used: AtomicU64,
    autocommit: AtomicBool,
    closed: AtomicBool,
    broken: AtomicBool,
    /// Bumped each time a pool takes the connection back; cursors from an older
    /// checkout are dead.
    checkout: AtomicU64,
}

impl Connection {
    pub(crate) async fn open(
        driver: Arc<dyn Driver>,
        dsn: String,
        options: &ConnectOptions,
    ) -> Result<Self, OdbcMiddlewareError> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let label = format!("odbc-worker-{id}");
        let bridge = Bridge::spawn(label.clone(), move || Session::new(label))?
            .with_call_timeout(options.call_timeout);

        let connect_dsn = dsn.clone();
        let connect_options = options.clone();
        let (autocommit, timeout) = bridge
            .run(move |session| {
                let native = driver.connect(&connect_dsn, &connect_options)?;
                session.attach(native);
                let native = session.native()?;
                if native.autocommit() != connect_options.autocommit {
                    native.set_autocommit(connect_options.autocommit)?;
                }
                Ok((native.autocommit(), native.timeout()))
            })
            .await?;

        let conn = Self {
            inner: Arc::new(ConnectionInner {
                id,
                dsn,
                echo: options.echo,
                login_timeout: timeout.or(options.login_timeout),
                bridge,
                created_at: Instant::now(),
                last_used: AtomicU64::new(0),
                autocommit: AtomicBool::new(autocommit),
                closed: AtomicBool::new(false),
                broken: AtomicBool::new(false),
                checkout: AtomicU64::new(0),
            }),
        };
        tracing::debug!(connection = id, "connection opened");

        if let Some(hook) = &options.after_created {
            if let Err(err) = hook(&conn).await {
                tracing::warn!(connection = id, error = %err, "after_created hook failed");
                if let Err(close_err) = conn.close().await {
                    tracing::debug!(connection = id, error = %close_err, "close after failed hook");
                }
                return Err(err);
            }
        }
        Ok(conn)
    }

    /// Open a new cursor on this connection.
    ///
    /// # Errors
    /// Usage error if the connection is closed, otherwise the driver's error.
    pub async fn cursor(&self) -> Result<Cursor, OdbcMiddlewareError> {
        let cursor_id = self.inner.call(Session::open_cursor).await?;
        Ok(Cursor::new(Arc::clone(&self.inner), cursor_id))
    }

    /// Open a cursor, run `sql` on it and return it ready for fetching.
    ///
    /// # Errors
    /// See [`Cursor::execute`].
    pub async fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Cursor, OdbcMiddlewareError> {
        let mut cursor = self.cursor().await?;
        cursor.execute(sql, params).await?;
        Ok(cursor)
    }

    /// # Errors
    /// Usage error if the connection is closed, otherwise the driver's error.
    pub async fn commit(&self) -> Result<(), OdbcMiddlewareError> {
        self.inner.commit().await
    }

    /// # Errors
    /// Usage error if the connection is closed, otherwise the driver's error.
    pub async fn rollback(&self) -> Result<(), OdbcMiddlewareError> {
        self.inner.rollback().await
    }

    /// Close every cursor opened here, then the native connection, then stop the worker.
    ///
    /// Closing twice is a no-op.
    ///
    /// # Errors
    /// Returns the driver's close error; the connection counts as closed regardless.
    pub async fn close(&self) -> Result<(), OdbcMiddlewareError> {
        self.inner.close().await
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// True once a call on this connection failed in a way that makes it unfit for reuse.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::Acquire)
    }

    /// Cached autocommit flag; kept in sync by [`set_autocommit`](Self::set_autocommit).
    #[must_use]
    pub fn autocommit(&self) -> bool {
        self.inner.autocommit()
    }

    /// # Errors
    /// Usage error if the connection is closed, otherwise the driver's error.
    pub async fn set_autocommit(&self, enabled: bool) -> Result<(), OdbcMiddlewareError> {
        self.inner
            .call(move |session| Ok(session.native()?.set_autocommit(enabled)?))
            .await?;
        self.inner.autocommit.store(enabled, Ordering::Release);
        Ok(())
    }

    /// # Errors
    /// Usage error if the connection is closed, otherwise the driver's error.
    pub async fn get_info(&self, info: InfoType) -> Result<Value, OdbcMiddlewareError> {
        self.inner
            .call(move |session| Ok(session.native()?.get_info(info)?))
            .await
    }

    /// # Errors
    /// Usage error if the connection is closed, otherwise the driver's error.
    pub async fn set_attr(&self, attr_id: i32, value: i64) -> Result<(), OdbcMiddlewareError> {
        self.inner
            .call(move |session| Ok(session.native()?.set_attr(attr_id, value)?))
            .await
    }

    /// Run `func` against the native connection on the worker thread.
    ///
    /// For driver calls this wrapper does not cover. The closure must not stash the
    /// reference anywhere.
    ///
    /// # Errors
    /// Usage error if the connection is closed, otherwise whatever `func` returns.
    pub async fn with_raw<F, R>(&self, func: F) -> Result<R, OdbcMiddlewareError>
    where
        F: FnOnce(&mut dyn NativeConnection) -> Result<R, OdbcMiddlewareError> + Send + 'static,
        R: Send + 'static,
    {
        self.inner.call(move |session| func(session.native()?)).await
    }

    /// Run `body` with this connection, then settle and close it.
    ///
    /// Without autocommit a successful body is committed and a failed one rolled back.
    /// The connection is closed either way.
    ///
    /// # Errors
    /// The body's error, or the commit/close error when the body succeeded.
    pub async fn scoped<T, F>(self, body: F) -> Result<T, OdbcMiddlewareError>
    where
        F: for<'r> FnOnce(&'r mut Connection) -> BoxFuture<'r, Result<T, OdbcMiddlewareError>>,
    {
        crate::scope::scoped(self, body).await
    }

    /// Run `body` with a fresh cursor, then settle the transaction and close the cursor.
    ///
    /// # Errors
    /// The body's error, or the commit/close error when the body succeeded.
    pub async fn with_cursor<T, F>(&self, body: F) -> Result<T, OdbcMiddlewareError>
    where
        F: for<'r> FnOnce(&'r mut Cursor) -> BoxFuture<'r, Result<T, OdbcMiddlewareError>>,
    {
        let cursor = self.cursor().await?;
        crate::scope::scoped(cursor, body).await
    }

    /// Driver-reported timeout, falling back to the configured login timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.login_timeout
    }

    #[must_use]
    pub fn echo(&self) -> bool {
        self.inner.echo
    }

    #[must_use]
    pub fn dsn(&self) -> &str {
        &self.inner.dsn
    }

    /// Process-unique id, also used in log fields and worker thread names.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.inner.last_used()
    }

    /// Calls queued or running on the worker, including abandoned ones.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.bridge.in_flight()
    }

    pub(crate) fn touch(&self) {
        self.inner.touch();
    }

    /// Second handle to the same connection, for pool bookkeeping.
    pub(crate) fn share(&self) -> Connection {
        Connection {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn close_detached<F>(&self, on_closed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.close_detached(on_closed);
    }

    /// Invalidate outstanding cursors and close their native handles, waiting for every
    /// call already queued on the worker.
    pub(crate) async fn reset(&self) -> Result<(), OdbcMiddlewareError> {
        self.inner.reset().await
    }

    /// Like [`reset`](Self::reset) without waiting; `then` runs on the worker once every
    /// earlier call has finished.
    pub(crate) fn reset_detached<F>(&self, then: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.reset_detached(then);
    }

    pub(crate) fn mark_broken(&self) {
        self.inner.broken.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("dsn", &self.inner.dsn)
            .field("autocommit", &self.autocommit())
            .field("closed", &self.is_closed())
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl ConnectionInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn echo(&self) -> bool {
        self.echo
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn autocommit(&self) -> bool {
        self.autocommit.load(Ordering::Acquire)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.checkout.load(Ordering::Acquire)
    }

    fn last_used(&self) -> Instant {
        let offset = Duration::from_nanos(self.last_used.load(Ordering::Acquire));
        self.created_at + offset
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.created_at.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_used.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Run `func` on the worker, applying the failure policy to its result.
    pub(crate) async fn call<F, R>(&self, func: F) -> Result<R, OdbcMiddlewareError>
    where
        F: FnOnce(&mut Session) -> Result<R, OdbcMiddlewareError> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_closed() {
            return Err(OdbcMiddlewareError::usage("connection is closed"));
        }
        let result = self.bridge.run(func).await;
        self.touch();
        if let Err(err) = &result {
            self.note_failure(err).await;
        }
        result
    }

    pub(crate) async fn commit(&self) -> Result<(), OdbcMiddlewareError> {
        self.call(|session| Ok(session.native()?.commit()?)).await
    }

    pub(crate) async fn rollback(&self) -> Result<(), OdbcMiddlewareError> {
        self.call(|session| Ok(session.native()?.rollback()?)).await
    }

    async fn note_failure(&self, err: &OdbcMiddlewareError) {
        if !err.taints_connection() {
            return;
        }
        if !self.broken.swap(true, Ordering::AcqRel) {
            tracing::debug!(connection = self.id, error = %err, "connection marked broken");
        }
        let lost = match err {
            OdbcMiddlewareError::Driver(driver_err) => driver_err.is_connection_level(),
            OdbcMiddlewareError::Worker(_) => true,
            _ => false,
        };
        if lost {
            tracing::warn!(connection = self.id, error = %err, "connection lost, closing");
            if let Err(close_err) = self.close().await {
                tracing::debug!(connection = self.id, error = %close_err, "close after lost connection");
            }
        }
    }

    pub(crate) async fn close(&self) -> Result<(), OdbcMiddlewareError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self
            .bridge
            .run_to_completion(|session| Ok(session.close()?))
            .await;
        self.bridge.shutdown();
        tracing::debug!(connection = self.id, "connection closed");
        match result {
            // A dead worker has already dropped the native handles.
            Err(OdbcMiddlewareError::Worker(_)) => Ok(()),
            other => other,
        }
    }

    async fn reset(&self) -> Result<(), OdbcMiddlewareError> {
        self.checkout.fetch_add(1, Ordering::AcqRel);
        if self.is_closed() {
            return Ok(());
        }
        self.bridge
            .run_to_completion(|session| {
                session.close_cursors();
                Ok(())
            })
            .await
    }

    fn reset_detached<F>(&self, then: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.checkout.fetch_add(1, Ordering::AcqRel);
        // Fires after the job, or right away when a dead worker drops it unrun.
        let done = OnDrop(Some(Box::new(then)));
        let _ = self
            .bridge
            .submit_then(Session::close_cursors, move || drop(done));
    }

    /// Close without waiting; `on_closed` runs once the native handles are released.
    fn close_detached<F>(&self, on_closed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.swap(true, Ordering::AcqRel) {
            on_closed();
            return;
        }
        let id = self.id;
        // Fires when the job finishes, or when it is dropped unrun by a dead worker.
        let done = OnDrop(Some(Box::new(on_closed)));
        let _ = self.bridge.submit(move |session| {
            if let Err(err) = session.close() {
                tracing::warn!(connection = id, error = %err, "native close failed");
            }
            drop(done);
        });
        self.bridge.shutdown();
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if !self.is_closed() {
            // The worker releases the native handles when its queue drains.
            tracing::warn!(connection = self.id, "unclosed connection dropped");
        }
    }
}

struct OnDrop(Option<Box<dyn FnOnce() + Send>>);

impl Drop for OnDrop {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}
