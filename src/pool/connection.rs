use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::OdbcMiddlewareError;

use super::Shared;

/// A connection checked out of a [`Pool`](super::Pool).
///
/// Dereferences to [`Connection`]. Dropping the guard returns the connection to the
/// pool; use [`release`](Self::release) to also wait for a discarded connection to close.
/// Either way, cursors opened through the guard are closed and refuse further use.
pub struct PooledConnection {
    conn: Connection,
    shared: Arc<Shared>,
    returned: bool,
}

impl PooledConnection {
    pub(super) fn new(conn: Connection, shared: Arc<Shared>) -> Self {
        Self {
            conn,
            shared,
            returned: false,
        }
    }

    /// Hand the connection back to its pool.
    ///
    /// Waits for calls still running on the connection's worker, including ones whose
    /// callers gave up. A connection that is closed or broken, or any connection once the
    /// pool is closing, is closed instead of being reused.
    ///
    /// # Errors
    /// Returns the close error of a discarded connection.
    pub async fn release(mut self) -> Result<(), OdbcMiddlewareError> {
        match self.take() {
            Some(conn) => self.shared.release_now(conn).await,
            None => Ok(()),
        }
    }

    /// Take the connection out of the pool for good; its slot becomes free.
    #[must_use]
    pub fn detach(mut self) -> Connection {
        let conn = self.conn.share();
        if self.take().is_some() {
            self.shared.detach(&conn);
        }
        conn
    }

    pub(super) fn belongs_to(&self, shared: &Arc<Shared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    fn take(&mut self) -> Option<Connection> {
        if self.returned {
            return None;
        }
        self.returned = true;
        Some(self.conn.share())
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.take() {
            self.shared.release(conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.conn)
            .field("returned", &self.returned)
            .finish()
    }
}
