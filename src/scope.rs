//! Scoped use of connections, cursors and pools.
//!
//! A scope runs a body against a resource and then always releases the resource, settling
//! the transaction first: commit after a successful body, rollback after a failed one.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::config::PoolOptions;
use crate::connection::Connection;
use crate::cursor::Cursor;
use crate::driver::Driver;
use crate::error::OdbcMiddlewareError;
use crate::pool::{Pool, PooledConnection, create_pool};

/// A resource with enter/exit semantics.
#[async_trait]
pub trait Scope: Send + Sized {
    /// Runs after the body returned `Ok`.
    async fn on_success(&mut self) -> Result<(), OdbcMiddlewareError> {
        Ok(())
    }

    /// Runs after the body returned `Err`; its own failure is logged, not returned.
    async fn on_failure(&mut self) -> Result<(), OdbcMiddlewareError> {
        Ok(())
    }

    /// Release the resource. Runs on every exit path.
    async fn exit(self) -> Result<(), OdbcMiddlewareError>;
}

/// Run `body` against `resource`, then settle and release it.
///
/// The body's error wins over anything that fails during cleanup.
///
/// # Errors
/// The body's error; on success, the first of the settle/release errors.
pub async fn scoped<R, T, F>(mut resource: R, body: F) -> Result<T, OdbcMiddlewareError>
where
    R: Scope,
    F: for<'r> FnOnce(&'r mut R) -> BoxFuture<'r, Result<T, OdbcMiddlewareError>>,
{
    let outcome = body(&mut resource).await;
    let settled = match &outcome {
        Ok(_) => resource.on_success().await,
        Err(err) => {
            if let Err(settle_err) = resource.on_failure().await {
                tracing::warn!(error = %settle_err, body_error = %err, "rollback after failed scope");
            }
            Ok(())
        }
    };
    let released = resource.exit().await;
    match outcome {
        Ok(value) => {
            settled?;
            released?;
            Ok(value)
        }
        Err(err) => {
            if let Err(release_err) = released {
                tracing::warn!(error = %release_err, "release after failed scope");
            }
            Err(err)
        }
    }
}

/// Create a pool, run `body` with it, then close it and wait for every connection to go.
///
/// # Errors
/// Pool creation errors, the body's error, or the shutdown error.
pub async fn with_pool<T, F>(
    driver: Arc<dyn Driver>,
    dsn: impl Into<String>,
    options: PoolOptions,
    body: F,
) -> Result<T, OdbcMiddlewareError>
where
    F: for<'r> FnOnce(&'r mut Pool) -> BoxFuture<'r, Result<T, OdbcMiddlewareError>>,
{
    let pool = create_pool(driver, dsn, options).await?;
    scoped(pool, body).await
}

async fn settle(conn: &Connection, success: bool) -> Result<(), OdbcMiddlewareError> {
    if conn.is_closed() || conn.autocommit() {
        return Ok(());
    }
    if success {
        conn.commit().await
    } else {
        conn.rollback().await
    }
}

#[async_trait]
impl Scope for Connection {
    async fn on_success(&mut self) -> Result<(), OdbcMiddlewareError> {
        settle(self, true).await
    }

    async fn on_failure(&mut self) -> Result<(), OdbcMiddlewareError> {
        settle(self, false).await
    }

    async fn exit(self) -> Result<(), OdbcMiddlewareError> {
        self.close().await
    }
}

#[async_trait]
impl Scope for PooledConnection {
    async fn on_success(&mut self) -> Result<(), OdbcMiddlewareError> {
        settle(self, true).await
    }

    async fn on_failure(&mut self) -> Result<(), OdbcMiddlewareError> {
        settle(self, false).await
    }

    async fn exit(self) -> Result<(), OdbcMiddlewareError> {
        self.release().await
    }
}

#[async_trait]
impl Scope for Cursor {
    async fn on_success(&mut self) -> Result<(), OdbcMiddlewareError> {
        if self.is_closed() || self.autocommit() {
            return Ok(());
        }
        self.commit().await
    }

    async fn on_failure(&mut self) -> Result<(), OdbcMiddlewareError> {
        if self.is_closed() || self.autocommit() {
            return Ok(());
        }
        self.rollback().await
    }

    async fn exit(mut self) -> Result<(), OdbcMiddlewareError> {
        self.close().await
    }
}

#[async_trait]
impl Scope for Pool {
    async fn exit(self) -> Result<(), OdbcMiddlewareError> {
        self.shutdown().await
    }
}
