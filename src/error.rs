use std::time::Duration;

use thiserror::Error;

use crate::driver::DriverError;

#[derive(Debug, Error)]
pub enum OdbcMiddlewareError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Pool exhausted: all {max} connections are in use")]
    PoolExhausted { max: usize },

    #[error("Timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    #[error("Native call did not finish within {0:?}")]
    CallTimeout(Duration),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl OdbcMiddlewareError {
    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Whether this error came from the native driver.
    #[must_use]
    pub fn is_driver_error(&self) -> bool {
        matches!(self, Self::Driver(_))
    }

    /// Whether this error indicates the owning connection can no longer be trusted.
    ///
    /// Driver errors, bridge failures and call timeouts all qualify; usage and pool
    /// errors do not touch the connection.
    #[must_use]
    pub fn taints_connection(&self) -> bool {
        matches!(
            self,
            Self::Driver(_) | Self::Worker(_) | Self::CallTimeout(_)
        )
    }
}
