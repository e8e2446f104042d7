use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::error::OdbcMiddlewareError;

/// Async setup hook run once on every freshly opened connection.
pub type AfterCreated = Arc<
    dyn for<'c> Fn(&'c Connection) -> BoxFuture<'c, Result<(), OdbcMiddlewareError>>
        + Send
        + Sync,
>;

/// Options for opening a single connection.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Put the session in driver autocommit mode.
    pub autocommit: bool,
    /// Ask the driver for the ANSI entry points instead of the wide ones.
    pub ansi: bool,
    /// Login timeout handed to the driver.
    pub login_timeout: Option<Duration>,
    /// Upper bound on waiting for any single native call.
    ///
    /// The native call itself cannot be interrupted; on expiry the caller gets
    /// [`OdbcMiddlewareError::CallTimeout`] and the connection is treated as broken.
    pub call_timeout: Option<Duration>,
    /// Report each executed statement and its parameters through `tracing`.
    pub echo: bool,
    /// Extra connection-string keywords forwarded to the driver untouched.
    pub attributes: BTreeMap<String, String>,
    #[serde(skip)]
    pub after_created: Option<AfterCreated>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("autocommit", &self.autocommit)
            .field("ansi", &self.ansi)
            .field("login_timeout", &self.login_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("echo", &self.echo)
            .field("attributes", &self.attributes)
            .field("after_created", &self.after_created.is_some())
            .finish()
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn builder() -> ConnectOptionsBuilder {
        ConnectOptionsBuilder::default()
    }

    /// Render `dsn` plus the extra attributes as one `key=value;` connection string.
    #[must_use]
    pub fn connection_string(&self, dsn: &str) -> String {
        let mut out = dsn.trim_end_matches(';').to_owned();
        for (key, value) in &self.attributes {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }
}

/// Fluent builder for [`ConnectOptions`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptionsBuilder {
    opts: ConnectOptions,
}

impl ConnectOptionsBuilder {
    #[must_use]
    pub fn autocommit(mut self, autocommit: bool) -> Self {
        self.opts.autocommit = autocommit;
        self
    }

    #[must_use]
    pub fn ansi(mut self, ansi: bool) -> Self {
        self.opts.ansi = ansi;
        self
    }

    #[must_use]
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.opts.login_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.opts.call_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn echo(mut self, echo: bool) -> Self {
        self.opts.echo = echo;
        self
    }

    #[must_use]
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts.attributes.insert(key.into(), value.into());
        self
    }

    /// Install the post-connect hook.
    ///
    /// ```rust
    /// use odbc_middleware::{ConnectOptions, OdbcMiddlewareError};
    ///
    /// let opts = ConnectOptions::builder()
    ///     .after_created(|conn| {
    ///         Box::pin(async move {
    ///             conn.set_attr(1234, 1).await?;
    ///             Ok::<_, OdbcMiddlewareError>(())
    ///         })
    ///     })
    ///     .finish();
    /// assert!(opts.after_created.is_some());
    /// ```
    #[must_use]
    pub fn after_created<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c Connection) -> BoxFuture<'c, Result<(), OdbcMiddlewareError>>
            + Send
            + Sync
            + 'static,
    {
        self.opts.after_created = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn finish(self) -> ConnectOptions {
        self.opts
    }
}

/// Options for a [`Pool`](crate::Pool).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub minsize: usize,
    pub maxsize: usize,
    /// Connections older than this are replaced on their next acquire. `None` never recycles.
    pub pool_recycle: Option<Duration>,
    /// How long `acquire` may wait for a release. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
    pub connect: ConnectOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            minsize: 10,
            maxsize: 10,
            pool_recycle: None,
            acquire_timeout: None,
            connect: ConnectOptions::default(),
        }
    }
}

impl PoolOptions {
    #[must_use]
    pub fn builder() -> PoolOptionsBuilder {
        PoolOptionsBuilder::default()
    }

    /// Check the sizing constraints.
    ///
    /// # Errors
    /// Returns [`OdbcMiddlewareError::Config`] when `maxsize < minsize` or `maxsize == 0`.
    pub fn validate(&self) -> Result<(), OdbcMiddlewareError> {
        if self.maxsize == 0 {
            return Err(OdbcMiddlewareError::Config(
                "maxsize should be greater than zero".into(),
            ));
        }
        if self.maxsize < self.minsize {
            return Err(OdbcMiddlewareError::Config(format!(
                "maxsize ({}) should be not less than minsize ({})",
                self.maxsize, self.minsize
            )));
        }
        Ok(())
    }
}

/// Fluent builder for [`PoolOptions`].
#[derive(Debug, Clone, Default)]
pub struct PoolOptionsBuilder {
    opts: PoolOptions,
}

impl PoolOptionsBuilder {
    #[must_use]
    pub fn minsize(mut self, minsize: usize) -> Self {
        self.opts.minsize = minsize;
        self
    }

    #[must_use]
    pub fn maxsize(mut self, maxsize: usize) -> Self {
        self.opts.maxsize = maxsize;
        self
    }

    #[must_use]
    pub fn pool_recycle(mut self, recycle: Duration) -> Self {
        self.opts.pool_recycle = Some(recycle);
        self
    }

    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.opts.acquire_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn echo(mut self, echo: bool) -> Self {
        self.opts.connect.echo = echo;
        self
    }

    #[must_use]
    pub fn connect_options(mut self, connect: ConnectOptions) -> Self {
        self.opts.connect = connect;
        self
    }

    #[must_use]
    pub fn finish(self) -> PoolOptions {
        self.opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_inverted_sizes() {
        let opts = PoolOptions::builder().minsize(5).maxsize(2).finish();
        assert!(matches!(
            opts.validate(),
            Err(OdbcMiddlewareError::Config(_))
        ));
        let opts = PoolOptions::builder().minsize(0).maxsize(0).finish();
        assert!(opts.validate().is_err());
        assert!(PoolOptions::default().validate().is_ok());
    }

    #[test]
    fn connection_string_appends_attributes() {
        let opts = ConnectOptions::builder()
            .attribute("Encrypt", "yes")
            .attribute("APP", "svc")
            .finish();
        assert_eq!(
            opts.connection_string("DSN=main;"),
            "DSN=main;APP=svc;Encrypt=yes"
        );
        assert_eq!(ConnectOptions::default().connection_string("DSN=x"), "DSN=x");
    }
}
