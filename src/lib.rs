//! Async access to blocking ODBC-style drivers, with a bounded connection pool.
//!
//! Each [`Connection`] owns a dedicated worker thread; every native call for that
//! connection runs there, one at a time, while the caller's task awaits the result.
//! [`Pool`] keeps up to `maxsize` such connections and hands them out first come first
//! served.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use odbc_middleware::prelude::*;
//!
//! async fn answer(driver: Arc<dyn Driver>) -> Result<Option<Value>, OdbcMiddlewareError> {
//!     let options = PoolOptions::builder().minsize(1).maxsize(4).finish();
//!     let pool = create_pool(driver, "DSN=warehouse", options).await?;
//!
//!     let conn = pool.acquire().await?;
//!     let mut cursor = conn.execute("SELECT 42", &[]).await?;
//!     let value = cursor.fetch_val().await?;
//!     cursor.close().await?;
//!     conn.release().await?;
//!
//!     pool.shutdown().await?;
//!     Ok(value)
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod pool;
pub mod prelude;
pub mod results;
pub mod scope;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bridge::Bridge;
pub use config::{
    AfterCreated, ConnectOptions, ConnectOptionsBuilder, PoolOptions, PoolOptionsBuilder,
};
pub use connection::{Connection, connect};
pub use cursor::Cursor;
pub use driver::{
    CatalogFilter, CatalogQuery, Driver, DriverError, DriverErrorKind, InfoType,
    NativeConnection, NativeCursor,
};
pub use error::OdbcMiddlewareError;
pub use pool::{Pool, PoolStatus, PooledConnection, create_pool};
pub use results::{ColumnDescription, DataType, Row};
pub use scope::{Scope, scoped, with_pool};
pub use types::Value;
