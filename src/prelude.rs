//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types and functions
//! to make it easier to get started with the library.

pub use crate::config::{ConnectOptions, PoolOptions};
pub use crate::connection::{Connection, connect};
pub use crate::cursor::Cursor;
pub use crate::driver::{CatalogFilter, Driver, DriverError, InfoType};
pub use crate::error::OdbcMiddlewareError;
pub use crate::pool::{Pool, PoolStatus, PooledConnection, create_pool};
pub use crate::results::{ColumnDescription, DataType, Row};
pub use crate::scope::{Scope, scoped, with_pool};
pub use crate::types::Value;
