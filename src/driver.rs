//! Contract for the synchronous native driver.
//!
//! Everything in this module is called from a bridge worker thread, never from the async
//! scheduler. Native connection and cursor handles are created on that thread and stay
//! there for their whole life, so they do not need to be `Send`.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConnectOptions;
use crate::results::ColumnDescription;
use crate::types::Value;

/// Category of a failure reported by the native driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The link to the server is gone or unusable.
    Connection,
    /// A statement failed (bad SQL, constraint violation, ...).
    Statement,
    /// The driver rejected the call sequence.
    Programming,
    /// The driver does not implement the requested call.
    NotSupported,
    Other,
}

/// Error raised by the native driver.
#[derive(Debug, Clone, Error)]
#[error("{}", render(.kind, .sqlstate.as_deref(), .message))]
pub struct DriverError {
    pub kind: DriverErrorKind,
    /// Five character SQLSTATE, when the driver reports one.
    pub sqlstate: Option<String>,
    pub message: String,
}

fn render(kind: &DriverErrorKind, sqlstate: Option<&str>, message: &str) -> String {
    match sqlstate {
        Some(state) => format!("[{state}] {kind:?} error: {message}"),
        None => format!("{kind:?} error: {message}"),
    }
}

impl DriverError {
    #[must_use]
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sqlstate: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connection, message)
    }

    #[must_use]
    pub fn statement(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Statement, message)
    }

    #[must_use]
    pub fn programming(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Programming, message)
    }

    #[must_use]
    pub fn not_supported(what: &str) -> Self {
        Self::new(
            DriverErrorKind::NotSupported,
            format!("{what} is not supported by this driver"),
        )
    }

    /// True when the error means the connection itself is lost.
    ///
    /// SQLSTATE class `08` is the ODBC "connection exception" class (`08S01` communication
    /// link failure, `08003` connection not open, ...).
    #[must_use]
    pub fn is_connection_level(&self) -> bool {
        self.kind == DriverErrorKind::Connection
            || self
                .sqlstate
                .as_deref()
                .is_some_and(|state| state.starts_with("08"))
    }
}

/// Driver information keys understood by [`NativeConnection::get_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoType {
    DriverName,
    DriverVersion,
    DbmsName,
    DbmsVersion,
    DataSourceName,
    /// Any other numeric `SQL_*` info constant.
    Raw(u16),
}

/// Catalog functions that produce a result set on a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogFilter {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
}

impl CatalogFilter {
    #[must_use]
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogQuery {
    Tables {
        filter: CatalogFilter,
        table_type: Option<String>,
    },
    Columns {
        filter: CatalogFilter,
        column: Option<String>,
    },
    Statistics {
        filter: CatalogFilter,
        unique: bool,
        quick: bool,
    },
    RowIdColumns {
        filter: CatalogFilter,
        nullable: bool,
    },
    RowVerColumns {
        filter: CatalogFilter,
        nullable: bool,
    },
    PrimaryKeys {
        filter: CatalogFilter,
    },
    ForeignKeys {
        filter: CatalogFilter,
        foreign: CatalogFilter,
    },
    TypeInfo {
        sql_type: Option<i16>,
    },
    Procedures {
        filter: CatalogFilter,
    },
    ProcedureColumns {
        filter: CatalogFilter,
    },
}

/// Entry point of a native driver: opens connections from a DSN.
pub trait Driver: Send + Sync + 'static {
    /// Open one native connection. May block for as long as the login takes.
    ///
    /// # Errors
    /// Returns the driver error raised while connecting.
    fn connect(
        &self,
        dsn: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn NativeConnection>, DriverError>;
}

/// One open native connection.
pub trait NativeConnection {
    /// # Errors
    /// Driver failure.
    fn cursor(&mut self) -> Result<Box<dyn NativeCursor>, DriverError>;

    /// # Errors
    /// Driver failure.
    fn commit(&mut self) -> Result<(), DriverError>;

    /// # Errors
    /// Driver failure.
    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Release the native handle. Called at most once.
    ///
    /// # Errors
    /// Driver failure; the handle is considered released either way.
    fn close(&mut self) -> Result<(), DriverError>;

    fn autocommit(&self) -> bool;

    /// # Errors
    /// Driver failure.
    fn set_autocommit(&mut self, enabled: bool) -> Result<(), DriverError>;

    /// Login/query timeout currently applied by the driver, if any.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// # Errors
    /// Driver failure, or `NotSupported` by default.
    fn get_info(&mut self, info: InfoType) -> Result<Value, DriverError> {
        let _ = info;
        Err(DriverError::not_supported("get_info"))
    }

    /// Set a numeric connection attribute (`SQLSetConnectAttr`).
    ///
    /// # Errors
    /// Driver failure, or `NotSupported` by default.
    fn set_attr(&mut self, attr_id: i32, value: i64) -> Result<(), DriverError> {
        let _ = (attr_id, value);
        Err(DriverError::not_supported("set_attr"))
    }
}

/// One native statement handle.
pub trait NativeCursor {
    /// # Errors
    /// Driver failure.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<(), DriverError>;

    /// # Errors
    /// Driver failure.
    fn execute_many(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> Result<(), DriverError> {
        for params in param_sets {
            self.execute(sql, params)?;
        }
        Ok(())
    }

    /// # Errors
    /// Driver failure.
    fn fetch_one(&mut self) -> Result<Option<Vec<Value>>, DriverError>;

    /// # Errors
    /// Driver failure.
    fn fetch_many(&mut self, size: usize) -> Result<Vec<Vec<Value>>, DriverError> {
        let mut rows = Vec::with_capacity(size);
        while rows.len() < size {
            match self.fetch_one()? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    /// # Errors
    /// Driver failure.
    fn fetch_all(&mut self) -> Result<Vec<Vec<Value>>, DriverError> {
        let mut rows = Vec::new();
        while let Some(row) = self.fetch_one()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Advance to the next result set; `false` when there is none.
    ///
    /// # Errors
    /// Driver failure.
    fn next_set(&mut self) -> Result<bool, DriverError> {
        Ok(false)
    }

    /// # Errors
    /// Driver failure.
    fn skip(&mut self, count: usize) -> Result<(), DriverError> {
        for _ in 0..count {
            if self.fetch_one()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// # Errors
    /// Driver failure, or `NotSupported` by default.
    fn catalog(&mut self, query: &CatalogQuery) -> Result<(), DriverError> {
        let _ = query;
        Err(DriverError::not_supported("catalog functions"))
    }

    /// # Errors
    /// Driver failure.
    fn set_input_sizes(&mut self, sizes: &[Option<usize>]) -> Result<(), DriverError> {
        let _ = sizes;
        Ok(())
    }

    /// `None` until a statement that returns rows has been executed.
    fn description(&self) -> Option<Vec<ColumnDescription>>;

    /// Rows affected by the last statement, `-1` when unknown.
    fn row_count(&self) -> i64;

    /// # Errors
    /// Driver failure.
    fn close(&mut self) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_class_08_is_connection_level() {
        let err = DriverError::statement("Communication link failure").with_sqlstate("08S01");
        assert!(err.is_connection_level());
        assert!(DriverError::connection("gone").is_connection_level());
        assert!(!DriverError::statement("syntax").with_sqlstate("42000").is_connection_level());
    }

    #[test]
    fn display_includes_sqlstate() {
        let err = DriverError::statement("bad column").with_sqlstate("42S22");
        assert_eq!(err.to_string(), "[42S22] Statement error: bad column");
        assert_eq!(
            DriverError::programming("closed").to_string(),
            "Programming error: closed"
        );
    }
}
