use std::fmt;
use std::sync::Arc;

use futures_util::stream::{self, Stream};

use crate::connection::{ConnectionInner, Session};
use crate::driver::{CatalogFilter, CatalogQuery, DriverError, NativeCursor};
use crate::error::OdbcMiddlewareError;
use crate::results::{ColumnDescription, ColumnIndex, Row};
use crate::types::Value;

/// Result-set metadata read back after every call that can change it.
struct Snapshot {
    description: Option<Vec<ColumnDescription>>,
    row_count: i64,
}

impl Snapshot {
    fn of(cursor: &dyn NativeCursor) -> Self {
        Self {
            description: cursor.description(),
            row_count: cursor.row_count(),
        }
    }
}

/// A statement handle on a [`Connection`](crate::Connection).
///
/// Calls go through the owning connection's worker, so they are serialized with
/// everything else issued on that connection.
pub struct Cursor {
    conn: Arc<ConnectionInner>,
    id: u64,
    description: Option<Arc<Vec<ColumnDescription>>>,
    columns: ColumnIndex,
    row_count: i64,
    arraysize: usize,
    executed: bool,
    closed: bool,
    epoch: u64,
}

impl Cursor {
    pub(crate) fn new(conn: Arc<ConnectionInner>, id: u64) -> Self {
        let epoch = conn.epoch();
        Self {
            conn,
            id,
            description: None,
            columns: ColumnIndex::default(),
            row_count: -1,
            arraysize: 1,
            executed: false,
            closed: false,
            epoch,
        }
    }

    /// Run one statement with positional parameters.
    ///
    /// # Errors
    /// Usage error if this cursor or its connection is closed, otherwise the driver's error.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<&mut Self, OdbcMiddlewareError> {
        self.log_statement("execute", sql, params);
        let statement = sql.to_owned();
        let params = params.to_vec();
        self.run_statement(move |cursor| cursor.execute(&statement, &params))
            .await?;
        Ok(self)
    }

    /// Run one statement once per parameter set.
    ///
    /// # Errors
    /// Usage error if this cursor or its connection is closed, otherwise the driver's error.
    pub async fn execute_many(
        &mut self,
        sql: &str,
        param_sets: &[Vec<Value>],
    ) -> Result<(), OdbcMiddlewareError> {
        if self.conn.echo() {
            tracing::info!(
                target: "odbc_middleware::echo",
                connection = self.conn.id(),
                sql,
                sets = param_sets.len(),
                ?param_sets,
                "execute_many"
            );
        }
        let statement = sql.to_owned();
        let param_sets = param_sets.to_vec();
        self.run_statement(move |cursor| cursor.execute_many(&statement, &param_sets))
            .await
    }

    /// Run a catalog function; its result set is fetched like a query's.
    ///
    /// # Errors
    /// Usage error if this cursor or its connection is closed, otherwise the driver's error.
    pub async fn catalog(&mut self, query: CatalogQuery) -> Result<&mut Self, OdbcMiddlewareError> {
        tracing::debug!(connection = self.conn.id(), cursor = self.id, ?query, "catalog");
        self.run_statement(move |cursor| cursor.catalog(&query))
            .await?;
        Ok(self)
    }

    /// # Errors
    /// See [`catalog`](Self::catalog).
    pub async fn tables(
        &mut self,
        filter: CatalogFilter,
        table_type: Option<String>,
    ) -> Result<&mut Self, OdbcMiddlewareError> {
        self.catalog(CatalogQuery::Tables { filter, table_type }).await
    }

    /// # Errors
    /// See [`catalog`](Self::catalog).
    pub async fn columns(
        &mut self,
        filter: CatalogFilter,
        column: Option<String>,
    ) -> Result<&mut Self, OdbcMiddlewareError> {
        self.catalog(CatalogQuery::Columns { filter, column }).await
    }

    /// # Errors
    /// See [`catalog`](Self::catalog).
    pub async fn statistics(
        &mut self,
        filter: CatalogFilter,
        unique: bool,
        quick: bool,
    ) -> Result<&mut Self, OdbcMiddlewareError> {
        self.catalog(CatalogQuery::Statistics {
            filter,
            unique,
            quick,
        })
        .await
    }

    /// # Errors
    /// See [`catalog`](Self::catalog).
    pub async fn row_id_columns(
        &mut self,
        filter: CatalogFilter,
        nullable: bool,
    ) -> Result<&mut Self, OdbcMiddlewareError> {
        self.catalog(CatalogQuery::RowIdColumns { filter, nullable })
            .await
    }

    /// # Errors
    /// See [`catalog`](Self::catalog).
    pub async fn row_ver_columns(
        &mut self,
        filter: CatalogFilter,
        nullable: bool,
    ) -> Result<&mut Self, OdbcMiddlewareError> {
        self.catalog(CatalogQuery::RowVerColumns { filter, nullable })
            .await
    }

    /// # Errors
    /// See [`catalog`](Self::catalog).
    pub async fn primary_keys(
        &mut self,
        filter: CatalogFilter,
    ) -> Result<&mut Self, OdbcMiddlewareError> {
        self.catalog(CatalogQuery::PrimaryKeys { filter }).await
    }

    /// # Errors
    /// See [`catalog`](Self::catalog).
    pub async fn foreign_keys(
        &mut self,
        filter: CatalogFilter,
        foreign: CatalogFilter,
    ) -> Result<&mut Self, OdbcMiddlewareError> {
        self.catalog(CatalogQuery::ForeignKeys { filter, foreign })
            .await
    }

    /// # Errors
    /// See [`catalog`](Self::catalog).
    pub async fn type_info(
        &mut self,
        sql_type: Option<i16>,
    ) -> Result<&mut Self, OdbcMiddlewareError> {
        self.catalog(CatalogQuery::TypeInfo { sql_type }).await
    }

    /// # Errors
    /// See [`catalog`](Self::catalog).
    pub async fn procedures(
        &mut self,
        filter: CatalogFilter,
    ) -> Result<&mut Self, OdbcMiddlewareError> {
        self.catalog(CatalogQuery::Procedures { filter }).await
    }

    /// # Errors
    /// See [`catalog`](Self::catalog).
    pub async fn procedure_columns(
        &mut self,
        filter: CatalogFilter,
    ) -> Result<&mut Self, OdbcMiddlewareError> {
        self.catalog(CatalogQuery::ProcedureColumns { filter })
            .await
    }

    /// Next row of the current result set, `None` once it is exhausted.
    ///
    /// # Errors
    /// Usage error before a successful execute, otherwise the driver's error.
    pub async fn fetch_one(&mut self) -> Result<Option<Row>, OdbcMiddlewareError> {
        let values = self.run_fetch(|cursor| cursor.fetch_one()).await?;
        Ok(values.map(|values| self.columns.row(values)))
    }

    /// Up to `size` rows; `0` means [`arraysize`](Self::arraysize).
    ///
    /// # Errors
    /// Usage error before a successful execute, otherwise the driver's error.
    pub async fn fetch_many(&mut self, size: usize) -> Result<Vec<Row>, OdbcMiddlewareError> {
        let size = if size == 0 { self.arraysize } else { size };
        let rows = self.run_fetch(move |cursor| cursor.fetch_many(size)).await?;
        Ok(rows.into_iter().map(|values| self.columns.row(values)).collect())
    }

    /// Every remaining row of the current result set.
    ///
    /// # Errors
    /// Usage error before a successful execute, otherwise the driver's error.
    pub async fn fetch_all(&mut self) -> Result<Vec<Row>, OdbcMiddlewareError> {
        let rows = self.run_fetch(|cursor| cursor.fetch_all()).await?;
        Ok(rows.into_iter().map(|values| self.columns.row(values)).collect())
    }

    /// First column of the next row, `None` when no row is left.
    ///
    /// # Errors
    /// Usage error before a successful execute, otherwise the driver's error.
    pub async fn fetch_val(&mut self) -> Result<Option<Value>, OdbcMiddlewareError> {
        let row = self.fetch_one().await?;
        Ok(row.and_then(|row| row.into_values().into_iter().next()))
    }

    /// Like [`fetch_val`](Self::fetch_val) but substituting `default` for a missing row.
    ///
    /// # Errors
    /// Usage error before a successful execute, otherwise the driver's error.
    pub async fn fetch_val_or(&mut self, default: Value) -> Result<Value, OdbcMiddlewareError> {
        Ok(self.fetch_val().await?.unwrap_or(default))
    }

    /// Stream the remaining rows, one worker round trip per row.
    pub fn rows(&mut self) -> impl Stream<Item = Result<Row, OdbcMiddlewareError>> + '_ {
        stream::try_unfold(self, |cursor| async move {
            let next = cursor.fetch_one().await?;
            Ok::<_, OdbcMiddlewareError>(next.map(|row| (row, cursor)))
        })
    }

    /// Move to the next result set. Returns `false` when there is none.
    ///
    /// # Errors
    /// Usage error before a successful execute, otherwise the driver's error.
    pub async fn next_set(&mut self) -> Result<bool, OdbcMiddlewareError> {
        self.ensure_executed()?;
        let id = self.id;
        let (more, snapshot) = self
            .call(move |session| {
                let cursor = session.cursor(id)?;
                let more = cursor.next_set()?;
                Ok((more, Snapshot::of(&*cursor)))
            })
            .await?;
        self.apply(snapshot);
        Ok(more)
    }

    /// Discard the next `count` rows.
    ///
    /// # Errors
    /// Usage error before a successful execute, otherwise the driver's error.
    pub async fn skip(&mut self, count: usize) -> Result<(), OdbcMiddlewareError> {
        self.run_fetch(move |cursor| cursor.skip(count)).await
    }

    /// Declare parameter buffer sizes for the next execute.
    ///
    /// # Errors
    /// Usage error if this cursor is closed, otherwise the driver's error.
    pub async fn set_input_sizes(
        &mut self,
        sizes: Vec<Option<usize>>,
    ) -> Result<(), OdbcMiddlewareError> {
        let id = self.id;
        self.call(move |session| Ok(session.cursor(id)?.set_input_sizes(&sizes)?))
            .await
    }

    /// Accepted for DB-API parity; output buffers are sized by the driver.
    pub fn set_output_size(&mut self, _size: usize, _column: Option<usize>) {}

    /// # Errors
    /// Usage error if the connection is closed, otherwise the driver's error.
    pub async fn commit(&self) -> Result<(), OdbcMiddlewareError> {
        self.ensure_open()?;
        self.conn.commit().await
    }

    /// # Errors
    /// Usage error if the connection is closed, otherwise the driver's error.
    pub async fn rollback(&self) -> Result<(), OdbcMiddlewareError> {
        self.ensure_open()?;
        self.conn.rollback().await
    }

    /// Release the statement handle. Closing twice, or after the connection closed, is a no-op.
    ///
    /// # Errors
    /// Returns the driver's close error.
    pub async fn close(&mut self) -> Result<(), OdbcMiddlewareError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.description = None;
        // A pool reset already closed the handles of a stale cursor.
        if self.conn.is_closed() || self.is_stale() {
            return Ok(());
        }
        let id = self.id;
        self.conn
            .call(move |session| Ok(session.close_cursor(id)?))
            .await
    }

    /// Column metadata of the current result set, `None` when it produced no rows.
    #[must_use]
    pub fn description(&self) -> Option<&[ColumnDescription]> {
        self.description.as_deref().map(Vec::as_slice)
    }

    /// Rows affected by the last statement, `-1` when unknown.
    #[must_use]
    pub fn row_count(&self) -> i64 {
        self.row_count
    }

    #[must_use]
    pub fn arraysize(&self) -> usize {
        self.arraysize
    }

    /// Default batch for [`fetch_many`](Self::fetch_many); values below one become one.
    pub fn set_arraysize(&mut self, size: usize) {
        self.arraysize = size.max(1);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed || self.conn.is_closed() || self.is_stale()
    }

    /// Autocommit flag of the owning connection.
    #[must_use]
    pub fn autocommit(&self) -> bool {
        self.conn.autocommit()
    }

    #[must_use]
    pub fn echo(&self) -> bool {
        self.conn.echo()
    }

    /// Id of the connection this cursor belongs to.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    fn log_statement(&self, what: &str, sql: &str, params: &[Value]) {
        if self.conn.echo() {
            tracing::info!(
                target: "odbc_middleware::echo",
                connection = self.conn.id(),
                sql,
                ?params,
                "{what}"
            );
        }
    }

    /// True once the connection went back to its pool after this cursor was opened.
    fn is_stale(&self) -> bool {
        self.conn.epoch() != self.epoch
    }

    fn ensure_open(&self) -> Result<(), OdbcMiddlewareError> {
        if self.closed {
            return Err(OdbcMiddlewareError::usage("cursor is closed"));
        }
        if self.conn.is_closed() {
            return Err(OdbcMiddlewareError::usage(
                "cursor is closed: its connection has been closed",
            ));
        }
        if self.is_stale() {
            return Err(OdbcMiddlewareError::usage(
                "cursor is closed: its connection was returned to the pool",
            ));
        }
        Ok(())
    }

    fn ensure_executed(&self) -> Result<(), OdbcMiddlewareError> {
        self.ensure_open()?;
        if self.executed {
            Ok(())
        } else {
            Err(OdbcMiddlewareError::usage(
                "no statement has been executed on this cursor",
            ))
        }
    }

    async fn call<F, R>(&self, func: F) -> Result<R, OdbcMiddlewareError>
    where
        F: FnOnce(&mut Session) -> Result<R, OdbcMiddlewareError> + Send + 'static,
        R: Send + 'static,
    {
        self.ensure_open()?;
        self.conn.call(func).await
    }

    async fn run_statement<F>(&mut self, func: F) -> Result<(), OdbcMiddlewareError>
    where
        F: FnOnce(&mut dyn NativeCursor) -> Result<(), DriverError> + Send + 'static,
    {
        let id = self.id;
        let outcome = self
            .call(move |session| {
                let cursor = session.cursor(id)?;
                func(&mut *cursor)?;
                Ok(Snapshot::of(&*cursor))
            })
            .await;
        match outcome {
            Ok(snapshot) => {
                self.executed = true;
                self.apply(snapshot);
                Ok(())
            }
            Err(err) => {
                self.executed = false;
                self.description = None;
                self.columns = ColumnIndex::default();
                Err(err)
            }
        }
    }

    async fn run_fetch<F, R>(&mut self, func: F) -> Result<R, OdbcMiddlewareError>
    where
        F: FnOnce(&mut dyn NativeCursor) -> Result<R, DriverError> + Send + 'static,
        R: Send + 'static,
    {
        self.ensure_executed()?;
        let id = self.id;
        let (value, row_count) = self
            .call(move |session| {
                let cursor = session.cursor(id)?;
                let value = func(&mut *cursor)?;
                Ok((value, cursor.row_count()))
            })
            .await?;
        self.row_count = row_count;
        Ok(value)
    }

    fn apply(&mut self, snapshot: Snapshot) {
        self.row_count = snapshot.row_count;
        match snapshot.description {
            Some(description) => {
                self.columns = ColumnIndex::from_description(&description);
                self.description = Some(Arc::new(description));
            }
            None => {
                self.columns = ColumnIndex::default();
                self.description = None;
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if !self.is_closed() {
            let id = self.id;
            let _ = self.conn.bridge.submit(move |session| {
                if let Err(err) = session.close_cursor(id) {
                    tracing::debug!(cursor = id, error = %err, "cursor close on drop failed");
                }
            });
        }
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("connection", &self.conn.id())
            .field("id", &self.id)
            .field("executed", &self.executed)
            .field("row_count", &self.row_count)
            .field("closed", &self.is_closed())
            .finish()
    }
}
