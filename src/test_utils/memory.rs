use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::config::ConnectOptions;
use crate::driver::{
    CatalogQuery, Driver, DriverError, InfoType, NativeConnection, NativeCursor,
};
use crate::results::{ColumnDescription, DataType};
use crate::types::Value;

/// Something the in-memory driver observed, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryEvent {
    Connect(u64),
    Execute { connection: u64, sql: String },
    Commit(u64),
    Rollback(u64),
    SetAutocommit { connection: u64, enabled: bool },
    SetAttr { connection: u64, attr: i32, value: i64 },
    Close(u64),
}

#[derive(Debug, Clone)]
struct ResultSet {
    columns: Vec<ColumnDescription>,
    rows: VecDeque<Vec<Value>>,
}

impl ResultSet {
    fn single(name: &str, data_type: DataType, value: Value) -> Self {
        Self {
            columns: vec![ColumnDescription::new(name, data_type)],
            rows: VecDeque::from([vec![value]]),
        }
    }
}

#[derive(Default)]
struct DriverState {
    next_id: u64,
    connects: usize,
    open: usize,
    connects_left: Option<usize>,
    fail_next: bool,
    connect_delay: Option<Duration>,
    events: Vec<MemoryEvent>,
    canned: HashMap<String, ResultSet>,
    tables: Vec<String>,
}

/// In-memory [`Driver`] with scripted statements and fault injection.
///
/// Statements are interpreted by prefix:
/// - `SELECT <int>` yields one row with one `value` column
/// - `SLEEP <ms>` blocks the calling thread
/// - `FAIL ...` raises a statement error (SQLSTATE `42000`)
/// - `DISCONNECT` raises a communication link failure (SQLSTATE `08S01`)
/// - `PARAMS` yields the bound parameters as one row
/// - `PANIC` panics inside the driver
///
/// `;` separates statements; each one producing rows becomes its own result set.
/// Anything else is treated as DML affecting one row per parameter set, unless a result
/// was registered for the exact text with [`with_result`](Self::with_result).
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<DriverState>>,
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The driver as the trait object connections and pools take.
    #[must_use]
    pub fn handle(&self) -> Arc<dyn Driver> {
        Arc::new(self.clone())
    }

    /// Register a canned result for the exact statement text `sql`.
    #[must_use]
    pub fn with_result(
        self,
        sql: &str,
        columns: Vec<ColumnDescription>,
        rows: Vec<Vec<Value>>,
    ) -> Self {
        self.lock().canned.insert(
            sql.to_owned(),
            ResultSet {
                columns,
                rows: rows.into(),
            },
        );
        self
    }

    /// Make a table visible to the `tables` catalog function.
    #[must_use]
    pub fn with_table(self, name: &str) -> Self {
        self.lock().tables.push(name.to_owned());
        self
    }

    /// Let `count` more connects succeed, then fail every one after.
    pub fn fail_connect_after(&self, count: usize) {
        self.lock().connects_left = Some(count);
    }

    /// Fail the next connect only.
    pub fn fail_next_connect(&self) {
        self.lock().fail_next = true;
    }

    /// Allow connects again.
    pub fn heal(&self) {
        let mut state = self.lock();
        state.connects_left = None;
        state.fail_next = false;
    }

    /// Block every connect for `delay`.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.lock().connect_delay = delay;
    }

    /// Successful connects so far.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Native connections opened and not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.lock().open
    }

    #[must_use]
    pub fn events(&self) -> Vec<MemoryEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Driver for MemoryDriver {
    fn connect(
        &self,
        dsn: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn NativeConnection>, DriverError> {
        let delay = self.lock().connect_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let mut state = self.lock();
        if state.fail_next {
            state.fail_next = false;
            return Err(DriverError::connection("data source unreachable").with_sqlstate("08001"));
        }
        if let Some(left) = state.connects_left {
            if left == 0 {
                return Err(DriverError::connection("data source unreachable").with_sqlstate("08001"));
            }
            state.connects_left = Some(left - 1);
        }
        state.next_id += 1;
        state.connects += 1;
        state.open += 1;
        let id = state.next_id;
        state.events.push(MemoryEvent::Connect(id));
        Ok(Box::new(MemoryConnection {
            id,
            dsn: dsn.to_owned(),
            driver: self.clone(),
            autocommit: false,
            timeout: options.login_timeout,
            closed: false,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    dsn: String,
    driver: MemoryDriver,
    autocommit: bool,
    timeout: Option<Duration>,
    closed: bool,
}

impl MemoryConnection {
    fn record(&self, event: MemoryEvent) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::programming("connection is closed").with_sqlstate("08003"));
        }
        self.driver.lock().events.push(event);
        Ok(())
    }
}

impl NativeConnection for MemoryConnection {
    fn cursor(&mut self) -> Result<Box<dyn NativeCursor>, DriverError> {
        if self.closed {
            return Err(DriverError::programming("connection is closed").with_sqlstate("08003"));
        }
        Ok(Box::new(MemoryCursor {
            connection: self.id,
            driver: self.driver.clone(),
            current: None,
            queued: VecDeque::new(),
            row_count: -1,
            closed: false,
        }))
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.record(MemoryEvent::Commit(self.id))
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.record(MemoryEvent::Rollback(self.id))
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.driver.lock();
        state.open = state.open.saturating_sub(1);
        state.events.push(MemoryEvent::Close(self.id));
        Ok(())
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }

    fn set_autocommit(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.record(MemoryEvent::SetAutocommit {
            connection: self.id,
            enabled,
        })?;
        self.autocommit = enabled;
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn get_info(&mut self, info: InfoType) -> Result<Value, DriverError> {
        match info {
            InfoType::DriverName => Ok(Value::Text("memory".into())),
            InfoType::DriverVersion => Ok(Value::Text("1.0".into())),
            InfoType::DbmsName => Ok(Value::Text("MemoryDB".into())),
            InfoType::DbmsVersion => Ok(Value::Text("1.0".into())),
            InfoType::DataSourceName => Ok(Value::Text(self.dsn.clone())),
            InfoType::Raw(_) => Err(DriverError::not_supported("raw info types")),
        }
    }

    fn set_attr(&mut self, attr_id: i32, value: i64) -> Result<(), DriverError> {
        self.record(MemoryEvent::SetAttr {
            connection: self.id,
            attr: attr_id,
            value,
        })
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        // Leaking a native handle is a bug in the caller; count it as closed anyway so
        // later assertions see it.
        if !self.closed {
            let _ = self.close();
        }
    }
}

struct MemoryCursor {
    connection: u64,
    driver: MemoryDriver,
    current: Option<ResultSet>,
    queued: VecDeque<ResultSet>,
    row_count: i64,
    closed: bool,
}

impl MemoryCursor {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed {
            Err(DriverError::programming("Attempt to use a closed cursor."))
        } else {
            Ok(())
        }
    }

    fn run_one(&mut self, sql: &str, params: &[Value]) -> Result<Option<ResultSet>, DriverError> {
        let upper = sql.to_ascii_uppercase();
        if let Some(canned) = self.driver.lock().canned.get(sql) {
            return Ok(Some(canned.clone()));
        }
        if upper.starts_with("FAIL") {
            return Err(DriverError::statement(format!("statement failed: {sql}")).with_sqlstate("42000"));
        }
        if upper.starts_with("DISCONNECT") {
            return Err(
                DriverError::statement("Communication link failure").with_sqlstate("08S01")
            );
        }
        if upper.starts_with("PANIC") {
            panic!("driver panic requested by statement");
        }
        if let Some(ms) = upper.strip_prefix("SLEEP ") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| DriverError::programming(format!("bad sleep duration: {ms}")))?;
            thread::sleep(Duration::from_millis(ms));
            return Ok(None);
        }
        if upper == "PARAMS" {
            return Ok(Some(ResultSet {
                columns: (0..params.len())
                    .map(|i| ColumnDescription::new(format!("p{i}"), DataType::Unknown))
                    .collect(),
                rows: VecDeque::from([params.to_vec()]),
            }));
        }
        if let Some(number) = upper.strip_prefix("SELECT ") {
            if let Ok(number) = number.trim().parse::<i64>() {
                return Ok(Some(ResultSet::single("value", DataType::Integer, Value::Int(number))));
            }
        }
        Ok(None)
    }
}

impl NativeCursor for MemoryCursor {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.driver.lock().events.push(MemoryEvent::Execute {
            connection: self.connection,
            sql: sql.to_owned(),
        });
        self.current = None;
        self.queued.clear();
        self.row_count = -1;

        let mut sets = VecDeque::new();
        let mut produced_rows = false;
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(set) = self.run_one(statement, params)? {
                produced_rows = true;
                sets.push_back(set);
            }
        }
        self.current = sets.pop_front();
        self.queued = sets;
        self.row_count = if produced_rows { -1 } else { 1 };
        Ok(())
    }

    fn execute_many(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> Result<(), DriverError> {
        for params in param_sets {
            self.execute(sql, params)?;
        }
        self.row_count = i64::try_from(param_sets.len()).unwrap_or(i64::MAX);
        Ok(())
    }

    fn fetch_one(&mut self) -> Result<Option<Vec<Value>>, DriverError> {
        self.ensure_open()?;
        match self.current.as_mut() {
            Some(set) => Ok(set.rows.pop_front()),
            None => Err(DriverError::programming(
                "No results.  Previous SQL was not a query.",
            )),
        }
    }

    fn next_set(&mut self) -> Result<bool, DriverError> {
        self.ensure_open()?;
        self.current = self.queued.pop_front();
        Ok(self.current.is_some())
    }

    fn catalog(&mut self, query: &CatalogQuery) -> Result<(), DriverError> {
        self.ensure_open()?;
        match query {
            CatalogQuery::Tables { filter, .. } => {
                let tables = self.driver.lock().tables.clone();
                let rows = tables
                    .into_iter()
                    .filter(|name| filter.table.as_deref().is_none_or(|wanted| wanted == name))
                    .map(|name| {
                        vec![
                            Value::Null,
                            Value::Null,
                            Value::Text(name),
                            Value::Text("TABLE".into()),
                            Value::Null,
                        ]
                    })
                    .collect();
                let columns = ["table_cat", "table_schem", "table_name", "table_type", "remarks"]
                    .into_iter()
                    .map(|name| ColumnDescription::new(name, DataType::Text))
                    .collect();
                self.current = Some(ResultSet { columns, rows });
                self.queued.clear();
                self.row_count = -1;
                Ok(())
            }
            _ => Err(DriverError::not_supported("this catalog function")),
        }
    }

    fn description(&self) -> Option<Vec<ColumnDescription>> {
        self.current.as_ref().map(|set| set.columns.clone())
    }

    fn row_count(&self) -> i64 {
        self.row_count
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.closed = true;
        self.current = None;
        self.queued.clear();
        Ok(())
    }
}
