use odbc_middleware::PooledConnection;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Op {
    Checkout,
    Return,
    Select,
    Execute,
    Commit,
    Rollback,
    /// A statement the driver rejects; the connection must be marked broken.
    Fail,
    /// A statement that loses the link; the connection must close itself.
    Disconnect,
    /// Arm a failure for the next connection the pool opens.
    ConnectFault,
    Clear,
    Sleep(u64),
}

/// What the simulation expects of a held connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Health {
    Healthy,
    Broken,
    Lost,
}

pub(crate) struct Held {
    pub(crate) conn: PooledConnection,
    pub(crate) health: Health,
}

pub(crate) struct TaskState {
    pub(crate) id: usize,
    pub(crate) held: Option<Held>,
}

impl TaskState {
    pub(crate) fn new(id: usize) -> Self {
        Self { id, held: None }
    }

    pub(crate) fn conn_id(&self) -> Option<u64> {
        self.held.as_ref().map(|held| held.conn.id())
    }
}

/// Harness-side facts the oracle needs besides the pool itself.
#[derive(Debug, Default)]
pub(crate) struct World {
    pub(crate) connect_fault_armed: bool,
}
