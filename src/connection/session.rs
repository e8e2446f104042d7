use std::collections::HashMap;

use crate::driver::{DriverError, NativeConnection, NativeCursor};
use crate::error::OdbcMiddlewareError;

/// Native handles owned by one connection's worker thread.
///
/// Cursors live here rather than in their async wrappers, so closing the connection
/// closes every cursor opened on it.
pub(crate) struct Session {
    label: String,
    native: Option<Box<dyn NativeConnection>>,
    cursors: HashMap<u64, Box<dyn NativeCursor>>,
    next_cursor_id: u64,
}

impl Session {
    pub(crate) fn new(label: String) -> Self {
        Self {
            label,
            native: None,
            cursors: HashMap::new(),
            next_cursor_id: 1,
        }
    }

    pub(crate) fn attach(&mut self, native: Box<dyn NativeConnection>) {
        self.native = Some(native);
    }

    pub(crate) fn native(&mut self) -> Result<&mut dyn NativeConnection, OdbcMiddlewareError> {
        match self.native.as_mut() {
            Some(native) => {
                let native: &mut dyn NativeConnection = native.as_mut();
                Ok(native)
            }
            None => Err(OdbcMiddlewareError::usage("connection is closed")),
        }
    }

    pub(crate) fn open_cursor(&mut self) -> Result<u64, OdbcMiddlewareError> {
        let cursor = self.native()?.cursor()?;
        let id = self.next_cursor_id;
        self.next_cursor_id = self.next_cursor_id.saturating_add(1);
        self.cursors.insert(id, cursor);
        Ok(id)
    }

    pub(crate) fn cursor(&mut self, id: u64) -> Result<&mut dyn NativeCursor, OdbcMiddlewareError> {
        match self.cursors.get_mut(&id) {
            Some(cursor) => {
                let cursor: &mut dyn NativeCursor = cursor.as_mut();
                Ok(cursor)
            }
            None => Err(OdbcMiddlewareError::usage("cursor is closed")),
        }
    }

    /// Close one cursor. Unknown ids are already closed.
    pub(crate) fn close_cursor(&mut self, id: u64) -> Result<(), DriverError> {
        match self.cursors.remove(&id) {
            Some(mut cursor) => cursor.close(),
            None => Ok(()),
        }
    }

    /// Close every open cursor; failures are logged and skipped.
    pub(crate) fn close_cursors(&mut self) {
        for (id, mut cursor) in self.cursors.drain() {
            if let Err(err) = cursor.close() {
                tracing::debug!(session = %self.label, cursor = id, error = %err, "cursor close failed");
            }
        }
    }

    /// Close every cursor, then the connection. Safe to call more than once.
    pub(crate) fn close(&mut self) -> Result<(), DriverError> {
        self.close_cursors();
        match self.native.take() {
            Some(mut native) => native.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.native.is_some() {
            if let Err(err) = self.close() {
                tracing::warn!(session = %self.label, error = %err, "native close failed during teardown");
            }
        }
    }
}
