use std::collections::HashMap;

use odbc_middleware::Pool;
use odbc_middleware::test_utils::MemoryDriver;

use crate::model::{Health, TaskState};

pub(crate) struct Oracle;

impl Oracle {
    /// Check the pool against the tasks' view of it. Runs between steps, when no acquire
    /// or release is in progress.
    pub(crate) fn check(tasks: &[TaskState], pool: &Pool, driver: &MemoryDriver) -> Result<(), String> {
        let status = pool.status();
        if status.size > status.maxsize {
            return Err(format!("pool size {} exceeds maxsize {}", status.size, status.maxsize));
        }
        if status.size != status.free + status.in_use + status.pending {
            return Err(format!(
                "size {} != free {} + in_use {} + pending {}",
                status.size, status.free, status.in_use, status.pending
            ));
        }
        if status.pending != 0 || status.waiting != 0 {
            return Err(format!(
                "idle pool reports pending={} waiting={}",
                status.pending, status.waiting
            ));
        }

        let mut owners = HashMap::new();
        let mut live_held = 0;
        for task in tasks {
            let Some(held) = &task.held else {
                continue;
            };
            let conn_id = held.conn.id();
            if let Some(other) = owners.insert(conn_id, task.id) {
                return Err(format!("conn {conn_id} held by tasks {other} and {}", task.id));
            }
            let expect_closed = held.health == Health::Lost;
            if held.conn.is_closed() != expect_closed {
                return Err(format!(
                    "conn {conn_id} (task {}) closed={} but expected {expect_closed}",
                    task.id,
                    held.conn.is_closed()
                ));
            }
            let expect_broken = held.health != Health::Healthy;
            if held.conn.is_broken() != expect_broken {
                return Err(format!(
                    "conn {conn_id} (task {}) broken={} but expected {expect_broken}",
                    task.id,
                    held.conn.is_broken()
                ));
            }
            if !expect_closed {
                live_held += 1;
            }
        }

        if owners.len() != status.in_use {
            return Err(format!(
                "tasks hold {} connections but the pool counts {} in use",
                owners.len(),
                status.in_use
            ));
        }

        let open = driver.open_connections();
        if open != status.free + live_held {
            return Err(format!(
                "driver has {open} open connections, expected free {} + live held {live_held}",
                status.free
            ));
        }

        Ok(())
    }

    /// After shutdown nothing may stay open.
    pub(crate) fn check_drained(pool: &Pool, driver: &MemoryDriver) -> Result<(), String> {
        if !pool.is_closed() {
            return Err("pool not closed after shutdown".to_string());
        }
        let open = driver.open_connections();
        if open != 0 {
            return Err(format!("{open} connections still open after shutdown"));
        }
        Ok(())
    }
}
