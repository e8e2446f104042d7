use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::connection::Connection;

/// What a queued acquirer is handed.
pub(super) enum Grant {
    /// A released connection, already counted as in use.
    Connection(Connection),
    /// Permission to open a new connection; the slot is already reserved.
    Slot,
}

struct Waiter {
    id: u64,
    grant: oneshot::Sender<Grant>,
}

/// Next step for an acquirer, decided under the pool lock.
pub(super) enum Checkout {
    Ready(Connection),
    /// Too old to hand out; close it and open a replacement in the reserved slot.
    Expired(Connection),
    Open,
    Wait {
        id: u64,
        grant: oneshot::Receiver<Grant>,
    },
    Exhausted,
    Closed,
}

/// Pool bookkeeping. Every method is synchronous and runs under the pool mutex.
///
/// `free + in_use + pending` never exceeds `maxsize`. Connections being discarded no
/// longer count against the limit but are tracked until their native close finishes.
pub(super) struct PoolState {
    maxsize: usize,
    free: VecDeque<Connection>,
    in_use: HashSet<u64>,
    pending: usize,
    discarding: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    closing: bool,
    closed: bool,
}

impl PoolState {
    pub(super) fn new(maxsize: usize) -> Self {
        Self {
            maxsize,
            free: VecDeque::new(),
            in_use: HashSet::new(),
            pending: 0,
            discarding: 0,
            waiters: VecDeque::new(),
            next_waiter: 0,
            closing: false,
            closed: false,
        }
    }

    pub(super) fn size(&self) -> usize {
        self.free.len() + self.in_use.len() + self.pending
    }

    pub(super) fn free_len(&self) -> usize {
        self.free.len()
    }

    pub(super) fn in_use_len(&self) -> usize {
        self.in_use.len()
    }

    pub(super) fn pending(&self) -> usize {
        self.pending
    }

    pub(super) fn waiting(&self) -> usize {
        self.waiters.len()
    }

    pub(super) fn is_closing(&self) -> bool {
        self.closing
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Nothing is left to close: no connection in any state, no creation in progress.
    pub(super) fn is_drained(&self) -> bool {
        self.free.is_empty() && self.in_use.is_empty() && self.pending == 0 && self.discarding == 0
    }

    pub(super) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub(super) fn checkout(&mut self, recycle: Option<Duration>, wait: bool) -> Checkout {
        if self.closing {
            return Checkout::Closed;
        }
        if self.waiters.is_empty() {
            while let Some(conn) = self.free.pop_front() {
                if conn.is_closed() {
                    continue;
                }
                if is_expired(&conn, recycle) {
                    self.pending += 1;
                    self.discarding += 1;
                    return Checkout::Expired(conn);
                }
                self.in_use.insert(conn.id());
                return Checkout::Ready(conn);
            }
            if self.size() < self.maxsize {
                self.pending += 1;
                return Checkout::Open;
            }
        }
        if !wait {
            return Checkout::Exhausted;
        }
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter;
        self.next_waiter = self.next_waiter.wrapping_add(1);
        self.waiters.push_back(Waiter { id, grant: tx });
        self.grant_slots();
        Checkout::Wait { id, grant: rx }
    }

    /// Swap a handed-off connection that turned out to be too old for a reserved slot.
    pub(super) fn expire_in_use(&mut self, conn: &Connection) {
        self.in_use.remove(&conn.id());
        self.pending += 1;
        self.discarding += 1;
    }

    /// Reserve a slot for a connection opened outside any acquire (pool prefill).
    pub(super) fn reserve(&mut self) -> bool {
        if self.closing || self.size() >= self.maxsize {
            return false;
        }
        self.pending += 1;
        true
    }

    /// A reserved slot got its connection. Returns `false` when the pool started closing
    /// meanwhile; the connection must then be discarded.
    pub(super) fn fill_slot(&mut self, conn: &Connection, to_free: bool) -> bool {
        self.pending = self.pending.saturating_sub(1);
        if self.closing {
            self.discarding += 1;
            return false;
        }
        if to_free {
            self.free.push_back(conn.share());
        } else {
            self.in_use.insert(conn.id());
        }
        true
    }

    /// A reserved slot will not be filled.
    pub(super) fn abandon_slot(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        self.grant_slots();
    }

    /// Take back an in-use connection. Returns it when it must be closed instead of reused.
    pub(super) fn release(&mut self, conn: Connection) -> Option<Connection> {
        self.in_use.remove(&conn.id());
        if self.closing || conn.is_closed() || conn.is_broken() {
            if !conn.is_closed() {
                self.discarding += 1;
            }
            self.grant_slots();
            return if conn.is_closed() { None } else { Some(conn) };
        }
        self.hand_off(conn);
        None
    }

    /// Stop tracking an in-use connection that the caller keeps.
    pub(super) fn detach(&mut self, conn: &Connection) {
        self.in_use.remove(&conn.id());
        self.grant_slots();
    }

    /// Drop a queued waiter. `false` means it was already granted something.
    pub(super) fn cancel_wait(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|waiter| waiter.id == id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Give back a grant whose receiver went away before using it.
    pub(super) fn return_grant(&mut self, grant: Grant) -> Option<Connection> {
        match grant {
            Grant::Connection(conn) => self.release(conn),
            Grant::Slot => {
                self.abandon_slot();
                None
            }
        }
    }

    /// Begin closing: fail every waiter and hand back the idle connections to close.
    pub(super) fn close(&mut self) -> Vec<Connection> {
        if self.closing {
            return Vec::new();
        }
        self.closing = true;
        // Dropping the senders wakes every waiter with a closed-pool error.
        self.waiters.clear();
        self.take_free()
    }

    /// Remove every idle connection for closing.
    pub(super) fn take_free(&mut self) -> Vec<Connection> {
        let free: Vec<Connection> = self.free.drain(..).collect();
        self.discarding += free.iter().filter(|conn| !conn.is_closed()).count();
        free.into_iter().filter(|conn| !conn.is_closed()).collect()
    }

    pub(super) fn discard_done(&mut self) {
        self.discarding = self.discarding.saturating_sub(1);
    }

    fn hand_off(&mut self, mut conn: Connection) {
        while let Some(waiter) = self.waiters.pop_front() {
            self.in_use.insert(conn.id());
            match waiter.grant.send(Grant::Connection(conn)) {
                Ok(()) => return,
                Err(Grant::Connection(returned)) => {
                    self.in_use.remove(&returned.id());
                    conn = returned;
                }
                Err(Grant::Slot) => return,
            }
        }
        self.free.push_back(conn);
    }

    /// Turn free capacity into slots for the longest-waiting acquirers.
    fn grant_slots(&mut self) {
        while !self.closing && self.size() < self.maxsize {
            let Some(waiter) = self.waiters.pop_front() else {
                return;
            };
            self.pending += 1;
            if waiter.grant.send(Grant::Slot).is_err() {
                self.pending -= 1;
            }
        }
    }
}

pub(super) fn is_expired(conn: &Connection, recycle: Option<Duration>) -> bool {
    recycle.is_some_and(|limit| conn.created_at().elapsed() > limit)
}
