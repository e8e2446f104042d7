use std::collections::BTreeMap;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Picks which task steps next. Time is simulated: sleeping tasks wake when the clock
/// reaches their deadline, and the clock jumps ahead when every task sleeps.
pub(crate) struct Scheduler {
    ready: Vec<usize>,
    timers: BTreeMap<u64, Vec<usize>>,
    now_ms: u64,
}

impl Scheduler {
    pub(crate) fn new(task_count: usize) -> Self {
        Self {
            ready: (0..task_count).collect(),
            timers: BTreeMap::new(),
            now_ms: 0,
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub(crate) fn sleep(&mut self, task_id: usize, duration_ms: u64) {
        let wake_at = self.now_ms.saturating_add(duration_ms.max(1));
        self.timers.entry(wake_at).or_default().push(task_id);
    }

    pub(crate) fn mark_ready(&mut self, task_id: usize) {
        self.ready.push(task_id);
    }

    pub(crate) fn advance_time(&mut self, elapsed_ms: u64) {
        self.now_ms = self.now_ms.saturating_add(elapsed_ms.max(1));
        self.wake_due();
    }

    pub(crate) fn next_ready(&mut self, rng: &mut ChaCha8Rng) -> Option<usize> {
        if self.ready.is_empty() {
            let wake_at = *self.timers.first_key_value()?.0;
            self.now_ms = self.now_ms.max(wake_at);
            self.wake_due();
        }
        let idx = rng.random_range(0..self.ready.len());
        Some(self.ready.swap_remove(idx))
    }

    fn wake_due(&mut self) {
        while let Some(entry) = self.timers.first_entry() {
            if *entry.key() > self.now_ms {
                break;
            }
            self.ready.append(&mut entry.remove());
        }
    }
}
