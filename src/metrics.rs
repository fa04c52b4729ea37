// Diagnostic Counters
//
// Thin counter surface the core reports drops, firings, and read volume
// through. The embedding runtime supplies its own implementation; the
// in-memory one backs tests and the sharded driver.

use dashmap::DashMap;
use std::collections::HashMap;

/// Elements dropped because their window had already closed.
pub const DROPPED_DUE_TO_CLOSED_WINDOW: &str = "dropped_due_to_closed_window";

/// Elements dropped because their window's allowed lateness had overflowed.
pub const DROPPED_DUE_TO_LATENESS: &str = "dropped_due_to_lateness";

/// Panes emitted to the output sink.
pub const PANES_FIRED: &str = "panes_fired";

/// Bytes of buffered values read when a group is opened for emission.
pub const BYTES_READ: &str = "bytes_read";

/// Second fire of a once-trigger coerced into a no-op.
pub const ONCE_TRIGGER_REFIRE_SUPPRESSED: &str = "once_trigger_refire_suppressed";

/// Counter sink supplied by the embedding runtime.
pub trait Counters: Send + Sync {
    fn increment(&self, name: &'static str, n: u64);
}

/// Discards all increments.
#[derive(Debug, Default)]
pub struct NoopCounters;

impl Counters for NoopCounters {
    fn increment(&self, _name: &'static str, _n: u64) {}
}

/// Concurrent counter map for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryCounters {
    counts: DashMap<&'static str, u64>,
}

impl InMemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counts.get(name).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counts.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}

impl Counters for InMemoryCounters {
    fn increment(&self, name: &'static str, n: u64) {
        *self.counts.entry(name).or_insert(0) += n;
    }
}
