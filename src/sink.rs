// Output Sink
//
// Emitted panes are appended to a per-key sink queue; durability and
// downstream flushing are the embedding runtime's responsibility.

use crate::error::Result;
use crate::reduce::PaneInfo;
use crate::time::Timestamp;
use crate::value::{StreamKey, StreamValue};
use crate::windowing::BoundedWindow;
use parking_lot::Mutex;
use std::sync::Arc;

/// One emitted pane.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowedValue {
    pub key: StreamKey,
    pub value: StreamValue,
    pub timestamp: Timestamp,
    pub window: BoundedWindow,
    pub pane: PaneInfo,
}

/// Destination for emitted panes.
pub trait OutputSink: Send {
    fn emit(&mut self, value: WindowedValue) -> Result<()>;
}

/// Shared handle over the output collected by a `CollectingSink`.
#[derive(Debug, Clone, Default)]
pub struct SinkHandle {
    collected: Arc<Mutex<Vec<WindowedValue>>>,
}

impl SinkHandle {
    /// Drain everything emitted so far.
    pub fn take(&self) -> Vec<WindowedValue> {
        std::mem::take(&mut *self.collected.lock())
    }

    pub fn snapshot(&self) -> Vec<WindowedValue> {
        self.collected.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.collected.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.collected.lock().is_empty()
    }
}

/// Appends emissions to a shared vector, for tests and local runs.
#[derive(Debug, Default)]
pub struct CollectingSink {
    handle: SinkHandle,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }
}

impl OutputSink for CollectingSink {
    fn emit(&mut self, value: WindowedValue) -> Result<()> {
        self.handle.collected.lock().push(value);
        Ok(())
    }
}
