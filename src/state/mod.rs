// Per-Key State
//
// The state backend is an abstract key-value store with namespaces. All
// operations for one key run on a single logical task, so the backend is not
// required to be thread-safe per key. Cells encode through bincode; the
// typed views live in `cells`.

use crate::error::Result;
use crate::value::StreamKey;
use crate::windowing::BoundedWindow;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod cache;
pub mod cells;

pub use cache::{CachedStateBackend, StateCache, StateCacheConfig, StateCacheStats};
pub use cells::{BagCell, CombiningCell, ValueCell, WatermarkHoldCell};

/// Well-known state cell tags.
pub mod tags {
    /// Serialized `ActiveWindowSet`, global namespace.
    pub const ACTIVE_WINDOWS: &str = "active-windows";

    /// Bag of buffered element values.
    pub const BUFFER: &str = "buf";

    /// Combining accumulator.
    pub const ACCUMULATOR: &str = "acc";

    /// Watermark hold instant.
    pub const HOLD: &str = "hold";

    /// Previous `PaneInfo` for the window.
    pub const PANE: &str = "pane";

    /// Window lifecycle phase marker.
    pub const PHASE: &str = "phase";

    /// Trigger finished-bits bitmap.
    pub const FINISHED: &str = "finished";

    /// Per-trigger-node target instant.
    pub const TARGET: &str = "target";

    /// Per-trigger-node element counter.
    pub const COUNT: &str = "count";

    /// Scripted trigger latch.
    pub const LATCH: &str = "latch";
}

/// Addressing scope for state cells and timers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateNamespace {
    /// Key-global state.
    Global,

    /// State scoped to one window.
    Window(BoundedWindow),

    /// State scoped to one trigger node of one window, indexed by the
    /// trigger tree's DFS ordering.
    WindowAndTrigger(BoundedWindow, u32),
}

impl StateNamespace {
    /// Stable string form used as the storage key.
    pub fn key(&self) -> String {
        match self {
            StateNamespace::Global => "g".to_string(),
            StateNamespace::Window(w) => {
                format!("w/{}/{}", w.start.as_millis(), w.end.as_millis())
            }
            StateNamespace::WindowAndTrigger(w, idx) => {
                format!("wt/{}/{}/{}", w.start.as_millis(), w.end.as_millis(), idx)
            }
        }
    }

    /// The window this namespace is scoped to, if any.
    pub fn window(&self) -> Option<&BoundedWindow> {
        match self {
            StateNamespace::Global => None,
            StateNamespace::Window(w) => Some(w),
            StateNamespace::WindowAndTrigger(w, _) => Some(w),
        }
    }
}

impl fmt::Display for StateNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Abstract per-key state store.
///
/// Writes are visible to subsequent reads within the same key immediately;
/// `persist` marks the batch boundary at which pending writes must be made
/// durable. `prefetch` is an optional hint allowing a remote backend to batch
/// reads before an event is evaluated.
pub trait StateBackend: Send {
    fn read(&self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<Option<Vec<u8>>>;

    fn write(
        &mut self,
        key: &StreamKey,
        ns: &StateNamespace,
        tag: &str,
        bytes: Vec<u8>,
    ) -> Result<()>;

    fn clear_value(&mut self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<()>;

    fn bag_append(
        &mut self,
        key: &StreamKey,
        ns: &StateNamespace,
        tag: &str,
        bytes: Vec<u8>,
    ) -> Result<()>;

    fn bag_read(&self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<Vec<Vec<u8>>>;

    fn bag_clear(&mut self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<()>;

    /// Remove every cell in the namespace.
    fn clear_namespace(&mut self, key: &StreamKey, ns: &StateNamespace) -> Result<()>;

    /// Whether any cell exists in the namespace.
    fn namespace_in_use(&self, key: &StreamKey, ns: &StateNamespace) -> Result<bool>;

    /// Hint that the listed tags are about to be read.
    fn prefetch(&self, _key: &StreamKey, _ns: &StateNamespace, _tags: &[&str]) {}

    /// Flush pending writes for the key.
    fn persist(&mut self, key: &StreamKey) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
struct NamespaceCells {
    values: HashMap<String, Vec<u8>>,
    bags: HashMap<String, Vec<Vec<u8>>>,
}

impl NamespaceCells {
    fn is_empty(&self) -> bool {
        self.values.is_empty() && self.bags.iter().all(|(_, b)| b.is_empty())
    }
}

/// Heap-backed state store for tests and single-process runs. Writes apply
/// eagerly, so `persist` only marks the checkpoint.
#[derive(Debug, Default)]
pub struct InMemoryStateBackend {
    keys: HashMap<StreamKey, HashMap<String, NamespaceCells>>,
    prefetches: AtomicU64,
    persists: AtomicU64,
}

impl InMemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespaces holding at least one cell for the key, in storage-key form.
    pub fn namespaces_in_use(&self, key: &StreamKey) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .keys
            .get(key)
            .map(|spaces| {
                spaces
                    .iter()
                    .filter(|(_, cells)| !cells.is_empty())
                    .map(|(ns, _)| ns.clone())
                    .collect()
            })
            .unwrap_or_default();
        namespaces.sort();
        namespaces
    }

    pub fn prefetch_count(&self) -> u64 {
        self.prefetches.load(Ordering::Relaxed)
    }

    pub fn persist_count(&self) -> u64 {
        self.persists.load(Ordering::Relaxed)
    }

    fn cells(&self, key: &StreamKey, ns: &StateNamespace) -> Option<&NamespaceCells> {
        self.keys.get(key).and_then(|spaces| spaces.get(&ns.key()))
    }

    fn cells_mut(&mut self, key: &StreamKey, ns: &StateNamespace) -> &mut NamespaceCells {
        self.keys
            .entry(key.clone())
            .or_default()
            .entry(ns.key())
            .or_default()
    }
}

impl StateBackend for InMemoryStateBackend {
    fn read(&self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.cells(key, ns).and_then(|c| c.values.get(tag).cloned()))
    }

    fn write(
        &mut self,
        key: &StreamKey,
        ns: &StateNamespace,
        tag: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.cells_mut(key, ns).values.insert(tag.to_string(), bytes);
        Ok(())
    }

    fn clear_value(&mut self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<()> {
        if let Some(spaces) = self.keys.get_mut(key) {
            if let Some(cells) = spaces.get_mut(&ns.key()) {
                cells.values.remove(tag);
            }
        }
        Ok(())
    }

    fn bag_append(
        &mut self,
        key: &StreamKey,
        ns: &StateNamespace,
        tag: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.cells_mut(key, ns)
            .bags
            .entry(tag.to_string())
            .or_default()
            .push(bytes);
        Ok(())
    }

    fn bag_read(&self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .cells(key, ns)
            .and_then(|c| c.bags.get(tag).cloned())
            .unwrap_or_default())
    }

    fn bag_clear(&mut self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<()> {
        if let Some(spaces) = self.keys.get_mut(key) {
            if let Some(cells) = spaces.get_mut(&ns.key()) {
                cells.bags.remove(tag);
            }
        }
        Ok(())
    }

    fn clear_namespace(&mut self, key: &StreamKey, ns: &StateNamespace) -> Result<()> {
        if let Some(spaces) = self.keys.get_mut(key) {
            spaces.remove(&ns.key());
        }
        Ok(())
    }

    fn namespace_in_use(&self, key: &StreamKey, ns: &StateNamespace) -> Result<bool> {
        Ok(self.cells(key, ns).map(|c| !c.is_empty()).unwrap_or(false))
    }

    fn prefetch(&self, _key: &StreamKey, _ns: &StateNamespace, tags: &[&str]) {
        self.prefetches.fetch_add(tags.len() as u64, Ordering::Relaxed);
    }

    fn persist(&mut self, key: &StreamKey) -> Result<()> {
        if let Some(spaces) = self.keys.get_mut(key) {
            spaces.retain(|_, cells| !cells.is_empty());
        }
        self.persists.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;

    fn window_ns() -> StateNamespace {
        StateNamespace::Window(BoundedWindow::new(
            Timestamp::from_millis(0),
            Timestamp::from_millis(10),
        ))
    }

    #[test]
    fn test_value_roundtrip() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let ns = window_ns();

        assert_eq!(backend.read(&key, &ns, "x").unwrap(), None);
        backend.write(&key, &ns, "x", vec![1, 2, 3]).unwrap();
        assert_eq!(backend.read(&key, &ns, "x").unwrap(), Some(vec![1, 2, 3]));

        backend.clear_value(&key, &ns, "x").unwrap();
        assert_eq!(backend.read(&key, &ns, "x").unwrap(), None);
    }

    #[test]
    fn test_bag_roundtrip() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let ns = window_ns();

        backend.bag_append(&key, &ns, "b", vec![1]).unwrap();
        backend.bag_append(&key, &ns, "b", vec![2]).unwrap();
        assert_eq!(backend.bag_read(&key, &ns, "b").unwrap(), vec![vec![1], vec![2]]);

        backend.bag_clear(&key, &ns, "b").unwrap();
        assert!(backend.bag_read(&key, &ns, "b").unwrap().is_empty());
    }

    #[test]
    fn test_namespace_lifecycle() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let ns = window_ns();

        assert!(!backend.namespace_in_use(&key, &ns).unwrap());
        backend.write(&key, &ns, "x", vec![0]).unwrap();
        assert!(backend.namespace_in_use(&key, &ns).unwrap());
        assert_eq!(backend.namespaces_in_use(&key), vec![ns.key()]);

        backend.clear_namespace(&key, &ns).unwrap();
        assert!(!backend.namespace_in_use(&key, &ns).unwrap());
        assert!(backend.namespaces_in_use(&key).is_empty());
    }

    #[test]
    fn test_namespace_keys_are_distinct() {
        let w = BoundedWindow::new(Timestamp::from_millis(0), Timestamp::from_millis(10));
        let a = StateNamespace::Window(w);
        let b = StateNamespace::WindowAndTrigger(w, 0);
        let c = StateNamespace::WindowAndTrigger(w, 1);
        assert_ne!(a.key(), b.key());
        assert_ne!(b.key(), c.key());
        assert_eq!(StateNamespace::Global.key(), "g");
    }

    #[test]
    fn test_prefetch_is_counted() {
        let backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        backend.prefetch(&key, &window_ns(), &["a", "b"]);
        assert_eq!(backend.prefetch_count(), 2);
    }
}
