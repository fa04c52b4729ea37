// Keyed State Cache
//
// Process-wide cache of per-key state with a weighted LRU eviction policy
// and exclusive per-key leases. A worker leases a key's entry for the
// duration of its ownership, so no two tasks serve the same key's state
// concurrently; entries are only evictable while unleased.

use super::{StateBackend, StateNamespace};
use crate::error::{Result, StreamError};
use crate::value::StreamKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Default maximum cache weight in bytes (64 MB).
pub const DEFAULT_MAX_WEIGHT_BYTES: usize = 64 * 1024 * 1024;

/// Configuration for the keyed state cache.
#[derive(Debug, Clone)]
pub struct StateCacheConfig {
    /// Maximum total weight in bytes: key sizes plus cached cell payloads.
    pub max_weight_bytes: usize,
}

impl Default for StateCacheConfig {
    fn default() -> Self {
        Self { max_weight_bytes: DEFAULT_MAX_WEIGHT_BYTES }
    }
}

impl StateCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_weight_bytes == 0 {
            return Err(StreamError::Configuration(
                "max_weight_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum CachedCell {
    /// A value cell; `None` records a known-absent value.
    Value(Option<Vec<u8>>),

    /// A fully materialised bag.
    Bag(Vec<Vec<u8>>),
}

impl CachedCell {
    fn weight(&self) -> usize {
        match self {
            CachedCell::Value(None) => 1,
            CachedCell::Value(Some(bytes)) => bytes.len(),
            CachedCell::Bag(items) => items.iter().map(|b| b.len()).sum::<usize>() + 8,
        }
    }
}

#[derive(Debug, Default)]
struct CacheEntry {
    cells: HashMap<(String, String), CachedCell>,
    weight: usize,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<StreamKey, CacheEntry>,
    total_weight: usize,
    tick: u64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_weight: usize,
    pub entries: usize,
}

/// Weighted-LRU cache of per-key state shared across worker threads.
#[derive(Debug)]
pub struct StateCache {
    config: StateCacheConfig,
    inner: Mutex<CacheInner>,
    leases: DashMap<StreamKey, ()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl StateCache {
    /// Validate the configuration and build the cache.
    pub fn init(config: StateCacheConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            inner: Mutex::new(CacheInner::default()),
            leases: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }))
    }

    /// Take the exclusive lease on a key. Fails if the key is already leased.
    pub fn lease(&self, key: &StreamKey) -> Result<()> {
        match self.leases.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StreamError::State(format!(
                "key {} is already leased",
                key
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(())
            }
        }
    }

    /// Return a key's lease, making its entry evictable again.
    pub fn release(&self, key: &StreamKey) {
        self.leases.remove(key);
    }

    pub fn is_leased(&self, key: &StreamKey) -> bool {
        self.leases.contains_key(key)
    }

    /// Drop every entry. Fails while any lease is outstanding.
    pub fn teardown(&self) -> Result<()> {
        if !self.leases.is_empty() {
            return Err(StreamError::InvalidOperation(format!(
                "cannot tear down state cache with {} outstanding leases",
                self.leases.len()
            )));
        }
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_weight = 0;
        Ok(())
    }

    pub fn stats(&self) -> StateCacheStats {
        let inner = self.inner.lock();
        StateCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            current_weight: inner.total_weight,
            entries: inner.entries.len(),
        }
    }

    fn get(&self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Option<CachedCell> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let cell = inner.entries.get_mut(key).and_then(|entry| {
            entry.last_used = tick;
            entry.cells.get(&(ns.key(), tag.to_string())).cloned()
        });
        match &cell {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        cell
    }

    fn put(&self, key: &StreamKey, ns: &StateNamespace, tag: &str, cell: CachedCell) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let entry = inner.entries.entry(key.clone()).or_insert_with(|| CacheEntry {
            weight: key.as_str().len(),
            ..CacheEntry::default()
        });
        entry.last_used = tick;

        let cell_key = (ns.key(), tag.to_string());
        let key_weight = cell_key.0.len() + cell_key.1.len();
        let new_weight = cell.weight() + key_weight;
        let old_weight = entry
            .cells
            .insert(cell_key, cell)
            .map(|old| old.weight() + key_weight)
            .unwrap_or(0);
        entry.weight = entry.weight + new_weight - old_weight;

        inner.total_weight = inner
            .total_weight
            .saturating_sub(old_weight)
            .saturating_add(new_weight);
        self.evict_locked(&mut inner);
    }

    /// Append to a cached bag if one is materialised; otherwise leave the
    /// bag uncached until the next read repopulates it.
    fn append_bag(&self, key: &StreamKey, ns: &StateNamespace, tag: &str, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            if let Some(CachedCell::Bag(items)) =
                entry.cells.get_mut(&(ns.key(), tag.to_string()))
            {
                items.push(bytes.to_vec());
                entry.weight += bytes.len();
            } else {
                return;
            }
        } else {
            return;
        }
        inner.total_weight = inner.total_weight.saturating_add(bytes.len());
        self.evict_locked(&mut inner);
    }

    fn clear_namespace(&self, key: &StreamKey, ns: &StateNamespace) {
        let mut inner = self.inner.lock();
        let ns_key = ns.key();
        let mut removed = 0usize;
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.cells.retain(|(cell_ns, tag), cell| {
                if *cell_ns == ns_key {
                    removed += cell.weight() + cell_ns.len() + tag.len();
                    false
                } else {
                    true
                }
            });
            entry.weight = entry.weight.saturating_sub(removed);
        }
        inner.total_weight = inner.total_weight.saturating_sub(removed);
    }

    fn evict_locked(&self, inner: &mut CacheInner) {
        while inner.total_weight > self.config.max_weight_bytes {
            let victim = inner
                .entries
                .iter()
                .filter(|(key, _)| !self.leases.contains_key(*key))
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());

            match victim {
                Some(key) => {
                    if let Some(entry) = inner.entries.remove(&key) {
                        inner.total_weight = inner.total_weight.saturating_sub(entry.weight);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, weight = entry.weight, "evicted cached key state");
                    }
                }
                // Everything left is leased; over-weight until releases.
                None => break,
            }
        }
    }
}

/// Read-through, write-through wrapper serving repeated reads from the
/// process-wide cache. The key's lease is taken on first access and returned
/// on `persist`.
#[derive(Debug)]
pub struct CachedStateBackend<B> {
    inner: B,
    cache: Arc<StateCache>,
    leased: Mutex<HashSet<StreamKey>>,
}

impl<B: StateBackend> CachedStateBackend<B> {
    pub fn new(inner: B, cache: Arc<StateCache>) -> Self {
        Self { inner, cache, leased: Mutex::new(HashSet::new()) }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Release all held leases and return the wrapped backend.
    pub fn into_inner(self) -> B {
        for key in self.leased.lock().iter() {
            self.cache.release(key);
        }
        self.inner
    }

    fn ensure_lease(&self, key: &StreamKey) -> Result<()> {
        let mut leased = self.leased.lock();
        if leased.contains(key) {
            return Ok(());
        }
        self.cache.lease(key)?;
        leased.insert(key.clone());
        Ok(())
    }
}

impl<B: StateBackend> StateBackend for CachedStateBackend<B> {
    fn read(&self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_lease(key)?;
        if let Some(CachedCell::Value(value)) = self.cache.get(key, ns, tag) {
            return Ok(value);
        }
        let value = self.inner.read(key, ns, tag)?;
        self.cache.put(key, ns, tag, CachedCell::Value(value.clone()));
        Ok(value)
    }

    fn write(
        &mut self,
        key: &StreamKey,
        ns: &StateNamespace,
        tag: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.ensure_lease(key)?;
        self.inner.write(key, ns, tag, bytes.clone())?;
        self.cache.put(key, ns, tag, CachedCell::Value(Some(bytes)));
        Ok(())
    }

    fn clear_value(&mut self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<()> {
        self.ensure_lease(key)?;
        self.inner.clear_value(key, ns, tag)?;
        self.cache.put(key, ns, tag, CachedCell::Value(None));
        Ok(())
    }

    fn bag_append(
        &mut self,
        key: &StreamKey,
        ns: &StateNamespace,
        tag: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.ensure_lease(key)?;
        self.inner.bag_append(key, ns, tag, bytes.clone())?;
        self.cache.append_bag(key, ns, tag, &bytes);
        Ok(())
    }

    fn bag_read(&self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<Vec<Vec<u8>>> {
        self.ensure_lease(key)?;
        if let Some(CachedCell::Bag(items)) = self.cache.get(key, ns, tag) {
            return Ok(items);
        }
        let items = self.inner.bag_read(key, ns, tag)?;
        self.cache.put(key, ns, tag, CachedCell::Bag(items.clone()));
        Ok(items)
    }

    fn bag_clear(&mut self, key: &StreamKey, ns: &StateNamespace, tag: &str) -> Result<()> {
        self.ensure_lease(key)?;
        self.inner.bag_clear(key, ns, tag)?;
        self.cache.put(key, ns, tag, CachedCell::Bag(Vec::new()));
        Ok(())
    }

    fn clear_namespace(&mut self, key: &StreamKey, ns: &StateNamespace) -> Result<()> {
        self.ensure_lease(key)?;
        self.inner.clear_namespace(key, ns)?;
        self.cache.clear_namespace(key, ns);
        Ok(())
    }

    fn namespace_in_use(&self, key: &StreamKey, ns: &StateNamespace) -> Result<bool> {
        self.inner.namespace_in_use(key, ns)
    }

    fn prefetch(&self, key: &StreamKey, ns: &StateNamespace, tags: &[&str]) {
        self.inner.prefetch(key, ns, tags);
    }

    fn persist(&mut self, key: &StreamKey) -> Result<()> {
        self.inner.persist(key)?;
        if self.leased.lock().remove(key) {
            self.cache.release(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStateBackend;
    use crate::time::Timestamp;
    use crate::windowing::BoundedWindow;

    fn ns() -> StateNamespace {
        StateNamespace::Window(BoundedWindow::new(
            Timestamp::from_millis(0),
            Timestamp::from_millis(10),
        ))
    }

    #[test]
    fn test_lease_is_exclusive() {
        let cache = StateCache::init(StateCacheConfig::default()).unwrap();
        let key = StreamKey::new("k");

        cache.lease(&key).unwrap();
        assert!(cache.lease(&key).is_err());
        cache.release(&key);
        cache.lease(&key).unwrap();
        cache.release(&key);
    }

    #[test]
    fn test_teardown_requires_no_leases() {
        let cache = StateCache::init(StateCacheConfig::default()).unwrap();
        let key = StreamKey::new("k");
        cache.lease(&key).unwrap();
        assert!(cache.teardown().is_err());
        cache.release(&key);
        assert!(cache.teardown().is_ok());
    }

    #[test]
    fn test_cached_reads_hit_after_miss() {
        let cache = StateCache::init(StateCacheConfig::default()).unwrap();
        let mut backend = CachedStateBackend::new(InMemoryStateBackend::new(), cache.clone());
        let key = StreamKey::new("k");

        backend.write(&key, &ns(), "x", vec![1, 2]).unwrap();
        assert_eq!(backend.read(&key, &ns(), "x").unwrap(), Some(vec![1, 2]));
        assert_eq!(backend.read(&key, &ns(), "x").unwrap(), Some(vec![1, 2]));

        let stats = cache.stats();
        assert!(stats.hits >= 2);

        backend.persist(&key).unwrap();
        assert!(!cache.is_leased(&key));
    }

    #[test]
    fn test_negative_read_is_cached() {
        let cache = StateCache::init(StateCacheConfig::default()).unwrap();
        let backend = CachedStateBackend::new(InMemoryStateBackend::new(), cache.clone());
        let key = StreamKey::new("k");

        assert_eq!(backend.read(&key, &ns(), "absent").unwrap(), None);
        assert_eq!(backend.read(&key, &ns(), "absent").unwrap(), None);
        assert!(cache.stats().hits >= 1);
    }

    #[test]
    fn test_weighted_eviction_skips_leased() {
        let cache = StateCache::init(StateCacheConfig { max_weight_bytes: 200 }).unwrap();
        let mut backend = CachedStateBackend::new(InMemoryStateBackend::new(), cache.clone());

        // The leased key stays resident while unleased keys are evicted.
        let hot = StreamKey::new("hot");
        backend.write(&hot, &ns(), "x", vec![0u8; 64]).unwrap();

        for i in 0..8 {
            let key = StreamKey::new(format!("cold-{}", i));
            backend.write(&key, &ns(), "x", vec![0u8; 64]).unwrap();
            backend.persist(&key).unwrap();
        }

        let stats = cache.stats();
        assert!(stats.evictions > 0);
        assert!(cache.is_leased(&hot));
        assert_eq!(backend.read(&hot, &ns(), "x").unwrap(), Some(vec![0u8; 64]));
    }

    #[test]
    fn test_bag_append_updates_cached_bag() {
        let cache = StateCache::init(StateCacheConfig::default()).unwrap();
        let mut backend = CachedStateBackend::new(InMemoryStateBackend::new(), cache);
        let key = StreamKey::new("k");

        backend.bag_append(&key, &ns(), "b", vec![1]).unwrap();
        assert_eq!(backend.bag_read(&key, &ns(), "b").unwrap(), vec![vec![1]]);
        backend.bag_append(&key, &ns(), "b", vec![2]).unwrap();
        assert_eq!(backend.bag_read(&key, &ns(), "b").unwrap(), vec![vec![1], vec![2]]);
    }
}
