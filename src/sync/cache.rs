//! Lazily loaded, process-wide cached values.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, OnceLock};

/// A value loaded at most once, on first access.
#[derive(Debug)]
pub struct LazyCache<T> {
    cell: OnceLock<T>,
}

impl<T> LazyCache<T> {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Return the cached value, running `load` if this is the first access.
    /// Concurrent first accesses run `load` exactly once.
    pub fn get_or_load(&self, load: impl FnOnce() -> T) -> &T {
        self.cell.get_or_init(load)
    }

    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }
}

impl<T> Default for LazyCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-key cache with serialized loading.
///
/// Loads for the same key never run concurrently; loads for different keys
/// do. A load returning `None` is not cached, so the next access retries.
#[derive(Debug)]
pub struct KeyedCache<K, V> {
    slots: Mutex<HashMap<K, Arc<Mutex<Option<V>>>>>,
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_load(&self, key: &K, load: impl FnOnce(&K) -> Option<V>) -> Option<V> {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let mut value = slot.lock();
        if value.is_none() {
            *value = load(key);
        }
        value.clone()
    }

    /// Forget the cached value for `key`.
    pub fn invalidate(&self, key: &K) {
        self.slots.lock().remove(key);
    }
}

impl<K, V> Default for KeyedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
