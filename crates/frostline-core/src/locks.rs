use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Non-blocking exclusion keyed by id. Acquisition never waits: a held key
/// returns `None` immediately. The returned guard releases on drop,
/// including during unwinding.
#[derive(Debug)]
pub struct LockTable<K: Eq + Hash + Clone> {
    held: Arc<DashMap<K, ()>>,
}

impl<K: Eq + Hash + Clone> Default for LockTable<K> {
    fn default() -> Self {
        Self {
            held: Arc::new(DashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> LockTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, key: K) -> Option<LockGuard<K>> {
        match self.held.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(LockGuard {
                    held: Arc::clone(&self.held),
                    key,
                })
            }
        }
    }

    pub fn is_held(&self, key: &K) -> bool {
        self.held.contains_key(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[derive(Debug)]
pub struct LockGuard<K: Eq + Hash + Clone> {
    held: Arc<DashMap<K, ()>>,
    key: K,
}

impl<K: Eq + Hash + Clone> LockGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for LockGuard<K> {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}
