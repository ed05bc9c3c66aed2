//! Ordered registry of live connections.
//!
//! Entries live in a slab so the key doubles as the mio token. A separate
//! key list keeps insertion order, which is the order frames are fanned out.

use slab::Slab;

/// Lifecycle phase of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    /// Outbound connect issued, not yet confirmed.
    Connecting,
    /// Connected and exchanging data.
    Active,
}

/// Registry of live connections using slab allocation.
///
/// Presence in the registry is what makes a connection valid: `remove` hands
/// the entry back exactly once and returns `None` on every later call.
pub struct Registry<T> {
    entries: Slab<T>,
    order: Vec<usize>,
    max_entries: usize,
}

impl<T> Registry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Slab::with_capacity(max_entries.min(1024)),
            order: Vec::new(),
            max_entries,
        }
    }

    /// Key the next `insert` will return.
    ///
    /// Used to register a socket with the reactor before the entry exists.
    pub fn next_key(&self) -> usize {
        self.entries.vacant_key()
    }

    /// Append an entry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, entry: T) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let key = self.entries.insert(entry);
        self.order.push(key);
        Some(key)
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        self.entries.get_mut(key)
    }

    /// Remove an entry. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: usize) -> Option<T> {
        let entry = self.entries.try_remove(key)?;
        if let Some(pos) = self.order.iter().position(|&k| k == key) {
            self.order.remove(pos);
        }
        Some(entry)
    }

    /// Keys of all current entries in insertion order.
    ///
    /// The returned list is detached from the registry, so callers may remove
    /// entries while walking it.
    pub fn snapshot(&self) -> Vec<usize> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_entries
    }
}
