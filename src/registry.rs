use ahash::RandomState;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;
use std::sync::Arc;

/// Concurrent map of in-flight transactions keyed by transaction id.
///
/// Sharded so inserts and removals of unrelated transactions never contend on
/// a single lock. Entries are inserted by the transaction factory and removed
/// only by the transaction's own close path.
pub struct TransactionRegistry<T> {
    inflight: DashMap<i64, Arc<T>, RandomState>,
}

impl<T> TransactionRegistry<T> {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Inserts `txn` under `id` unless the id is already registered.
    /// Returns `false` (and leaves the map untouched) on a duplicate.
    pub fn try_add(&self, id: i64, txn: Arc<T>) -> bool {
        match self.inflight.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(txn);
                debug!("Registered transaction {}", id);
                true
            }
        }
    }

    pub fn get(&self, id: i64) -> Option<Arc<T>> {
        self.inflight.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the registered transaction for `id`, inserting the one built
    /// by `create` if there is none. The flag is `true` when an existing
    /// transaction was found.
    pub fn get_or_insert_with(&self, id: i64, create: impl FnOnce() -> Arc<T>) -> (bool, Arc<T>) {
        match self.inflight.entry(id) {
            Entry::Occupied(occupied) => (true, Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let txn = create();
                vacant.insert(Arc::clone(&txn));
                debug!("Registered transaction {}", id);
                (false, txn)
            }
        }
    }

    /// Removes the entry for `id` only if it is `txn` itself.
    pub fn remove(&self, id: i64, txn: &T) -> Option<Arc<T>> {
        let removed = self
            .inflight
            .remove_if(&id, |_, registered| std::ptr::eq(Arc::as_ptr(registered), txn))
            .map(|(_, registered)| registered);
        if removed.is_some() {
            debug!("Deregistered transaction {}", id);
        }
        removed
    }

    pub fn contains(&self, id: i64) -> bool {
        self.inflight.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Point-in-time copy of the registered transactions. Safe to take while
    /// other threads insert and remove; the copy simply misses later changes.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.inflight
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl<T> Default for TransactionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
