use ahash::{AHashMap as HashMap, RandomState};
use std::cmp::Ordering;
use std::hash::Hash;
use std::sync::Arc;

/// Total order over store keys, injected by the store.
pub trait KeyComparer<K>: Send + Sync {
    fn compare(&self, left: &K, right: &K) -> Ordering;
}

/// Comparer that uses the key's own `Ord` implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrder;

impl<K: Ord> KeyComparer<K> for NaturalOrder {
    fn compare(&self, left: &K, right: &K) -> Ordering {
        left.cmp(right)
    }
}

/// Bucket function for the write-set. Independent of the hash callers use
/// for lock resource identity.
pub trait KeyHasher<K>: Send + Sync {
    fn hash(&self, key: &K) -> u64;
}

impl<K, F> KeyHasher<K> for F
where
    F: Fn(&K) -> u64 + Send + Sync,
{
    fn hash(&self, key: &K) -> u64 {
        self(key)
    }
}

/// `ahash`-backed hasher for keys implementing `Hash`.
#[derive(Debug, Clone, Default)]
pub struct DefaultKeyHasher {
    state: RandomState,
}

impl<K: Hash> KeyHasher<K> for DefaultKeyHasher {
    fn hash(&self, key: &K) -> u64 {
        self.state.hash_one(key)
    }
}

/// Per-transaction staging area for not-yet-committed writes.
///
/// Entries are bucketed by the injected hasher; keys within a bucket are
/// matched with the injected comparer, so keys only need a total order, not
/// `Eq`/`Hash` of their own.
pub struct WriteSet<K, V> {
    hasher: Arc<dyn KeyHasher<K>>,
    comparer: Arc<dyn KeyComparer<K>>,
    buckets: HashMap<u64, Vec<(K, V)>>,
    len: usize,
}

impl<K, V> WriteSet<K, V> {
    pub fn new(hasher: Arc<dyn KeyHasher<K>>, comparer: Arc<dyn KeyComparer<K>>) -> Self {
        Self {
            hasher,
            comparer,
            buckets: HashMap::new(),
            len: 0,
        }
    }

    /// Stages `value` for `key`, returning the value it replaces.
    pub fn add(&mut self, key: K, value: V) -> Option<V> {
        let bucket = self.buckets.entry(self.hasher.hash(&key)).or_default();
        let comparer = &self.comparer;
        match bucket
            .iter_mut()
            .find(|(staged, _)| comparer.compare(staged, &key) == Ordering::Equal)
        {
            Some((_, staged)) => Some(std::mem::replace(staged, value)),
            None => {
                bucket.push((key, value));
                self.len += 1;
                None
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.buckets
            .get(&self.hasher.hash(key))?
            .iter()
            .find(|(staged, _)| self.comparer.compare(staged, key) == Ordering::Equal)
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let hash = self.hasher.hash(key);
        let bucket = self.buckets.get_mut(&hash)?;
        let index = bucket
            .iter()
            .position(|(staged, _)| self.comparer.compare(staged, key) == Ordering::Equal)?;
        let (_, value) = bucket.swap_remove(index);
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Staged entries in comparer order, the order they are applied at commit.
    pub fn sorted_entries(&self) -> Vec<(&K, &V)> {
        let mut entries: Vec<(&K, &V)> = self
            .buckets
            .values()
            .flat_map(|bucket| bucket.iter().map(|(key, value)| (key, value)))
            .collect();
        entries.sort_by(|(left, _), (right, _)| self.comparer.compare(left, right));
        entries
    }
}
