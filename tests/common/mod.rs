//! Common utilities for tlock integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tlock::{
    DefaultKeyHasher, LockContext, NaturalOrder, ReplicatedTransaction, StoreConfig,
    TransactionalStore,
};

// --- FakeReplicatedTransaction ---

/// Stand-in for the replicator's transaction object. Keeps its lock contexts
/// alive until `complete` unlocks them, like a commit or abort would.
pub struct FakeReplicatedTransaction {
    id: i64,
    contexts: Mutex<Vec<Arc<dyn LockContext>>>,
    registrations: AtomicUsize,
}

impl FakeReplicatedTransaction {
    pub fn new(id: i64) -> Arc<Self> {
        Arc::new(Self {
            id,
            contexts: Mutex::new(Vec::new()),
            registrations: AtomicUsize::new(0),
        })
    }

    /// Unlocks (and drops) every registered lock context.
    pub fn complete(&self) {
        let contexts = std::mem::take(&mut *self.contexts.lock());
        for context in contexts {
            context.unlock();
        }
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }
}

impl ReplicatedTransaction for FakeReplicatedTransaction {
    fn transaction_id(&self) -> i64 {
        self.id
    }

    fn add_lock_context(&self, context: Arc<dyn LockContext>) {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(context);
    }
}

// --- Helper Functions ---

pub type TestStore = TransactionalStore<String, i64>;

/// Store over `String` keys with the given primary flag.
pub fn setup_store(primary: bool) -> Arc<TestStore> {
    let config = StoreConfig {
        primary,
        ..StoreConfig::default()
    };
    Arc::new(TransactionalStore::new(
        config,
        Arc::new(NaturalOrder),
        Arc::new(DefaultKeyHasher::default()),
    ))
}

/// Lock resource hash of a key, independent of the write-set hasher.
pub fn resource_hash(key: &str) -> u64 {
    ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key)
}
