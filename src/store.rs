use log::debug;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::errors::{Result, TxnLockError};
use crate::isolation::{LockingHints, ReadIsolationLevel};
use crate::lock_manager::LockManager;
use crate::lock_manager::control_block::LockControlBlock;
use crate::lock_manager::mode::LockMode;
use crate::replicator::ReplicatedTransaction;
use crate::transaction::write_set::{KeyComparer, KeyHasher};
use crate::transaction::{StoreTransaction, StoreTransactionRegistry};

/// tlock prelude
pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::isolation::*;
    pub use crate::lock_manager::control_block::*;
    pub use crate::lock_manager::mode::*;
    pub use crate::lock_manager::{INFINITE_TIMEOUT, LockManager};
    pub use crate::registry::*;
    pub use crate::replicator::*;
    pub use crate::store::TransactionalStore;
    pub use crate::transaction::prime_lock_request::*;
    pub use crate::transaction::write_set::*;
    pub use crate::transaction::*;
}

/// Entry point of the lock core: one lock manager and one registry of
/// in-flight transactions for a store.
pub struct TransactionalStore<K, V> {
    config: StoreConfig,
    lock_manager: Arc<LockManager>,
    registry: Arc<StoreTransactionRegistry<K, V>>,
    key_comparer: Arc<dyn KeyComparer<K>>,
    key_hasher: Arc<dyn KeyHasher<K>>,
}

impl<K, V> TransactionalStore<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(
        config: StoreConfig,
        key_comparer: Arc<dyn KeyComparer<K>>,
        key_hasher: Arc<dyn KeyHasher<K>>,
    ) -> Self {
        let lock_manager = LockManager::new(config.lock_manager.clone());
        debug!(
            "Opened store {} with lock manager {}",
            config.store_id,
            lock_manager.id()
        );
        Self {
            config,
            lock_manager,
            registry: Arc::new(StoreTransactionRegistry::new()),
            key_comparer,
            key_hasher,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn registry(&self) -> &Arc<StoreTransactionRegistry<K, V>> {
        &self.registry
    }

    fn timeout_or_default(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.config.lock_manager.default_timeout)
    }

    /// Returns the store transaction running inside `replicated`, creating
    /// and registering it on first use. The flag is `true` if it already
    /// existed.
    ///
    /// A new transaction locks keys under its own id, is registered as the
    /// replicated transaction's lock context, and on a primary reads with
    /// [`ReadIsolationLevel::ReadRepeatable`].
    pub fn create_or_find_transaction(
        &self,
        replicated: &Arc<dyn ReplicatedTransaction>,
    ) -> (bool, Arc<StoreTransaction<K, V>>) {
        let id = replicated.transaction_id();
        let (found, txn) = self.registry.get_or_insert_with(id, || {
            Arc::new(StoreTransaction::new(
                id,
                id,
                self.config.read_only,
                &self.registry,
                Arc::clone(&self.key_comparer),
                Some(Arc::clone(replicated)),
            ))
        });
        if !found {
            txn.attach_to(replicated);
            if self.config.primary {
                txn.set_read_isolation_level(ReadIsolationLevel::ReadRepeatable);
            }
        }
        (found, txn)
    }

    /// Creates a transaction that is not bound to a replicated transaction.
    /// It locks keys under its own id.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered.
    pub fn create_transaction(&self, id: i64, read_only: bool) -> Arc<StoreTransaction<K, V>> {
        self.create_transaction_for_owner(id, id, read_only)
    }

    /// Like [`create_transaction`](Self::create_transaction), but key locks
    /// are taken under `owner`. Transactions sharing an owner re-enter each
    /// other's grants of the same mode.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered.
    pub fn create_transaction_for_owner(
        &self,
        id: i64,
        owner: i64,
        read_only: bool,
    ) -> Arc<StoreTransaction<K, V>> {
        StoreTransaction::create(
            id,
            owner,
            read_only,
            &self.registry,
            Arc::clone(&self.key_comparer),
        )
    }

    /// Locks `resource_hash` for reading when the transaction's isolation
    /// level calls for it.
    ///
    /// Under [`ReadIsolationLevel::ReadRepeatable`] this takes the prime lock
    /// shared, then an `Update` key lock under [`LockingHints::UpdateLock`]
    /// or a `Shared` one otherwise. Both waits share the one `timeout`
    /// budget. Other levels read without key locks and resolve to `None`.
    pub async fn lock_key_for_read(
        &self,
        txn: &StoreTransaction<K, V>,
        resource_hash: u64,
        timeout: Option<Duration>,
    ) -> Result<Option<Arc<LockControlBlock>>> {
        if !txn.read_isolation_level().takes_read_locks() {
            if txn.is_closed() {
                return Err(TxnLockError::Aborted { txn_id: txn.id() });
            }
            return Ok(None);
        }
        let mode = match txn.locking_hints() {
            LockingHints::UpdateLock => LockMode::Update,
            LockingHints::None => LockMode::Shared,
        };
        self.lock_key(txn, resource_hash, mode, timeout)
            .await
            .map(Some)
    }

    /// Takes the prime lock shared, then an exclusive key lock on
    /// `resource_hash`.
    pub async fn lock_key_for_write(
        &self,
        txn: &StoreTransaction<K, V>,
        resource_hash: u64,
        timeout: Option<Duration>,
    ) -> Result<Arc<LockControlBlock>> {
        self.lock_key(txn, resource_hash, LockMode::Exclusive, timeout)
            .await
    }

    async fn lock_key(
        &self,
        txn: &StoreTransaction<K, V>,
        resource_hash: u64,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<Arc<LockControlBlock>> {
        let timeout = self.timeout_or_default(timeout);
        let remaining = txn
            .acquire_prime_lock(&self.lock_manager, LockMode::Shared, timeout, false)
            .await?;
        txn.acquire_key_lock(&self.lock_manager, resource_hash, mode, remaining)
            .await
    }

    /// Locks `resource_hash` for writing and stages `value` for `key` in the
    /// transaction's write-set. Returns the value previously staged for the
    /// key, if any.
    pub async fn write(
        &self,
        txn: &StoreTransaction<K, V>,
        resource_hash: u64,
        key: K,
        value: V,
        timeout: Option<Duration>,
    ) -> Result<Option<V>> {
        self.lock_key_for_write(txn, resource_hash, timeout).await?;
        let write_set = txn.get_component(Arc::clone(&self.key_hasher));
        let previous = write_set.lock().add(key, value);
        Ok(previous)
    }

    /// Closes every in-flight transaction (replica close or demotion).
    /// Returns how many were closed.
    pub fn abort_all_transactions(&self) -> usize {
        let inflight = self.registry.snapshot();
        for txn in &inflight {
            txn.close();
        }
        debug!(
            "Store {} aborted {} in-flight transaction(s)",
            self.config.store_id,
            inflight.len()
        );
        inflight.len()
    }

    /// Aborts every in-flight transaction and closes the lock manager.
    pub fn close(&self) {
        self.abort_all_transactions();
        self.lock_manager.close();
        debug!("Closed store {}", self.config.store_id);
    }
}
