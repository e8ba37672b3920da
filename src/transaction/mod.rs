pub mod prime_lock_request;
pub mod write_set;

use log::{debug, error, warn};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::errors::{Result, TxnLockError};
use crate::isolation::{LockingHints, ReadIsolationLevel};
use crate::lock_manager::control_block::LockControlBlock;
use crate::lock_manager::mode::{LockMode, LockStatus, UnlockStatus};
use crate::lock_manager::{INFINITE_TIMEOUT, LockManager};
use crate::registry::TransactionRegistry;
use crate::replicator::{LockContext, ReplicatedTransaction};
use prime_lock_request::PrimeLockRequest;
use write_set::{KeyComparer, KeyHasher, WriteSet};

/// Registry of in-flight store transactions over keys `K` and values `V`.
pub type StoreTransactionRegistry<K, V> = TransactionRegistry<StoreTransaction<K, V>>;

/// Extension point run by [`StoreTransaction::close`] before any generic
/// lock is released. Specialized transaction kinds hook their own cleanup
/// here.
pub trait ClearLocksHook<K, V>: Send + Sync {
    fn on_clear_locks(&self, txn: &StoreTransaction<K, V>);
}

/// Remaining wait budget after `start`. An infinite budget stays infinite.
pub fn remaining_timeout(start: Instant, timeout: Duration) -> Duration {
    if timeout == INFINITE_TIMEOUT {
        return timeout;
    }
    timeout.saturating_sub(start.elapsed())
}

#[derive(Debug, Default)]
struct TxnState {
    read_isolation_level: ReadIsolationLevel,
    locking_hints: LockingHints,
    /// Acquisitions to undo at close.
    prime_lock_requests: Vec<PrimeLockRequest>,
    key_locks: Vec<Arc<LockControlBlock>>,
    is_prime_lock_acquired: bool,
    is_completed: bool,
    is_closed: bool,
}

/// Lock-acquisition context of one logical transaction against one store.
///
/// A store transaction records every prime lock and key lock it obtains and
/// gives all of them back exactly once when it closes. Closing happens on
/// commit or abort of the replicated transaction (through [`LockContext`]),
/// on forced teardown of the store, or, as a last resort, on drop.
///
/// Acquisitions are `async` and never hold the transaction's own mutex while
/// waiting on the lock manager. The mutex only guards bookkeeping.
///
/// # Lifecycle
///
/// `Open` -> prime lock acquiring -> prime lock held (key locks taken) ->
/// `Closing` -> `Closed`. Once closing has started every acquisition fails
/// with [`TxnLockError::Aborted`]; an acquisition that was already waiting
/// when the close started gives its lock straight back once granted.
pub struct StoreTransaction<K, V> {
    id: i64,
    owner: i64,
    read_only: bool,
    state: Mutex<TxnState>,
    /// Only the caller that moves this from zero runs the close body.
    clear_locks_guard: AtomicU64,
    /// Cleared at close; the replicated transaction holds this transaction as
    /// a lock context, so the two keep each other alive until then.
    replicated_txn: Mutex<Option<Arc<dyn ReplicatedTransaction>>>,
    registry: Weak<StoreTransactionRegistry<K, V>>,
    key_comparer: Arc<dyn KeyComparer<K>>,
    write_set: OnceLock<Arc<Mutex<WriteSet<K, V>>>>,
    clear_locks_hook: Mutex<Option<Arc<dyn ClearLocksHook<K, V>>>>,
}

impl<K, V> StoreTransaction<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates and registers a transaction that is not bound to a replicated
    /// transaction (recovery, checkpointing, specialized transaction kinds).
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered.
    pub fn create(
        id: i64,
        owner: i64,
        read_only: bool,
        registry: &Arc<StoreTransactionRegistry<K, V>>,
        key_comparer: Arc<dyn KeyComparer<K>>,
    ) -> Arc<Self> {
        let txn = Arc::new(Self::new(id, owner, read_only, registry, key_comparer, None));
        assert!(
            registry.try_add(id, Arc::clone(&txn)),
            "transaction {} is already registered",
            id
        );
        debug!("Created transaction {} for owner {}", id, owner);
        txn
    }

    /// Creates and registers a transaction running inside `replicated`, and
    /// registers it as the replicated transaction's lock context.
    ///
    /// # Panics
    ///
    /// Panics if the replicated transaction's id is already registered.
    pub fn create_for_replicated(
        replicated: Arc<dyn ReplicatedTransaction>,
        owner: i64,
        read_only: bool,
        registry: &Arc<StoreTransactionRegistry<K, V>>,
        key_comparer: Arc<dyn KeyComparer<K>>,
    ) -> Arc<Self> {
        let id = replicated.transaction_id();
        let txn = Arc::new(Self::new(
            id,
            owner,
            read_only,
            registry,
            key_comparer,
            Some(Arc::clone(&replicated)),
        ));
        assert!(
            registry.try_add(id, Arc::clone(&txn)),
            "transaction {} is already registered",
            id
        );
        txn.attach_to(&replicated);
        txn
    }

    pub(crate) fn attach_to(self: &Arc<Self>, replicated: &Arc<dyn ReplicatedTransaction>) {
        replicated.add_lock_context(Arc::clone(self) as Arc<dyn LockContext>);
        debug!(
            "Attached transaction {} (owner {}) to replicated transaction",
            self.id, self.owner
        );
    }
}

impl<K, V> StoreTransaction<K, V> {
    pub(crate) fn new(
        id: i64,
        owner: i64,
        read_only: bool,
        registry: &Arc<StoreTransactionRegistry<K, V>>,
        key_comparer: Arc<dyn KeyComparer<K>>,
        replicated_txn: Option<Arc<dyn ReplicatedTransaction>>,
    ) -> Self {
        Self {
            id,
            owner,
            read_only,
            state: Mutex::new(TxnState::default()),
            clear_locks_guard: AtomicU64::new(0),
            replicated_txn: Mutex::new(replicated_txn),
            registry: Arc::downgrade(registry),
            key_comparer,
            write_set: OnceLock::new(),
            clear_locks_hook: Mutex::new(None),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Owner used for every key-lock entry this transaction takes.
    pub fn owner(&self) -> i64 {
        self.owner
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn read_isolation_level(&self) -> ReadIsolationLevel {
        self.state.lock().read_isolation_level
    }

    pub fn set_read_isolation_level(&self, level: ReadIsolationLevel) {
        self.state.lock().read_isolation_level = level;
    }

    pub fn locking_hints(&self) -> LockingHints {
        self.state.lock().locking_hints
    }

    pub fn set_locking_hints(&self, hints: LockingHints) {
        self.state.lock().locking_hints = hints;
    }

    pub fn is_prime_lock_acquired(&self) -> bool {
        self.state.lock().is_prime_lock_acquired
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().is_completed
    }

    pub fn set_completed(&self) {
        self.state.lock().is_completed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed
    }

    pub fn replicated_transaction(&self) -> Option<Arc<dyn ReplicatedTransaction>> {
        self.replicated_txn.lock().clone()
    }

    /// `false` once close has dropped the back-reference to the replicated
    /// transaction.
    pub fn has_replicated_transaction(&self) -> bool {
        self.replicated_txn.lock().is_some()
    }

    pub fn prime_lock_requests_len(&self) -> usize {
        self.state.lock().prime_lock_requests.len()
    }

    /// Number of distinct key-lock blocks recorded for release.
    pub fn key_lock_count(&self) -> usize {
        self.state.lock().key_locks.len()
    }

    pub fn set_clear_locks_hook(&self, hook: Arc<dyn ClearLocksHook<K, V>>) {
        *self.clear_locks_hook.lock() = Some(hook);
    }

    fn aborted(&self) -> TxnLockError {
        TxnLockError::Aborted { txn_id: self.id }
    }

    /// Acquires the container-wide prime lock in `Shared` or `Exclusive` mode.
    ///
    /// If the prime lock is already held by this transaction and `reacquire`
    /// is `false`, returns immediately. With `reacquire` set, a fresh
    /// acquisition is made, e.g. to escalate from shared to exclusive.
    ///
    /// Returns the part of `timeout` that is left, so chained acquisitions
    /// can share one deadline.
    ///
    /// # Errors
    ///
    /// * [`TxnLockError::TimedOut`] if the lock was not granted in time.
    /// * [`TxnLockError::Aborted`] if the transaction is closed, or was closed
    ///   while waiting (the just-granted lock is released again), or the lock
    ///   manager is closed.
    ///
    /// # Panics
    ///
    /// Panics for any mode other than `Shared` or `Exclusive`.
    pub async fn acquire_prime_lock(
        &self,
        lock_manager: &Arc<LockManager>,
        mode: LockMode,
        timeout: Duration,
        reacquire: bool,
    ) -> Result<Duration> {
        assert!(
            matches!(mode, LockMode::Shared | LockMode::Exclusive),
            "transaction {} requested prime lock in {:?} mode",
            self.id,
            mode
        );
        let start = Instant::now();

        {
            let mut state = self.state.lock();
            if reacquire {
                state.is_prime_lock_acquired = false;
            }
            if state.is_closed {
                return Err(self.aborted());
            }
            if state.is_prime_lock_acquired {
                return Ok(timeout);
            }
        }

        lock_manager
            .acquire_prime_lock(mode, timeout)
            .await
            .map_err(|err| match err {
                TxnLockError::LockManagerClosed => self.aborted(),
                other => other,
            })?;

        let closed = {
            let mut state = self.state.lock();
            if !state.is_closed {
                state
                    .prime_lock_requests
                    .push(PrimeLockRequest::new(Arc::clone(lock_manager), mode));
                state.is_prime_lock_acquired = true;
            }
            state.is_closed
        };

        if closed {
            debug!(
                "Transaction {} closed while acquiring prime lock {:?}; releasing it",
                self.id, mode
            );
            if let Err(err) = lock_manager.release_prime_lock(mode) {
                warn!(
                    "Transaction {} failed to hand back prime lock {:?} on lock manager {}: {}",
                    self.id,
                    mode,
                    lock_manager.id(),
                    err
                );
            }
            return Err(self.aborted());
        }

        Ok(remaining_timeout(start, timeout))
    }

    /// Acquires a key lock on `resource_hash`.
    ///
    /// The first grant of a block is recorded so that close can release it;
    /// re-entrant grants of the same block only raise its count.
    ///
    /// # Errors
    ///
    /// * [`TxnLockError::TimedOut`] if the lock was not granted in time.
    /// * [`TxnLockError::Aborted`] if the transaction or the lock manager is
    ///   closed, or the transaction was closed while waiting (the grant is
    ///   handed back).
    ///
    /// # Panics
    ///
    /// Panics on `Free` mode, on a non-shared mode requested by a read-only
    /// transaction, and if the lock manager returns a block that does not
    /// match the request.
    pub async fn acquire_key_lock(
        &self,
        lock_manager: &Arc<LockManager>,
        resource_hash: u64,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Arc<LockControlBlock>> {
        assert!(
            mode != LockMode::Free,
            "transaction {} requested a key lock in Free mode",
            self.id
        );
        assert!(
            !self.read_only || mode.is_shared_compatible(),
            "read-only transaction {} requested a {:?} key lock",
            self.id,
            mode
        );
        if self.is_closed() {
            return Err(self.aborted());
        }

        let block = lock_manager
            .acquire_lock(self.owner, resource_hash, mode, timeout)
            .await?;

        match block.status() {
            LockStatus::Granted => {}
            LockStatus::Invalid => {
                block.close();
                debug!(
                    "Transaction {} got an invalid {:?} lock on resource {:#x}",
                    self.id, mode, resource_hash
                );
                return Err(self.aborted());
            }
            LockStatus::Timeout => {
                block.close();
                debug!(
                    "Transaction {} timed out on {:?} lock for resource {:#x}",
                    self.id, mode, resource_hash
                );
                return Err(TxnLockError::TimedOut { timeout });
            }
            LockStatus::Pending => panic!(
                "lock manager {} resolved a pending block for resource {:#x}",
                lock_manager.id(),
                resource_hash
            ),
        }

        assert!(
            block.owner() == self.owner && block.mode() == mode && block.count() > 0,
            "lock manager {} granted owner {} {:?} (count {}) for a {:?} request by owner {}",
            lock_manager.id(),
            block.owner(),
            block.mode(),
            block.count(),
            mode,
            self.owner
        );

        let closed = {
            let mut state = self.state.lock();
            if !state.is_closed && !state.key_locks.iter().any(|held| Arc::ptr_eq(held, &block)) {
                state.key_locks.push(Arc::clone(&block));
            }
            state.is_closed
        };

        if closed {
            let status = lock_manager.release_lock(&block);
            debug!(
                "Transaction {} closed while acquiring {:?} lock on resource {:#x}; released ({:?})",
                self.id, mode, resource_hash, status
            );
            return Err(self.aborted());
        }

        Ok(block)
    }

    /// Returns the transaction's write-set, building it with `hasher` on the
    /// first call. Later calls return the same write-set and ignore `hasher`.
    pub fn get_component(&self, hasher: Arc<dyn KeyHasher<K>>) -> Arc<Mutex<WriteSet<K, V>>> {
        Arc::clone(self.write_set.get_or_init(|| {
            Arc::new(Mutex::new(WriteSet::new(hasher, Arc::clone(&self.key_comparer))))
        }))
    }

    /// The write-set, if a write has happened.
    pub fn write_set(&self) -> Option<Arc<Mutex<WriteSet<K, V>>>> {
        self.write_set.get().cloned()
    }

    /// Releases every lock held by the transaction, deregisters it and drops
    /// the replicated-transaction back-reference.
    ///
    /// Safe to call any number of times from any number of threads; only the
    /// first call does the work. Individual release failures are logged and
    /// never stop the remaining releases.
    pub fn close(&self) {
        self.close_inner(false);
    }

    fn close_inner(&self, dropping: bool) {
        if self.clear_locks_guard.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        {
            let mut state = self.state.lock();
            if state.is_closed {
                return;
            }
            state.is_closed = true;
        }
        debug!("Closing transaction {}", self.id);

        let hook = self.clear_locks_hook.lock().clone();
        if let Some(hook) = hook {
            if catch_unwind(AssertUnwindSafe(|| hook.on_clear_locks(self))).is_err() {
                error!("Clear-locks hook panicked for transaction {}", self.id);
            }
        }

        // Nothing is recorded once `is_closed` is set, so the lists are final.
        let (prime_lock_requests, key_locks) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.prime_lock_requests),
                std::mem::take(&mut state.key_locks),
            )
        };

        for request in &prime_lock_requests {
            match catch_unwind(AssertUnwindSafe(|| request.release())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    "Transaction {} failed to release prime lock {:?} on lock manager {}: {}",
                    self.id,
                    request.mode(),
                    request.lock_manager().id(),
                    err
                ),
                Err(_) => warn!(
                    "Transaction {} panicked releasing prime lock {:?} on lock manager {}",
                    self.id,
                    request.mode(),
                    request.lock_manager().id()
                ),
            }
        }

        for block in &key_locks {
            match catch_unwind(AssertUnwindSafe(|| release_key_lock(block))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    "Transaction {} failed to release {:?} lock on resource {:#x} (status {:?}, lock manager {}): {}",
                    self.id,
                    block.mode(),
                    block.resource_hash(),
                    block.status(),
                    block.lock_manager_id(),
                    err
                ),
                Err(_) => warn!(
                    "Transaction {} panicked releasing {:?} lock on resource {:#x} (lock manager {})",
                    self.id,
                    block.mode(),
                    block.resource_hash(),
                    block.lock_manager_id()
                ),
            }
        }

        // The registry holds a strong reference, so a transaction being
        // dropped is no longer registered.
        if !dropping {
            if let Some(registry) = self.registry.upgrade() {
                let removed = registry.remove(self.id, self);
                assert!(
                    removed.is_some(),
                    "transaction {} was not registered when it closed",
                    self.id
                );
            }
        }

        let replicated_txn = self.replicated_txn.lock().take();
        drop(replicated_txn);

        debug!(
            "Closed transaction {}: released {} prime lock(s) and {} key lock(s)",
            self.id,
            prime_lock_requests.len(),
            key_locks.len()
        );
    }

    /// Synonym for [`close`](Self::close).
    pub fn unlock(&self) {
        self.close();
    }
}

/// Releases every unit of `block` and retires it.
fn release_key_lock(block: &Arc<LockControlBlock>) -> Result<()> {
    let Some(lock_manager) = block.lock_manager() else {
        block.close();
        return Err(TxnLockError::ReleaseFailed(format!(
            "lock manager {} no longer exists",
            block.lock_manager_id()
        )));
    };
    while block.count() > 0 {
        let status = lock_manager.release_lock(block);
        if status != UnlockStatus::Success {
            block.close();
            return Err(TxnLockError::ReleaseFailed(format!(
                "{:?} for resource {:#x}",
                status,
                block.resource_hash()
            )));
        }
    }
    block.close();
    Ok(())
}

impl<K, V> LockContext for StoreTransaction<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn unlock(&self) {
        self.close();
    }
}

impl<K, V> Drop for StoreTransaction<K, V> {
    fn drop(&mut self) {
        self.close_inner(true);
    }
}

impl<K, V> std::fmt::Debug for StoreTransaction<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StoreTransaction")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("read_only", &self.read_only)
            .field("is_prime_lock_acquired", &state.is_prime_lock_acquired)
            .field("key_locks", &state.key_locks.len())
            .field("is_closed", &state.is_closed)
            .finish()
    }
}
