//! Prime-lock and key-lock arbitration.
//!
//! A [`LockManager`] owns one container-wide prime lock and a set of sharded
//! resource tables keyed by a 64-bit resource hash. Every acquisition is an
//! `async fn`: the calling task parks on a oneshot channel while queued and
//! the lock manager completes the channel on grant, expiry or close. Table
//! mutations happen under short-held `parking_lot` mutexes; waiters are
//! always resumed after the table lock is dropped.
//!
//! The lock manager does not order acquisitions across resources. Callers
//! that lock several keys must take them in a consistent order (for example
//! sorted by hash) to stay deadlock free.

pub mod control_block;
pub mod mode;
pub(crate) mod prime_lock;
pub(crate) mod resource;

use ahash::AHashMap as HashMap;
use futures::channel::oneshot;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::config::LockManagerConfig;
use crate::errors::{Result, TxnLockError};
use control_block::LockControlBlock;
use mode::{LockMode, LockStatus, UnlockStatus};
use prime_lock::PrimeLock;
use resource::{ResourceControlBlock, Waiter};

/// Timeout value meaning "wait until granted or closed".
pub const INFINITE_TIMEOUT: Duration = Duration::MAX;

static NEXT_LOCK_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Waits on `receiver` for at most `timeout`. `None` means the timer fired
/// first; the receiver is left intact so the caller can still drain a value
/// that raced with the timer.
pub(crate) async fn wait_for<T>(
    receiver: &mut oneshot::Receiver<T>,
    timeout: Duration,
) -> Option<std::result::Result<T, oneshot::Canceled>> {
    if timeout == INFINITE_TIMEOUT {
        Some(receiver.await)
    } else {
        tokio::time::timeout(timeout, receiver).await.ok()
    }
}

/// A queued key-lock request that has not yet reached its caller.
///
/// Dropping it while armed means the acquiring future went away: a request
/// still in the queue is withdrawn, and a grant already sent is released.
struct PendingLock<'a> {
    lock_manager: &'a LockManager,
    block: Arc<LockControlBlock>,
    receiver: oneshot::Receiver<Arc<LockControlBlock>>,
    armed: bool,
}

impl PendingLock<'_> {
    fn invalidated(&self) -> Arc<LockControlBlock> {
        self.block.fail(LockStatus::Invalid);
        Arc::clone(&self.block)
    }
}

impl Drop for PendingLock<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self
            .lock_manager
            .withdraw_lock(&self.block, LockStatus::Invalid)
        {
            debug!(
                "Owner {} dropped its queued {:?} request on resource {:#x}",
                self.block.owner(),
                self.block.mode(),
                self.block.resource_hash()
            );
            return;
        }
        // Any send after `close` fails and is handed back by the sender.
        self.receiver.close();
        if let Ok(Some(block)) = self.receiver.try_recv() {
            if block.status() == LockStatus::Granted {
                warn!(
                    "Owner {} dropped a granted {:?} lock on resource {:#x}; releasing",
                    block.owner(),
                    block.mode(),
                    block.resource_hash()
                );
                self.lock_manager.release_lock(&block);
            }
        }
    }
}

enum Admission {
    Granted(Arc<LockControlBlock>),
    Rejected(Arc<LockControlBlock>),
    Queued(Arc<LockControlBlock>, oneshot::Receiver<Arc<LockControlBlock>>),
}

/// Arbiter of the prime lock and of per-resource key locks.
pub struct LockManager {
    id: u64,
    config: LockManagerConfig,
    open: AtomicBool,
    prime_lock: PrimeLock,
    tables: Vec<Mutex<HashMap<u64, ResourceControlBlock>>>,
}

impl LockManager {
    /// Creates an open lock manager.
    pub fn new(config: LockManagerConfig) -> Arc<Self> {
        let id = NEXT_LOCK_MANAGER_ID.fetch_add(1, Ordering::Relaxed);
        let tables = (0..config.effective_shard_count())
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        debug!(
            "Opened lock manager {} with {} lock tables",
            id,
            config.effective_shard_count()
        );
        Arc::new(Self {
            id,
            config,
            open: AtomicBool::new(true),
            prime_lock: PrimeLock::new(),
            tables,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn table(&self, resource_hash: u64) -> &Mutex<HashMap<u64, ResourceControlBlock>> {
        &self.tables[(resource_hash % self.tables.len() as u64) as usize]
    }

    /// Acquires the prime lock in `Shared` or `Exclusive` mode.
    ///
    /// Resolves once the lock is held, or fails with `TimedOut` when
    /// `timeout` elapses first, or with `LockManagerClosed` if the manager
    /// is (or gets) closed. Any other mode is a caller bug and panics.
    pub async fn acquire_prime_lock(&self, mode: LockMode, timeout: Duration) -> Result<()> {
        assert!(
            matches!(mode, LockMode::Shared | LockMode::Exclusive),
            "invalid prime lock mode {:?}",
            mode
        );
        self.prime_lock.acquire(mode, timeout).await?;
        debug!("Lock manager {} granted prime lock {:?}", self.id, mode);
        Ok(())
    }

    /// Releases one unit of prime-lock ownership in `mode`. Must be called
    /// exactly once per successful `acquire_prime_lock`.
    pub fn release_prime_lock(&self, mode: LockMode) -> Result<()> {
        assert!(
            matches!(mode, LockMode::Shared | LockMode::Exclusive),
            "invalid prime lock mode {:?}",
            mode
        );
        self.prime_lock.release(mode)?;
        debug!("Lock manager {} released prime lock {:?}", self.id, mode);
        Ok(())
    }

    /// `(shared holders, exclusive held, queued waiters)` of the prime lock.
    pub fn prime_lock_state(&self) -> (usize, bool, usize) {
        self.prime_lock.snapshot()
    }

    /// Acquires a key lock on `resource_hash` for `owner`.
    ///
    /// The returned block's status must be inspected: `Granted`, `Timeout`
    /// or `Invalid` (manager closed). A request by an owner that already
    /// holds the same mode on the resource bumps the existing block's count
    /// and returns that block. A zero `timeout` never queues.
    pub async fn acquire_lock(
        self: &Arc<Self>,
        owner: i64,
        resource_hash: u64,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Arc<LockControlBlock>> {
        if mode == LockMode::Free {
            return Err(TxnLockError::InvalidArgument(
                "cannot acquire a key lock in Free mode".to_string(),
            ));
        }

        let (block, receiver) = {
            let mut table = self.table(resource_hash).lock();
            if !self.is_open() {
                return Ok(LockControlBlock::new(
                    self,
                    owner,
                    resource_hash,
                    mode,
                    timeout,
                    LockStatus::Invalid,
                    false,
                ));
            }

            let resource = table.entry(resource_hash).or_default();
            match self.admit(resource, owner, resource_hash, mode, timeout) {
                Admission::Granted(block) => return Ok(block),
                Admission::Rejected(block) => {
                    if !resource.has_clients() {
                        table.remove(&resource_hash);
                    }
                    return Ok(block);
                }
                Admission::Queued(block, receiver) => (block, receiver),
            }
        };

        debug!(
            "Owner {} queued for {:?} lock on resource {:#x}",
            owner, mode, resource_hash
        );

        let mut pending = PendingLock {
            lock_manager: self,
            block,
            receiver,
            armed: true,
        };
        let block = match wait_for(&mut pending.receiver, timeout).await {
            Some(Ok(block)) => block,
            Some(Err(_)) => pending.invalidated(),
            None => {
                if self.withdraw_lock(&pending.block, LockStatus::Timeout) {
                    debug!(
                        "Owner {} timed out waiting for {:?} lock on resource {:#x} after {:?}",
                        owner, mode, resource_hash, timeout
                    );
                    Arc::clone(&pending.block)
                } else {
                    // Granted or invalidated while the timer fired.
                    match (&mut pending.receiver).await {
                        Ok(block) => block,
                        Err(_) => pending.invalidated(),
                    }
                }
            }
        };
        pending.armed = false;
        Ok(block)
    }

    fn admit(
        self: &Arc<Self>,
        resource: &mut ResourceControlBlock,
        owner: i64,
        resource_hash: u64,
        mode: LockMode,
        timeout: Duration,
    ) -> Admission {
        if let Some(existing) = resource.locate(owner, mode) {
            let count = existing.increment();
            debug!(
                "Owner {} re-entered {:?} lock on resource {:#x} (count {})",
                owner, mode, resource_hash, count
            );
            return Admission::Granted(Arc::clone(existing));
        }

        let is_upgrade = resource.owner_is_granted(owner);
        let grantable = if is_upgrade {
            // The owner already holds the resource. Fairness towards queued
            // waiters is waived since they are blocked on this owner anyway.
            resource.can_grant(owner, mode)
        } else {
            resource.waiting.is_empty() && mode.is_compatible_with(resource.granted_mode())
        };

        if grantable {
            let block = LockControlBlock::new(
                self,
                owner,
                resource_hash,
                mode,
                timeout,
                LockStatus::Granted,
                false,
            );
            resource.add_granted(Arc::clone(&block));
            debug!(
                "Owner {} granted {:?} lock on resource {:#x}",
                owner, mode, resource_hash
            );
            return Admission::Granted(block);
        }

        if timeout.is_zero() {
            return Admission::Rejected(LockControlBlock::new(
                self,
                owner,
                resource_hash,
                mode,
                timeout,
                LockStatus::Timeout,
                false,
            ));
        }

        let block = LockControlBlock::new(
            self,
            owner,
            resource_hash,
            mode,
            timeout,
            LockStatus::Pending,
            is_upgrade,
        );
        let (sender, receiver) = oneshot::channel();
        resource.enqueue(Waiter {
            block: Arc::clone(&block),
            sender,
        });
        Admission::Queued(block, receiver)
    }

    /// Drops one unit of `block`'s grant. When its count reaches zero the
    /// block leaves the granted list, is closed, and waiters that have become
    /// compatible are granted.
    pub fn release_lock(&self, block: &Arc<LockControlBlock>) -> UnlockStatus {
        let resource_hash = block.resource_hash();
        let woken = {
            let mut table = self.table(resource_hash).lock();
            let Some(resource) = table.get_mut(&resource_hash) else {
                return UnlockStatus::UnknownResource;
            };
            if !resource.contains_granted(block) {
                return UnlockStatus::NotGranted;
            }
            if block.decrement() > 0 {
                return UnlockStatus::Success;
            }

            resource.remove_granted(block);
            block.close();
            let woken = resource.recompute_grantees();
            if !resource.has_clients() {
                table.remove(&resource_hash);
            }
            woken
        };

        debug!(
            "Owner {} released {:?} lock on resource {:#x} after {:?}; {} waiter(s) granted",
            block.owner(),
            block.mode(),
            resource_hash,
            block.granted_at().map(|at| at.elapsed()).unwrap_or_default(),
            woken.len()
        );
        self.complete(woken);
        UnlockStatus::Success
    }

    /// Takes a still-queued request out of its resource queue and resolves
    /// its block with `status`. Returns `false` if the waiter had already
    /// left the queue (granted or invalidated concurrently).
    fn withdraw_lock(&self, block: &Arc<LockControlBlock>, status: LockStatus) -> bool {
        let resource_hash = block.resource_hash();
        let woken = {
            let mut table = self.table(resource_hash).lock();
            let Some(resource) = table.get_mut(&resource_hash) else {
                return false;
            };
            if resource.remove_waiter(block).is_none() {
                return false;
            }
            block.fail(status);
            // The withdrawn waiter may have been blocking compatible waiters
            // queued behind it.
            let woken = resource.recompute_grantees();
            if !resource.has_clients() {
                table.remove(&resource_hash);
            }
            woken
        };
        self.complete(woken);
        true
    }

    fn complete(&self, woken: Vec<Waiter>) {
        for waiter in woken {
            let block = Arc::clone(&waiter.block);
            if waiter.sender.send(Arc::clone(&block)).is_err() {
                // The acquirer is gone; nobody will ever release this grant.
                warn!(
                    "Owner {} abandoned {:?} lock on resource {:#x}; releasing",
                    block.owner(),
                    block.mode(),
                    block.resource_hash()
                );
                self.release_lock(&block);
            }
        }
    }

    /// Closes the lock manager.
    ///
    /// New key-lock requests resolve `Invalid` and new prime-lock requests
    /// fail with `LockManagerClosed`. Every queued waiter is failed the same
    /// way. Locks that are already granted remain releasable.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        self.prime_lock.close();

        let mut failed = 0usize;
        for table in &self.tables {
            let waiters: Vec<Waiter> = {
                let mut table = table.lock();
                let mut waiters = Vec::new();
                table.retain(|_, resource| {
                    for waiter in resource.waiting.drain(..) {
                        waiter.block.fail(LockStatus::Invalid);
                        waiters.push(waiter);
                    }
                    resource.granted_mode = resource
                        .granted
                        .iter()
                        .map(|block| block.mode())
                        .reduce(LockMode::max);
                    resource.has_clients()
                });
                waiters
            };
            failed += waiters.len();
            for waiter in waiters {
                waiter.complete();
            }
        }

        debug!(
            "Closed lock manager {}; failed {} pending waiter(s)",
            self.id, failed
        );
    }

    /// Number of resource entries currently held in the lock tables.
    pub fn resource_count(&self) -> usize {
        self.tables.iter().map(|table| table.lock().len()).sum()
    }

    pub fn contains_resource(&self, resource_hash: u64) -> bool {
        self.table(resource_hash).lock().contains_key(&resource_hash)
    }

    /// Number of granted blocks on a resource.
    pub fn granted_count(&self, resource_hash: u64) -> usize {
        self.table(resource_hash)
            .lock()
            .get(&resource_hash)
            .map_or(0, |resource| resource.granted.len())
    }

    /// Number of queued waiters on a resource.
    pub fn waiter_count(&self, resource_hash: u64) -> usize {
        self.table(resource_hash)
            .lock()
            .get(&resource_hash)
            .map_or(0, |resource| resource.waiting.len())
    }

    /// The strongest mode currently granted on a resource.
    pub fn granted_mode(&self, resource_hash: u64) -> LockMode {
        self.table(resource_hash)
            .lock()
            .get(&resource_hash)
            .map_or(LockMode::Free, |resource| resource.granted_mode())
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("tables", &self.tables.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<LockManager> {
        LockManager::new(LockManagerConfig::default())
    }

    #[tokio::test]
    async fn shared_requests_are_granted_together() {
        let lm = manager();
        let first = lm.acquire_lock(1, 42, LockMode::Shared, Duration::ZERO).await.unwrap();
        let second = lm.acquire_lock(2, 42, LockMode::Shared, Duration::ZERO).await.unwrap();
        assert_eq!(first.status(), LockStatus::Granted);
        assert_eq!(second.status(), LockStatus::Granted);
        assert_eq!(lm.granted_count(42), 2);
    }

    #[tokio::test]
    async fn same_owner_same_mode_is_reentrant() {
        let lm = manager();
        let first = lm.acquire_lock(1, 7, LockMode::Exclusive, Duration::ZERO).await.unwrap();
        let second = lm.acquire_lock(1, 7, LockMode::Exclusive, Duration::ZERO).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.count(), 2);
        assert_eq!(lm.granted_count(7), 1);

        assert_eq!(lm.release_lock(&first), UnlockStatus::Success);
        assert!(lm.contains_resource(7));
        assert_eq!(lm.release_lock(&first), UnlockStatus::Success);
        assert!(!lm.contains_resource(7));
        assert!(first.is_closed());
        assert_eq!(lm.release_lock(&first), UnlockStatus::UnknownResource);
    }

    #[tokio::test]
    async fn zero_timeout_conflict_leaves_no_registration() {
        let lm = manager();
        let holder = lm.acquire_lock(1, 9, LockMode::Exclusive, Duration::ZERO).await.unwrap();
        let rejected = lm.acquire_lock(2, 9, LockMode::Shared, Duration::ZERO).await.unwrap();
        assert_eq!(rejected.status(), LockStatus::Timeout);
        assert_eq!(rejected.count(), 0);
        assert_eq!(lm.waiter_count(9), 0);
        assert_eq!(lm.release_lock(&rejected), UnlockStatus::NotGranted);
        lm.release_lock(&holder);
        assert_eq!(lm.resource_count(), 0);
    }

    #[tokio::test]
    async fn free_mode_is_rejected() {
        let lm = manager();
        let err = lm.acquire_lock(1, 1, LockMode::Free, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, TxnLockError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn single_owner_can_escalate_to_exclusive() {
        let lm = manager();
        let shared = lm.acquire_lock(5, 3, LockMode::Shared, Duration::ZERO).await.unwrap();
        let exclusive = lm.acquire_lock(5, 3, LockMode::Exclusive, Duration::ZERO).await.unwrap();
        assert_eq!(exclusive.status(), LockStatus::Granted);
        assert!(!Arc::ptr_eq(&shared, &exclusive));
        assert_eq!(lm.granted_mode(3), LockMode::Exclusive);

        lm.release_lock(&exclusive);
        assert_eq!(lm.granted_mode(3), LockMode::Shared);
        lm.release_lock(&shared);
        assert_eq!(lm.granted_mode(3), LockMode::Free);
    }

    #[tokio::test]
    async fn upgrade_waiter_jumps_plain_waiters() {
        let lm = manager();
        let a = lm.acquire_lock(1, 11, LockMode::Shared, Duration::ZERO).await.unwrap();
        let b = lm.acquire_lock(2, 11, LockMode::Shared, Duration::ZERO).await.unwrap();

        let lm_c = Arc::clone(&lm);
        let plain = tokio::spawn(async move {
            lm_c.acquire_lock(3, 11, LockMode::Exclusive, INFINITE_TIMEOUT).await.unwrap()
        });
        while lm.waiter_count(11) < 1 {
            tokio::task::yield_now().await;
        }
        let lm_a = Arc::clone(&lm);
        let upgrade = tokio::spawn(async move {
            lm_a.acquire_lock(1, 11, LockMode::Exclusive, INFINITE_TIMEOUT).await.unwrap()
        });
        while lm.waiter_count(11) < 2 {
            tokio::task::yield_now().await;
        }

        // Owner 2 leaves; owner 1 is now the only grantee and its upgrade wins.
        lm.release_lock(&b);
        let upgraded = upgrade.await.unwrap();
        assert_eq!(upgraded.status(), LockStatus::Granted);
        assert_eq!(lm.waiter_count(11), 1);

        lm.release_lock(&upgraded);
        lm.release_lock(&a);
        let granted = plain.await.unwrap();
        assert_eq!(granted.status(), LockStatus::Granted);
        assert_eq!(granted.owner(), 3);
    }

    #[tokio::test]
    async fn close_invalidates_waiters_and_new_requests() {
        let lm = manager();
        let holder = lm.acquire_lock(1, 5, LockMode::Exclusive, Duration::ZERO).await.unwrap();
        let lm_w = Arc::clone(&lm);
        let waiter = tokio::spawn(async move {
            lm_w.acquire_lock(2, 5, LockMode::Shared, INFINITE_TIMEOUT).await.unwrap()
        });
        while lm.waiter_count(5) == 0 {
            tokio::task::yield_now().await;
        }

        lm.close();
        assert_eq!(waiter.await.unwrap().status(), LockStatus::Invalid);
        let late = lm.acquire_lock(3, 6, LockMode::Shared, Duration::ZERO).await.unwrap();
        assert_eq!(late.status(), LockStatus::Invalid);
        assert_eq!(
            lm.acquire_prime_lock(LockMode::Shared, Duration::ZERO).await,
            Err(TxnLockError::LockManagerClosed)
        );

        assert_eq!(lm.release_lock(&holder), UnlockStatus::Success);
        assert_eq!(lm.resource_count(), 0);
    }

    #[tokio::test]
    async fn prime_lock_writer_is_not_starved_by_readers() {
        let lm = manager();
        lm.acquire_prime_lock(LockMode::Shared, Duration::ZERO).await.unwrap();

        let lm_w = Arc::clone(&lm);
        let writer = tokio::spawn(async move {
            lm_w.acquire_prime_lock(LockMode::Exclusive, INFINITE_TIMEOUT).await
        });
        while lm.prime_lock_state().2 == 0 {
            tokio::task::yield_now().await;
        }

        // A reader arriving behind a queued writer must wait too.
        assert!(matches!(
            lm.acquire_prime_lock(LockMode::Shared, Duration::ZERO).await,
            Err(TxnLockError::TimedOut { .. })
        ));

        lm.release_prime_lock(LockMode::Shared).unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(lm.prime_lock_state(), (0, true, 0));
        lm.release_prime_lock(LockMode::Exclusive).unwrap();
        assert!(lm.release_prime_lock(LockMode::Exclusive).is_err());
    }

    #[tokio::test]
    async fn dropped_acquirer_hands_back_a_sent_grant() {
        let lm = manager();
        let holder = lm.acquire_lock(1, 99, LockMode::Exclusive, Duration::ZERO).await.unwrap();
        assert!(holder.granted_at().is_some());

        let lm_w = Arc::clone(&lm);
        let waiter = tokio::spawn(async move {
            lm_w.acquire_lock(2, 99, LockMode::Exclusive, INFINITE_TIMEOUT).await
        });
        while lm.waiter_count(99) == 0 {
            tokio::task::yield_now().await;
        }

        // The grant is sent to the waiter, which is cancelled before it runs.
        lm.release_lock(&holder);
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        assert_eq!(lm.granted_count(99), 0);
        assert_eq!(lm.resource_count(), 0);
        let third = lm.acquire_lock(3, 99, LockMode::Shared, Duration::ZERO).await.unwrap();
        assert_eq!(third.status(), LockStatus::Granted);
    }

    #[tokio::test]
    async fn dropped_acquirer_leaves_the_queue() {
        let lm = manager();
        let holder = lm.acquire_lock(1, 12, LockMode::Exclusive, Duration::ZERO).await.unwrap();

        let lm_w = Arc::clone(&lm);
        let waiter = tokio::spawn(async move {
            lm_w.acquire_lock(2, 12, LockMode::Exclusive, INFINITE_TIMEOUT).await
        });
        while lm.waiter_count(12) == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(lm.waiter_count(12), 0);
        assert_eq!(lm.granted_count(12), 1);

        lm.release_lock(&holder);
        assert_eq!(lm.resource_count(), 0);
    }

    #[tokio::test]
    async fn dropped_prime_acquirer_hands_back_a_sent_grant() {
        let lm = manager();
        lm.acquire_prime_lock(LockMode::Exclusive, Duration::ZERO).await.unwrap();

        let lm_w = Arc::clone(&lm);
        let reader = tokio::spawn(async move {
            lm_w.acquire_prime_lock(LockMode::Shared, INFINITE_TIMEOUT).await
        });
        while lm.prime_lock_state().2 == 0 {
            tokio::task::yield_now().await;
        }

        lm.release_prime_lock(LockMode::Exclusive).unwrap();
        reader.abort();
        assert!(reader.await.unwrap_err().is_cancelled());
        assert_eq!(lm.prime_lock_state(), (0, false, 0));
    }

    #[tokio::test]
    async fn dropped_prime_acquirer_unblocks_readers_behind_it() {
        let lm = manager();
        lm.acquire_prime_lock(LockMode::Shared, Duration::ZERO).await.unwrap();

        let lm_w = Arc::clone(&lm);
        let writer = tokio::spawn(async move {
            lm_w.acquire_prime_lock(LockMode::Exclusive, INFINITE_TIMEOUT).await
        });
        while lm.prime_lock_state().2 == 0 {
            tokio::task::yield_now().await;
        }
        writer.abort();
        assert!(writer.await.unwrap_err().is_cancelled());

        assert_eq!(lm.prime_lock_state(), (1, false, 0));
        lm.acquire_prime_lock(LockMode::Shared, Duration::ZERO).await.unwrap();
        assert_eq!(lm.prime_lock_state(), (2, false, 0));
    }
}
