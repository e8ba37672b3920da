use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::LockManager;
use super::mode::{LockMode, LockStatus};

#[derive(Debug)]
struct BlockState {
    status: LockStatus,
    count: u32,
    granted_at: Option<Instant>,
}

/// One request for (and, once granted, one grant of) a key lock.
///
/// While outstanding the block is owned by its lock manager's resource
/// table. Transactions keep an `Arc` to it only to release it later.
#[derive(Debug)]
pub struct LockControlBlock {
    lock_manager: Weak<LockManager>,
    lock_manager_id: u64,
    owner: i64,
    resource_hash: u64,
    mode: LockMode,
    timeout: Duration,
    upgraded: bool,
    state: Mutex<BlockState>,
    closed: AtomicBool,
}

impl LockControlBlock {
    pub(crate) fn new(
        lock_manager: &Arc<LockManager>,
        owner: i64,
        resource_hash: u64,
        mode: LockMode,
        timeout: Duration,
        status: LockStatus,
        upgraded: bool,
    ) -> Arc<Self> {
        let granted = status == LockStatus::Granted;
        Arc::new(Self {
            lock_manager: Arc::downgrade(lock_manager),
            lock_manager_id: lock_manager.id(),
            owner,
            resource_hash,
            mode,
            timeout,
            upgraded,
            state: Mutex::new(BlockState {
                status,
                count: u32::from(granted),
                granted_at: granted.then(Instant::now),
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// The lock manager that issued this block, if it is still alive.
    pub fn lock_manager(&self) -> Option<Arc<LockManager>> {
        self.lock_manager.upgrade()
    }

    pub fn lock_manager_id(&self) -> u64 {
        self.lock_manager_id
    }

    pub fn owner(&self) -> i64 {
        self.owner
    }

    pub fn resource_hash(&self) -> u64 {
        self.resource_hash
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn status(&self) -> LockStatus {
        self.state.lock().status
    }

    /// Re-entrant grant count. Zero once fully released or never granted.
    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    /// When the grant was issued; `None` for a block never granted.
    pub fn granted_at(&self) -> Option<Instant> {
        self.state.lock().granted_at
    }

    pub(crate) fn is_upgrade(&self) -> bool {
        self.upgraded
    }

    pub(crate) fn grant(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.status, LockStatus::Pending);
        state.status = LockStatus::Granted;
        state.count = 1;
        state.granted_at = Some(Instant::now());
    }

    pub(crate) fn fail(&self, status: LockStatus) {
        let mut state = self.state.lock();
        state.status = status;
        state.count = 0;
    }

    pub(crate) fn increment(&self) -> u32 {
        let mut state = self.state.lock();
        state.count += 1;
        state.count
    }

    pub(crate) fn decrement(&self) -> u32 {
        let mut state = self.state.lock();
        assert!(state.count > 0, "release of block with zero count");
        state.count -= 1;
        state.count
    }

    /// Retires the block. A closed block must not be reused for grants.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
