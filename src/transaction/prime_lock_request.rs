use std::sync::Arc;

use crate::errors::Result;
use crate::lock_manager::LockManager;
use crate::lock_manager::mode::LockMode;

/// Record of one successful prime-lock acquisition, kept so the transaction
/// can release it symmetrically when it closes.
#[derive(Debug, Clone)]
pub struct PrimeLockRequest {
    lock_manager: Arc<LockManager>,
    mode: LockMode,
}

impl PrimeLockRequest {
    pub fn new(lock_manager: Arc<LockManager>, mode: LockMode) -> Self {
        Self { lock_manager, mode }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn release(&self) -> Result<()> {
        self.lock_manager.release_prime_lock(self.mode)
    }
}
