use serde::{Deserialize, Serialize};

/// Mode in which a prime or key lock is requested or held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// No lock. Invalid for acquisition.
    Free,
    Shared,
    Exclusive,
    /// Intention to write. Compatible with prior shared holders, but
    /// exclusive against other updaters and writers, so it can be escalated
    /// to `Exclusive` without two upgraders deadlocking each other.
    Update,
}

impl LockMode {
    /// Whether a request in `self` can be granted while the resource is held
    /// in `granted`.
    ///
    /// | granted \ requested | Shared | Exclusive | Update |
    /// |---|---|---|---|
    /// | Free | ok | ok | ok |
    /// | Shared | ok | conflict | ok |
    /// | Exclusive | conflict | conflict | conflict |
    /// | Update | conflict | conflict | conflict |
    pub fn is_compatible_with(self, granted: LockMode) -> bool {
        match (granted, self) {
            (LockMode::Free, _) | (_, LockMode::Free) => true,
            (LockMode::Shared, LockMode::Shared) | (LockMode::Shared, LockMode::Update) => true,
            _ => false,
        }
    }

    /// The stronger of the two modes, used to recompute a resource's granted
    /// mode.
    pub fn max(self, other: LockMode) -> LockMode {
        if self.strength() >= other.strength() {
            self
        } else {
            other
        }
    }

    /// Modes a read-only transaction is allowed to request.
    pub fn is_shared_compatible(self) -> bool {
        self == LockMode::Shared
    }

    fn strength(self) -> u8 {
        match self {
            LockMode::Free => 0,
            LockMode::Shared => 1,
            LockMode::Update => 2,
            LockMode::Exclusive => 3,
        }
    }
}

/// Terminal (or pending) state of a key-lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    /// Request is queued behind incompatible holders.
    Pending,
    /// The lock manager (or the requester) was closed. The acquiring
    /// transaction must abort; this is not retryable.
    Invalid,
    Timeout,
    Granted,
}

/// Outcome of `LockManager::release_lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStatus {
    Success,
    /// The block was not in the resource's granted list.
    NotGranted,
    /// No entry exists for the block's resource.
    UnknownResource,
}
