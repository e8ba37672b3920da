use serde::{Deserialize, Serialize};

/// Read isolation level of a store transaction.
///
/// The lock core never interprets this value itself. It is mutable
/// configuration read by the store's read path to decide whether a read has
/// to take a key lock at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadIsolationLevel {
    /// **Snapshot:**
    ///
    /// Reads are served from a consistent snapshot taken when the transaction
    /// first reads. No key locks are taken by readers, so a snapshot reader
    /// never blocks and is never blocked by writers.
    #[default]
    Snapshot,
    /// **Read Committed:**
    ///
    /// Every read observes the latest committed value at the time of the read.
    /// Two reads of the same key may return different values.
    ReadCommitted,
    /// **Read Repeatable:**
    ///
    /// Reads take a shared (or update, see [`LockingHints::UpdateLock`]) key
    /// lock which is held until the transaction closes, so repeated reads of
    /// the same key within the transaction see the same value. Transactions
    /// created on a primary replica are upgraded to this level.
    ReadRepeatable,
}

impl ReadIsolationLevel {
    /// Whether reads under this level acquire key locks.
    pub fn takes_read_locks(self) -> bool {
        matches!(self, ReadIsolationLevel::ReadRepeatable)
    }
}

/// Locking hints attached to a store transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockingHints {
    #[default]
    None,
    /// Readers take `Update` instead of `Shared` key locks, so a later write
    /// to the same key can be escalated to `Exclusive` without deadlocking
    /// against another reader that intends to write.
    UpdateLock,
}
