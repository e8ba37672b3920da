//! Seams towards the replication layer.
//!
//! The lock core never talks to the replicator directly. A replicated
//! transaction is consumed through [`ReplicatedTransaction`], and it calls back
//! into the store through the [`LockContext`] each store transaction registers
//! on it.

use std::sync::Arc;

/// Something a replicated transaction notifies when it completes.
///
/// Implementations must tolerate `unlock` being called more than once and
/// from several threads at the same time.
pub trait LockContext: Send + Sync {
    /// Releases every lock held on behalf of the completed transaction.
    fn unlock(&self);
}

/// The replicated transaction a store transaction runs inside.
pub trait ReplicatedTransaction: Send + Sync {
    /// Identity of the logical transaction. Store transactions created for
    /// this replicated transaction share the id.
    fn transaction_id(&self) -> i64;

    /// Registers a lock context to be unlocked when the transaction commits or
    /// aborts. The replicated transaction keeps the context alive until then.
    fn add_lock_context(&self, context: Arc<dyn LockContext>);
}
