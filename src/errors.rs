use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxnLockError {
    /// The transaction was closed before or while the lock was being acquired.
    #[error("Transaction {txn_id} aborted: it was closed during lock acquisition")]
    Aborted { txn_id: i64 },

    /// The lock could not be granted within the wait budget.
    #[error("Lock wait timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Lock manager is closed")]
    LockManagerClosed,

    #[error("Lock release failed: {0}")]
    ReleaseFailed(String),
}

impl TxnLockError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, TxnLockError::Aborted { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TxnLockError::TimedOut { .. })
    }
}

pub type Result<T> = std::result::Result<T, TxnLockError>;
