pub mod config;
pub mod errors;
pub mod isolation;
pub mod lock_manager;
pub mod registry;
pub mod replicator;
pub mod store;
pub mod transaction;

// Re-export key types and structs for easier access
pub use config::{LockManagerConfig, StoreConfig};
pub use errors::{Result, TxnLockError};
pub use isolation::{LockingHints, ReadIsolationLevel};
pub use lock_manager::control_block::LockControlBlock;
pub use lock_manager::mode::{LockMode, LockStatus, UnlockStatus};
pub use lock_manager::{INFINITE_TIMEOUT, LockManager};
pub use registry::TransactionRegistry;
pub use replicator::{LockContext, ReplicatedTransaction};
pub use store::{TransactionalStore, prelude};
pub use transaction::prime_lock_request::PrimeLockRequest;
pub use transaction::write_set::{DefaultKeyHasher, KeyComparer, KeyHasher, NaturalOrder, WriteSet};
pub use transaction::{ClearLocksHook, StoreTransaction, StoreTransactionRegistry};
