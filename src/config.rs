use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of lock hash tables a lock manager shards resources over.
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// Default lock wait budget used when a caller supplies none.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Number of independently locked hash tables holding resource entries.
    pub shard_count: usize,
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            default_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl LockManagerConfig {
    /// Shard count clamped to at least one table.
    pub fn effective_shard_count(&self) -> usize {
        self.shard_count.max(1)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Identity of the store in traces.
    pub store_id: i64,
    /// New transactions created by this store are read-only.
    pub read_only: bool,
    /// The hosting replica is primary. Transactions created on a primary are
    /// upgraded to `ReadRepeatable` isolation.
    pub primary: bool,
    pub lock_manager: LockManagerConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_id: 1,
            read_only: false,
            primary: true,
            lock_manager: LockManagerConfig::default(),
        }
    }
}

/// Serializes a `Duration` as whole milliseconds. `u64::MAX` stands for an
/// infinite wait.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if *value == Duration::MAX {
            return serializer.serialize_u64(u64::MAX);
        }
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        if millis == u64::MAX {
            Ok(Duration::MAX)
        } else {
            Ok(Duration::from_millis(millis))
        }
    }
}
