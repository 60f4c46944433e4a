//! The conditional-write contract the lease protocol coordinates through,
//! plus the bundled implementations.
//!
//! Any per-key linearizable key-value store with conditional put/update/
//! delete can back the protocol. Mutual exclusion rests entirely on the
//! store refusing a write whose predicates no longer hold.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;

#[cfg(feature = "dynamodb")]
pub mod dynamo;
pub mod memory;

/// Persisted image of one lease as the store sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRecord {
    pub key: String,
    /// `None` covers both a missing owner attribute and the "NULL" sentinel.
    pub owner: Option<String>,
    pub counter: u64,
    /// Caller-defined attributes, carried opaquely.
    pub extras: HashMap<String, Value>,
}

/// New owner and counter values for a conditional write. Extra attributes
/// are only written when `extras` is `Some`; existing extras are never
/// removed by a write.
#[derive(Debug, Clone)]
pub struct WriteImage {
    pub owner: Option<String>,
    pub counter: u64,
    pub extras: Option<HashMap<String, Value>>,
}

/// ANDed equality predicates over the stored record. An empty condition
/// makes the write an unconditional upsert.
#[derive(Debug, Clone, Default)]
pub struct WriteCondition {
    pub counter: Option<u64>,
    pub owner: Option<String>,
}

impl WriteCondition {
    pub fn is_empty(&self) -> bool {
        self.counter.is_none() && self.owner.is_none()
    }
}

/// Deletion predicate: holds when the record is absent, or when the stored
/// owner and counter both equal these values.
#[derive(Debug, Clone)]
pub struct DeleteCondition {
    pub counter: u64,
    pub owner: Option<String>,
}

/// A per-key linearizable store with conditional mutations.
///
/// Predicate violations surface as [`StoreError::ConditionFailed`] and must
/// leave the record untouched. Implementations do not retry; the retry
/// budget lives with the caller.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the namespace if it does not already exist. "Already exists"
    /// is success.
    async fn ensure_table(&self, read_cap: u64, write_cap: u64) -> Result<(), StoreError>;

    /// Consistent full scan of every lease record.
    async fn scan(&self) -> Result<Vec<LeaseRecord>, StoreError>;

    /// Ensure a bare record for `key` exists. An existing record is left
    /// entirely untouched, whatever its owner or counter. Returns the
    /// record as it stands after the call, so a caller racing an active
    /// holder sees the real owner and counter.
    async fn ensure_key(&self, key: &str) -> Result<LeaseRecord, StoreError>;

    /// Conditionally set owner and counter (and extras, when the image
    /// carries them).
    async fn write(
        &self,
        key: &str,
        image: &WriteImage,
        cond: &WriteCondition,
    ) -> Result<(), StoreError>;

    /// Conditionally delete the record.
    async fn remove(&self, key: &str, cond: &DeleteCondition) -> Result<(), StoreError>;
}
