//! The lease data model and the tasks that contend for leases.
//!
//! Work units are identified by opaque keys. Each key has exactly one lease
//! record in the store; whichever worker holds the lease is entitled to
//! process the unit. Workers never talk to each other: every transfer of
//! ownership is a conditional write guarded by the lease counter, so the
//! store's per-key linearizability is the only coordination primitive.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::store::LeaseRecord;

pub(crate) mod coordinator;
pub(crate) mod manager;
pub(crate) mod renewer;
pub(crate) mod state;
pub(crate) mod taker;

/// One unit of work and the authority to process it.
///
/// Ownership rotates across the fleet over the lease's lifetime. The counter
/// advances on every renewal, take, or update and doubles as the fencing
/// token: a worker whose view of the counter is stale can no longer mutate
/// the record.
#[derive(Debug, Clone)]
pub struct Lease {
    key: String,
    owner: Option<String>,
    counter: u64,
    /// When this worker last observed the counter advance. Local only,
    /// never persisted.
    last_renewal: Instant,
    /// Identity of this worker's current acquisition of the lease. Local
    /// only, never persisted.
    concurrency_token: Option<Uuid>,
    extras: HashMap<String, Value>,
}

impl Lease {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner: None,
            counter: 0,
            last_renewal: Instant::now(),
            concurrency_token: None,
            extras: HashMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Token minted the last time this worker took the lease, if the lease
    /// came out of the worker's held set.
    pub fn concurrency_token(&self) -> Option<Uuid> {
        self.concurrency_token
    }

    /// Attach a caller-defined attribute. It rides along in the store record
    /// untouched by the lease protocol.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extras.insert(key.into(), value.into());
    }

    /// Read back a caller-defined attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }

    pub fn extras(&self) -> &HashMap<String, Value> {
        &self.extras
    }

    pub(crate) fn from_record(record: LeaseRecord, listed_at: Instant) -> Self {
        Self {
            key: record.key,
            owner: record.owner,
            counter: record.counter,
            last_renewal: listed_at,
            concurrency_token: None,
            extras: record.extras,
        }
    }

    pub(crate) fn has_no_owner(&self) -> bool {
        self.owner.is_none()
    }

    pub(crate) fn is_owned_by(&self, worker_id: &str) -> bool {
        self.owner.as_deref() == Some(worker_id)
    }

    /// Whether the renewal clock has run past `window` as of `now`.
    pub(crate) fn is_expired(&self, window: Duration, now: Instant) -> bool {
        now.duration_since(self.last_renewal) > window
    }
}
