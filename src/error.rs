use thiserror::Error;

/// Failures reported by a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional predicate did not hold; some other actor mutated the
    /// record first. Never retried.
    #[error("conditional check failed")]
    ConditionFailed,
    /// Throttling or connectivity trouble. Safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The store refused the request for a non-transient reason.
    #[error("store rejected the request: {0}")]
    Rejected(String),
    /// A stored record could not be decoded into a lease.
    #[error("malformed lease record: {0}")]
    Corrupt(String),
}

/// Errors surfaced through the caller-facing lease API.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The concurrency token on the passed-in lease does not match the
    /// authoritative lease: the lease was lost and regained between the
    /// caller's snapshot and this call.
    #[error("concurrency token does not match the authoritative lease")]
    TokenNotMatch,
    /// The passed-in lease is not held by this worker.
    #[error("worker does not hold the passed-in lease")]
    LeaseNotHeld,
    /// A conditional store write lost a race with another worker.
    #[error("conditional check failed: another worker mutated the lease first")]
    ConditionFailed,
    /// Lease keys are opaque but must be non-empty.
    #[error("lease key must not be empty")]
    EmptyKey,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A store failure that survived the retry budget.
    #[error("store failure: {0}")]
    Store(#[source] StoreError),
}

impl LeaseError {
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::ConditionFailed => LeaseError::ConditionFailed,
            other => LeaseError::Store(other),
        }
    }

    /// True when the operation lost a conditional-write race rather than
    /// hitting a store fault.
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, LeaseError::ConditionFailed)
    }
}
