use std::time::Duration;

use uuid::Uuid;

use crate::error::LeaseError;

/// Spacing of retries for store calls that failed transiently.
///
/// Attempt `n` waits `initial * factor^(n-1)`, bounded by `cap`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub cap: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            factor: 2.0,
        }
    }
}

/// Tunables for one worker process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier of this worker within the fleet.
    pub worker_id: String,
    /// Store namespace the fleet coordinates through.
    pub lease_table: String,
    /// How long a lease may go unrenewed before any worker may steal it.
    pub expiry: Duration,
    /// Cadence of the renewal task. Keep at or below a third of `expiry`.
    pub renew_period: Duration,
    /// Cadence of the taker task.
    pub take_period: Duration,
    /// Read capacity requested when the lease table is first created.
    pub table_read_cap: u64,
    /// Write capacity requested when the lease table is first created.
    pub table_write_cap: u64,
    /// Retry spacing for store calls.
    pub backoff: BackoffPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            lease_table: "leases".to_string(),
            expiry: Duration::from_secs(30),
            renew_period: Duration::from_secs(10),
            take_period: Duration::from_secs(30),
            table_read_cap: 10,
            table_write_cap: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl Config {
    pub fn new(worker_id: impl Into<String>, lease_table: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            lease_table: lease_table.into(),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), LeaseError> {
        if self.worker_id.is_empty() {
            return Err(LeaseError::InvalidConfig("worker_id must not be empty"));
        }
        if self.lease_table.is_empty() {
            return Err(LeaseError::InvalidConfig("lease_table must not be empty"));
        }
        if self.renew_period >= self.expiry {
            return Err(LeaseError::InvalidConfig(
                "renew_period must be shorter than expiry",
            ));
        }
        if self.renew_period.is_zero() || self.take_period.is_zero() {
            return Err(LeaseError::InvalidConfig(
                "renew_period and take_period must be non-zero",
            ));
        }
        Ok(())
    }
}
