//! Adapter between lease operations and the store's conditional writes.
//!
//! Each operation composes its predicates from the passed-in lease: a
//! counter check when the counter has ever advanced, an owner check when the
//! lease has an owner. A freshly created lease (counter 0, no owner) carries
//! no predicates, so the first take succeeds unconditionally. Transient
//! store failures are retried with backoff inside each operation; a
//! conditional-check failure is a semantic outcome and is returned as-is.

use std::sync::Arc;

use tokio::time::Instant;

use crate::config::Config;
use crate::error::LeaseError;
use crate::lease::Lease;
use crate::store::{DeleteCondition, LeaseStore, WriteCondition, WriteImage};
use crate::util::retry::{with_retries, ExponentialRetry};

const MAX_CREATE_ATTEMPTS: usize = 3;
const MAX_SCAN_ATTEMPTS: usize = 3;
const MAX_WRITE_ATTEMPTS: usize = 2;
const MAX_DELETE_ATTEMPTS: usize = 2;

pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    config: Arc<Config>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: Config) -> Self {
        Self::with_shared_config(store, Arc::new(config))
    }

    pub(crate) fn with_shared_config(store: Arc<dyn LeaseStore>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    fn retry(&self, op: &'static str, max_attempts: usize) -> ExponentialRetry {
        ExponentialRetry::new(
            op,
            &self.config.worker_id,
            max_attempts,
            self.config.backoff.clone(),
        )
    }

    /// Ensure the lease table exists. A table that is already present counts
    /// as success.
    pub async fn create_table(&self) -> Result<(), LeaseError> {
        let store = self.store.clone();
        let read_cap = self.config.table_read_cap;
        let write_cap = self.config.table_write_cap;
        with_retries(self.retry("create_table", MAX_CREATE_ATTEMPTS), move || {
            let store = store.clone();
            async move { store.ensure_table(read_cap, write_cap).await }
        })
        .await
        .map_err(LeaseError::from_store)
    }

    /// List every lease in the table. Each returned lease's renewal clock
    /// starts at the moment of the read, so a freshly listed lease is never
    /// instantly classified as expired.
    pub async fn list_leases(&self) -> Result<Vec<Lease>, LeaseError> {
        let store = self.store.clone();
        let records = with_retries(self.retry("list_leases", MAX_SCAN_ATTEMPTS), move || {
            let store = store.clone();
            async move { store.scan().await }
        })
        .await
        .map_err(LeaseError::from_store)?;

        let listed_at = Instant::now();
        Ok(records
            .into_iter()
            .map(|record| Lease::from_record(record, listed_at))
            .collect())
    }

    /// Ensure a record exists for the lease's key. Only the key is written;
    /// an existing record keeps its owner, counter, and extras. The
    /// returned lease reflects the record as it stands after the call,
    /// which for an existing key is the live owner and counter, not the
    /// caller's input.
    pub async fn create_lease(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        let store = self.store.clone();
        let key = lease.key.clone();
        let record = with_retries(self.retry("create_lease", MAX_CREATE_ATTEMPTS), move || {
            let store = store.clone();
            let key = key.clone();
            async move { store.ensure_key(&key).await }
        })
        .await
        .map_err(LeaseError::from_store)?;
        Ok(Lease::from_record(record, Instant::now()))
    }

    /// Advance the lease counter by one, conditioned on the stored record
    /// still matching this lease. The passed-in lease is updated in place
    /// only on success.
    pub async fn renew_lease(&self, lease: &mut Lease) -> Result<(), LeaseError> {
        let image = WriteImage {
            owner: lease.owner.clone(),
            counter: lease.counter + 1,
            extras: None,
        };
        self.conditional_write("renew_lease", lease, image).await
    }

    /// Transfer ownership to this worker, advancing the counter.
    pub async fn take_lease(&self, lease: &mut Lease) -> Result<(), LeaseError> {
        let image = WriteImage {
            owner: Some(self.config.worker_id.clone()),
            counter: lease.counter + 1,
            extras: None,
        };
        self.conditional_write("take_lease", lease, image).await
    }

    /// Clear ownership without transferring it. The counter stays put; it
    /// advances when some worker next takes the lease.
    pub async fn evict_lease(&self, lease: &mut Lease) -> Result<(), LeaseError> {
        let image = WriteImage {
            owner: None,
            counter: lease.counter,
            extras: None,
        };
        self.conditional_write("evict_lease", lease, image).await
    }

    /// Write back the lease's caller-defined attributes, advancing the
    /// counter under the usual predicates.
    pub async fn update_lease(&self, lease: &mut Lease) -> Result<(), LeaseError> {
        let image = WriteImage {
            owner: lease.owner.clone(),
            counter: lease.counter + 1,
            extras: Some(lease.extras.clone()),
        };
        self.conditional_write("update_lease", lease, image).await
    }

    /// Delete the record. Succeeds when the record is already gone or when
    /// the stored owner and counter still match the passed-in lease.
    pub async fn delete_lease(&self, lease: &Lease) -> Result<(), LeaseError> {
        let cond = Arc::new(DeleteCondition {
            counter: lease.counter,
            owner: lease.owner.clone(),
        });
        let store = self.store.clone();
        let key = lease.key.clone();
        with_retries(self.retry("delete_lease", MAX_DELETE_ATTEMPTS), move || {
            let store = store.clone();
            let key = key.clone();
            let cond = cond.clone();
            async move { store.remove(&key, &cond).await }
        })
        .await
        .map_err(LeaseError::from_store)
    }

    async fn conditional_write(
        &self,
        op: &'static str,
        lease: &mut Lease,
        image: WriteImage,
    ) -> Result<(), LeaseError> {
        let cond = Arc::new(Self::write_condition(lease));
        let image = Arc::new(image);
        let store = self.store.clone();
        let key = lease.key.clone();

        let attempt_image = image.clone();
        with_retries(self.retry(op, MAX_WRITE_ATTEMPTS), move || {
            let store = store.clone();
            let key = key.clone();
            let image = attempt_image.clone();
            let cond = cond.clone();
            async move { store.write(&key, &image, &cond).await }
        })
        .await
        .map_err(LeaseError::from_store)?;

        lease.owner = image.owner.clone();
        lease.counter = image.counter;
        lease.last_renewal = Instant::now();
        Ok(())
    }

    fn write_condition(lease: &Lease) -> WriteCondition {
        WriteCondition {
            counter: if lease.counter > 0 {
                Some(lease.counter)
            } else {
                None
            },
            owner: lease.owner.clone(),
        }
    }
}
