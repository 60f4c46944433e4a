//! Orchestrates the periodic tasks and serves the caller-facing API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use super::manager::LeaseManager;
use super::renewer::LeaseRenewer;
use super::state::{SharedState, WorkerState};
use super::taker::LeaseTaker;
use super::Lease;
use crate::config::Config;
use crate::error::LeaseError;
use crate::store::LeaseStore;
use crate::util::runnable::{run_at_fixed_interval, run_with_fixed_delay};

/// The caller-facing contract: lifecycle plus lease CRUD.
#[async_trait]
pub trait Leaser: Send + Sync {
    /// Prepare the lease table, prime the local view, and launch the
    /// periodic renewer and taker.
    async fn start(&self) -> Result<(), LeaseError>;

    /// Stop both periodic tasks and wait for them to wind down. Held leases
    /// are not released; they lapse once their renewals stop. A caller that
    /// wants an immediate handoff evicts explicitly through the manager.
    async fn stop(&self);

    /// Leases this worker currently holds, each carrying the concurrency
    /// token of its acquisition.
    async fn get_leases(&self) -> Vec<Lease>;

    /// Ensure a lease record exists for the key. Only the key is written;
    /// an existing record is untouched, and the returned lease reflects
    /// whatever record is actually there (for an existing key, its live
    /// owner and counter).
    async fn create(&self, lease: Lease) -> Result<Lease, LeaseError>;

    /// Write back caller-defined attributes of a held lease.
    async fn update(&self, lease: Lease) -> Result<Lease, LeaseError>;

    /// Delete a lease record, conditioned on the passed-in owner and
    /// counter still being current.
    async fn delete(&self, lease: Lease) -> Result<(), LeaseError>;
}

pub struct LeaseCoordinator {
    manager: Arc<LeaseManager>,
    renewer: Arc<LeaseRenewer>,
    taker: Arc<LeaseTaker>,
    state: SharedState,
    config: Arc<Config>,
    shutdown: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl LeaseCoordinator {
    pub fn new(store: Arc<dyn LeaseStore>, config: Config) -> Result<Self, LeaseError> {
        config.validate()?;
        let config = Arc::new(config);
        let state: SharedState = Arc::new(Mutex::new(WorkerState::default()));
        let manager = Arc::new(LeaseManager::with_shared_config(store, config.clone()));
        let renewer = Arc::new(LeaseRenewer::new(
            manager.clone(),
            state.clone(),
            config.clone(),
        ));
        let taker = Arc::new(LeaseTaker::new(
            manager.clone(),
            state.clone(),
            config.clone(),
        ));
        Ok(Self {
            manager,
            renewer,
            taker,
            state,
            config,
            shutdown: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// The underlying manager, for embedders that need the raw lease
    /// operations (eviction, tooling) against the same store and worker id.
    pub fn manager(&self) -> Arc<LeaseManager> {
        self.manager.clone()
    }
}

#[cfg(test)]
impl LeaseCoordinator {
    pub(crate) async fn take_pass(&self) {
        self.taker.take_pass().await;
    }

    pub(crate) async fn renew_pass(&self) {
        self.renewer.renew_pass().await;
    }
}

#[async_trait]
impl Leaser for LeaseCoordinator {
    async fn start(&self) -> Result<(), LeaseError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.manager.create_table().await?;

        // Prime the table view so the first take pass classifies against a
        // full listing instead of an empty one.
        let listed = self.manager.list_leases().await?;
        {
            let mut state = self.state.lock().await;
            state.snapshot = listed
                .into_iter()
                .map(|lease| (lease.key().to_string(), lease))
                .collect();
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(run_with_fixed_delay(
            self.taker.clone(),
            self.config.take_period,
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(run_at_fixed_interval(
            self.renewer.clone(),
            self.config.renew_period,
            self.shutdown.clone(),
        )));
        info!(
            worker = %self.config.worker_id,
            table = %self.config.lease_table,
            "lease coordination started"
        );
        Ok(())
    }

    async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(
                    worker = %self.config.worker_id,
                    error = %err,
                    "periodic task ended abnormally"
                );
            }
        }
        info!(worker = %self.config.worker_id, "lease coordination stopped");
    }

    async fn get_leases(&self) -> Vec<Lease> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .held
            .values()
            .filter(|lease| !lease.is_expired(self.config.expiry, now))
            .cloned()
            .collect()
    }

    async fn create(&self, lease: Lease) -> Result<Lease, LeaseError> {
        if lease.key().is_empty() {
            return Err(LeaseError::EmptyKey);
        }
        self.manager.create_lease(&lease).await
    }

    async fn update(&self, lease: Lease) -> Result<Lease, LeaseError> {
        if lease.key().is_empty() {
            return Err(LeaseError::EmptyKey);
        }

        // The state lock is fair, so it may be held across the store call;
        // this keeps the renewer from advancing the counter mid-update.
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let held = match state.held.get(lease.key()) {
            Some(held) if !held.is_expired(self.config.expiry, now) => held,
            _ => return Err(LeaseError::LeaseNotHeld),
        };
        if held.concurrency_token != lease.concurrency_token {
            return Err(LeaseError::TokenNotMatch);
        }

        let mut merged = held.clone();
        merged.extras.extend(lease.extras.clone());
        match self.manager.update_lease(&mut merged).await {
            Ok(()) => {
                state.held.insert(merged.key().to_string(), merged.clone());
                Ok(merged)
            }
            Err(err) if err.is_condition_failed() => {
                // The authoritative record moved underneath this worker:
                // treat it exactly like a lost-and-regained lease.
                state.mark_lost(lease.key(), merged.concurrency_token);
                Err(LeaseError::TokenNotMatch)
            }
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, lease: Lease) -> Result<(), LeaseError> {
        if lease.key().is_empty() {
            return Err(LeaseError::EmptyKey);
        }
        self.manager.delete_lease(&lease).await
    }
}
