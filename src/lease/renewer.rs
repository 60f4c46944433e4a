//! Periodic task that keeps this worker's held leases alive.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::warn;

use super::manager::LeaseManager;
use super::state::SharedState;
use super::Lease;
use crate::config::Config;
use crate::util::runnable::PeriodicRunnable;

pub(crate) struct LeaseRenewer {
    manager: Arc<LeaseManager>,
    state: SharedState,
    config: Arc<Config>,
}

impl LeaseRenewer {
    pub(crate) fn new(manager: Arc<LeaseManager>, state: SharedState, config: Arc<Config>) -> Self {
        Self {
            manager,
            state,
            config,
        }
    }

    /// One pass: renew every held lease. Leases are copied out first so the
    /// state lock is never held across a store call.
    pub(crate) async fn renew_pass(&self) {
        let held = { self.state.lock().await.held_leases() };
        if held.is_empty() {
            return;
        }
        join_all(held.into_iter().map(|lease| self.renew_one(lease))).await;
    }

    async fn renew_one(&self, mut lease: Lease) {
        let token = lease.concurrency_token;
        match self.manager.renew_lease(&mut lease).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.held.get_mut(lease.key()) {
                    *entry = lease;
                }
            }
            Err(err) if err.is_condition_failed() => {
                // Some other worker took or evicted this lease.
                if self.state.lock().await.mark_lost(lease.key(), token) {
                    warn!(
                        worker = %self.config.worker_id,
                        lease = %lease.key(),
                        "lease lost to another worker"
                    );
                }
            }
            Err(err) => {
                warn!(
                    worker = %self.config.worker_id,
                    lease = %lease.key(),
                    error = %err,
                    "failed to renew lease"
                );
                // The renewal clock keeps running through transient trouble.
                // Once it passes the expiry window the claim is no longer
                // defensible locally, and the rest of the fleet is free to
                // steal the lease.
                if lease.is_expired(self.config.expiry, Instant::now())
                    && self.state.lock().await.mark_lost(lease.key(), token)
                {
                    warn!(
                        worker = %self.config.worker_id,
                        lease = %lease.key(),
                        "lease expired without a successful renewal"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl PeriodicRunnable for LeaseRenewer {
    async fn run_once(&self) {
        self.renew_pass().await;
    }
}
