//! Periodic task that discovers expired leases and steals a balanced share.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::manager::LeaseManager;
use super::state::{SharedState, WorkerState};
use super::Lease;
use crate::config::Config;
use crate::error::LeaseError;
use crate::util::runnable::PeriodicRunnable;

pub(crate) struct LeaseTaker {
    manager: Arc<LeaseManager>,
    state: SharedState,
    config: Arc<Config>,
}

impl LeaseTaker {
    pub(crate) fn new(manager: Arc<LeaseManager>, state: SharedState, config: Arc<Config>) -> Self {
        Self {
            manager,
            state,
            config,
        }
    }

    /// One pass: list the table, reconcile the renewal clocks, classify
    /// expiry, and try to take a balanced share of the expired leases.
    pub(crate) async fn take_pass(&self) {
        let listed = match self.manager.list_leases().await {
            Ok(listed) => listed,
            Err(err) => {
                // A partial view must not update local state.
                warn!(
                    worker = %self.config.worker_id,
                    error = %err,
                    "lease listing failed, skipping take pass"
                );
                return;
            }
        };

        let now = Instant::now();
        let candidates = {
            let mut state = self.state.lock().await;
            reconcile_snapshot(&mut state.snapshot, listed, now);
            self.choose_candidates(&state, now)
        };

        for mut lease in candidates {
            match self.manager.take_lease(&mut lease).await {
                Ok(()) => {
                    lease.concurrency_token = Some(Uuid::new_v4());
                    debug!(
                        worker = %self.config.worker_id,
                        lease = %lease.key(),
                        counter = lease.counter(),
                        "took lease"
                    );
                    self.state.lock().await.promote(lease);
                }
                Err(LeaseError::ConditionFailed) => {
                    // Another worker got there first; nothing to clean up.
                    debug!(
                        worker = %self.config.worker_id,
                        lease = %lease.key(),
                        "lost the race for lease"
                    );
                }
                Err(err) => {
                    warn!(
                        worker = %self.config.worker_id,
                        lease = %lease.key(),
                        error = %err,
                        "failed to take lease"
                    );
                }
            }
        }
    }

    /// Expired leases not already owned by this worker, randomly sampled
    /// down to what an even split of the table allows this worker to take.
    fn choose_candidates(&self, state: &WorkerState, now: Instant) -> Vec<Lease> {
        let target = steal_target(
            state.snapshot.len(),
            observed_workers(&state.snapshot, &self.config.worker_id),
        );
        let needed = target.saturating_sub(state.held.len());
        if needed == 0 {
            return Vec::new();
        }

        let stealable: Vec<&Lease> = state
            .snapshot
            .values()
            .filter(|lease| {
                lease.has_no_owner() || lease.is_expired(self.config.expiry, now)
            })
            .filter(|lease| !lease.is_owned_by(&self.config.worker_id))
            .collect();

        stealable
            .choose_multiple(&mut rand::thread_rng(), needed)
            .map(|lease| (*lease).clone())
            .collect()
    }
}

#[async_trait]
impl PeriodicRunnable for LeaseTaker {
    async fn run_once(&self) {
        self.take_pass().await;
    }
}

/// Fold a fresh listing into the previous snapshot. A lease whose counter
/// has not moved keeps its earlier renewal stamp; anything that advanced or
/// is newly seen starts its clock at `now`. Leases gone from the listing
/// drop out.
fn reconcile_snapshot(snapshot: &mut HashMap<String, Lease>, listed: Vec<Lease>, now: Instant) {
    let mut next = HashMap::with_capacity(listed.len());
    for mut lease in listed {
        match snapshot.get(lease.key()) {
            Some(prior) if prior.counter == lease.counter => {
                lease.last_renewal = prior.last_renewal;
            }
            _ => lease.last_renewal = now,
        }
        next.insert(lease.key().to_string(), lease);
    }
    *snapshot = next;
}

/// Workers visible in the table: every distinct owner, plus this worker.
fn observed_workers(snapshot: &HashMap<String, Lease>, worker_id: &str) -> usize {
    let mut owners: HashSet<&str> = snapshot.values().filter_map(Lease::owner).collect();
    owners.insert(worker_id);
    owners.len()
}

/// Even share of the table for one worker: ceil(total / workers).
fn steal_target(total_leases: usize, workers: usize) -> usize {
    if workers == 0 {
        return total_leases;
    }
    (total_leases + workers - 1) / workers
}
