use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use super::Lease;

/// Worker-local view of the fleet, mutated by the taker and renewer and read
/// by the caller-facing operations. Every access goes through one fair async
/// lock.
#[derive(Debug, Default)]
pub(crate) struct WorkerState {
    /// Leases this worker currently believes it holds, keyed by lease key.
    /// Each entry carries the concurrency token of its acquisition.
    pub(crate) held: HashMap<String, Lease>,
    /// Reconciled view of the whole table from the last take pass.
    pub(crate) snapshot: HashMap<String, Lease>,
}

pub(crate) type SharedState = Arc<Mutex<WorkerState>>;

impl WorkerState {
    pub(crate) fn held_leases(&self) -> Vec<Lease> {
        self.held.values().cloned().collect()
    }

    /// Record a freshly taken lease in both the held set and the snapshot.
    pub(crate) fn promote(&mut self, lease: Lease) {
        self.snapshot.insert(lease.key.clone(), lease.clone());
        self.held.insert(lease.key.clone(), lease);
    }

    /// Drop a held lease, but only if it still belongs to the acquisition
    /// episode identified by `token`. A concurrent re-take mints a new
    /// token, and that newer episode must survive a stale loss report.
    pub(crate) fn mark_lost(&mut self, key: &str, token: Option<Uuid>) -> bool {
        match self.held.get(key) {
            Some(entry) if entry.concurrency_token == token => {
                self.held.remove(key);
                true
            }
            _ => false,
        }
    }
}
