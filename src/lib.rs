//! Partition a bounded set of work units across a fleet of stateless
//! workers with distributed leases.
//!
//! Every work unit is identified by an opaque key with one lease record in
//! a shared, strongly-consistent store. Workers never coordinate directly:
//! each one periodically lists the table, takes an even share of whatever
//! leases have expired, and renews what it holds. When a holder crashes or
//! stops renewing, the rest of the fleet sees the lease counter stop moving
//! and steals the lease after the expiry window. Conditional writes guarded
//! by the counter make every transfer race-safe.
//!
//! ```no_run
//! use std::sync::Arc;
//! use worklease::store::memory::InMemoryLeaseStore;
//! use worklease::{Config, Lease, LeaseCoordinator, Leaser};
//!
//! # async fn example() -> Result<(), worklease::LeaseError> {
//! let store = Arc::new(InMemoryLeaseStore::new());
//! let coordinator = LeaseCoordinator::new(store, Config::new("worker-1", "jobs"))?;
//! coordinator.start().await?;
//!
//! coordinator.create(Lease::new("job-42")).await?;
//! for lease in coordinator.get_leases().await {
//!     println!("processing unit {}", lease.key());
//! }
//!
//! coordinator.stop().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod lease;
pub mod store;
mod util;

pub use config::{BackoffPolicy, Config};
pub use error::{LeaseError, StoreError};
pub use lease::coordinator::{LeaseCoordinator, Leaser};
pub use lease::manager::LeaseManager;
pub use lease::Lease;

#[cfg(feature = "dynamodb")]
pub use store::dynamo::DynamoLeaseStore;
pub use store::memory::InMemoryLeaseStore;
pub use store::LeaseStore;
