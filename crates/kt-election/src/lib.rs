//! Lease-based leader election.
//!
//! Replicas contend for one [`lease::LeaseRecord`] through a
//! [`lease::LeaseStore`] with compare-and-swap updates. The holder renews it
//! every retry period; when it stops renewing, another replica takes over
//! once the lease has gone unchanged for its full duration.

pub mod elector;
pub mod lease;

pub use elector::{LeaderCallbacks, LeaderElectionConfig, LeaderElector, RunOutcome};
pub use lease::{InMemoryLeaseStore, LeaseError, LeaseRecord, LeaseStore, VersionedLease};
