//! Distributed leases over an object store.
//!
//! A lease is a time-bounded, renewable, exclusive claim on a named blob. It
//! lets independent worker processes agree on who performs a fleet-wide task
//! without a central lock server.

pub mod claimed;
pub mod error;
pub mod lease;
pub mod memory;
pub mod store;

pub use claimed::{claim_period_start, ClaimedDistributedLease};
pub use error::{LeaseError, Result};
pub use lease::{
    blob_safe_name, DistributedLease, LeaseHandle, LeaseOptions, DEFAULT_LEASE_DURATION,
    LEASE_BLOB_BODY,
};
pub use memory::MemoryLeaseStore;
pub use store::{BlobKey, LeaseStore};
