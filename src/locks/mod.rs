//! # Locks
//!
//! Keyed account locks for balance critical sections and subsystem leases for
//! single-runner scheduling.

pub mod keyed;
pub mod lease;

pub use keyed::{KeyedGuard, KeyedLocks};
pub use lease::{lease_key, LeaseProvider, LocalLeaseProvider};
