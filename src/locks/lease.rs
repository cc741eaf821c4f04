//! Subsystem leases.
//!
//! Only the process holding `scheduler:<subsystem>` runs that subsystem's
//! routing loop. [`LocalLeaseProvider`] arbitrates between handlers inside one
//! process; a multi-process deployment plugs a distributed store in behind the
//! same trait.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{PipelineError, Result};

pub fn lease_key(subsystem: &str) -> String {
    format!("scheduler:{subsystem}")
}

#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Returns `true` when `owner` now holds the lease (including re-entry).
    async fn try_lock(&self, key: &str, owner: &str) -> Result<bool>;

    async fn unlock(&self, key: &str, owner: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LocalLeaseProvider {
    holders: DashMap<String, String>,
}

impl LocalLeaseProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, key: &str) -> Option<String> {
        self.holders.get(key).map(|h| h.value().clone())
    }
}

#[async_trait]
impl LeaseProvider for LocalLeaseProvider {
    async fn try_lock(&self, key: &str, owner: &str) -> Result<bool> {
        match self.holders.entry(key.to_string()) {
            Entry::Occupied(held) => Ok(held.get() == owner),
            Entry::Vacant(vacant) => {
                vacant.insert(owner.to_string());
                debug!(key = %key, owner = %owner, "Lease acquired");
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<()> {
        match self.holders.entry(key.to_string()) {
            Entry::Occupied(held) if held.get() == owner => {
                held.remove();
                debug!(key = %key, owner = %owner, "Lease released");
                Ok(())
            }
            Entry::Occupied(_) => Err(PipelineError::LeaseUnavailable {
                key: key.to_string(),
            }),
            Entry::Vacant(_) => Ok(()),
        }
    }
}
