//! # Reference Domains
//!
//! Business modules plugged into the generic pipeline. Each module provides a
//! scanner, an executor and a persistenter for one subsystem, plus a `build`
//! function wiring them into a [`crate::stage::PipelineHandler`].
//!
//! - [`benefit::wait`]: periodic reward computation for goods in `wait`
//! - [`benefit::bookkeeping`]: reward apportionment and ledger statements
//! - [`benefit::reset`]: `done` and `fail` goods back to `wait`
//! - [`withdraw::review`]: auto-review of pending withdrawals

pub mod benefit;
pub mod withdraw;

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::locks::{KeyedLocks, LeaseProvider, LocalLeaseProvider};
use crate::saga::{SagaDispatcher, SagaDispose, TransOptions};
use crate::services::Platform;

/// Everything a domain module needs from the outside world.
#[derive(Clone)]
pub struct DomainContext {
    pub platform: Platform,
    pub dispatcher: SagaDispatcher,
    pub config: PipelineConfig,
    pub lease: Arc<dyn LeaseProvider>,
    pub account_locks: KeyedLocks,
}

impl DomainContext {
    pub fn new(platform: Platform, dispatcher: SagaDispatcher, config: PipelineConfig) -> Self {
        Self {
            platform,
            dispatcher,
            config,
            lease: Arc::new(LocalLeaseProvider::new()),
            account_locks: KeyedLocks::new(),
        }
    }

    pub fn with_lease(mut self, lease: Arc<dyn LeaseProvider>) -> Self {
        self.lease = lease;
        self
    }

    /// A fresh saga using the configured submission options.
    pub fn saga(&self) -> SagaDispose {
        SagaDispose::new(TransOptions::from(&self.config.saga))
    }

    pub fn row_limit(&self) -> u32 {
        self.config.scan.row_limit.max(1)
    }
}
