#![allow(clippy::doc_markdown)] // Allow technical terms like RPC names in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Pipeline Core
//!
//! Generic discover, compute, commit pipeline for business entities whose
//! canonical state lives in remote services.
//!
//! ## Overview
//!
//! Every subsystem runs the same three stages over its own entity type:
//!
//! - a **Scanner** pages through upstream records matching a state predicate
//! - an **Executor** reads and computes, then makes exactly one routing decision
//! - a **Persistent** stage commits the outcome, usually as a saga of forward
//!   RPCs paired with compensators
//!
//! Edges between stages are cancellation-aware sends that never block the
//! producer. Failed entities are re-submitted after a fixed cooldown. Each
//! long-lived stage loop runs under a watcher that coordinates shutdown.
//!
//! ## Module Organization
//!
//! - [`feed`] - AsyncFeed, CancelableFeed and the retry scheduler
//! - [`watcher`] - Stage lifecycle coordination
//! - [`stage`] - Stage contracts, routing, workers and the pipeline handler
//! - [`saga`] - Saga construction, execution and audit
//! - [`locks`] - Keyed account locks and subsystem leases
//! - [`state_machine`] - Per-domain state graphs
//! - [`money`] - Decimal parsing and apportionment
//! - [`services`] - Remote service ports and the in-memory platform
//! - [`domains`] - Reference benefit and withdraw modules
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pipeline_core::config::PipelineConfig;
//! use pipeline_core::domains::{withdraw, DomainContext};
//! use pipeline_core::saga::{InProcessSagaEngine, SagaDispatcher};
//! use pipeline_core::services::{InMemoryPlatform, Platform};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> pipeline_core::Result<()> {
//! pipeline_core::logging::init_structured_logging();
//!
//! let platform = Arc::new(InMemoryPlatform::new());
//! let ctx = DomainContext::new(
//!     Platform::in_memory(platform.clone()),
//!     SagaDispatcher::new(Arc::new(InProcessSagaEngine::new(platform))),
//!     PipelineConfig::default(),
//! );
//!
//! let token = CancellationToken::new();
//! if let Some(handler) = withdraw::review::build(&ctx, &token)? {
//!     // ... run until shutdown
//!     handler.finalize().await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod domains;
pub mod error;
pub mod feed;
pub mod locks;
pub mod logging;
pub mod money;
pub mod saga;
pub mod services;
pub mod stage;
pub mod state_machine;
pub mod watcher;

pub use config::{ConfigManager, PipelineConfig};
pub use error::{ErrorCategory, PipelineError, Result, SagaError};
pub use feed::{async_feed, cancelable_feed, retry, FeedOutcome, RetryScheduler};
pub use stage::{
    Exec, Notify, ObjectId, Payload, Persistenter, PipelineBuilder, PipelineHandler, Route, Routes,
    Scanner, TriggerCond,
};
pub use watcher::Watcher;
