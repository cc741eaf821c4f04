//! # Saga Commit Wrapper
//!
//! Multi-service commits are expressed as an ordered [`SagaDispose`] of
//! forward RPCs paired with compensators, executed by a [`SagaEngine`] and
//! audited by the [`SagaDispatcher`].
//!
//! ```rust,no_run
//! use pipeline_core::saga::{SagaDispatcher, SagaDispose, TransOptions};
//! use serde_json::json;
//!
//! # async fn commit(dispatcher: &SagaDispatcher) -> pipeline_core::Result<()> {
//! let mut dispose = SagaDispose::new(TransOptions::default());
//! dispose
//!     .add("ledger.v1", "CreateStatements", "DeleteStatements", &json!({"id": "s1"}))?
//!     .add("good.v1", "UpdateGood", "", &json!({"id": "g1"}))?;
//! dispatcher.execute(dispose).await
//! # }
//! ```

pub mod dispatcher;
pub mod dispose;
pub mod engine;

pub use dispatcher::SagaDispatcher;
pub use dispose::{SagaAction, SagaDispose, TransOptions};
pub use engine::{InProcessSagaEngine, RpcInvoker, SagaEngine};
