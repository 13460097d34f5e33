//! Saga execution coordination over a durable, replayable saga log.
//!
//! A *saga* is a long-lived business transaction composed of small
//! sub-transactions, each registered with a forward *action* and a
//! *compensation* that semantically undoes it. The
//! [`ExecutionCoordinator`] (SEC) owns the registries and the log storage;
//! each [`Saga`] drives forward execution, records every transition in an
//! append-only log, and on failure walks that log in reverse to run
//! compensations with the exact arguments the actions received — possibly in
//! a later process than the one that wrote them.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sagaflow::{ExecutionCoordinator, MemoryStorage, SagaContext};
//!
//! async fn debit(_ctx: SagaContext, account: String, amount: i64) -> anyhow::Result<()> {
//!     // move money out of `account`
//!     Ok(())
//! }
//!
//! async fn credit(_ctx: SagaContext, account: String, amount: i64) -> anyhow::Result<()> {
//!     // move money back into `account`
//!     Ok(())
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let storage = Arc::new(MemoryStorage::new("saga"));
//! let sec = ExecutionCoordinator::new(storage, "saga");
//! sec.add_sub_tx("debit", debit, credit)?;
//!
//! let saga = sec.start_saga(SagaContext::new(), "order-42").await;
//! saga.exec_sub("debit", ("acct-a".to_string(), 50_i64)).await;
//! saga.end_saga().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Failure containment
//!
//! An action error rolls the saga back and `end_saga` returns
//! [`SagaError::ActionFailed`]. A compensation that exhausts its retry budget
//! halts the rollback: the saga log is retained, its id is appended to the
//! `<prefix>compensate_failures` index, and `end_saga` returns
//! [`SagaError::CompensationFailed`] for an operator to reconcile.
//!
//! Sagas provide no isolation: effects of committed sub-transactions are
//! visible to the world before the saga ends. Actions and compensations
//! should be idempotent; the coordinator does not make them so.

mod context;
mod coordinator;
mod error;
mod log;
mod params;
mod saga;
mod storage;
mod subtx;

pub use context::SagaContext;
pub use coordinator::{CoordinatorConfig, ExecutionCoordinator, OutstandingSaga};
pub use error::{ConfigError, SagaError};
pub use log::{CodecError, LogKind, LogRecord};
pub use params::{AnyArg, ParamError, ParamRegistry, SagaArgs, TaggedParam};
pub use saga::{ExecSubCall, Saga};
pub use storage::{Storage, StorageError};
pub use subtx::{ErasedOp, SubTxDef, SubTxFn, SubTxRegistry};

#[cfg(any(test, feature = "testing"))]
pub use storage::memory::MemoryStorage;

#[cfg(feature = "redis")]
pub use storage::redis::{RedisConfig, RedisStorage};
