//! Saga Execution Coordinator.
//!
//! Process-wide owner of the sub-transaction and param type registries and of
//! the saga log storage handle; factory for [`Saga`] instances.

use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::context::SagaContext;
use crate::error::ConfigError;
use crate::log::LogRecord;
use crate::params::{AnyArg, ParamError, ParamRegistry, SagaArgs, TaggedParam};
use crate::saga::Saga;
use crate::storage::{Storage, StorageError};
use crate::subtx::{SubTxDef, SubTxFn, SubTxRegistry};

/// Configuration for an [`ExecutionCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Prefix prepended to every saga id to form its storage key.
    pub log_prefix: String,
    /// Attempts granted to each individual compensation before the saga
    /// latches compensate-failed. No backoff between attempts.
    pub compensate_retries: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log_prefix: "saga".to_string(),
            compensate_retries: 10,
        }
    }
}

#[derive(Default)]
pub(crate) struct Registries {
    pub(crate) params: ParamRegistry,
    pub(crate) sub_txs: SubTxRegistry,
}

pub(crate) struct CoordinatorCore {
    pub(crate) registries: RwLock<Registries>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) config: CoordinatorConfig,
}

impl CoordinatorCore {
    /// Resolve a sub-transaction definition.
    ///
    /// Panics if `sub_tx_id` was never registered: executing an unknown
    /// sub-transaction is a misconfiguration, not a recoverable condition.
    pub(crate) fn must_find_sub_tx(&self, sub_tx_id: &str) -> SubTxDef {
        let registries = self.registries.read().unwrap();
        match registries.sub_txs.find(sub_tx_id) {
            Some(def) => def.clone(),
            None => panic!("sub-transaction '{sub_tx_id}' not registered"),
        }
    }

    pub(crate) fn encode_params(
        &self,
        names: &[&'static str],
        args: &[AnyArg],
    ) -> Result<Vec<TaggedParam>, ParamError> {
        self.registries.read().unwrap().params.encode(names, args)
    }

    pub(crate) fn decode_params(&self, params: &[TaggedParam]) -> Result<Vec<AnyArg>, ParamError> {
        self.registries.read().unwrap().params.decode(params)
    }

    pub(crate) fn failures_key(&self) -> String {
        format!("{}compensate_failures", self.config.log_prefix)
    }
}

/// Saga Execution Coordinator (SEC).
///
/// Thread-safe and cheap to clone; one instance per process and storage
/// backend is typical. Registries take a writer lock only during setup and
/// are read-locked on the hot path.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    core: Arc<CoordinatorCore>,
}

impl ExecutionCoordinator {
    /// Create a coordinator over `storage`, keying saga logs under
    /// `log_prefix`.
    pub fn new(storage: Arc<dyn Storage>, log_prefix: impl Into<String>) -> Self {
        Self::with_config(
            storage,
            CoordinatorConfig {
                log_prefix: log_prefix.into(),
                ..CoordinatorConfig::default()
            },
        )
    }

    /// Create a coordinator with explicit configuration.
    pub fn with_config(storage: Arc<dyn Storage>, config: CoordinatorConfig) -> Self {
        Self {
            core: Arc::new(CoordinatorCore {
                registries: RwLock::new(Registries::default()),
                storage,
                config,
            }),
        }
    }

    /// Register a sub-transaction under `sub_tx_id`.
    ///
    /// `action` and `compensate` must accept the same argument tuple after the
    /// leading [`SagaContext`]; compensation is later invoked with the exact
    /// arguments the action received. Every argument type is registered in the
    /// param type registry as part of the same atomic update.
    ///
    /// Returns `&Self` so registrations chain:
    ///
    /// ```rust,ignore
    /// sec.add_sub_tx("debit", debit, credit)?
    ///    .add_sub_tx("credit", credit, debit)?;
    /// ```
    pub fn add_sub_tx<A, F, C>(
        &self,
        sub_tx_id: &str,
        action: F,
        compensate: C,
    ) -> Result<&Self, ConfigError>
    where
        A: SagaArgs,
        F: SubTxFn<A>,
        C: SubTxFn<A>,
    {
        let mut registries = self.core.registries.write().unwrap();
        A::register(&mut registries.params)?;
        registries.sub_txs.add_definition(SubTxDef {
            sub_tx_id: sub_tx_id.to_string(),
            action: action.erase(),
            compensate: compensate.erase(),
            param_names: A::param_names(),
        })?;
        debug!(sub_tx_id, "registered sub-transaction");
        Ok(self)
    }

    /// Start a new saga under the caller-unique `id`.
    ///
    /// The `sagaStart` record is durable before this returns.
    pub async fn start_saga(&self, ctx: SagaContext, id: impl Into<String>) -> Saga {
        let saga = Saga::new(self.core.clone(), ctx, id.into());
        saga.write_start().await;
        info!(saga_id = %saga.id(), log_id = %saga.log_id(), "saga started");
        saga
    }

    /// Scan storage for saga logs and report each one's last record.
    ///
    /// Crash-recovery semantics (resume, compensate, alert) are intentionally
    /// not decided by this crate; the scan only surfaces what an operator or a
    /// supervisor needs in order to act. The compensate-failures index is not
    /// itself a saga log and is excluded.
    pub async fn scan_outstanding(&self) -> Result<Vec<OutstandingSaga>, StorageError> {
        let failures_key = self.core.failures_key();
        let mut outstanding = Vec::new();
        for log_id in self.core.storage.log_ids().await? {
            if log_id == failures_key {
                continue;
            }
            let last = self.core.storage.last_log(&log_id).await?;
            let last_record = last
                .as_deref()
                .and_then(|payload| LogRecord::decode(payload).ok());
            outstanding.push(OutstandingSaga { log_id, last_record });
        }
        Ok(outstanding)
    }

    /// Log ids of sagas whose compensation did not complete, in the order
    /// they failed. Drained out-of-band by operators.
    pub async fn compensate_failures(&self) -> Result<Vec<String>, StorageError> {
        self.core.storage.lookup(&self.core.failures_key()).await
    }

    /// Storage key of the out-of-band compensate-failures index.
    pub fn failures_key(&self) -> String {
        self.core.failures_key()
    }

    /// The storage handle this coordinator owns.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.core.storage
    }

    /// Release storage resources.
    pub async fn close(&self) -> Result<(), StorageError> {
        self.core.storage.close().await
    }
}

/// A saga log found in storage by [`ExecutionCoordinator::scan_outstanding`].
#[derive(Debug)]
pub struct OutstandingSaga {
    /// Full storage key of the saga log.
    pub log_id: String,
    /// Decoded tail record; `None` when the log is empty or unreadable.
    pub last_record: Option<LogRecord>,
}
