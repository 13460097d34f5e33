//! Per-transaction saga state machine.
//!
//! A [`Saga`] drives forward execution (`exec_sub`), abort with reverse
//! compensation (`abort`) and teardown (`end_saga`), recording every
//! transition in its append-only log before acting on it. The log is both the
//! decision record during forward execution and the work list during
//! rollback.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::context::SagaContext;
use crate::coordinator::CoordinatorCore;
use crate::error::SagaError;
use crate::log::{LogKind, LogRecord};
use crate::params::{AnyArg, SagaArgs, TaggedParam};

#[cfg(test)]
mod integration_tests;

/// One sub-transaction invocation inside [`Saga::exec_sub_concurrent`].
pub struct ExecSubCall {
    sub_tx_id: String,
    args: Vec<AnyArg>,
}

impl ExecSubCall {
    /// A call of `sub_tx_id` with the given argument tuple.
    pub fn new(sub_tx_id: impl Into<String>, args: impl SagaArgs) -> Self {
        Self {
            sub_tx_id: sub_tx_id.into(),
            args: args.into_args(),
        }
    }
}

/// Mutable saga state. Critical sections touching this hold the mutex for
/// field access only — never across storage I/O or user code.
#[derive(Default)]
struct SagaFlags {
    aborted: bool,
    compensate_fail: bool,
    err: Option<SagaError>,
}

struct SagaCore {
    id: String,
    log_id: String,
    ctx: SagaContext,
    sec: Arc<CoordinatorCore>,
    flags: Mutex<SagaFlags>,
}

/// A running saga.
///
/// Created by [`ExecutionCoordinator::start_saga`](crate::ExecutionCoordinator::start_saga).
/// Clones share state, so a saga can be handed to concurrent tasks; the
/// instance is spent once [`end_saga`](Self::end_saga) returns.
///
/// Storage failures panic: the durable log is the only recovery record, and
/// continuing without it would silently lose the ability to roll back.
#[derive(Clone)]
pub struct Saga {
    core: Arc<SagaCore>,
}

impl Saga {
    pub(crate) fn new(sec: Arc<CoordinatorCore>, ctx: SagaContext, id: String) -> Self {
        let log_id = format!("{}{}", sec.config.log_prefix, id);
        Self {
            core: Arc::new(SagaCore {
                id,
                log_id,
                ctx,
                sec,
                flags: Mutex::new(SagaFlags::default()),
            }),
        }
    }

    /// Caller-supplied saga id.
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Full storage key of this saga's log.
    pub fn log_id(&self) -> &str {
        &self.core.log_id
    }

    pub(crate) async fn write_start(&self) {
        self.append(LogRecord::saga(LogKind::SagaStart)).await;
    }

    async fn append(&self, record: LogRecord) {
        let payload = record.encode();
        if let Err(err) = self.core.sec.storage.append_log(&self.core.log_id, payload).await {
            panic!("append to saga log '{}' failed: {err}", self.core.log_id);
        }
    }

    /// Execute the sub-transaction registered under `sub_tx_id`.
    ///
    /// Writes `actionStart`, invokes the action with the saga's context, and
    /// on success writes `actionEnd` carrying the serialized arguments. On
    /// failure the action's error is recorded (first failure wins) and the
    /// saga aborts. A no-op once the saga is aborted.
    ///
    /// Returns `&Self` so calls chain through `.await`.
    ///
    /// # Panics
    ///
    /// Panics if `sub_tx_id` is unknown or an argument type does not match
    /// the registration; both are misconfigurations.
    pub async fn exec_sub<A: SagaArgs>(&self, sub_tx_id: &str, args: A) -> &Self {
        self.exec_sub_erased(sub_tx_id, args.into_args()).await;
        self
    }

    async fn exec_sub_erased(&self, sub_tx_id: &str, args: Vec<AnyArg>) {
        if self.core.flags.lock().unwrap().aborted {
            return;
        }
        let def = self.core.sec.must_find_sub_tx(sub_tx_id);
        // Arguments are encoded before anything reaches the log, so a
        // misregistered type cannot leave a half-written history behind.
        let params = match self.core.sec.encode_params(&def.param_names, &args) {
            Ok(params) => params,
            Err(err) => panic!("encode params for sub-transaction '{sub_tx_id}': {err}"),
        };

        self.append(LogRecord::sub_tx(LogKind::ActionStart, sub_tx_id)).await;
        debug!(saga_id = %self.core.id, sub_tx_id, "executing action");

        match (def.action)(self.core.ctx.clone(), args).await {
            Ok(()) => {
                self.append(LogRecord::sub_tx(LogKind::ActionEnd, sub_tx_id).with_params(params))
                    .await;
            }
            Err(action_err) => {
                error!(
                    saga_id = %self.core.id,
                    sub_tx_id,
                    error = %action_err,
                    "action failed, aborting saga"
                );
                {
                    let mut flags = self.core.flags.lock().unwrap();
                    if flags.err.is_none() {
                        flags.err = Some(SagaError::ActionFailed {
                            sub_tx_id: sub_tx_id.to_string(),
                            source: action_err,
                        });
                    }
                }
                self.abort().await;
            }
        }
    }

    /// Execute groups of sub-transactions concurrently.
    ///
    /// Groups run in parallel; calls within a group run sequentially. All
    /// spawned work is awaited before this returns. `actionStart`/`actionEnd`
    /// pairs of different groups may interleave in the log.
    pub async fn exec_sub_concurrent(&self, groups: Vec<Vec<ExecSubCall>>) -> &Self {
        let mut tasks = Vec::with_capacity(groups.len());
        for group in groups {
            let saga = self.clone();
            tasks.push(tokio::spawn(async move {
                for ExecSubCall { sub_tx_id, args } in group {
                    saga.exec_sub_erased(&sub_tx_id, args).await;
                }
            }));
        }
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
            }
        }
        self
    }

    /// Stop forward execution and compensate every committed sub-transaction,
    /// newest first.
    ///
    /// The first caller performs the rollback; later calls (including
    /// concurrent failures racing out of [`exec_sub_concurrent`](Self::exec_sub_concurrent))
    /// return immediately. The scan snapshots the log, appends `sagaAbort`,
    /// then walks the snapshot in reverse compensating every `actionEnd`. If
    /// a compensation exhausts its retry budget the scan halts, the saga
    /// latches compensate-failed and its log id is appended to the
    /// compensate-failures index; remaining compensations are deliberately
    /// left to manual recovery.
    pub async fn abort(&self) {
        {
            let mut flags = self.core.flags.lock().unwrap();
            if flags.aborted {
                return;
            }
            flags.aborted = true;
        }

        let snapshot = match self.core.sec.storage.lookup(&self.core.log_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => panic!("lookup of saga log '{}' failed: {err}", self.core.log_id),
        };
        self.append(LogRecord::saga(LogKind::SagaAbort)).await;
        info!(
            saga_id = %self.core.id,
            records = snapshot.len(),
            "aborting saga, compensating committed actions"
        );

        for payload in snapshot.iter().rev() {
            let record = match LogRecord::decode(payload) {
                Ok(record) => record,
                Err(err) => {
                    panic!("malformed record in saga log '{}': {err}", self.core.log_id)
                }
            };
            if record.kind != LogKind::ActionEnd {
                continue;
            }
            let Some(sub_tx_id) = record.sub_tx_id.as_deref() else {
                continue;
            };
            let params = record.params.as_deref().unwrap_or(&[]);
            if let Err(gave_up) = self.compensate(sub_tx_id, params).await {
                self.latch_compensate_failure(gave_up).await;
                return;
            }
        }
    }

    /// Run one compensation with its retry budget.
    ///
    /// The caller's context may already be cancelled by the time rollback
    /// runs; every attempt executes under a fresh, detached context.
    async fn compensate(&self, sub_tx_id: &str, params: &[TaggedParam]) -> Result<(), SagaError> {
        let def = self.core.sec.must_find_sub_tx(sub_tx_id);
        self.append(LogRecord::sub_tx(LogKind::CompensateStart, sub_tx_id)).await;

        let budget = self.core.sec.config.compensate_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=budget {
            let args = match self.core.sec.decode_params(params) {
                Ok(args) => args,
                Err(err) => panic!("decode params for compensation of '{sub_tx_id}': {err}"),
            };
            match (def.compensate)(SagaContext::detached(), args).await {
                Ok(()) => {
                    self.append(LogRecord::sub_tx(LogKind::CompensateEnd, sub_tx_id)).await;
                    debug!(saga_id = %self.core.id, sub_tx_id, attempt, "compensated");
                    return Ok(());
                }
                Err(err) => {
                    debug!(
                        saga_id = %self.core.id,
                        sub_tx_id,
                        attempt,
                        error = %err,
                        "compensation attempt failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(SagaError::CompensationFailed {
            sub_tx_id: sub_tx_id.to_string(),
            attempts: budget,
            source: last_err.expect("retry budget grants at least one attempt"),
            cause: None,
        })
    }

    async fn latch_compensate_failure(&self, gave_up: SagaError) {
        warn!(
            saga_id = %self.core.id,
            error = %gave_up,
            "compensation exhausted retries; halting rollback, log retained"
        );
        let failures_key = self.core.sec.failures_key();
        if let Err(err) = self
            .core
            .sec
            .storage
            .append_log(&failures_key, self.core.log_id.clone())
            .await
        {
            panic!("append to failures index '{failures_key}' failed: {err}");
        }

        let mut flags = self.core.flags.lock().unwrap();
        flags.compensate_fail = true;
        let cause = flags.err.take().map(Box::new);
        flags.err = Some(match gave_up {
            SagaError::CompensationFailed {
                sub_tx_id,
                attempts,
                source,
                ..
            } => SagaError::CompensationFailed {
                sub_tx_id,
                attempts,
                source,
                cause,
            },
            other => other,
        });
    }

    /// Finish the saga.
    ///
    /// Appends `sagaEnd` and returns the saga's outcome. A clean or fully
    /// rolled back saga has its log removed; a compensate-failed saga keeps
    /// the full log (and its entry in the failures index) for manual
    /// recovery.
    pub async fn end_saga(&self) -> Result<(), SagaError> {
        self.append(LogRecord::saga(LogKind::SagaEnd)).await;

        let (compensate_fail, err) = {
            let mut flags = self.core.flags.lock().unwrap();
            (flags.compensate_fail, flags.err.take())
        };

        if compensate_fail {
            warn!(
                saga_id = %self.core.id,
                "saga ended with failed compensation; log retained for manual recovery"
            );
            return Err(err.expect("compensate-failed sagas always latch an error"));
        }

        if let Err(err) = self.core.sec.storage.cleanup(&self.core.log_id).await {
            panic!("cleanup of saga log '{}' failed: {err}", self.core.log_id);
        }
        info!(saga_id = %self.core.id, "saga ended");

        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
