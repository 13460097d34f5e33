//! Integration tests for the saga state machine.
//!
//! These tests run money-transfer sagas against a mock ledger and the
//! in-memory storage backend, asserting on the exact shape of the saga log.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::context::SagaContext;
use crate::coordinator::{CoordinatorConfig, ExecutionCoordinator};
use crate::error::SagaError;
use crate::log::{LogKind, LogRecord};
use crate::saga::ExecSubCall;
use crate::storage::memory::MemoryStorage;
use crate::storage::Storage;

/// A mock double-entry ledger that tracks balances and records every call.
struct Ledger {
    balances: Mutex<HashMap<String, i64>>,
    /// Ordered record of every action/compensation application.
    journal: Mutex<Vec<String>>,
    /// Sub-transactions whose action fails.
    fail_actions: Mutex<HashSet<String>>,
    /// Sub-transactions whose compensation always fails.
    fail_compensations: Mutex<HashSet<String>>,
    /// Compensation attempts per sub-transaction.
    compensate_attempts: Mutex<HashMap<String, u32>>,
}

impl Ledger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            balances: Mutex::new(HashMap::from([("A".to_string(), 100)])),
            journal: Mutex::new(Vec::new()),
            fail_actions: Mutex::new(HashSet::new()),
            fail_compensations: Mutex::new(HashSet::new()),
            compensate_attempts: Mutex::new(HashMap::new()),
        })
    }

    fn fail_action(&self, sub_tx_id: &str) {
        self.fail_actions.lock().unwrap().insert(sub_tx_id.to_string());
    }

    fn fail_compensation(&self, sub_tx_id: &str) {
        self.fail_compensations.lock().unwrap().insert(sub_tx_id.to_string());
    }

    fn balance(&self, account: &str) -> i64 {
        self.balances.lock().unwrap().get(account).copied().unwrap_or(0)
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn compensate_attempts(&self, sub_tx_id: &str) -> u32 {
        self.compensate_attempts
            .lock()
            .unwrap()
            .get(sub_tx_id)
            .copied()
            .unwrap_or(0)
    }

    fn act(&self, sub_tx_id: &str, account: &str, amount: i64) -> anyhow::Result<()> {
        if self.fail_actions.lock().unwrap().contains(sub_tx_id) {
            anyhow::bail!("action '{sub_tx_id}' rejected");
        }
        let delta = if sub_tx_id == "out" { -amount } else { amount };
        *self.balances.lock().unwrap().entry(account.to_string()).or_insert(0) += delta;
        self.journal
            .lock()
            .unwrap()
            .push(format!("{sub_tx_id} {account} {amount}"));
        Ok(())
    }

    fn undo(&self, sub_tx_id: &str, account: &str, amount: i64) -> anyhow::Result<()> {
        *self
            .compensate_attempts
            .lock()
            .unwrap()
            .entry(sub_tx_id.to_string())
            .or_insert(0) += 1;
        if self.fail_compensations.lock().unwrap().contains(sub_tx_id) {
            anyhow::bail!("compensation '{sub_tx_id}' rejected");
        }
        let delta = if sub_tx_id == "out" { amount } else { -amount };
        *self.balances.lock().unwrap().entry(account.to_string()).or_insert(0) += delta;
        self.journal
            .lock()
            .unwrap()
            .push(format!("undo {sub_tx_id} {account} {amount}"));
        Ok(())
    }
}

/// Register the `out` and `in` transfer sub-transactions against `ledger`.
fn register_transfers(sec: &ExecutionCoordinator, ledger: &Arc<Ledger>) {
    for sub_tx_id in ["out", "in"] {
        let act = {
            let ledger = ledger.clone();
            move |_ctx: SagaContext, account: String, amount: i64| {
                let ledger = ledger.clone();
                async move { ledger.act(sub_tx_id, &account, amount) }
            }
        };
        let undo = {
            let ledger = ledger.clone();
            move |_ctx: SagaContext, account: String, amount: i64| {
                let ledger = ledger.clone();
                async move { ledger.undo(sub_tx_id, &account, amount) }
            }
        };
        sec.add_sub_tx(sub_tx_id, act, undo).expect("registration succeeds");
    }
}

fn coordinator() -> (Arc<MemoryStorage>, ExecutionCoordinator, Arc<Ledger>) {
    let storage = Arc::new(MemoryStorage::new("saga"));
    let sec = ExecutionCoordinator::new(storage.clone(), "saga");
    let ledger = Ledger::new();
    register_transfers(&sec, &ledger);
    (storage, sec, ledger)
}

async fn decoded_log(storage: &MemoryStorage, log_id: &str) -> Vec<LogRecord> {
    storage
        .lookup(log_id)
        .await
        .unwrap()
        .iter()
        .map(|payload| LogRecord::decode(payload).unwrap())
        .collect()
}

fn kinds(records: &[LogRecord]) -> Vec<(LogKind, Option<&str>)> {
    records
        .iter()
        .map(|record| (record.kind, record.sub_tx_id.as_deref()))
        .collect()
}

#[tokio::test]
async fn happy_path_commits_and_cleans_up() {
    let (storage, sec, ledger) = coordinator();

    let saga = sec.start_saga(SagaContext::new(), "tx-1").await;
    saga.exec_sub("out", ("A".to_string(), 50_i64))
        .await
        .exec_sub("in", ("B".to_string(), 50_i64))
        .await;

    let log = decoded_log(&storage, "sagatx-1").await;
    assert_eq!(
        kinds(&log),
        vec![
            (LogKind::SagaStart, None),
            (LogKind::ActionStart, Some("out")),
            (LogKind::ActionEnd, Some("out")),
            (LogKind::ActionStart, Some("in")),
            (LogKind::ActionEnd, Some("in")),
        ]
    );
    let out_params = log[2].params.as_ref().unwrap();
    assert_eq!(out_params[0].value, serde_json::json!("A"));
    assert_eq!(out_params[1].value, serde_json::json!(50));

    assert!(saga.end_saga().await.is_ok());
    assert!(storage.lookup("sagatx-1").await.unwrap().is_empty());
    assert_eq!(ledger.balance("A"), 50);
    assert_eq!(ledger.balance("B"), 50);
}

#[tokio::test]
async fn failed_second_action_rolls_back_the_first() {
    let (storage, sec, ledger) = coordinator();
    ledger.fail_action("in");

    let saga = sec.start_saga(SagaContext::new(), "tx-2").await;
    saga.exec_sub("out", ("A".to_string(), 50_i64))
        .await
        .exec_sub("in", ("B".to_string(), 50_i64))
        .await;

    let log = decoded_log(&storage, "sagatx-2").await;
    assert_eq!(
        kinds(&log),
        vec![
            (LogKind::SagaStart, None),
            (LogKind::ActionStart, Some("out")),
            (LogKind::ActionEnd, Some("out")),
            (LogKind::ActionStart, Some("in")),
            (LogKind::SagaAbort, None),
            (LogKind::CompensateStart, Some("out")),
            (LogKind::CompensateEnd, Some("out")),
        ]
    );

    let err = saga.end_saga().await.unwrap_err();
    assert!(matches!(&err, SagaError::ActionFailed { sub_tx_id, .. } if sub_tx_id == "in"));
    assert!(err.to_string().contains("action 'in' rejected"));

    assert!(storage.lookup("sagatx-2").await.unwrap().is_empty());
    assert_eq!(ledger.balance("A"), 100);
    assert_eq!(ledger.balance("B"), 0);
}

#[tokio::test]
async fn exhausted_compensation_latches_and_preserves_the_log() {
    let (storage, sec, ledger) = coordinator();
    ledger.fail_action("in");
    ledger.fail_compensation("out");

    let saga = sec.start_saga(SagaContext::new(), "tx-3").await;
    saga.exec_sub("out", ("A".to_string(), 50_i64))
        .await
        .exec_sub("in", ("B".to_string(), 50_i64))
        .await;

    assert_eq!(ledger.compensate_attempts("out"), 10);

    let err = saga.end_saga().await.unwrap_err();
    match &err {
        SagaError::CompensationFailed {
            sub_tx_id,
            attempts,
            cause,
            ..
        } => {
            assert_eq!(sub_tx_id, "out");
            assert_eq!(*attempts, 10);
            let cause = cause.as_deref().expect("action failure recorded as cause");
            assert!(cause.to_string().contains("action 'in' rejected"));
        }
        other => panic!("expected CompensationFailed, got {other:?}"),
    }

    // Log retained in full for manual recovery, and indexed.
    let log = decoded_log(&storage, "sagatx-3").await;
    assert_eq!(log.first().map(|r| r.kind), Some(LogKind::SagaStart));
    assert_eq!(log.last().map(|r| r.kind), Some(LogKind::SagaEnd));
    assert!(log.iter().any(|r| r.kind == LogKind::CompensateStart));
    assert!(log.iter().all(|r| r.kind != LogKind::CompensateEnd));

    let failures = storage.lookup("sagacompensate_failures").await.unwrap();
    assert_eq!(failures, vec!["sagatx-3"]);
}

#[tokio::test]
async fn caller_initiated_abort_compensates_and_ends_clean() {
    let (storage, sec, ledger) = coordinator();

    let saga = sec.start_saga(SagaContext::new(), "tx-4").await;
    saga.exec_sub("out", ("A".to_string(), 50_i64)).await;
    saga.abort().await;

    // Forward work after abort is a no-op: nothing new reaches the log.
    let records_after_abort = storage.lookup("sagatx-4").await.unwrap().len();
    saga.exec_sub("in", ("B".to_string(), 50_i64)).await;
    assert_eq!(
        storage.lookup("sagatx-4").await.unwrap().len(),
        records_after_abort
    );

    assert!(saga.end_saga().await.is_ok());
    assert!(storage.lookup("sagatx-4").await.unwrap().is_empty());
    assert_eq!(ledger.balance("A"), 100);
    assert_eq!(ledger.journal().last().unwrap(), "undo out A 50");
}

#[tokio::test]
async fn concurrent_groups_run_in_parallel_and_sequentially_within() {
    let (storage, sec, ledger) = coordinator();

    let saga = sec.start_saga(SagaContext::new(), "tx-5").await;
    saga.exec_sub_concurrent(vec![
        vec![
            ExecSubCall::new("out", ("A".to_string(), 10_i64)),
            ExecSubCall::new("out", ("A".to_string(), 20_i64)),
        ],
        vec![ExecSubCall::new("out", ("B".to_string(), 5_i64))],
    ])
    .await;

    let log = decoded_log(&storage, "sagatx-5").await;
    let action_ends: Vec<_> = log.iter().filter(|r| r.kind == LogKind::ActionEnd).collect();
    assert_eq!(action_ends.len(), 3);
    assert!(action_ends.iter().all(|r| r.params.is_some()));

    // Within the first group, `A 10` precedes `A 20`; group order is free.
    let journal = ledger.journal();
    let pos_10 = journal.iter().position(|e| e == "out A 10").unwrap();
    let pos_20 = journal.iter().position(|e| e == "out A 20").unwrap();
    assert!(pos_10 < pos_20);

    assert!(saga.end_saga().await.is_ok());
    assert_eq!(ledger.balance("A"), 70);
    assert_eq!(ledger.balance("B"), -5);
}

#[tokio::test]
async fn unknown_sub_tx_is_fatal_and_writes_nothing() {
    let (storage, sec, _ledger) = coordinator();

    let saga = sec.start_saga(SagaContext::new(), "tx-6").await;
    let ghost = {
        let saga = saga.clone();
        tokio::spawn(async move {
            saga.exec_sub("ghost", ()).await;
        })
    };

    let err = ghost.await.unwrap_err();
    assert!(err.is_panic());

    // Only the sagaStart record exists; the miss happened before any
    // actionStart was appended.
    let log = decoded_log(&storage, "sagatx-6").await;
    assert_eq!(kinds(&log), vec![(LogKind::SagaStart, None)]);
}

#[tokio::test]
async fn first_action_failure_needs_no_compensation() {
    let (storage, sec, ledger) = coordinator();
    ledger.fail_action("out");

    let saga = sec.start_saga(SagaContext::new(), "tx-7").await;
    saga.exec_sub("out", ("A".to_string(), 50_i64)).await;

    let log = decoded_log(&storage, "sagatx-7").await;
    assert_eq!(
        kinds(&log),
        vec![
            (LogKind::SagaStart, None),
            (LogKind::ActionStart, Some("out")),
            (LogKind::SagaAbort, None),
        ]
    );

    let err = saga.end_saga().await.unwrap_err();
    assert!(matches!(err, SagaError::ActionFailed { sub_tx_id, .. } if sub_tx_id == "out"));
    assert_eq!(ledger.balance("A"), 100);
}

#[tokio::test]
async fn concurrent_failure_aborts_sibling_groups() {
    let (storage, sec, ledger) = coordinator();
    ledger.fail_action("in");

    let saga = sec.start_saga(SagaContext::new(), "tx-8").await;
    saga.exec_sub_concurrent(vec![
        vec![
            ExecSubCall::new("in", ("B".to_string(), 5_i64)),
            ExecSubCall::new("out", ("A".to_string(), 10_i64)),
        ],
        vec![ExecSubCall::new("out", ("A".to_string(), 20_i64))],
    ])
    .await;

    let err = saga.end_saga().await.unwrap_err();
    assert!(matches!(err, SagaError::ActionFailed { sub_tx_id, .. } if sub_tx_id == "in"));

    // The failing group's second call never ran forward work, and the
    // failing action itself never committed.
    assert!(!ledger.journal().iter().any(|e| e == "out A 10"));
    assert_eq!(ledger.balance("B"), 0);
    assert!(storage.lookup("sagatx-8").await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_budget_is_configurable() {
    let storage = Arc::new(MemoryStorage::new("saga"));
    let sec = ExecutionCoordinator::with_config(
        storage.clone(),
        CoordinatorConfig {
            log_prefix: "saga".to_string(),
            compensate_retries: 3,
        },
    );
    let ledger = Ledger::new();
    register_transfers(&sec, &ledger);
    ledger.fail_action("in");
    ledger.fail_compensation("out");

    let saga = sec.start_saga(SagaContext::new(), "tx-9").await;
    saga.exec_sub("out", ("A".to_string(), 50_i64))
        .await
        .exec_sub("in", ("B".to_string(), 50_i64))
        .await;

    assert_eq!(ledger.compensate_attempts("out"), 3);
    let err = saga.end_saga().await.unwrap_err();
    assert!(matches!(err, SagaError::CompensationFailed { attempts: 3, .. }));
}

#[tokio::test]
async fn compensation_runs_detached_from_a_cancelled_caller() {
    let (storage, sec, ledger) = coordinator();
    ledger.fail_action("in");

    let observed = Arc::new(Mutex::new(None));
    let probe = {
        let observed = observed.clone();
        move |ctx: SagaContext, _account: String, _amount: i64| {
            let observed = observed.clone();
            async move {
                *observed.lock().unwrap() = Some(ctx.is_cancelled());
                Ok::<(), anyhow::Error>(())
            }
        }
    };
    let noop = |_ctx: SagaContext, _account: String, _amount: i64| async { Ok::<(), anyhow::Error>(()) };
    sec.add_sub_tx("probed", noop, probe).unwrap();

    let ctx = SagaContext::new();
    let saga = sec.start_saga(ctx.clone(), "tx-10").await;
    saga.exec_sub("probed", ("A".to_string(), 1_i64)).await;

    // The caller cancels before the failure that triggers rollback.
    ctx.cancel();
    saga.exec_sub("in", ("B".to_string(), 50_i64)).await;

    assert_eq!(*observed.lock().unwrap(), Some(false));
    let _ = saga.end_saga().await;
    let _ = storage;
}
