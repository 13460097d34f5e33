//! Error types shared across the coordinator and saga state machine.

use thiserror::Error;

/// Misconfiguration detected while wiring sub-transactions.
///
/// These are programming errors, surfaced at registration time so a broken
/// setup never reaches forward execution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sub-transaction '{0}' is already registered")]
    DuplicateSubTx(String),

    #[error("param type name '{name}' is already registered for a different type")]
    ParamNameCollision { name: &'static str },
}

/// Outcome of a failed saga, returned from [`Saga::end_saga`](crate::Saga::end_saga).
#[derive(Debug, Error)]
pub enum SagaError {
    /// An action failed and rollback completed: every previously committed
    /// sub-transaction was compensated and the saga log was cleaned up.
    #[error("sub-transaction '{sub_tx_id}' failed: {source}")]
    ActionFailed {
        sub_tx_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A compensation exhausted its retry budget. Rollback is incomplete: the
    /// saga log is retained and the log id was appended to the
    /// compensate-failures index for manual recovery.
    #[error("compensation for '{sub_tx_id}' gave up after {attempts} attempts: {source}")]
    CompensationFailed {
        /// Sub-transaction whose compensation gave up.
        sub_tx_id: String,
        /// Attempts made before giving up.
        attempts: u32,
        /// Last error the compensation returned.
        #[source]
        source: anyhow::Error,
        /// The action failure that triggered rollback, absent when the abort
        /// was caller-initiated.
        cause: Option<Box<SagaError>>,
    },
}

impl SagaError {
    /// The action failure that started rollback, if any.
    ///
    /// For [`SagaError::ActionFailed`] this is the error itself; for
    /// [`SagaError::CompensationFailed`] it is the recorded cause.
    pub fn action_error(&self) -> Option<&SagaError> {
        match self {
            SagaError::ActionFailed { .. } => Some(self),
            SagaError::CompensationFailed { cause, .. } => cause.as_deref(),
        }
    }
}
