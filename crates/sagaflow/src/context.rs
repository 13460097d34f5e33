//! Execution context handed to saga actions.

use tokio_util::sync::CancellationToken;

/// Context passed as the first argument to every action and compensation.
///
/// Carries the caller's cancellation signal on the forward path. Cancellation
/// is advisory: actions observe it via [`is_cancelled`](Self::is_cancelled) or
/// [`cancelled`](Self::cancelled), but the saga itself keeps running until the
/// caller invokes [`Saga::abort`](crate::Saga::abort). Compensations never see
/// this token; rollback runs under a fresh, detached context even when the
/// original request has long been cancelled.
#[derive(Debug, Clone, Default)]
pub struct SagaContext {
    cancel: CancellationToken,
}

impl SagaContext {
    /// A context with its own, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing cancellation token, e.g. one derived from a request.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Context detached from any caller cancellation, used for rollback.
    pub(crate) fn detached() -> Self {
        Self::new()
    }

    /// Signal cancellation to every operation holding a clone of this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// The underlying token, for bridging into other tokio-util aware code.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}
