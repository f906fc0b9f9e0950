//! Per-call context shared by the RPC client and server.

use tokio_util::sync::CancellationToken;

use crate::deadline::DeadlineContext;
use crate::status::RpcStatus;

/// Cancellation and deadline state of one call.
///
/// The token is cancelled when the peer sends a cancel frame or its
/// connection drops. Both conditions surface as `DEADLINE_EXCEEDED`.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: DeadlineContext,
    token: CancellationToken,
}

impl CallContext {
    /// Creates a context from a deadline and a cancellation token.
    pub fn new(deadline: DeadlineContext, token: CancellationToken) -> Self {
        Self { deadline, token }
    }

    /// A context that never expires on its own.
    pub fn detached() -> Self {
        Self::new(DeadlineContext::new(), CancellationToken::new())
    }

    /// True once the call was cancelled or its deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_expired()
    }

    /// `Err(DEADLINE_EXCEEDED)` once cancelled or expired.
    pub fn check(&self) -> Result<(), RpcStatus> {
        if self.token.is_cancelled() {
            return Err(RpcStatus::deadline_exceeded("call cancelled by client"));
        }
        self.deadline.check()
    }

    /// Resolves when the call is cancelled or its deadline fires.
    pub async fn cancelled(&self) {
        match self.deadline.deadline() {
            Some(deadline) => {
                let at = tokio::time::Instant::from_std(deadline.instant());
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Cancels the call.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The call's deadline.
    pub fn deadline(&self) -> &DeadlineContext {
        &self.deadline
    }

    /// The call's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
