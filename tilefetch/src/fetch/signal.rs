//! Shared cancellation signal with first-writer-wins abort reason.

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::error::AbortReason;

#[derive(Debug, Default)]
struct SignalState {
    reason: Option<AbortReason>,
    sealed: bool,
    purge_requested: bool,
}

/// Cancellation signal shared by every worker of one fetch operation.
///
/// Raising the signal records an [`AbortReason`] and cancels the token in one
/// step. Only the first raise takes effect. Once the operation is sealed for
/// commit, further raises are ignored.
#[derive(Debug, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    state: Mutex<SignalState>,
}

impl AbortSignal {
    /// Create an un-raised signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason` and cancel, unless a reason is already set or the
    /// operation is sealed.
    ///
    /// Returns `true` if this call recorded the reason.
    pub fn raise(&self, reason: AbortReason) -> bool {
        let mut state = self.state.lock();
        if state.sealed || state.reason.is_some() {
            return false;
        }
        state.reason = Some(reason);
        self.token.cancel();
        true
    }

    /// Whether the signal has been raised.
    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded abort reason, if any.
    pub fn reason(&self) -> Option<AbortReason> {
        self.state.lock().reason
    }

    /// Seal the signal for commit.
    ///
    /// Succeeds only if no reason was recorded; afterwards `raise` is a no-op.
    pub fn seal(&self) -> bool {
        let mut state = self.state.lock();
        if state.reason.is_some() {
            return false;
        }
        state.sealed = true;
        true
    }

    /// Ask the abort path to delete unlinked tiles during cleanup.
    pub fn request_purge(&self) {
        self.state.lock().purge_requested = true;
    }

    /// Whether an unlinked-tile purge was requested.
    pub fn purge_requested(&self) -> bool {
        self.state.lock().purge_requested
    }

    /// Future that resolves once the signal is raised.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
