//! Lifecycle of a fetch operation.

use std::fmt;

/// State of the [`RegionFetcher`](super::RegionFetcher).
///
/// ```text
/// Idle ──fetch()──► Fetching ──all workers done, no abort──► Completing ──► Committed
///                      │
///                      └──abort raised──► Aborting ──cleanup done──► Aborted
/// ```
///
/// `Committed` and `Aborted` are terminal for one operation; a new `fetch()`
/// starts over from either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OperationState {
    #[default]
    Idle,
    Fetching,
    Completing,
    Aborting,
    Committed,
    Aborted,
}

impl OperationState {
    /// Whether an operation is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Fetching | Self::Completing | Self::Aborting)
    }

    /// Whether the last operation has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Completing => "completing",
            Self::Aborting => "aborting",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}
