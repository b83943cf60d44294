use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::trace;

/// Lifecycle state of a compensator.
///
/// Status only ever moves forward: `Executing` → `FailedToExecute` →
/// `Compensating` → `Compensated` or `FailedToCompensate`. The two terminal
/// states share a rank, so neither can replace the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Status {
    /// Steps may be executed and compensations registered.
    Executing,
    /// A step failed and automatic compensation has not started yet.
    FailedToExecute,
    /// Compensations are being drained.
    Compensating,
    /// Every pending compensation ran successfully.
    Compensated,
    /// A compensation failed. The compensator can no longer be used.
    FailedToCompensate,
}

impl Status {
    fn rank(self) -> u8 {
        match self {
            Self::Executing => 0,
            Self::FailedToExecute => 1,
            Self::Compensating => 2,
            Self::Compensated | Self::FailedToCompensate => 3,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Compensated | Self::FailedToCompensate)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Executing => "executing",
            Self::FailedToExecute => "failed to execute",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::FailedToCompensate => "failed to compensate",
        };
        f.write_str(name)
    }
}

/// Status guarded by its own lock, advanced only forward.
#[derive(Debug)]
pub(crate) struct StatusCell {
    inner: Mutex<Status>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Status::Executing),
        }
    }

    pub(crate) fn get(&self) -> Status {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if it ranks above the current status.
    ///
    /// Returns the status in effect after the call.
    pub(crate) fn advance(&self, next: Status) -> Status {
        let mut current = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if next.rank() > current.rank() {
            *current = next;
        } else if next != *current {
            trace!(current = %*current, ignored = %next, "ignored backwards status transition");
        }
        *current
    }
}
