use tracing::warn;

use crate::journal::Journal;
use crate::status::{Status, StatusCell};

/// Armed while a compensation runs.
///
/// Dropped without [`UnwindGuard::disarm`], which only happens when the
/// compensation panicked, it ends the rollback the same way a returned error
/// does: the entry is marked failed, the rest are abandoned and the status
/// moves to [`Status::FailedToCompensate`].
pub(crate) struct UnwindGuard<'a> {
    status: &'a StatusCell,
    journal: &'a Journal,
    sequence: u64,
    armed: bool,
}

impl<'a> UnwindGuard<'a> {
    pub(crate) fn new(status: &'a StatusCell, journal: &'a Journal, sequence: u64) -> Self {
        Self {
            status,
            journal,
            sequence,
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.journal.record_compensation_failed(self.sequence);
            self.status.advance(Status::FailedToCompensate);
            warn!(sequence = self.sequence, "compensation panicked");
        }
    }
}
