use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::tag::Tag;

/// What became of a registered compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EntryStatus {
    /// Registered and waiting on the stack.
    Pending,
    /// Ran successfully during rollback.
    Compensated,
    /// Returned an error during rollback.
    CompensationFailed,
    /// Discarded by a commit without running.
    Committed,
    /// Never run because an earlier compensation failed.
    Abandoned,
}

/// Record of one registered compensation.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    /// Registration sequence number, matching the stack's.
    pub sequence: u64,
    /// Label of the tag the compensation was pinned to.
    pub tag: Option<String>,
    pub status: EntryStatus,
    pub registered_at: Instant,
    /// When the compensation ran, failed, or was discarded.
    pub completed_at: Option<Instant>,
}

/// Snapshot of a compensator's journal.
#[derive(Debug, Clone, Default)]
pub struct CompensationJournal {
    entries: Vec<JournalEntry>,
}

impl CompensationJournal {
    /// Entries in registration order.
    #[must_use]
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    #[must_use]
    pub fn entry(&self, sequence: u64) -> Option<&JournalEntry> {
        self.entries.iter().find(|entry| entry.sequence == sequence)
    }

    /// Sequence numbers of entries with the given status, in registration order.
    #[must_use]
    pub fn with_status(&self, status: EntryStatus) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.sequence)
            .collect()
    }

    /// One line per entry, for display.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for entry in &self.entries {
            let glyph = match entry.status {
                EntryStatus::Pending => "…",
                EntryStatus::Compensated => "↩",
                EntryStatus::CompensationFailed => "⚠",
                EntryStatus::Committed => "✓",
                EntryStatus::Abandoned => "✗",
            };
            match &entry.tag {
                Some(tag) => lines.push(format!("{glyph} #{} [{tag}]", entry.sequence)),
                None => lines.push(format!("{glyph} #{}", entry.sequence)),
            }
        }
        lines.join("\n")
    }
}

/// Journal shared by a coordinator's operations.
#[derive(Debug, Default)]
pub(crate) struct Journal {
    inner: Mutex<CompensationJournal>,
}

impl Journal {
    fn update(&self, f: impl FnOnce(&mut Vec<JournalEntry>)) {
        let mut journal = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut journal.entries);
    }

    pub(crate) fn snapshot(&self) -> CompensationJournal {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn record_registered(&self, sequence: u64, tag: Option<&Tag>) {
        self.update(|entries| {
            entries.push(JournalEntry {
                sequence,
                tag: tag.map(|tag| tag.label().to_string()),
                status: EntryStatus::Pending,
                registered_at: Instant::now(),
                completed_at: None,
            });
        });
    }

    pub(crate) fn record_compensated(&self, sequence: u64) {
        self.complete(sequence, EntryStatus::Compensated);
    }

    /// Mark `sequence` failed and every other pending entry abandoned.
    pub(crate) fn record_compensation_failed(&self, sequence: u64) {
        self.update(|entries| {
            let now = Instant::now();
            for entry in entries.iter_mut() {
                if entry.status != EntryStatus::Pending {
                    continue;
                }
                entry.status = if entry.sequence == sequence {
                    EntryStatus::CompensationFailed
                } else {
                    EntryStatus::Abandoned
                };
                entry.completed_at = Some(now);
            }
        });
    }

    /// Mark every pending entry committed.
    ///
    /// Entries settled before this commit are dropped, so a compensator that
    /// keeps committing only remembers its latest round.
    pub(crate) fn record_committed(&self) {
        self.update(|entries| {
            entries.retain(|entry| entry.status == EntryStatus::Pending);
            let now = Instant::now();
            for entry in entries
                .iter_mut()
                .filter(|entry| entry.status == EntryStatus::Pending)
            {
                entry.status = EntryStatus::Committed;
                entry.completed_at = Some(now);
            }
        });
    }

    fn complete(&self, sequence: u64, status: EntryStatus) {
        self.update(|entries| {
            if let Some(entry) = entries.iter_mut().find(|entry| entry.sequence == sequence) {
                entry.status = status;
                entry.completed_at = Some(Instant::now());
            }
        });
    }
}
