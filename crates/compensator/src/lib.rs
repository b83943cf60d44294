//! Compensation coordinator for multi-step operations.
//!
//! A [`Compensator`] runs fallible steps one at a time and records a
//! compensation for each step that succeeded. When a step fails, or when
//! [`Compensator::compensate`] is called, the recorded compensations run in
//! reverse order. [`Tag`]s reserve a slot in that order so compensations
//! registered later can still roll back alongside earlier work.
//!
//! [`AsyncCompensator`] offers the same operations for futures.

mod asynchronous;
mod compensation;
mod error;
mod journal;
mod stack;
mod status;
mod sync;
mod tag;
mod unwind;

pub use asynchronous::AsyncCompensator;
pub use compensation::{
    AsyncCompensated, AsyncCompensation, AsyncValueCompensation, Compensated, Compensation,
    ValueCompensation,
};
pub use error::{CompensationError, CompensatorError, TagNotFound};
pub use journal::{CompensationJournal, EntryStatus, JournalEntry};
pub use stack::{CompensationStack, PendingCompensation};
pub use status::Status;
pub use sync::Compensator;
pub use tag::Tag;
