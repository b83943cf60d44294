use std::fmt::{self, Debug, Display};
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compensation::{Action, Compensated, Compensation, ValueCompensation};
use crate::error::{CompensatorError, RollbackFailure};
use crate::journal::{CompensationJournal, Journal};
use crate::stack::{CompensationStack, PendingCompensation};
use crate::status::{Status, StatusCell};
use crate::tag::Tag;
use crate::unwind::UnwindGuard;

/// Runs fallible steps and rolls back their compensations in reverse order.
///
/// Every step-registering call is serialized on an execution lock and only
/// allowed while the status is [`Status::Executing`]. When a step's body
/// fails, all compensations registered so far run before the error is
/// returned. The failing step's own compensation is never registered.
///
/// The lock is not re-entrant: calling back into the same compensator from
/// inside a step body deadlocks.
pub struct Compensator<E> {
    status: StatusCell,
    stack: CompensationStack<Action<E>>,
    journal: Journal,
    execution: Mutex<()>,
    compensation: Mutex<()>,
    cancellation: Option<CancellationToken>,
}

impl<E> Compensator<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: StatusCell::new(),
            stack: CompensationStack::new(),
            journal: Journal::default(),
            execution: Mutex::new(()),
            compensation: Mutex::new(()),
            cancellation: None,
        }
    }

    /// Create a compensator whose steps are refused once `token` is cancelled.
    ///
    /// Cancellation never interrupts a rollback in progress.
    #[must_use]
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: Some(token),
            ..Self::new()
        }
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Pending compensations in the order a rollback would run them.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingCompensation> {
        self.stack.pending()
    }

    #[must_use]
    pub fn journal(&self) -> CompensationJournal {
        self.journal.snapshot()
    }
}

impl<E> Default for Compensator<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Debug for Compensator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compensator")
            .field("status", &self.status())
            .field("pending", &self.stack.pending())
            .field("cancellable", &self.cancellation.is_some())
            .finish_non_exhaustive()
    }
}

impl<E> Compensator<E>
where
    E: Debug + Display + Send + 'static,
{
    /// Reserve a rollback slot at the current top of the stack.
    ///
    /// # Errors
    ///
    /// Returns a status error unless the compensator is executing.
    pub fn create_tag(&self, label: Option<&str>) -> Result<Tag, CompensatorError<E>> {
        self.step(None, || {
            let tag = self.stack.add_tag(label);
            debug!(tag = tag.label(), "created tag");
            Ok(tag)
        })
    }

    /// Register a compensation without running anything.
    ///
    /// # Errors
    ///
    /// Returns a status error unless the compensator is executing, or
    /// [`CompensatorError::TagNotFound`] for a dead tag.
    pub fn add_compensation<C>(
        &self,
        compensation: C,
        tag: Option<&Tag>,
    ) -> Result<(), CompensatorError<E>>
    where
        C: FnOnce() -> Result<(), E> + Send + 'static,
    {
        self.step(tag, || self.register(Compensation::new(compensation), tag))
    }

    /// Run `execution`, then register `compensation` if it succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`CompensatorError::Execution`] if `execution` failed and the
    /// rollback succeeded, or [`CompensatorError::Compensation`] if the
    /// rollback failed too.
    pub fn execute<F>(
        &self,
        execution: F,
        compensation: Compensation<E>,
        tag: Option<&Tag>,
    ) -> Result<(), CompensatorError<E>>
    where
        F: FnOnce() -> Result<(), E>,
    {
        self.step(tag, || {
            execution().map_err(CompensatorError::Execution)?;
            self.register(compensation, tag)
        })
    }

    /// Run `execution` and register `compensation` only if `test` passes.
    ///
    /// Returns whether the step ran.
    ///
    /// # Errors
    ///
    /// A failing `test` is handled like a failing `execution`.
    pub fn execute_if<P, F>(
        &self,
        test: P,
        execution: F,
        compensation: Compensation<E>,
        tag: Option<&Tag>,
    ) -> Result<bool, CompensatorError<E>>
    where
        P: FnOnce() -> Result<bool, E>,
        F: FnOnce() -> Result<(), E>,
    {
        self.step(tag, || {
            if !test().map_err(CompensatorError::Execution)? {
                return Ok(false);
            }
            execution().map_err(CompensatorError::Execution)?;
            self.register(compensation, tag)?;
            Ok(true)
        })
    }

    /// Run `execution` and register `compensation` bound to its result.
    ///
    /// The result is cloned so both the caller and the compensation get it.
    /// For results that cannot be cloned, such as handles, use
    /// [`Compensator::run`] and build the compensation inside the step.
    ///
    /// # Errors
    ///
    /// Same as [`Compensator::execute`].
    pub fn get<T, F>(
        &self,
        execution: F,
        compensation: ValueCompensation<T, E>,
        tag: Option<&Tag>,
    ) -> Result<T, CompensatorError<E>>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        self.step(tag, || {
            let value = execution().map_err(CompensatorError::Execution)?;
            if !compensation.is_none() {
                self.register(compensation.bind(value.clone()), tag)?;
            }
            Ok(value)
        })
    }

    /// Run a step that produces both its result and its own compensation.
    ///
    /// # Errors
    ///
    /// Same as [`Compensator::execute`].
    pub fn run<T, F>(&self, execution: F, tag: Option<&Tag>) -> Result<T, CompensatorError<E>>
    where
        F: FnOnce() -> Result<Compensated<T, E>, E>,
    {
        self.step(tag, || {
            let Compensated {
                value,
                compensation,
            } = execution().map_err(CompensatorError::Execution)?;
            self.register(compensation, tag)?;
            Ok(value)
        })
    }

    /// Run `execution` for each item, registering `compensation` bound to
    /// every item that succeeded.
    ///
    /// # Errors
    ///
    /// Stops at the first failing item. Only items before it have
    /// compensations registered, and those run before the error is returned.
    pub fn foreach<I, F>(
        &self,
        items: I,
        execution: F,
        compensation: ValueCompensation<I::Item, E>,
        tag: Option<&Tag>,
    ) -> Result<(), CompensatorError<E>>
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        F: FnMut(&I::Item) -> Result<(), E>,
    {
        self.try_foreach(items.into_iter().map(Ok), execution, compensation, tag)
    }

    /// Like [`Compensator::foreach`], for item sources that can fail while
    /// being enumerated. An `Err` item is handled like a failing execution.
    ///
    /// # Errors
    ///
    /// Same as [`Compensator::foreach`].
    pub fn try_foreach<I, T, F>(
        &self,
        items: I,
        mut execution: F,
        compensation: ValueCompensation<T, E>,
        tag: Option<&Tag>,
    ) -> Result<(), CompensatorError<E>>
    where
        I: IntoIterator<Item = Result<T, E>>,
        T: Send + 'static,
        F: FnMut(&T) -> Result<(), E>,
    {
        self.step(tag, || {
            for item in items {
                let item = item.map_err(CompensatorError::Execution)?;
                execution(&item).map_err(CompensatorError::Execution)?;
                self.register(compensation.bind(item), tag)?;
            }
            Ok(())
        })
    }

    /// Discard every pending compensation without running it.
    ///
    /// # Errors
    ///
    /// Returns a status error unless the compensator is executing.
    pub fn commit(&self) -> Result<(), CompensatorError<E>> {
        self.step(None, || {
            let discarded = self.stack.clear();
            self.journal.record_committed();
            debug!(discarded, "committed compensations");
            Ok(())
        })
    }

    /// Run every pending compensation, most recent first.
    ///
    /// Calling this again after a successful rollback does nothing. A
    /// compensation that panics ends the rollback like one that failed: the
    /// panic propagates and the compensator is left
    /// [`Status::FailedToCompensate`].
    ///
    /// # Errors
    ///
    /// Returns [`CompensatorError::Compensation`] if a compensation fails;
    /// the remaining ones are abandoned. Once that has happened, every
    /// further call returns a status error.
    pub fn compensate(&self) -> Result<(), CompensatorError<E>> {
        self.run_compensation()
            .map_err(|failure| failure.into_error(None))
    }

    fn guard(&self) -> Result<(), CompensatorError<E>> {
        if self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(CompensatorError::Cancelled);
        }
        match self.status.get() {
            Status::Executing => Ok(()),
            status => Err(CompensatorError::Status(status)),
        }
    }

    fn register(
        &self,
        compensation: Compensation<E>,
        tag: Option<&Tag>,
    ) -> Result<(), CompensatorError<E>> {
        if let Some(action) = compensation.into_action() {
            let sequence = self.stack.add_compensation(action, tag)?;
            self.journal.record_registered(sequence, tag);
            debug!(sequence, tag = tag.map(Tag::label), "registered compensation");
        }
        Ok(())
    }

    fn step<T>(
        &self,
        tag: Option<&Tag>,
        body: impl FnOnce() -> Result<T, CompensatorError<E>>,
    ) -> Result<T, CompensatorError<E>> {
        self.guard()?;
        self.stack.validate_tag(tag)?;

        let execution = self.execution.lock().unwrap_or_else(PoisonError::into_inner);
        self.guard()?;
        self.stack.validate_tag(tag)?;

        match body() {
            Err(CompensatorError::Execution(error)) => {
                self.status.advance(Status::FailedToExecute);
                drop(execution);
                warn!(%error, "step failed, compensating");
                Err(match self.run_compensation() {
                    Ok(()) => CompensatorError::Execution(error),
                    Err(failure) => failure.into_error(Some(error)),
                })
            }
            result => result,
        }
    }

    fn finished(&self) -> Option<Result<(), RollbackFailure<E>>> {
        match self.status.get() {
            Status::Compensated => Some(Ok(())),
            Status::FailedToCompensate => Some(Err(RollbackFailure::Status(
                Status::FailedToCompensate,
            ))),
            _ => None,
        }
    }

    fn run_compensation(&self) -> Result<(), RollbackFailure<E>> {
        if let Some(result) = self.finished() {
            return result;
        }
        let _compensation = self
            .compensation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = self.finished() {
            return result;
        }

        self.status.advance(Status::Compensating);
        let _execution = self.execution.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(pending = self.stack.len(), "compensating");

        while let Some((pending, action)) = self.stack.try_pop() {
            debug!(
                sequence = pending.sequence,
                tag = pending.tag.as_ref().map(Tag::label),
                "running compensation"
            );
            let unwind = UnwindGuard::new(&self.status, &self.journal, pending.sequence);
            let result = action();
            unwind.disarm();
            if let Err(error) = result {
                self.journal.record_compensation_failed(pending.sequence);
                self.status.advance(Status::FailedToCompensate);
                warn!(
                    sequence = pending.sequence,
                    abandoned = self.stack.len(),
                    %error,
                    "compensation failed"
                );
                return Err(RollbackFailure::Compensation(error));
            }
            self.journal.record_compensated(pending.sequence);
        }

        self.status.advance(Status::Compensated);
        debug!("compensated");
        Ok(())
    }
}
