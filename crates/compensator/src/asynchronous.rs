use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, poll_fn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compensation::{AsyncAction, AsyncCompensated, AsyncCompensation, AsyncValueCompensation};
use crate::error::{CompensatorError, RollbackFailure};
use crate::journal::{CompensationJournal, Journal};
use crate::stack::{CompensationStack, PendingCompensation};
use crate::status::{Status, StatusCell};
use crate::tag::Tag;
use crate::unwind::UnwindGuard;

/// Suspending counterpart of [`Compensator`](crate::Compensator).
///
/// Steps, tests and compensations are futures. The coordinator never spawns
/// tasks of its own: everything runs on the calling task, which may yield
/// while waiting for a lock or for a user future.
pub struct AsyncCompensator<E> {
    status: StatusCell,
    stack: CompensationStack<Undo<E>>,
    journal: Journal,
    execution: Mutex<()>,
    compensation: Mutex<()>,
    cancellation: Option<CancellationToken>,
}

/// A compensation on the stack: not started yet, or interrupted mid-run.
enum Undo<E> {
    Ready(AsyncAction<E>),
    Running(BoxFuture<'static, Result<(), E>>),
}

/// A compensation taken off the stack to run.
///
/// If the rollback is dropped before the compensation finishes, the
/// unfinished future goes back on top of the stack and the next rollback
/// resumes it.
struct InFlight<'a, E> {
    compensator: &'a AsyncCompensator<E>,
    pending: PendingCompensation,
    undo: Option<Undo<E>>,
}

impl<E> InFlight<'_, E> {
    fn poll_undo(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), E>> {
        let Some(undo) = self.undo.take() else {
            return Poll::Ready(Ok(()));
        };
        let unwind = UnwindGuard::new(
            &self.compensator.status,
            &self.compensator.journal,
            self.pending.sequence,
        );
        let mut future = match undo {
            Undo::Ready(action) => action(),
            Undo::Running(future) => future,
        };
        let poll = future.poll_unpin(cx);
        unwind.disarm();
        if poll.is_pending() {
            self.undo = Some(Undo::Running(future));
        }
        poll
    }
}

impl<E> Drop for InFlight<'_, E> {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            debug!(
                sequence = self.pending.sequence,
                "rollback interrupted, compensation kept on the stack"
            );
            self.compensator.stack.restore(self.pending.clone(), undo);
        }
    }
}

impl<E> AsyncCompensator<E> {
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

    #[must_use]
    pub fn pending(&self) -> Vec<PendingCompensation> {
        self.stack.pending()
    }

    #[must_use]
    pub fn journal(&self) -> CompensationJournal {
        self.journal.snapshot()
    }
}

impl<E> Default for AsyncCompensator<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Debug for AsyncCompensator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCompensator")
            .field("status", &self.status())
            .field("pending", &self.stack.pending())
            .field("cancellable", &self.cancellation.is_some())
            .finish_non_exhaustive()
    }
}

impl<E> AsyncCompensator<E>
where
    E: Debug + Display + Send + 'static,
{
    /// # Errors
    ///
    /// Returns a status error unless the compensator is executing.
    pub async fn create_tag(&self, label: Option<&str>) -> Result<Tag, CompensatorError<E>> {
        self.step(None, async {
            let tag = self.stack.add_tag(label);
            debug!(tag = tag.label(), "created tag");
            Ok(tag)
        })
        .await
    }

    /// # Errors
    ///
    /// Returns a status error unless the compensator is executing, or
    /// [`CompensatorError::TagNotFound`] for a dead tag.
    pub async fn add_compensation<C, Fut>(
        &self,
        compensation: C,
        tag: Option<&Tag>,
    ) -> Result<(), CompensatorError<E>>
    where
        C: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.step(tag, async {
            self.register(AsyncCompensation::new(compensation), tag)
        })
        .await
    }

    /// # Errors
    ///
    /// See [`Compensator::execute`](crate::Compensator::execute).
    pub async fn execute<F, Fut>(
        &self,
        execution: F,
        compensation: AsyncCompensation<E>,
        tag: Option<&Tag>,
    ) -> Result<(), CompensatorError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.step(tag, async {
            execution().await.map_err(CompensatorError::Execution)?;
            self.register(compensation, tag)
        })
        .await
    }

    /// Returns whether the step ran.
    ///
    /// # Errors
    ///
    /// A failing `test` is handled like a failing `execution`.
    pub async fn execute_if<P, PFut, F, Fut>(
        &self,
        test: P,
        execution: F,
        compensation: AsyncCompensation<E>,
        tag: Option<&Tag>,
    ) -> Result<bool, CompensatorError<E>>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<bool, E>>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.step(tag, async {
            if !test().await.map_err(CompensatorError::Execution)? {
                return Ok(false);
            }
            execution().await.map_err(CompensatorError::Execution)?;
            self.register(compensation, tag)?;
            Ok(true)
        })
        .await
    }

    /// The result is cloned so both the caller and the compensation get it.
    /// Use [`AsyncCompensator::run`] for results that cannot be cloned.
    ///
    /// # Errors
    ///
    /// See [`Compensator::get`](crate::Compensator::get).
    pub async fn get<T, F, Fut>(
        &self,
        execution: F,
        compensation: AsyncValueCompensation<T, E>,
        tag: Option<&Tag>,
    ) -> Result<T, CompensatorError<E>>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.step(tag, async {
            let value = execution().await.map_err(CompensatorError::Execution)?;
            if !compensation.is_none() {
                self.register(compensation.bind(value.clone()), tag)?;
            }
            Ok(value)
        })
        .await
    }

    /// # Errors
    ///
    /// See [`Compensator::run`](crate::Compensator::run).
    pub async fn run<T, F, Fut>(
        &self,
        execution: F,
        tag: Option<&Tag>,
    ) -> Result<T, CompensatorError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AsyncCompensated<T, E>, E>>,
    {
        self.step(tag, async {
            let AsyncCompensated {
                value,
                compensation,
            } = execution().await.map_err(CompensatorError::Execution)?;
            self.register(compensation, tag)?;
            Ok(value)
        })
        .await
    }

    /// Each item is handed to `execution` by clone and kept for its
    /// compensation.
    ///
    /// # Errors
    ///
    /// See [`Compensator::foreach`](crate::Compensator::foreach).
    pub async fn foreach<I, F, Fut>(
        &self,
        items: I,
        execution: F,
        compensation: AsyncValueCompensation<I::Item, E>,
        tag: Option<&Tag>,
    ) -> Result<(), CompensatorError<E>>
    where
        I: IntoIterator,
        I::Item: Clone + Send + 'static,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.try_foreach(items.into_iter().map(Ok), execution, compensation, tag)
            .await
    }

    /// # Errors
    ///
    /// See [`Compensator::try_foreach`](crate::Compensator::try_foreach).
    pub async fn try_foreach<I, T, F, Fut>(
        &self,
        items: I,
        mut execution: F,
        compensation: AsyncValueCompensation<T, E>,
        tag: Option<&Tag>,
    ) -> Result<(), CompensatorError<E>>
    where
        I: IntoIterator<Item = Result<T, E>>,
        T: Clone + Send + 'static,
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.step(tag, async {
            for item in items {
                let item = item.map_err(CompensatorError::Execution)?;
                execution(item.clone())
                    .await
                    .map_err(CompensatorError::Execution)?;
                self.register(compensation.bind(item), tag)?;
            }
            Ok(())
        })
        .await
    }

    /// # Errors
    ///
    /// Returns a status error unless the compensator is executing.
    pub async fn commit(&self) -> Result<(), CompensatorError<E>> {
        self.step(None, async {
            let discarded = self.stack.clear();
            self.journal.record_committed();
            debug!(discarded, "committed compensations");
            Ok(())
        })
        .await
    }

    /// Run every pending compensation, most recent first.
    ///
    /// Dropping the returned future stops the rollback without losing
    /// anything: a compensation cut off mid-run stays on the stack, and the
    /// next call resumes it before moving on.
    ///
    /// # Errors
    ///
    /// See [`Compensator::compensate`](crate::Compensator::compensate).
    pub async fn compensate(&self) -> Result<(), CompensatorError<E>> {
        self.run_compensation()
            .await
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
        compensation: AsyncCompensation<E>,
        tag: Option<&Tag>,
    ) -> Result<(), CompensatorError<E>> {
        if let Some(action) = compensation.into_action() {
            let sequence = self.stack.add_compensation(Undo::Ready(action), tag)?;
            self.journal.record_registered(sequence, tag);
            debug!(sequence, tag = tag.map(Tag::label), "registered compensation");
        }
        Ok(())
    }

    async fn step<T>(
        &self,
        tag: Option<&Tag>,
        body: impl Future<Output = Result<T, CompensatorError<E>>>,
    ) -> Result<T, CompensatorError<E>> {
        self.guard()?;
        self.stack.validate_tag(tag)?;

        let execution = self.execution.lock().await;
        self.guard()?;
        self.stack.validate_tag(tag)?;

        match body.await {
            Err(CompensatorError::Execution(error)) => {
                self.status.advance(Status::FailedToExecute);
                drop(execution);
                warn!(%error, "step failed, compensating");
                Err(match self.run_compensation().await {
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

    async fn run_compensation(&self) -> Result<(), RollbackFailure<E>> {
        if let Some(result) = self.finished() {
            return result;
        }
        let _compensation = self.compensation.lock().await;
        if let Some(result) = self.finished() {
            return result;
        }

        self.status.advance(Status::Compensating);
        let _execution = self.execution.lock().await;
        debug!(pending = self.stack.len(), "compensating");

        while let Some((pending, undo)) = self.stack.try_pop() {
            debug!(
                sequence = pending.sequence,
                tag = pending.tag.as_ref().map(Tag::label),
                "running compensation"
            );
            let mut in_flight = InFlight {
                compensator: self,
                pending: pending.clone(),
                undo: Some(undo),
            };
            let result = poll_fn(|cx| in_flight.poll_undo(cx)).await;
            drop(in_flight);
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
