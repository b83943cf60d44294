use std::fmt::{self, Debug, Display};

use thiserror::Error;

use crate::status::Status;
use crate::tag::Tag;

/// A tag that no longer owns a group on the compensation stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tag '{0}' not found on the compensation stack")]
pub struct TagNotFound(pub Tag);

/// Error from a failed compensation.
///
/// Carries the error that triggered the rollback, if the rollback was
/// automatic, and the error the failing compensation returned.
#[derive(Debug)]
pub struct CompensationError<E> {
    /// Error from the step whose failure triggered the rollback.
    /// `None` when the rollback was requested explicitly.
    pub while_executing: Option<E>,
    /// Error returned by the compensation that failed.
    pub while_compensating: E,
}

impl<E: Display> Display for CompensationError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.while_executing {
            Some(executing) => write!(
                f,
                "execution failed ({executing}), and compensation also failed ({})",
                self.while_compensating
            ),
            None => write!(f, "compensation failed ({})", self.while_compensating),
        }
    }
}

impl<E> std::error::Error for CompensationError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.while_compensating)
    }
}

/// Error from a compensator operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompensatorError<E: Debug + Display> {
    /// The operation is not allowed in the compensator's current status.
    #[error("compensator is {0}")]
    Status(Status),

    /// A tag was given that no longer owns a group.
    #[error(transparent)]
    TagNotFound(#[from] TagNotFound),

    /// The compensator's cancellation token was triggered.
    #[error("compensator was cancelled")]
    Cancelled,

    /// A step failed. Previously registered compensations were run
    /// successfully before this error was returned.
    #[error("step failed: {0}")]
    Execution(E),

    /// A compensation failed. The compensator is now unusable.
    #[error(transparent)]
    Compensation(CompensationError<E>),
}

impl<E: Debug + Display> CompensatorError<E> {
    /// The status carried by a [`CompensatorError::Status`] error.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Status(status) => Some(*status),
            _ => None,
        }
    }

    /// The user error behind this error, if it came from a step.
    ///
    /// For compensation failures this is the triggering step error.
    #[must_use]
    pub fn execution_error(&self) -> Option<&E> {
        match self {
            Self::Execution(error) => Some(error),
            Self::Compensation(error) => error.while_executing.as_ref(),
            _ => None,
        }
    }

    /// Convert into the step error, if this error came from a step.
    #[must_use]
    pub fn into_execution_error(self) -> Option<E> {
        match self {
            Self::Execution(error) => Some(error),
            _ => None,
        }
    }
}

/// Why a rollback run did not complete.
pub(crate) enum RollbackFailure<E> {
    /// A previous rollback already failed.
    Status(Status),
    /// A compensation returned this error.
    Compensation(E),
}

impl<E: Debug + Display> RollbackFailure<E> {
    /// Build the caller-facing error, attaching the step error that
    /// triggered the rollback, if any.
    pub(crate) fn into_error(self, while_executing: Option<E>) -> CompensatorError<E> {
        match self {
            Self::Status(status) => CompensatorError::Status(status),
            Self::Compensation(while_compensating) => {
                CompensatorError::Compensation(CompensationError {
                    while_executing,
                    while_compensating,
                })
            }
        }
    }
}
