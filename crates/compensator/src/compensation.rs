//! Values pairing a step outcome with what it takes to undo it.
//!
//! A step either has nothing to undo or hands over a rollback action. The
//! coordinators accept these wrappers instead of a separate method for every
//! combination of "with compensation", "without compensation" and "with a
//! compensation that needs the step's result".

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

pub(crate) type Action<E> = Box<dyn FnOnce() -> Result<(), E> + Send>;

pub(crate) type AsyncAction<E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), E>> + Send>;

/// Rollback action for a step, or nothing to roll back.
pub struct Compensation<E> {
    action: Option<Action<E>>,
}

impl<E> Compensation<E> {
    /// Compensation running `action` on rollback.
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
    {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// Nothing to roll back.
    #[must_use]
    pub fn none() -> Self {
        Self { action: None }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.action.is_none()
    }

    pub(crate) fn into_action(self) -> Option<Action<E>> {
        self.action
    }
}

impl<E> Default for Compensation<E> {
    fn default() -> Self {
        Self::none()
    }
}

impl<E> fmt::Debug for Compensation<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compensation")
            .field("is_none", &self.is_none())
            .finish()
    }
}

/// Rollback action that receives a value produced by the step.
///
/// The action is shared, so the same compensation can be bound to every item
/// of a `foreach` or to the result of a `get`.
pub struct ValueCompensation<T, E> {
    action: Option<Arc<dyn Fn(T) -> Result<(), E> + Send + Sync>>,
}

impl<T, E> ValueCompensation<T, E> {
    /// Compensation calling `action` with the step's value on rollback.
    pub fn new<F>(action: F) -> Self
    where
        F: Fn(T) -> Result<(), E> + Send + Sync + 'static,
    {
        Self {
            action: Some(Arc::new(action)),
        }
    }

    #[must_use]
    pub fn none() -> Self {
        Self { action: None }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.action.is_none()
    }

    /// Close over `value`, yielding a compensation with no arguments.
    pub fn bind(&self, value: T) -> Compensation<E>
    where
        T: Send + 'static,
        E: 'static,
    {
        match &self.action {
            Some(action) => {
                let action = Arc::clone(action);
                Compensation::new(move || action(value))
            }
            None => Compensation::none(),
        }
    }
}

impl<T, E> Clone for ValueCompensation<T, E> {
    fn clone(&self) -> Self {
        Self {
            action: self.action.clone(),
        }
    }
}

impl<T, E> Default for ValueCompensation<T, E> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T, E> fmt::Debug for ValueCompensation<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCompensation")
            .field("is_none", &self.is_none())
            .finish()
    }
}

/// A step's result together with the compensation undoing it.
#[derive(Debug)]
pub struct Compensated<T, E> {
    pub value: T,
    pub compensation: Compensation<E>,
}

impl<T, E> Compensated<T, E> {
    pub fn new(value: T, compensation: Compensation<E>) -> Self {
        Self {
            value,
            compensation,
        }
    }

    /// A result with nothing to roll back.
    pub fn without_compensation(value: T) -> Self {
        Self::new(value, Compensation::none())
    }
}

/// Suspending rollback action for a step, or nothing to roll back.
pub struct AsyncCompensation<E> {
    action: Option<AsyncAction<E>>,
}

impl<E> AsyncCompensation<E> {
    /// Compensation awaiting the future returned by `action` on rollback.
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        Self {
            action: Some(Box::new(move || action().boxed())),
        }
    }

    #[must_use]
    pub fn none() -> Self {
        Self { action: None }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.action.is_none()
    }

    pub(crate) fn into_action(self) -> Option<AsyncAction<E>> {
        self.action
    }
}

impl<E> Default for AsyncCompensation<E> {
    fn default() -> Self {
        Self::none()
    }
}

impl<E> fmt::Debug for AsyncCompensation<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCompensation")
            .field("is_none", &self.is_none())
            .finish()
    }
}

/// Suspending rollback action that receives a value produced by the step.
pub struct AsyncValueCompensation<T, E> {
    action: Option<Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), E>> + Send + Sync>>,
}

impl<T, E> AsyncValueCompensation<T, E> {
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        Self {
            action: Some(Arc::new(move |value| action(value).boxed())),
        }
    }

    #[must_use]
    pub fn none() -> Self {
        Self { action: None }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.action.is_none()
    }

    /// Close over `value`, yielding a compensation with no arguments.
    pub fn bind(&self, value: T) -> AsyncCompensation<E>
    where
        T: Send + 'static,
        E: 'static,
    {
        match &self.action {
            Some(action) => {
                let action = Arc::clone(action);
                AsyncCompensation {
                    action: Some(Box::new(move || action(value))),
                }
            }
            None => AsyncCompensation::none(),
        }
    }
}

impl<T, E> Clone for AsyncValueCompensation<T, E> {
    fn clone(&self) -> Self {
        Self {
            action: self.action.clone(),
        }
    }
}

impl<T, E> Default for AsyncValueCompensation<T, E> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T, E> fmt::Debug for AsyncValueCompensation<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncValueCompensation")
            .field("is_none", &self.is_none())
            .finish()
    }
}

/// A suspending step's result together with the compensation undoing it.
#[derive(Debug)]
pub struct AsyncCompensated<T, E> {
    pub value: T,
    pub compensation: AsyncCompensation<E>,
}

impl<T, E> AsyncCompensated<T, E> {
    pub fn new(value: T, compensation: AsyncCompensation<E>) -> Self {
        Self {
            value,
            compensation,
        }
    }

    pub fn without_compensation(value: T) -> Self {
        Self::new(value, AsyncCompensation::none())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn none_has_no_action() {
        assert!(Compensation::<()>::none().into_action().is_none());
        assert!(Compensation::<()>::default().is_none());
        assert!(ValueCompensation::<i32, ()>::none().bind(1).is_none());
    }

    #[test]
    fn new_wraps_action() {
        let compensation = Compensation::new(|| Err::<(), _>("undo failed"));
        let action = compensation.into_action().expect("action present");
        assert_eq!(action(), Err("undo failed"));
    }

    #[test]
    fn bind_closes_over_value() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let compensation = ValueCompensation::new(move |value: i32| {
            sink.lock().expect("lock").push(value);
            Ok::<(), ()>(())
        });

        let first = compensation.bind(7).into_action().expect("bound action");
        let second = compensation.bind(9).into_action().expect("bound action");
        assert_eq!(second(), Ok(()));
        assert_eq!(first(), Ok(()));

        assert_eq!(*seen.lock().expect("lock"), vec![9, 7]);
    }

    #[test]
    fn compensated_without_compensation() {
        let result = Compensated::<_, ()>::without_compensation("value");
        assert_eq!(result.value, "value");
        assert!(result.compensation.is_none());
    }

    #[test]
    fn async_bind_closes_over_value() {
        let compensation =
            AsyncValueCompensation::new(|value: i32| async move { Err::<(), _>(value) });
        let action = compensation.bind(3).into_action().expect("bound action");

        assert_eq!(futures::executor::block_on(action()), Err(3));
        assert!(AsyncValueCompensation::<i32, ()>::none().bind(3).is_none());
    }
}
