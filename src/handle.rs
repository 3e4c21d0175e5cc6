//! Cancelable asynchronous handles.
//!
//! An [`AsyncHandle`] is the engine's unit of "not settled yet": a shared,
//! single-threaded cell that starts pending and settles exactly once with a
//! value or a [`Cause`]. The settlement side is a [`Completer`], typically
//! driven by the host's event loop. Settlement runs registered continuations
//! synchronously, which is how one logical turn propagates through the
//! dependency graph.
//!
//! Cancellation is cooperative: [`AsyncHandle::cancel`] flips a flag and the
//! underlying operation keeps running; when its outcome later arrives it is
//! replaced by a distinguished cancellation failure. The [`AsyncHandle::guard`]
//! variant additionally forces early rejection on cancel, bounding the wait
//! even when the source never settles.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::value::{Cause, FutureValue, Material};

enum HandleState<T> {
    Pending { waiters: Vec<Box<dyn FnOnce()>> },
    Settled(Result<T, Cause>),
}

pub(crate) struct HandleInner<T> {
    state: RefCell<HandleState<T>>,
    canceled: Cell<bool>,
    /// Guards settle immediately on cancel instead of waiting for the source.
    force: bool,
}

impl<T> HandleInner<T> {
    fn new(force: bool) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(HandleState::Pending {
                waiters: Vec::new(),
            }),
            canceled: Cell::new(false),
            force,
        })
    }

    fn is_settled(&self) -> bool {
        matches!(&*self.state.borrow(), HandleState::Settled(_))
    }

    /// Settle and run waiters. Waiters run after the borrow is released so
    /// they may freely re-enter the handle.
    fn settle(&self, result: Result<T, Cause>) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                HandleState::Settled(_) => return,
                HandleState::Pending { waiters } => {
                    let waiters = std::mem::take(waiters);
                    *state = HandleState::Settled(result);
                    waiters
                }
            }
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// One settlement attempt from a completer or a forwarding guard.
    ///
    /// A settlement arriving after cancellation resolves to the cancellation
    /// failure instead of the real outcome; a second settlement of an already
    /// canceled handle is swallowed. Settling twice otherwise is a protocol
    /// error.
    fn offer(&self, result: Result<T, Cause>) {
        if self.is_settled() {
            if self.canceled.get() {
                return;
            }
            panic!("asynchronous handle settled twice");
        }
        if self.canceled.get() {
            self.settle(Err(Cause::Canceled));
        } else {
            self.settle(result);
        }
    }

    fn cancel(&self) {
        if self.canceled.get() {
            return;
        }
        self.canceled.set(true);
        if self.force {
            self.settle(Err(Cause::Canceled));
        }
    }

    fn force_cancel(&self) {
        self.canceled.set(true);
        self.settle(Err(Cause::Canceled));
    }

    /// Register a waiter, running it immediately when already settled.
    fn push_waiter(&self, waiter: Box<dyn FnOnce()>) {
        let immediate = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                HandleState::Settled(_) => Some(waiter),
                HandleState::Pending { waiters } => {
                    waiters.push(waiter);
                    None
                }
            }
        };
        if let Some(waiter) = immediate {
            waiter();
        }
    }
}

/// Consumer side of a cancelable asynchronous operation.
///
/// Cheap to clone; clones share one settlement. Created with
/// [`AsyncHandle::channel`] alongside its [`Completer`].
pub struct AsyncHandle<T> {
    inner: Rc<HandleInner<T>>,
}

impl<T> Clone for AsyncHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> AsyncHandle<T> {
    /// Create a pending handle together with its settlement side.
    pub fn channel() -> (Completer<T>, AsyncHandle<T>) {
        let inner = HandleInner::new(false);
        (
            Completer {
                inner: inner.clone(),
            },
            AsyncHandle { inner },
        )
    }

    /// A handle that is already settled.
    pub fn settled(result: Result<T, Cause>) -> AsyncHandle<T> {
        let inner = HandleInner::new(false);
        inner.settle(result);
        AsyncHandle { inner }
    }

    /// Returns `true` once the handle carries an outcome.
    pub fn is_settled(&self) -> bool {
        self.inner.is_settled()
    }

    /// Returns `true` if the handle was canceled.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.get()
    }

    /// Cooperatively cancel.
    ///
    /// Idempotent. The underlying operation is not stopped; if it is still
    /// outstanding, its eventual outcome is replaced by [`Cause::Canceled`].
    /// Guards created with [`AsyncHandle::guard`] settle immediately instead.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Cancel and settle with [`Cause::Canceled`] right now if still pending.
    pub(crate) fn force_cancel(&self) {
        self.inner.force_cancel();
    }

    /// Register a continuation for the settlement turn.
    ///
    /// Runs immediately when the handle is already settled.
    pub fn on_settle(&self, waiter: impl FnOnce() + 'static) {
        self.inner.push_waiter(Box::new(waiter));
    }

    /// Type-erased view used by the engine for fibers and suspensions.
    pub(crate) fn suspension(&self) -> Suspension {
        Suspension(self.inner.clone())
    }
}

impl<T: Clone + 'static> AsyncHandle<T> {
    /// The settled outcome, if any.
    pub fn settled_result(&self) -> Option<Result<T, Cause>> {
        match &*self.inner.state.borrow() {
            HandleState::Settled(result) => Some(result.clone()),
            HandleState::Pending { .. } => None,
        }
    }

    /// The handle as a future-value: `Pending` until settled.
    pub fn current(&self) -> FutureValue<T> {
        match self.settled_result() {
            None => FutureValue::Pending(self.clone()),
            Some(Ok(value)) => FutureValue::Present(value),
            Some(Err(cause)) => FutureValue::Error(cause),
        }
    }

    /// The safe variant: settles from this handle, but its own `cancel`
    /// rejects immediately regardless of the source's cooperation.
    ///
    /// The source is left untouched on cancel — it may be shared with other
    /// consumers that still want its outcome.
    pub fn guard(&self) -> AsyncHandle<T> {
        let inner = HandleInner::new(true);
        let guard = AsyncHandle {
            inner: inner.clone(),
        };
        let source = self.clone();
        self.on_settle(move || {
            let outcome = source
                .settled_result()
                .expect("settle continuation ran on a pending handle");
            inner.offer(outcome);
        });
        guard
    }

    /// Derive a handle by transforming the successful outcome.
    ///
    /// Failures pass through unchanged; a failing `map_fn` settles the
    /// derived handle with its error.
    pub fn map<R: Clone + 'static>(
        &self,
        map_fn: impl FnOnce(T) -> Result<Material<R>, anyhow::Error> + 'static,
    ) -> AsyncHandle<R> {
        let (completer, mapped) = AsyncHandle::channel();
        let source = self.clone();
        self.on_settle(move || {
            let outcome = source
                .settled_result()
                .expect("settle continuation ran on a pending handle");
            match outcome {
                Ok(value) => match map_fn(value) {
                    Ok(material) => drive(completer, FutureValue::wrap(material)),
                    Err(err) => completer.reject(Cause::fault(err)),
                },
                Err(cause) => completer.reject(cause),
            }
        });
        mapped
    }
}

impl<T> fmt::Debug for AsyncHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.borrow() {
            HandleState::Pending { .. } => "pending",
            HandleState::Settled(Ok(_)) => "resolved",
            HandleState::Settled(Err(_)) => "rejected",
        };
        write!(f, "AsyncHandle({state}")?;
        if self.inner.canceled.get() {
            write!(f, ", canceled")?;
        }
        write!(f, ")")
    }
}

/// Settle a completer from a future-value, chasing nested pending handles.
pub(crate) fn drive<T: Clone + 'static>(completer: Completer<T>, value: FutureValue<T>) {
    match value {
        FutureValue::Present(value) => completer.resolve(value),
        FutureValue::Error(cause) => completer.reject(cause),
        FutureValue::Absent => completer.reject(Cause::fault(anyhow::anyhow!("value is absent"))),
        FutureValue::Pending(handle) => {
            let source = handle.clone();
            handle.on_settle(move || drive(completer, source.current()));
        }
    }
}

/// Settlement side of an [`AsyncHandle`].
///
/// Settling twice is a protocol error, except that outcomes arriving after
/// cancellation are replaced by the cancellation failure. Dropping an
/// unsettled completer cancels the handle so waiters are not left hanging.
pub struct Completer<T> {
    inner: Rc<HandleInner<T>>,
}

impl<T: 'static> Completer<T> {
    /// Settle with a value.
    pub fn resolve(self, value: T) {
        self.inner.offer(Ok(value));
    }

    /// Settle with a failure.
    pub fn reject(self, cause: Cause) {
        self.inner.offer(Err(cause));
    }

    /// Returns `true` once the handle settled (including by cancellation).
    pub fn is_settled(&self) -> bool {
        self.inner.is_settled()
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.inner.is_settled() {
            self.inner.canceled.set(true);
            self.inner.settle(Err(Cause::Canceled));
        }
    }
}

trait ErasedHandle {
    fn on_settle_boxed(&self, waiter: Box<dyn FnOnce()>);
    fn cancel(&self);
    fn force_cancel(&self);
    fn is_canceled(&self) -> bool;
    fn is_settled(&self) -> bool;
}

impl<T: 'static> ErasedHandle for HandleInner<T> {
    fn on_settle_boxed(&self, waiter: Box<dyn FnOnce()>) {
        self.push_waiter(waiter);
    }

    fn cancel(&self) {
        HandleInner::cancel(self);
    }

    fn force_cancel(&self) {
        HandleInner::force_cancel(self);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.get()
    }

    fn is_settled(&self) -> bool {
        HandleInner::is_settled(self)
    }
}

/// Type-erased pending handle, as carried by [`FlowError::Suspend`]
/// and entry fibers.
///
/// [`FlowError::Suspend`]: crate::FlowError::Suspend
#[derive(Clone)]
pub struct Suspension(Rc<dyn ErasedHandle>);

impl Suspension {
    /// A force-cancelable guard that settles when this suspension settles.
    ///
    /// Entries park on the guard rather than on the awaited handle itself, so
    /// canceling a fiber never settles a handle shared with other consumers.
    pub(crate) fn guard(&self) -> Suspension {
        let inner = HandleInner::<()>::new(true);
        let forward = inner.clone();
        self.on_settle(move || forward.offer(Ok(())));
        Suspension(inner)
    }

    /// Returns `true` once the awaited handle settled.
    pub fn is_settled(&self) -> bool {
        self.0.is_settled()
    }

    /// Returns `true` if the awaited handle was canceled.
    pub fn is_canceled(&self) -> bool {
        self.0.is_canceled()
    }

    pub(crate) fn on_settle(&self, waiter: impl FnOnce() + 'static) {
        self.0.on_settle_boxed(Box::new(waiter));
    }

    pub(crate) fn cancel(&self) {
        self.0.cancel();
    }

    pub(crate) fn force_cancel(&self) {
        self.0.force_cancel();
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Suspension(settled: {}, canceled: {})",
            self.0.is_settled(),
            self.0.is_canceled()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_settles_waiters_synchronously() {
        let (completer, handle) = AsyncHandle::<i32>::channel();
        let seen = Rc::new(Cell::new(0));
        let seen2 = seen.clone();
        let probe = handle.clone();
        handle.on_settle(move || {
            if let Some(Ok(v)) = probe.settled_result() {
                seen2.set(v);
            }
        });
        completer.resolve(41);
        assert_eq!(seen.get(), 41);
        assert!(handle.is_settled());
    }

    #[test]
    fn cancel_converts_late_outcome() {
        let (completer, handle) = AsyncHandle::<i32>::channel();
        handle.cancel();
        assert!(handle.is_canceled());
        assert!(!handle.is_settled());
        completer.resolve(5);
        assert!(matches!(
            handle.settled_result(),
            Some(Err(Cause::Canceled))
        ));
    }

    #[test]
    fn cancel_twice_is_noop() {
        let (_completer, handle) = AsyncHandle::<i32>::channel();
        handle.cancel();
        handle.cancel();
        assert!(handle.is_canceled());
    }

    #[test]
    #[should_panic(expected = "settled twice")]
    fn double_settle_is_protocol_error() {
        let (completer, handle) = AsyncHandle::<i32>::channel();
        completer.resolve(1);
        handle.inner.offer(Ok(2));
    }

    #[test]
    fn guard_rejects_immediately_on_cancel() {
        let (_completer, handle) = AsyncHandle::<i32>::channel();
        let guard = handle.guard();
        guard.cancel();
        assert!(matches!(guard.settled_result(), Some(Err(Cause::Canceled))));
        // The source is only ever canceled by its own consumers.
        assert!(!handle.is_canceled());
        assert!(!handle.is_settled());
    }

    #[test]
    fn guard_forwards_source_settlement() {
        let (completer, handle) = AsyncHandle::<i32>::channel();
        let guard = handle.guard();
        completer.resolve(7);
        assert!(matches!(guard.settled_result(), Some(Ok(7))));
    }

    #[test]
    fn guard_swallows_settlement_after_cancel() {
        let (completer, handle) = AsyncHandle::<i32>::channel();
        let guard = handle.guard();
        guard.cancel();
        completer.resolve(7);
        assert!(matches!(guard.settled_result(), Some(Err(Cause::Canceled))));
        assert!(matches!(handle.settled_result(), Some(Ok(7))));
    }

    #[test]
    fn map_transforms_success() {
        let (completer, handle) = AsyncHandle::<i32>::channel();
        let mapped = handle.map(|v| Ok(Material::from(v * 2)));
        completer.resolve(21);
        assert!(matches!(mapped.settled_result(), Some(Ok(42))));
    }

    #[test]
    fn map_propagates_failure() {
        let (completer, handle) = AsyncHandle::<i32>::channel();
        let mapped = handle.map(|v| Ok(Material::from(v * 2)));
        completer.reject(Cause::fault(anyhow::anyhow!("boom")));
        assert!(matches!(mapped.settled_result(), Some(Err(_))));
    }

    #[test]
    fn dropping_completer_cancels_handle() {
        let (completer, handle) = AsyncHandle::<i32>::channel();
        drop(completer);
        assert!(handle.is_canceled());
        assert!(matches!(
            handle.settled_result(),
            Some(Err(Cause::Canceled))
        ));
    }
}
