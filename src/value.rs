//! The future-value algebra.
//!
//! A [`FutureValue`] is an immutable tagged description of a value that may
//! not exist yet: absent, pending behind an [`AsyncHandle`], present, or
//! failed. Combinators never mutate in place — every transition produces a
//! new value.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::FlowError;
use crate::handle::{drive, AsyncHandle};

/// Failure cause carried by an errored future-value.
///
/// Cheap to clone. `Canceled` is the distinguished cancellation signal; all
/// other failures are opaque [`anyhow::Error`]s.
#[derive(Clone)]
pub enum Cause {
    /// The producing operation was canceled.
    Canceled,
    /// The producing operation failed.
    Fault(Arc<anyhow::Error>),
}

impl Cause {
    /// Wrap any error as an opaque failure cause.
    pub fn fault(err: impl Into<anyhow::Error>) -> Self {
        Cause::Fault(Arc::new(err.into()))
    }

    /// Returns `true` for the cancellation signal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Cause::Canceled)
    }

    /// Downcast an opaque failure to a concrete error type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        match self {
            Cause::Canceled => None,
            Cause::Fault(err) => err.downcast_ref(),
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Canceled => write!(f, "canceled"),
            Cause::Fault(err) => write!(f, "{}", err),
        }
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Canceled => f.write_str("Canceled"),
            Cause::Fault(err) => write!(f, "Fault({:?})", err),
        }
    }
}

/// Anything that can be turned into a future-value: a bare value, an
/// asynchronous handle, or a future-value itself.
pub enum Material<T> {
    /// An immediately available value.
    Value(T),
    /// A possibly-unsettled asynchronous handle.
    Handle(AsyncHandle<T>),
    /// An already-classified future-value.
    Future(FutureValue<T>),
}

impl<T> Material<T> {
    /// Material from an asynchronous handle.
    pub fn handle(handle: AsyncHandle<T>) -> Self {
        Material::Handle(handle)
    }

    /// Material from a future-value.
    pub fn future(value: FutureValue<T>) -> Self {
        Material::Future(value)
    }
}

impl<T> From<T> for Material<T> {
    fn from(value: T) -> Self {
        Material::Value(value)
    }
}

/// An immutable value that may be absent, pending, present, or failed.
#[derive(Clone)]
pub enum FutureValue<T> {
    /// No value has ever been produced.
    Absent,
    /// An asynchronous handle is outstanding.
    Pending(AsyncHandle<T>),
    /// The value is available.
    Present(T),
    /// Producing the value failed.
    Error(Cause),
}

impl<T: Clone + 'static> FutureValue<T> {
    /// Coerce material into a future-value.
    ///
    /// Bare values become `Present`; unsettled handles become `Pending`,
    /// settled ones collapse to their outcome.
    pub fn wrap(material: impl Into<Material<T>>) -> Self {
        match material.into() {
            Material::Value(value) => FutureValue::Present(value),
            Material::Handle(handle) => handle.current(),
            Material::Future(value) => value,
        }
    }

    /// A settled value from a result.
    pub fn from_result(result: Result<T, Cause>) -> Self {
        match result {
            Ok(value) => FutureValue::Present(value),
            Err(cause) => FutureValue::Error(cause),
        }
    }

    /// Returns `true` for `Present` and `Error`.
    pub fn is_settled(&self) -> bool {
        matches!(self, FutureValue::Present(_) | FutureValue::Error(_))
    }

    /// Returns `true` for `Pending`.
    pub fn is_pending(&self) -> bool {
        matches!(self, FutureValue::Pending(_))
    }

    /// Returns `true` for `Absent`.
    pub fn is_absent(&self) -> bool {
        matches!(self, FutureValue::Absent)
    }

    /// The value, if present.
    pub fn present(self) -> Option<T> {
        match self {
            FutureValue::Present(value) => Some(value),
            _ => None,
        }
    }

    /// The failure cause, if errored.
    pub fn error_cause(&self) -> Option<&Cause> {
        match self {
            FutureValue::Error(cause) => Some(cause),
            _ => None,
        }
    }

    /// The settled outcome, if settled.
    pub fn settled(&self) -> Option<Result<T, Cause>> {
        match self {
            FutureValue::Present(value) => Some(Ok(value.clone())),
            FutureValue::Error(cause) => Some(Err(cause.clone())),
            _ => None,
        }
    }

    /// The carried value if present, else the default. Never fails.
    pub fn value_or(self, default: T) -> T {
        match self {
            FutureValue::Present(value) => value,
            _ => default,
        }
    }

    /// Substitute a fallback only when absent.
    pub fn or(self, fallback: impl Into<Material<T>>) -> FutureValue<T> {
        match self {
            FutureValue::Absent => FutureValue::wrap(fallback),
            other => other,
        }
    }

    /// Transform the present value, re-wrapping the outcome.
    ///
    /// A failing `map_fn` yields `Error`. On `Pending` the transformation is
    /// deferred until the source settles. `Error` and `Absent` pass through.
    pub fn map<R: Clone + 'static>(
        self,
        map_fn: impl FnOnce(T) -> Result<Material<R>, anyhow::Error> + 'static,
    ) -> FutureValue<R> {
        match self {
            FutureValue::Absent => FutureValue::Absent,
            FutureValue::Error(cause) => FutureValue::Error(cause),
            FutureValue::Present(value) => match map_fn(value) {
                Ok(material) => FutureValue::wrap(material),
                Err(err) => FutureValue::Error(Cause::fault(err)),
            },
            FutureValue::Pending(handle) => FutureValue::Pending(handle.map(map_fn)),
        }
    }

    /// Like [`map`](FutureValue::map), but the transformation receives the
    /// settled outcome, so one function can handle success and failure alike.
    /// `Absent` passes through.
    pub fn then<R: Clone + 'static>(
        self,
        then_fn: impl FnOnce(Result<T, Cause>) -> Result<Material<R>, anyhow::Error> + 'static,
    ) -> FutureValue<R> {
        match self {
            FutureValue::Absent => FutureValue::Absent,
            FutureValue::Present(value) => match then_fn(Ok(value)) {
                Ok(material) => FutureValue::wrap(material),
                Err(err) => FutureValue::Error(Cause::fault(err)),
            },
            FutureValue::Error(cause) => match then_fn(Err(cause)) {
                Ok(material) => FutureValue::wrap(material),
                Err(err) => FutureValue::Error(Cause::fault(err)),
            },
            FutureValue::Pending(handle) => {
                let (completer, derived) = AsyncHandle::channel();
                let source = handle.clone();
                handle.on_settle(move || {
                    let outcome = source
                        .settled_result()
                        .expect("settle continuation ran on a pending handle");
                    match then_fn(outcome) {
                        Ok(material) => drive(completer, FutureValue::wrap(material)),
                        Err(err) => completer.reject(Cause::fault(err)),
                    }
                });
                FutureValue::Pending(derived)
            }
        }
    }

    /// Convert into a direct result, or a suspension request.
    ///
    /// `Present` yields the value; `Error` the failure; `Absent` an absence
    /// fault; `Pending` yields [`FlowError::Suspend`] carrying the handle so
    /// the computation loop can park and re-run. Propagate with `?`.
    ///
    /// A `Pending` whose handle has settled since this value was captured
    /// collapses to the settled outcome instead of suspending, so re-running
    /// code that holds an old future-value always makes progress.
    pub fn ready(self) -> Result<T, FlowError> {
        match self {
            FutureValue::Present(value) => Ok(value),
            FutureValue::Error(cause) => Err(FlowError::Failed(cause)),
            FutureValue::Absent => Err(FlowError::absent()),
            FutureValue::Pending(handle) => match handle.settled_result() {
                Some(Ok(value)) => Ok(value),
                Some(Err(cause)) => Err(FlowError::Failed(cause)),
                None => Err(FlowError::Suspend(handle.suspension())),
            },
        }
    }

    /// Combine values, short-circuiting on failure.
    ///
    /// `Present(values)` if every member is present. The first `Error` in
    /// list order wins if it appears before any unresolved `Pending`.
    /// Otherwise a `Pending` that resolves order-preserving once every member
    /// settles, or rejects with the first member failure.
    pub fn all(values: Vec<FutureValue<T>>) -> FutureValue<Vec<T>> {
        let mut ready = Vec::with_capacity(values.len());
        for value in &values {
            match value {
                FutureValue::Present(v) => ready.push(v.clone()),
                FutureValue::Error(cause) => return FutureValue::Error(cause.clone()),
                FutureValue::Absent => {
                    return FutureValue::Error(Cause::fault(anyhow::anyhow!("value is absent")))
                }
                FutureValue::Pending(_) => break,
            }
        }
        if ready.len() == values.len() {
            return FutureValue::Present(ready);
        }

        let (completer, joined) = AsyncHandle::channel();
        let join = Rc::new(JoinState::new(values.len(), completer));
        for (index, value) in values.into_iter().enumerate() {
            match value {
                FutureValue::Present(v) => join.fill(index, Ok(v)),
                FutureValue::Error(cause) => join.fill(index, Err(cause)),
                FutureValue::Absent => {
                    join.fill(index, Err(Cause::fault(anyhow::anyhow!("value is absent"))))
                }
                FutureValue::Pending(handle) => {
                    let join = join.clone();
                    let source = handle.clone();
                    handle.on_settle(move || {
                        let outcome = source
                            .settled_result()
                            .expect("settle continuation ran on a pending handle");
                        join.fill(index, outcome);
                    });
                }
            }
        }
        FutureValue::Pending(joined)
    }

    /// Combine values without short-circuiting: every slot becomes a settled
    /// sub-result once all members settle.
    pub fn all_settled(values: Vec<FutureValue<T>>) -> FutureValue<Vec<Result<T, Cause>>> {
        let mut ready = Vec::with_capacity(values.len());
        for value in &values {
            match value {
                FutureValue::Present(v) => ready.push(Ok(v.clone())),
                FutureValue::Error(cause) => ready.push(Err(cause.clone())),
                FutureValue::Absent => {
                    ready.push(Err(Cause::fault(anyhow::anyhow!("value is absent"))))
                }
                FutureValue::Pending(_) => break,
            }
        }
        if ready.len() == values.len() {
            return FutureValue::Present(ready);
        }

        let (completer, joined) = AsyncHandle::channel();
        let join = Rc::new(JoinState::new(values.len(), completer));
        for (index, value) in values.into_iter().enumerate() {
            match value {
                FutureValue::Present(v) => join.fill(index, Ok(Ok(v))),
                FutureValue::Error(cause) => join.fill(index, Ok(Err(cause))),
                FutureValue::Absent => join.fill(
                    index,
                    Ok(Err(Cause::fault(anyhow::anyhow!("value is absent")))),
                ),
                FutureValue::Pending(handle) => {
                    let join = join.clone();
                    let source = handle.clone();
                    handle.on_settle(move || {
                        let outcome = source
                            .settled_result()
                            .expect("settle continuation ran on a pending handle");
                        join.fill(index, Ok(outcome));
                    });
                }
            }
        }
        FutureValue::Pending(joined)
    }
}

impl<T: fmt::Debug> fmt::Debug for FutureValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FutureValue::Absent => f.write_str("Absent"),
            FutureValue::Pending(handle) => write!(f, "Pending({:?})", handle),
            FutureValue::Present(value) => write!(f, "Present({:?})", value),
            FutureValue::Error(cause) => write!(f, "Error({:?})", cause),
        }
    }
}

/// Order-preserving join of several settlements into one handle.
///
/// The first member failure settles the join; a join that already settled
/// ignores the remaining members.
struct JoinState<V> {
    slots: std::cell::RefCell<Vec<Option<V>>>,
    remaining: std::cell::Cell<usize>,
    completer: std::cell::RefCell<Option<crate::handle::Completer<Vec<V>>>>,
}

impl<V: Clone + 'static> JoinState<V> {
    fn new(len: usize, completer: crate::handle::Completer<Vec<V>>) -> Self {
        Self {
            slots: std::cell::RefCell::new(vec![None; len]),
            remaining: std::cell::Cell::new(len),
            completer: std::cell::RefCell::new(Some(completer)),
        }
    }

    fn fill(&self, index: usize, outcome: Result<V, Cause>) {
        let Some(completer) = self.completer.borrow_mut().take() else {
            return;
        };
        match outcome {
            Err(cause) => completer.reject(cause),
            Ok(value) => {
                self.slots.borrow_mut()[index] = Some(value);
                self.remaining.set(self.remaining.get() - 1);
                if self.remaining.get() == 0 {
                    let values = self
                        .slots
                        .borrow_mut()
                        .iter_mut()
                        .map(|slot| slot.take().expect("join slot missing"))
                        .collect();
                    completer.resolve(values);
                } else {
                    *self.completer.borrow_mut() = Some(completer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(msg: &str) -> Cause {
        Cause::fault(anyhow::anyhow!("{msg}"))
    }

    #[test]
    fn wrap_coerces_materials() {
        assert!(matches!(
            FutureValue::wrap(Material::from(3)),
            FutureValue::Present(3)
        ));
        let (_completer, handle) = AsyncHandle::<i32>::channel();
        assert!(FutureValue::<i32>::wrap(Material::handle(handle)).is_pending());
        assert!(
            FutureValue::<i32>::wrap(Material::future(FutureValue::<i32>::Error(fault("x"))))
                .error_cause()
                .is_some()
        );
    }

    #[test]
    fn map_applies_on_present() {
        let mapped = FutureValue::Present(4).map(|v| Ok(Material::from(v + 1)));
        assert_eq!(mapped.present(), Some(5));
    }

    #[test]
    fn map_catches_failure() {
        let mapped: FutureValue<i32> =
            FutureValue::Present(4).map(|_| Err(anyhow::anyhow!("broken")));
        assert!(mapped.error_cause().is_some());
    }

    #[test]
    fn map_is_identity_on_error_and_absent() {
        let err: FutureValue<i32> =
            FutureValue::Error(fault("e")).map(|v: i32| Ok(Material::from(v)));
        assert!(err.error_cause().is_some());
        let absent: FutureValue<i32> = FutureValue::Absent.map(|v: i32| Ok(Material::from(v)));
        assert!(absent.is_absent());
    }

    #[test]
    fn map_defers_on_pending() {
        let (completer, handle) = AsyncHandle::<i32>::channel();
        let mapped = FutureValue::Pending(handle).map(|v| Ok(Material::from(v * 10)));
        let FutureValue::Pending(mapped) = mapped else {
            panic!("expected pending");
        };
        completer.resolve(4);
        assert!(matches!(mapped.settled_result(), Some(Ok(40))));
    }

    #[test]
    fn then_sees_both_outcomes() {
        let ok = FutureValue::Present(1).then(|r| Ok(Material::from(r.is_ok())));
        assert_eq!(ok.present(), Some(true));
        let err = FutureValue::<i32>::Error(fault("e")).then(|r| Ok(Material::from(r.is_ok())));
        assert_eq!(err.present(), Some(false));
    }

    #[test]
    fn or_substitutes_only_when_absent() {
        assert_eq!(FutureValue::Absent.or(9).present(), Some(9));
        assert_eq!(FutureValue::Present(1).or(9).present(), Some(1));
        assert!(FutureValue::<i32>::Error(fault("e"))
            .or(9)
            .error_cause()
            .is_some());
    }

    #[test]
    fn value_or_never_fails() {
        assert_eq!(FutureValue::Present(1).value_or(7), 1);
        assert_eq!(FutureValue::<i32>::Error(fault("e")).value_or(7), 7);
        assert_eq!(FutureValue::<i32>::Absent.value_or(7), 7);
    }

    #[test]
    fn ready_classifies_variants() {
        assert_eq!(FutureValue::Present(2).ready().unwrap(), 2);
        assert!(matches!(
            FutureValue::<i32>::Error(fault("e")).ready(),
            Err(FlowError::Failed(_))
        ));
        assert!(matches!(
            FutureValue::<i32>::Absent.ready(),
            Err(FlowError::Failed(_))
        ));
        let (_completer, handle) = AsyncHandle::<i32>::channel();
        assert!(matches!(
            FutureValue::Pending(handle).ready(),
            Err(FlowError::Suspend(_))
        ));
    }

    #[test]
    fn all_present_collects_in_order() {
        let joined = FutureValue::all(vec![
            FutureValue::Present(1),
            FutureValue::Present(2),
            FutureValue::Present(3),
        ]);
        assert_eq!(joined.present(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn all_returns_first_error_before_pending() {
        let (_completer, handle) = AsyncHandle::<i32>::channel();
        let joined = FutureValue::all(vec![
            FutureValue::Error(fault("first")),
            FutureValue::Pending(handle),
            FutureValue::Error(fault("second")),
        ]);
        let cause = joined.error_cause().expect("expected error");
        assert!(cause.to_string().contains("first"));
    }

    #[test]
    fn all_is_pending_until_members_settle() {
        let (ca, ha) = AsyncHandle::<i32>::channel();
        let (cb, hb) = AsyncHandle::<i32>::channel();
        let joined = FutureValue::all(vec![
            FutureValue::Pending(ha),
            FutureValue::Present(5),
            FutureValue::Pending(hb),
        ]);
        let FutureValue::Pending(joined) = joined else {
            panic!("expected pending");
        };
        assert!(joined.settled_result().is_none());
        ca.resolve(1);
        assert!(joined.settled_result().is_none());
        cb.resolve(3);
        assert!(matches!(joined.settled_result(), Some(Ok(v)) if v == vec![1, 5, 3]));
    }

    #[test]
    fn all_rejects_when_member_fails_late() {
        let (completer, handle) = AsyncHandle::<i32>::channel();
        let joined = FutureValue::all(vec![FutureValue::Pending(handle), FutureValue::Present(2)]);
        let FutureValue::Pending(joined) = joined else {
            panic!("expected pending");
        };
        completer.reject(fault("late"));
        assert!(matches!(joined.settled_result(), Some(Err(_))));
    }

    #[test]
    fn all_settled_never_short_circuits() {
        let (completer, handle) = AsyncHandle::<i32>::channel();
        let joined = FutureValue::all_settled(vec![
            FutureValue::Error(fault("kept")),
            FutureValue::Pending(handle),
        ]);
        let FutureValue::Pending(joined) = joined else {
            panic!("expected pending");
        };
        completer.resolve(9);
        let slots = joined.settled_result().unwrap().unwrap();
        assert!(slots[0].is_err());
        assert!(matches!(slots[1], Ok(9)));
    }
}
