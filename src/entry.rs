//! The per-entry state machine.
//!
//! An [`EntryCell`] is the unit of cached, dependency-tracked state: the
//! current completion handle readers hold, the last settled outcome used as a
//! reducer seed, at most one live fiber, dependency edges in both directions,
//! and the subscriptions to notify when the entry is invalidated.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use slab::Slab;

use crate::access::{MemoTable, ReadAccess};
use crate::error::FlowError;
use crate::handle::{AsyncHandle, Completer, Suspension};
use crate::key::Key;
use crate::store::Store;
use crate::tracer::FlowEvent;
use crate::value::{Cause, FutureValue, Material};

/// What an entry kind is allowed to do.
///
/// Every entry carries its capability tag; operations are checked against the
/// table below instead of duck-typed marker fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Derived entries: readable only.
    Readable = 0,
    /// Inputs and updatable derived entries: readable and writable.
    Settable = 1,
    /// Reducing entries: readable, writable, and command-driven.
    Reducing = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryOp {
    Read = 0,
    Write = 1,
    Reduce = 2,
}

/// Permission table indexed by `[capability][operation]`.
const CAPABILITY_OPS: [[bool; 3]; 3] = [
    [true, false, false],
    [true, true, false],
    [true, true, true],
];

impl Capability {
    pub(crate) fn allows(self, op: EntryOp) -> bool {
        CAPABILITY_OPS[self as usize][op as usize]
    }

    pub(crate) fn require(self, op: EntryOp, key: &Key) {
        if !self.allows(op) {
            panic!("entry `{key}` ({self:?}) does not allow {op:?}");
        }
    }
}

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Created, never computed.
    Init,
    /// Stale; the next read recomputes.
    Invalid,
    /// A fiber is in flight.
    Pending,
    /// Carries a present value or an error.
    Settled,
    /// Transient state while a restart callback runs.
    Cancel,
}

/// A compute pass: runs against the access object and yields material or a
/// suspension/failure.
pub(crate) type ComputeFn<T> = dyn Fn(&ReadAccess) -> Result<Material<T>, FlowError>;
pub(crate) type SharedComputeFn<T> = Rc<ComputeFn<T>>;
pub(crate) type RestartFn = Rc<dyn Fn(&Store)>;

struct Fiber {
    id: u64,
    handle: Suspension,
}

pub(crate) struct EntryCell<T: 'static> {
    key: Key,
    capability: Capability,
    inner: RefCell<EntryInner<T>>,
    /// Kept outside `inner` so memo factories may re-enter the entry state.
    memo: RefCell<MemoTable>,
}

struct EntryInner<T> {
    state: EntryState,
    epoch: u64,
    completer: Option<Completer<T>>,
    output: AsyncHandle<T>,
    last_settled: Option<Result<T, Cause>>,
    fiber: Option<Fiber>,
    next_fiber_id: u64,
    restart: Option<RestartFn>,
    up_deps: Vec<Key>,
    down_deps: Vec<(Key, Weak<dyn AnyEntry>)>,
    subs: Slab<Rc<dyn Fn()>>,
}

enum InvalidatePlan {
    Proceed,
    Restart(RestartFn),
    Fallback,
}

impl<T: Clone + 'static> EntryCell<T> {
    pub(crate) fn new(key: Key, capability: Capability) -> Rc<Self> {
        let (completer, output) = AsyncHandle::channel();
        Rc::new(Self {
            key,
            capability,
            inner: RefCell::new(EntryInner {
                state: EntryState::Init,
                epoch: 0,
                completer: Some(completer),
                output,
                last_settled: None,
                fiber: None,
                next_fiber_id: 0,
                restart: None,
                up_deps: Vec::new(),
                down_deps: Vec::new(),
                subs: Slab::new(),
            }),
            memo: RefCell::new(MemoTable::new()),
        })
    }

    pub(crate) fn key(&self) -> &Key {
        &self.key
    }

    pub(crate) fn capability(&self) -> Capability {
        self.capability
    }

    pub(crate) fn state(&self) -> EntryState {
        self.inner.borrow().state
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.inner.borrow().epoch
    }

    pub(crate) fn should_recompute(&self) -> bool {
        matches!(
            self.state(),
            EntryState::Init | EntryState::Invalid | EntryState::Cancel
        )
    }

    pub(crate) fn current(&self) -> FutureValue<T> {
        self.inner.borrow().output.current()
    }

    pub(crate) fn last_settled(&self) -> Option<Result<T, Cause>> {
        self.inner.borrow().last_settled.clone()
    }

    pub(crate) fn up_deps(&self) -> Vec<Key> {
        self.inner.borrow().up_deps.clone()
    }

    /// Pre-seed a dependency edge, e.g. from a snapshot record.
    pub(crate) fn seed_up_dep(&self, dep: Key) {
        let mut inner = self.inner.borrow_mut();
        if !inner.up_deps.contains(&dep) {
            inner.up_deps.push(dep);
        }
    }

    /// Pre-seed a settled outcome, e.g. replayed from a snapshot record.
    pub(crate) fn preset(&self, outcome: Result<T, Cause>) {
        self.settle(outcome);
    }

    fn assert_settable(&self, state: EntryState) {
        if !matches!(
            state,
            EntryState::Init | EntryState::Invalid | EntryState::Cancel
        ) {
            panic!("entry `{}` cannot be written in state {state:?}", self.key);
        }
    }

    /// Write a classified value into the entry.
    ///
    /// Requires the settable window (init, invalid, or cancel).
    pub(crate) fn apply(
        self: &Rc<Self>,
        store: &Store,
        value: FutureValue<T>,
        restart: Option<RestartFn>,
    ) {
        match value {
            FutureValue::Absent => {
                self.inner.borrow_mut().last_settled = None;
                self.invalidate(store, true);
            }
            FutureValue::Present(value) => self.settle(Ok(value)),
            FutureValue::Error(cause) => self.settle(Err(cause)),
            FutureValue::Pending(handle) => self.set_pending(store, handle, restart),
        }
    }

    /// Settle from the settable window. Clears the fiber and restart
    /// callback, records the outcome as the new reducer seed, and resolves
    /// the completion handle readers hold.
    fn settle(&self, outcome: Result<T, Cause>) {
        let completer = {
            let mut inner = self.inner.borrow_mut();
            self.assert_settable(inner.state);
            inner.state = EntryState::Settled;
            inner.restart = None;
            inner.fiber = None;
            inner.last_settled = Some(outcome.clone());
            inner
                .completer
                .take()
                .unwrap_or_else(|| panic!("entry `{}` settled twice in one epoch", self.key))
        };
        match outcome {
            Ok(value) => completer.resolve(value),
            Err(cause) => completer.reject(cause),
        }
    }

    /// Park the entry behind an in-flight handle.
    ///
    /// The fiber is a guard over the handle: canceling it never settles a
    /// handle shared with other consumers.
    fn set_pending(
        self: &Rc<Self>,
        store: &Store,
        handle: AsyncHandle<T>,
        restart: Option<RestartFn>,
    ) {
        let guard = handle.guard();
        let fiber_id = {
            let mut inner = self.inner.borrow_mut();
            self.assert_settable(inner.state);
            inner.state = EntryState::Pending;
            inner.restart = restart;
            let id = inner.next_fiber_id;
            inner.next_fiber_id += 1;
            inner.fiber = Some(Fiber {
                id,
                handle: guard.suspension(),
            });
            id
        };
        let entry = Rc::downgrade(self);
        let store = store.downgrade();
        let source = guard.clone();
        guard.on_settle(move || {
            let Some(entry) = entry.upgrade() else { return };
            let Some(store) = store.upgrade() else { return };
            let outcome = source
                .settled_result()
                .expect("settle continuation ran on a pending handle");
            entry.settle_from_fiber(&store, fiber_id, outcome);
        });
    }

    /// Settlement of the entry's own fiber: pending -> settled.
    ///
    /// A fiber that is no longer current is swallowed with a diagnostic.
    fn settle_from_fiber(&self, store: &Store, fiber_id: u64, outcome: Result<T, Cause>) {
        let completer = {
            let mut inner = self.inner.borrow_mut();
            let current = matches!(&inner.fiber, Some(fiber) if fiber.id == fiber_id);
            if !current {
                drop(inner);
                store.tracer().emit(FlowEvent::StaleFiberSettled {
                    key: self.key.clone(),
                    canceled: matches!(&outcome, Err(cause) if cause.is_canceled()),
                });
                return;
            }
            inner.state = EntryState::Settled;
            inner.restart = None;
            inner.fiber = None;
            inner.last_settled = Some(outcome.clone());
            inner
                .completer
                .take()
                .unwrap_or_else(|| panic!("entry `{}` settled twice in one epoch", self.key))
        };
        match outcome {
            Ok(value) => completer.resolve(value),
            Err(cause) => completer.reject(cause),
        }
    }

    /// Invalidate the entry and schedule downstream invalidation plus
    /// subscriber notification in the store's batch.
    ///
    /// A pending entry first cancels its fiber. With a restart callback and
    /// `skip_restart == false` the entry detours through `Cancel` and the
    /// callback must synchronously drive it back to a concrete state.
    pub(crate) fn invalidate(self: &Rc<Self>, store: &Store, skip_restart: bool) {
        let mut fiber_to_cancel = None;
        let plan;
        let counts;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == EntryState::Invalid {
                return;
            }
            counts = (
                inner.up_deps.len(),
                inner.down_deps.len(),
                inner.subs.len(),
            );
            if inner.state == EntryState::Pending {
                fiber_to_cancel = inner.fiber.take().map(|fiber| fiber.handle);
                if skip_restart {
                    inner.restart = None;
                    plan = InvalidatePlan::Proceed;
                } else if let Some(restart) = inner.restart.take() {
                    inner.state = EntryState::Cancel;
                    plan = InvalidatePlan::Restart(restart);
                } else {
                    plan = InvalidatePlan::Fallback;
                }
            } else {
                plan = InvalidatePlan::Proceed;
            }
        }
        store.tracer().emit(FlowEvent::EntryInvalidated {
            key: self.key.clone(),
            up_deps: counts.0,
            down_deps: counts.1,
            subscribers: counts.2,
        });
        if let Some(handle) = fiber_to_cancel {
            handle.force_cancel();
            store
                .tracer()
                .emit(FlowEvent::FiberCanceled { key: self.key.clone() });
        }
        match plan {
            InvalidatePlan::Restart(restart) => {
                restart(store);
                if self.state() == EntryState::Cancel {
                    panic!(
                        "restart callback for entry `{}` returned without settling it",
                        self.key
                    );
                }
                // The restart drove the entry to a concrete state; readers
                // keep waiting on the same completion handle, so there is
                // nothing to notify.
                return;
            }
            InvalidatePlan::Fallback => {
                store
                    .tracer()
                    .emit(FlowEvent::RestartFallback { key: self.key.clone() });
            }
            InvalidatePlan::Proceed => {}
        }

        // Mark invalid and mint a fresh completion handle before releasing
        // any waiters, so continuations observe a consistent state.
        let mut discarded = None;
        let (subs, downs) = {
            let mut inner = self.inner.borrow_mut();
            let was_init = inner.state == EntryState::Init;
            inner.state = EntryState::Invalid;
            inner.restart = None;
            if !was_init {
                let (completer, output) = AsyncHandle::channel();
                let old_output = std::mem::replace(&mut inner.output, output);
                let old_completer = inner.completer.replace(completer);
                inner.epoch += 1;
                discarded = Some((old_output, old_completer));
            }
            let subs: Vec<(usize, Rc<dyn Fn()>)> = inner
                .subs
                .iter()
                .map(|(id, cb)| (id, cb.clone()))
                .collect();
            let downs: Vec<Rc<dyn AnyEntry>> = inner
                .down_deps
                .drain(..)
                .filter_map(|(_, weak)| weak.upgrade())
                .collect();
            inner.up_deps.clear();
            (subs, downs)
        };
        if let Some((old_output, old_completer)) = discarded {
            match old_completer {
                // Still pending: dropping the completer rejects waiters with
                // the cancellation signal.
                Some(completer) => drop(completer),
                // Already settled: flag only, so late holders can tell the
                // handle is stale.
                None => old_output.cancel(),
            }
        }
        store.start_batch();
        store.queue_notifications(&self.key, subs);
        store.queue_invalidations(downs);
        store.end_batch();
    }

    /// Run one computation loop instance against this entry.
    pub(crate) fn run_loop(
        self: &Rc<Self>,
        store: &Store,
        f: SharedComputeFn<T>,
        access: Rc<ReadAccess>,
        restart: RestartFn,
    ) {
        self.assert_settable(self.state());
        self.loop_step(store, f, access, restart);
    }

    /// One pass of the loop: run the compute function and classify the
    /// outcome. Suspensions install a restart continuation that re-enters
    /// this same loop instance once the awaited handle settles.
    fn loop_step(
        self: &Rc<Self>,
        store: &Store,
        f: SharedComputeFn<T>,
        access: Rc<ReadAccess>,
        restart: RestartFn,
    ) {
        access.begin_pass(store);
        store.eval_push(&self.key);
        let result = f(&access);
        store.eval_pop();
        match result {
            Ok(material) => {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.state = EntryState::Invalid;
                    inner.fiber = None;
                }
                self.apply(store, FutureValue::wrap(material), Some(restart));
            }
            Err(FlowError::Suspend(suspension)) => {
                let guard = suspension.guard();
                let fiber_id = {
                    let mut inner = self.inner.borrow_mut();
                    inner.state = EntryState::Pending;
                    inner.restart = Some(restart.clone());
                    let id = inner.next_fiber_id;
                    inner.next_fiber_id += 1;
                    inner.fiber = Some(Fiber {
                        id,
                        handle: guard.clone(),
                    });
                    id
                };
                let entry = Rc::downgrade(self);
                let store = store.downgrade();
                let waited = guard.clone();
                guard.on_settle(move || {
                    let Some(entry) = entry.upgrade() else { return };
                    let Some(store) = store.upgrade() else { return };
                    let current =
                        matches!(&entry.inner.borrow().fiber, Some(fiber) if fiber.id == fiber_id);
                    if !current {
                        store.tracer().emit(FlowEvent::StaleFiberSettled {
                            key: entry.key.clone(),
                            canceled: waited.is_canceled(),
                        });
                        return;
                    }
                    {
                        let mut inner = entry.inner.borrow_mut();
                        inner.state = EntryState::Invalid;
                        inner.fiber = None;
                    }
                    entry.loop_step(&store, f, access, restart);
                });
            }
            Err(failure) => {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.state = EntryState::Invalid;
                    inner.fiber = None;
                }
                self.settle(Err(failure.into_cause()));
            }
        }
    }

    pub(crate) fn subscribe(&self, callback: Rc<dyn Fn()>) -> usize {
        self.inner.borrow_mut().subs.insert(callback)
    }
}

/// Start a computation loop with a fresh access object, wiring a restart
/// callback that re-launches the same compute function as a new pass.
pub(crate) fn launch<T: Clone + 'static>(
    store: &Store,
    cell: &Rc<EntryCell<T>>,
    generation: u64,
    f: SharedComputeFn<T>,
) {
    let host = cell.clone() as Rc<dyn AnyEntry>;
    let access = Rc::new(ReadAccess::new(
        store.downgrade(),
        Rc::downgrade(&host),
        cell.key.clone(),
        generation,
    ));
    let restart: RestartFn = {
        let key = cell.key.clone();
        let capability = cell.capability;
        let f = f.clone();
        Rc::new(move |store: &Store| {
            let cell = store.cell::<T>(&key, capability);
            launch(store, &cell, generation, f.clone());
        })
    };
    cell.run_loop(store, f, access, restart);
}

/// Type-erased view of an entry, as stored in the registry and in
/// down-dependency lists.
pub(crate) trait AnyEntry: 'static {
    fn key(&self) -> &Key;
    fn capability(&self) -> Capability;
    fn as_any(self: Rc<Self>) -> Rc<dyn Any>;
    fn invalidate_dyn(self: Rc<Self>, store: &Store, skip_restart: bool);
    /// Idempotent per dependent key; replaces a stale edge in place.
    fn register_dependent(&self, key: Key, dependent: Weak<dyn AnyEntry>);
    /// Record one read, deduplicated, as it happens.
    fn note_up_dep(&self, dep: Key);
    /// Wholesale replacement, at the start of a computation pass.
    fn replace_up_deps(&self, deps: Vec<Key>);
    fn memo_table(&self) -> &RefCell<MemoTable>;
    fn unsubscribe(&self, id: usize);
}

impl<T: Clone + 'static> AnyEntry for EntryCell<T> {
    fn key(&self) -> &Key {
        &self.key
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn invalidate_dyn(self: Rc<Self>, store: &Store, skip_restart: bool) {
        EntryCell::invalidate(&self, store, skip_restart);
    }

    fn register_dependent(&self, key: Key, dependent: Weak<dyn AnyEntry>) {
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.down_deps.iter_mut().find(|(existing, _)| *existing == key) {
            slot.1 = dependent;
        } else {
            inner.down_deps.push((key, dependent));
        }
    }

    fn note_up_dep(&self, dep: Key) {
        self.seed_up_dep(dep);
    }

    fn replace_up_deps(&self, deps: Vec<Key>) {
        self.inner.borrow_mut().up_deps = deps;
    }

    fn memo_table(&self) -> &RefCell<MemoTable> {
        &self.memo
    }

    fn unsubscribe(&self, id: usize) {
        let mut inner = self.inner.borrow_mut();
        if inner.subs.contains(id) {
            inner.subs.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn cell(store: &Store, name: &str) -> Rc<EntryCell<i32>> {
        store.cell::<i32>(&Key::new(name), Capability::Settable)
    }

    #[test]
    fn fresh_entry_starts_in_init() {
        let store = Store::new();
        let entry = cell(&store, "a");
        assert_eq!(entry.state(), EntryState::Init);
        assert!(entry.should_recompute());
        assert!(entry.current().is_pending());
    }

    #[test]
    fn settle_then_invalidate_walks_the_lifecycle() {
        let store = Store::new();
        let entry = cell(&store, "a");
        entry.apply(&store, FutureValue::Present(5), None);
        assert_eq!(entry.state(), EntryState::Settled);
        assert_eq!(entry.current().present(), Some(5));

        entry.invalidate(&store, false);
        assert_eq!(entry.state(), EntryState::Invalid);
        assert!(entry.current().is_pending());
        // The seed survives invalidation.
        assert!(matches!(entry.last_settled(), Some(Ok(5))));
    }

    #[test]
    fn invalidate_discards_and_mints_the_completion_handle() {
        let store = Store::new();
        let entry = cell(&store, "a");
        entry.apply(&store, FutureValue::Present(5), None);
        let old = entry.current();
        let epoch = entry.epoch();
        entry.invalidate(&store, false);
        assert_eq!(entry.epoch(), epoch + 1);
        // Late holders of the old handle observe a canceled handle that kept
        // its value.
        let FutureValue::Present(_) = old else {
            panic!("expected the old settled value");
        };
        let FutureValue::Pending(fresh) = entry.current() else {
            panic!("expected a fresh pending handle");
        };
        assert!(!fresh.is_canceled());
    }

    #[test]
    #[should_panic(expected = "cannot be written")]
    fn settling_twice_is_a_protocol_error() {
        let store = Store::new();
        let entry = cell(&store, "a");
        entry.apply(&store, FutureValue::Present(1), None);
        entry.apply(&store, FutureValue::Present(2), None);
    }

    #[test]
    fn stale_fiber_settlement_is_swallowed() {
        let store = Store::new();
        let collector = Rc::new(crate::tracer::EventCollector::new());
        store.set_tracer(collector.clone());

        let entry = cell(&store, "a");
        let (completer, handle) = AsyncHandle::channel();
        entry.apply(&store, FutureValue::Pending(handle), None);
        assert_eq!(entry.state(), EntryState::Pending);

        // No restart installed: invalidation cancels the fiber directly.
        entry.invalidate(&store, false);
        assert_eq!(entry.state(), EntryState::Invalid);

        // The old fiber finally settles; the entry must not move.
        completer.resolve(9);
        assert_eq!(entry.state(), EntryState::Invalid);
        assert!(collector.count(|e| matches!(e, FlowEvent::FiberCanceled { .. })) >= 1);
    }

    #[test]
    fn pending_entry_settles_when_fiber_resolves() {
        let store = Store::new();
        let entry = cell(&store, "a");
        let (completer, handle) = AsyncHandle::channel();
        entry.apply(&store, FutureValue::Pending(handle), None);
        completer.resolve(12);
        assert_eq!(entry.state(), EntryState::Settled);
        assert_eq!(entry.current().present(), Some(12));
    }

    #[test]
    fn canceling_twice_is_noop() {
        let store = Store::new();
        let entry = cell(&store, "a");
        let (_completer, handle) = AsyncHandle::<i32>::channel();
        entry.apply(&store, FutureValue::Pending(handle), None);
        entry.invalidate(&store, false);
        entry.invalidate(&store, false);
        assert_eq!(entry.state(), EntryState::Invalid);
    }

    #[test]
    fn capability_table_gates_operations() {
        assert!(Capability::Readable.allows(EntryOp::Read));
        assert!(!Capability::Readable.allows(EntryOp::Write));
        assert!(Capability::Settable.allows(EntryOp::Write));
        assert!(!Capability::Settable.allows(EntryOp::Reduce));
        assert!(Capability::Reducing.allows(EntryOp::Reduce));
    }
}
