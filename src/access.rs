//! Computation access objects and the memo table.
//!
//! A [`ReadAccess`] is handed to compute functions: reads through it are
//! recorded as dependency edges, unwrapping a pending value suspends the
//! pass, and [`ReadAccess::memo`] gives each call site a keyed slot for
//! long-lived sub-resources. A [`WriteAccess`] is the surface of a batched
//! action block opened with [`Store::with_access`]; it is locked when the
//! block returns, so escaping clones cannot write outside the window.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::entry::{AnyEntry, EntryState};
use crate::error::FlowError;
use crate::handle::Suspension;
use crate::key::Key;
use crate::store::{Store, WeakStore};
use crate::tracer::FlowEvent;
use crate::value::{Cause, FutureValue, Material};

/// A named entry definition that can be read from a store.
///
/// Implemented by every entry kind. Reading resolves the backing cell,
/// restores it from a waiting snapshot record, launches a computation when
/// the entry is stale, and returns the current future-value.
pub trait Readable<T: Clone + 'static> {
    /// The entry's stable name.
    fn key(&self) -> &Key;

    /// The current future-value, recomputing if the entry is stale.
    fn read(&self, store: &Store) -> FutureValue<T>;

    /// The entry's lifecycle state, without triggering a computation.
    fn state(&self, store: &Store) -> EntryState;

    /// Mark the entry stale without supplying a new value.
    ///
    /// The raw form of refresh: invalidation and notification propagate when
    /// the enclosing batch closes.
    fn mark_stale(&self, store: &Store);
}

/// An entry definition that accepts direct writes.
pub trait Settable<T: Clone + 'static>: Readable<T> {
    /// Write material into the entry inside an open write window.
    fn write(&self, access: &WriteAccess, material: Material<T>);
}

/// An entry definition driven by reduction commands.
pub trait Reducing<T: Clone + 'static, C>: Settable<T> {
    /// Apply one command inside an open write window.
    fn dispatch(&self, store: &Store, command: C);
}

/// One comparison key of a memo slot.
///
/// Keys compare by value identity per element; floats compare by bit
/// pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoKey {
    /// Always-equal placeholder.
    Unit,
    /// Boolean key.
    Bool(bool),
    /// Integer key.
    Int(i64),
    /// Float key, compared by bit pattern.
    Bits(u64),
    /// Text key.
    Text(String),
}

impl From<()> for MemoKey {
    fn from(_: ()) -> Self {
        MemoKey::Unit
    }
}

impl From<bool> for MemoKey {
    fn from(value: bool) -> Self {
        MemoKey::Bool(value)
    }
}

impl From<i32> for MemoKey {
    fn from(value: i32) -> Self {
        MemoKey::Int(value.into())
    }
}

impl From<i64> for MemoKey {
    fn from(value: i64) -> Self {
        MemoKey::Int(value)
    }
}

impl From<f64> for MemoKey {
    fn from(value: f64) -> Self {
        MemoKey::Bits(value.to_bits())
    }
}

impl From<&str> for MemoKey {
    fn from(value: &str) -> Self {
        MemoKey::Text(value.to_string())
    }
}

impl From<String> for MemoKey {
    fn from(value: String) -> Self {
        MemoKey::Text(value)
    }
}

struct MemoSlot {
    keys: Vec<MemoKey>,
    value: Rc<dyn Any>,
    canceler: Option<Suspension>,
}

impl MemoSlot {
    fn new<R: Clone + 'static>(keys: Vec<MemoKey>, value: FutureValue<R>) -> Self {
        let canceler = match &value {
            FutureValue::Pending(handle) => Some(handle.suspension()),
            _ => None,
        };
        Self {
            keys,
            value: Rc::new(value),
            canceler,
        }
    }

    fn dispose(self) {
        if let Some(canceler) = self.canceler {
            canceler.cancel();
        }
    }
}

/// Positional slot table for one entry's memoized sub-resources.
///
/// Slots survive recomputation; they are disposed only when the owning
/// definition's generation token changes.
pub(crate) struct MemoTable {
    generation: Option<u64>,
    slots: Vec<MemoSlot>,
}

impl MemoTable {
    pub(crate) fn new() -> Self {
        Self {
            generation: None,
            slots: Vec::new(),
        }
    }

    /// Align with the owning definition's generation token. A mismatch
    /// empties the table; the drained slots are returned so the caller can
    /// dispose them outside the table borrow.
    fn ensure_generation(&mut self, generation: u64) -> Vec<MemoSlot> {
        if self.generation == Some(generation) {
            return Vec::new();
        }
        self.generation = Some(generation);
        self.slots.drain(..).collect()
    }
}

/// Read-side access object handed to compute functions.
///
/// One instance is created per computation loop and reused across the
/// loop's suspension re-entries. Every read of another entry is recorded
/// as an up-dependency the moment it happens; the entry's previous edges
/// are cleared when a pass begins, so each pass fully replaces them.
pub struct ReadAccess {
    store: WeakStore,
    host: Weak<dyn AnyEntry>,
    key: Key,
    generation: u64,
    deps: RefCell<Vec<Key>>,
    memo_cursor: Cell<usize>,
}

impl ReadAccess {
    pub(crate) fn new(
        store: WeakStore,
        host: Weak<dyn AnyEntry>,
        key: Key,
        generation: u64,
    ) -> Self {
        Self {
            store,
            host,
            key,
            generation,
            deps: RefCell::new(Vec::new()),
            memo_cursor: Cell::new(0),
        }
    }

    /// Reset pass-local state: the recorded read set starts empty (the pass
    /// fully replaces the entry's previous up-dependencies), and the memo
    /// table is reconciled with the definition's generation.
    pub(crate) fn begin_pass(&self, store: &Store) {
        self.deps.borrow_mut().clear();
        self.memo_cursor.set(0);
        if let Some(host) = self.host.upgrade() {
            host.replace_up_deps(Vec::new());
            let stale = host
                .memo_table()
                .borrow_mut()
                .ensure_generation(self.generation);
            if !stale.is_empty() {
                store.tracer().emit(FlowEvent::MemoTableRebuilt {
                    key: self.key.clone(),
                    generation: self.generation,
                });
            }
            for slot in stale {
                slot.dispose();
            }
        }
    }

    fn live_store(&self) -> Result<Store, FlowError> {
        self.store
            .upgrade()
            .ok_or_else(|| FlowError::Failed(Cause::fault(anyhow::anyhow!("store was disposed"))))
    }

    /// Read and record in one step. Edges register before control returns,
    /// so a change to the dependency reaches this entry even while the pass
    /// is parked on a suspension.
    fn try_value<T: Clone + 'static>(
        &self,
        source: &(impl Readable<T> + ?Sized),
    ) -> Result<FutureValue<T>, FlowError> {
        let store = self.live_store()?;
        if let Some(path) = store.cycle_with(source.key()) {
            return Err(FlowError::Cycle { path });
        }
        let value = source.read(&store);
        let fresh = {
            let mut deps = self.deps.borrow_mut();
            if deps.contains(source.key()) {
                false
            } else {
                deps.push(source.key().clone());
                true
            }
        };
        if fresh {
            if let Some(host) = self.host.upgrade() {
                host.note_up_dep(source.key().clone());
                if let Some(entry) = store.existing_any(source.key()) {
                    entry.register_dependent(self.key.clone(), Rc::downgrade(&host));
                }
            }
        }
        Ok(value)
    }

    /// Read another entry's future-value, recording it as a dependency.
    ///
    /// A read that would re-enter a running computation yields an error
    /// value naming the cycle.
    pub fn value<T: Clone + 'static>(&self, source: &(impl Readable<T> + ?Sized)) -> FutureValue<T> {
        match self.try_value(source) {
            Ok(value) => value,
            Err(err) => FutureValue::Error(err.into_cause()),
        }
    }

    /// Unwrap a future-value: the value when present, a failure when errored
    /// or absent, a suspension request when pending. Propagate with `?`.
    pub fn unwrap<T: Clone + 'static>(&self, value: FutureValue<T>) -> Result<T, FlowError> {
        value.ready()
    }

    /// Unwrap several future-values at once, short-circuiting like
    /// [`FutureValue::all`].
    pub fn unwrap_all<T: Clone + 'static>(
        &self,
        values: Vec<FutureValue<T>>,
    ) -> Result<Vec<T>, FlowError> {
        FutureValue::all(values).ready()
    }

    /// Read and unwrap in one call.
    pub fn get<T: Clone + 'static>(
        &self,
        source: &(impl Readable<T> + ?Sized),
    ) -> Result<T, FlowError> {
        self.try_value(source)?.ready()
    }

    /// Read and unwrap several entries of one value type, suspending until
    /// all of them are available.
    pub fn get_many<T: Clone + 'static>(
        &self,
        sources: &[&dyn Readable<T>],
    ) -> Result<Vec<T>, FlowError> {
        let mut values = Vec::with_capacity(sources.len());
        for source in sources {
            values.push(self.try_value(*source)?);
        }
        FutureValue::all(values).ready()
    }

    /// A keyed memo slot: reuse the previous resource while `keys` compare
    /// equal to the prior pass, else cancel it and run `factory` again.
    ///
    /// Slots are positional, so call sites must execute in a stable order;
    /// changing a slot's key arity between passes is a protocol error. The
    /// table lives on the entry and survives recomputation; it is disposed
    /// as a whole when the definition's generation token changes.
    pub fn memo<R: Clone + 'static>(
        &self,
        factory: impl FnOnce() -> Result<Material<R>, anyhow::Error>,
        keys: Vec<MemoKey>,
    ) -> FutureValue<R> {
        let Some(host) = self.host.upgrade() else {
            return FutureValue::Absent;
        };
        let index = self.memo_cursor.get();
        self.memo_cursor.set(index + 1);
        // The table borrow is released before the factory or a stale slot's
        // cancellation runs; both may re-enter the engine.
        {
            let table = host.memo_table().borrow();
            if let Some(slot) = table.slots.get(index) {
                if slot.keys.len() != keys.len() {
                    panic!(
                        "memo slot {index} of entry `{}` changed arity: {} keys where the previous pass supplied {}",
                        self.key,
                        keys.len(),
                        slot.keys.len()
                    );
                }
                if slot.keys == keys {
                    return slot
                        .value
                        .downcast_ref::<FutureValue<R>>()
                        .expect("memo slot reused with a different resource type")
                        .clone();
                }
            }
        }
        let value = run_factory(factory);
        let replaced = {
            let mut table = host.memo_table().borrow_mut();
            let slot = MemoSlot::new(keys, value.clone());
            if index < table.slots.len() {
                Some(std::mem::replace(&mut table.slots[index], slot))
            } else {
                table.slots.push(slot);
                None
            }
        };
        if let Some(replaced) = replaced {
            replaced.dispose();
        }
        value
    }
}

fn run_factory<R: Clone + 'static>(
    factory: impl FnOnce() -> Result<Material<R>, anyhow::Error>,
) -> FutureValue<R> {
    match factory() {
        Ok(material) => FutureValue::wrap(material),
        Err(err) => FutureValue::Error(Cause::fault(err)),
    }
}

/// Write-side access object for batched action blocks.
///
/// Created by [`Store::with_access`]. Every mutation performed through it
/// lands in one batch: invalidation propagates fully before any subscriber
/// fires, and each subscriber fires at most once. Cheap to clone; all
/// clones share one lock.
#[derive(Clone)]
pub struct WriteAccess {
    inner: Rc<WriteInner>,
}

struct WriteInner {
    store: Store,
    forbidden: Option<Key>,
    locked: Cell<bool>,
}

impl WriteAccess {
    pub(crate) fn new(store: Store, forbidden: Option<Key>) -> Self {
        Self {
            inner: Rc::new(WriteInner {
                store,
                forbidden,
                locked: Cell::new(false),
            }),
        }
    }

    pub(crate) fn lock(&self) {
        self.inner.locked.set(true);
    }

    pub(crate) fn store(&self) -> &Store {
        &self.inner.store
    }

    fn assert_unlocked(&self) {
        if self.inner.locked.get() {
            panic!("write access used outside its window");
        }
    }

    fn assert_allowed(&self, key: &Key) {
        if self.inner.forbidden.as_ref() == Some(key) {
            panic!("entry `{key}` cannot set itself from its own interceptor");
        }
    }

    /// Read an entry's current future-value without recording a dependency.
    pub fn value<T: Clone + 'static>(&self, source: &(impl Readable<T> + ?Sized)) -> FutureValue<T> {
        self.assert_unlocked();
        source.read(&self.inner.store)
    }

    /// Write material into a settable entry.
    pub fn set<T: Clone + 'static>(
        &self,
        target: &(impl Settable<T> + ?Sized),
        material: impl Into<Material<T>>,
    ) {
        self.assert_unlocked();
        self.assert_allowed(target.key());
        target.write(self, material.into());
    }

    /// Apply a command to a reducing entry.
    pub fn reduce<T: Clone + 'static, C>(
        &self,
        target: &(impl Reducing<T, C> + ?Sized),
        command: C,
    ) {
        self.assert_unlocked();
        self.assert_allowed(target.key());
        target.dispatch(&self.inner.store, command);
    }

    /// Mark an entry stale without supplying a new value.
    pub fn refresh<T: Clone + 'static>(&self, target: &(impl Readable<T> + ?Sized)) {
        self.assert_unlocked();
        self.assert_allowed(target.key());
        target.mark_stale(&self.inner.store);
    }
}
