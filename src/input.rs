//! Settable input entries.
//!
//! An [`Input`] is a named slot written from outside the graph and read by
//! derived computations. Until the first write it yields its initializer,
//! or reads as absent when it has none.

use std::rc::Rc;

use crate::access::{ReadAccess, Readable, Settable, WriteAccess};
use crate::entry::{launch, Capability, EntryCell, EntryOp, EntryState, SharedComputeFn};
use crate::error::FlowError;
use crate::key::Key;
use crate::snapshot::Codec;
use crate::store::{Store, Subscription};
use crate::value::{FutureValue, Material};

/// Seed for an entry that has never settled.
pub enum Initializer<T> {
    /// A fixed starting value.
    Value(T),
    /// A zero-argument producer invoked per initialization.
    Producer(Rc<dyn Fn() -> T>),
    /// Another readable entry; reading it records a dependency edge.
    Entry(Rc<dyn Fn(&ReadAccess) -> Result<Material<T>, FlowError>>),
}

impl<T: Clone + 'static> Initializer<T> {
    /// Initialize from a fixed value.
    pub fn value(value: T) -> Self {
        Initializer::Value(value)
    }

    /// Initialize from a producer closure.
    pub fn producer(producer: impl Fn() -> T + 'static) -> Self {
        Initializer::Producer(Rc::new(producer))
    }

    /// Initialize from another entry.
    pub fn entry(source: impl Readable<T> + 'static) -> Self {
        Initializer::Entry(Rc::new(move |access| {
            Ok(Material::future(access.value(&source)))
        }))
    }

    /// The initial material for a first computation pass.
    pub(crate) fn material(&self, access: &ReadAccess) -> Result<Material<T>, FlowError> {
        match self {
            Initializer::Value(value) => Ok(Material::Value(value.clone())),
            Initializer::Producer(producer) => Ok(Material::Value(producer())),
            Initializer::Entry(read) => read(access),
        }
    }

    /// The initial value as a concrete seed, suspending while pending.
    pub(crate) fn seed(&self, access: &ReadAccess) -> Result<T, FlowError> {
        match self.material(access)? {
            Material::Value(value) => Ok(value),
            Material::Handle(handle) => handle.current().ready(),
            Material::Future(value) => value.ready(),
        }
    }
}

impl<T: Clone> Clone for Initializer<T> {
    fn clone(&self) -> Self {
        match self {
            Initializer::Value(value) => Initializer::Value(value.clone()),
            Initializer::Producer(producer) => Initializer::Producer(producer.clone()),
            Initializer::Entry(read) => Initializer::Entry(read.clone()),
        }
    }
}

/// A settable input entry.
///
/// Cheap to clone; clones address the same entry in any store.
///
/// # Example
///
/// ```
/// use value_flow::{Input, Store};
///
/// let store = Store::new();
/// let count = Input::new("count").with_default(0);
/// assert_eq!(count.get(&store).present(), Some(0));
/// count.set(&store, 3);
/// assert_eq!(count.get(&store).present(), Some(3));
/// ```
pub struct Input<T> {
    key: Key,
    init: Option<Initializer<T>>,
    codec: Option<Rc<dyn Codec<T>>>,
}

impl<T: Clone> Clone for Input<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            init: self.init.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<T: Clone + 'static> Input<T> {
    /// Define an input with no initializer; it reads as absent until set.
    pub fn new(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            init: None,
            codec: None,
        }
    }

    /// Seed the input from an initializer.
    pub fn with_initializer(mut self, init: Initializer<T>) -> Self {
        self.init = Some(init);
        self
    }

    /// Seed the input from a fixed value.
    pub fn with_default(self, value: T) -> Self {
        self.with_initializer(Initializer::value(value))
    }

    /// Serialize the settled value into snapshots with this codec.
    pub fn with_codec(mut self, codec: impl Codec<T> + 'static) -> Self {
        self.codec = Some(Rc::new(codec));
        self
    }

    fn materialize(&self, store: &Store) -> Rc<EntryCell<T>> {
        store.materialize(&self.key, Capability::Settable, self.codec.as_ref())
    }

    /// The current future-value, computing the initializer if needed.
    pub fn get(&self, store: &Store) -> FutureValue<T> {
        self.read(store)
    }

    /// Write material, invalidating dependents.
    pub fn set(&self, store: &Store, material: impl Into<Material<T>>) {
        store.with_access(|access| access.set(self, material));
    }

    /// Mark the input stale; the next read re-runs the initializer.
    pub fn refresh(&self, store: &Store) {
        store.with_access(|access| access.refresh(self));
    }

    /// Observe invalidations. Dropping the subscription unsubscribes.
    pub fn subscribe(&self, store: &Store, callback: impl Fn() + 'static) -> Subscription {
        let cell = self.materialize(store);
        let id = cell.subscribe(Rc::new(callback));
        Subscription::new(store.downgrade(), self.key.clone(), id)
    }
}

impl<T: Clone + 'static> Readable<T> for Input<T> {
    fn key(&self) -> &Key {
        &self.key
    }

    fn read(&self, store: &Store) -> FutureValue<T> {
        let cell = self.materialize(store);
        cell.capability().require(EntryOp::Read, &self.key);
        if cell.should_recompute() {
            match &self.init {
                Some(init) => {
                    let init = init.clone();
                    let f: SharedComputeFn<T> = Rc::new(move |access| init.material(access));
                    launch(store, &cell, 0, f);
                }
                None => return FutureValue::Absent,
            }
        }
        cell.current()
    }

    fn state(&self, store: &Store) -> EntryState {
        store
            .existing_cell::<T>(&self.key)
            .map_or(EntryState::Init, |cell| cell.state())
    }

    fn mark_stale(&self, store: &Store) {
        self.materialize(store).invalidate(store, false);
    }
}

impl<T: Clone + 'static> Settable<T> for Input<T> {
    fn write(&self, access: &WriteAccess, material: Material<T>) {
        let store = access.store();
        store.assert_writable(&self.key);
        let cell = self.materialize(store);
        cell.capability().require(EntryOp::Write, &self.key);
        if !cell.should_recompute() {
            cell.invalidate(store, true);
        }
        cell.apply(store, FutureValue::wrap(material), None);
    }
}
