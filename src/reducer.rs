//! Reducing entries: derived from a previous value and a command.

use std::cell::RefCell;
use std::rc::Rc;

use crate::access::{ReadAccess, Readable, Reducing, Settable, WriteAccess};
use crate::entry::{Capability, EntryCell, EntryOp, EntryState, SharedComputeFn};
use crate::error::FlowError;
use crate::input::Initializer;
use crate::key::Key;
use crate::snapshot::Codec;
use crate::store::{Store, Subscription};
use crate::value::{Cause, FutureValue, Material};

/// Seed of one reduction pass.
enum Seed<T> {
    /// The entry's last settled outcome, or nothing for a first run.
    Settled(Option<Result<T, Cause>>),
    /// Material supplied by a direct write; a null reduction re-records
    /// dependencies around it.
    Material(FutureValue<T>),
}

/// A reducing entry: commands fold into the previous settled value.
///
/// The reduction function receives the previous value and the command being
/// applied. A read that finds the entry stale re-runs it with no command
/// (a null reduction) so the value recomputes from its dependencies; the
/// seed for a first run comes from the initializer. A reducer asked to run
/// with neither a settled value nor an initializer is a protocol error.
///
/// # Example
///
/// ```
/// use value_flow::{Material, Reducer, Store};
///
/// let store = Store::new();
/// let counter = Reducer::new("counter", |_access, prev: i32, cmd: Option<i32>| {
///     Ok(Material::from(prev + cmd.unwrap_or(0)))
/// })
/// .with_default(0);
/// counter.reduce(&store, 3);
/// counter.reduce(&store, 4);
/// assert_eq!(counter.get(&store).present(), Some(7));
/// ```
pub struct Reducer<T, C> {
    key: Key,
    reduce: Rc<dyn Fn(&ReadAccess, T, Option<C>) -> Result<Material<T>, FlowError>>,
    init: Option<Initializer<T>>,
    generation: u64,
    codec: Option<Rc<dyn Codec<T>>>,
}

impl<T: Clone, C> Clone for Reducer<T, C> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            reduce: self.reduce.clone(),
            init: self.init.clone(),
            generation: self.generation,
            codec: self.codec.clone(),
        }
    }
}

impl<T: Clone + 'static, C: Clone + 'static> Reducer<T, C> {
    /// Define a reducing entry from its reduction function.
    pub fn new(
        key: impl Into<Key>,
        reduce: impl Fn(&ReadAccess, T, Option<C>) -> Result<Material<T>, FlowError> + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            reduce: Rc::new(reduce),
            init: None,
            generation: 0,
            codec: None,
        }
    }

    /// Seed the first reduction from an initializer.
    pub fn with_initializer(mut self, init: Initializer<T>) -> Self {
        self.init = Some(init);
        self
    }

    /// Seed the first reduction from a fixed value.
    pub fn with_default(self, value: T) -> Self {
        self.with_initializer(Initializer::value(value))
    }

    /// Tag the definition with a generation token.
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Serialize the settled value into snapshots with this codec.
    pub fn with_codec(mut self, codec: impl Codec<T> + 'static) -> Self {
        self.codec = Some(Rc::new(codec));
        self
    }

    fn materialize(&self, store: &Store) -> Rc<EntryCell<T>> {
        store.materialize(&self.key, Capability::Reducing, self.codec.as_ref())
    }

    /// The current future-value, running a null reduction if stale.
    pub fn get(&self, store: &Store) -> FutureValue<T> {
        self.read(store)
    }

    /// Fold one command into the value.
    pub fn reduce(&self, store: &Store, command: C) {
        store.with_access(|access| access.reduce(self, command));
    }

    /// Replace the value, re-recording dependencies through a null
    /// reduction. Absent material clears the seed instead.
    pub fn set(&self, store: &Store, material: impl Into<Material<T>>) {
        store.with_access(|access| access.set(self, material));
    }

    /// Mark the entry stale; the next read runs a null reduction.
    pub fn refresh(&self, store: &Store) {
        store.with_access(|access| access.refresh(self));
    }

    /// Observe invalidations. Dropping the subscription unsubscribes.
    pub fn subscribe(&self, store: &Store, callback: impl Fn() + 'static) -> Subscription {
        let cell = self.materialize(store);
        let id = cell.subscribe(Rc::new(callback));
        Subscription::new(store.downgrade(), self.key.clone(), id)
    }

    /// Launch one reduction pass.
    ///
    /// The seed is resolved once per loop instance and cached, so a pass
    /// suspended inside the reduction does not re-run the seed computation
    /// on re-entry.
    fn run_reduction(
        &self,
        store: &Store,
        cell: &Rc<EntryCell<T>>,
        seed: Seed<T>,
        command: Option<C>,
    ) {
        let reduce = self.reduce.clone();
        let init = self.init.clone();
        let key = self.key.clone();
        let resolved: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let f: SharedComputeFn<T> = Rc::new(move |access| {
            let cached = resolved.borrow().clone();
            let prev = match cached {
                Some(value) => value,
                None => {
                    let value = match &seed {
                        Seed::Settled(Some(Ok(value))) => value.clone(),
                        Seed::Settled(Some(Err(cause))) => {
                            return Err(FlowError::Failed(cause.clone()))
                        }
                        Seed::Settled(None) => match &init {
                            Some(init) => init.seed(access)?,
                            None => panic!(
                                "reducing entry `{key}` has no settled value and no initializer"
                            ),
                        },
                        Seed::Material(value) => value.clone().ready()?,
                    };
                    *resolved.borrow_mut() = Some(value.clone());
                    value
                }
            };
            reduce(access, prev, command.clone())
        });
        crate::entry::launch(store, cell, self.generation, f);
    }
}

impl<T: Clone + 'static, C: Clone + 'static> Readable<T> for Reducer<T, C> {
    fn key(&self) -> &Key {
        &self.key
    }

    fn read(&self, store: &Store) -> FutureValue<T> {
        let cell = self.materialize(store);
        cell.capability().require(EntryOp::Read, &self.key);
        if cell.should_recompute() {
            let last = cell.last_settled();
            self.run_reduction(store, &cell, Seed::Settled(last), None);
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

impl<T: Clone + 'static, C: Clone + 'static> Settable<T> for Reducer<T, C> {
    fn write(&self, access: &WriteAccess, material: Material<T>) {
        let store = access.store();
        store.assert_writable(&self.key);
        let cell = self.materialize(store);
        cell.capability().require(EntryOp::Write, &self.key);
        if !cell.should_recompute() {
            cell.invalidate(store, true);
        }
        match FutureValue::wrap(material) {
            // Clearing the seed: the next run falls back to the initializer.
            FutureValue::Absent => cell.apply(store, FutureValue::Absent, None),
            value => self.run_reduction(store, &cell, Seed::Material(value), None),
        }
    }
}

impl<T: Clone + 'static, C: Clone + 'static> Reducing<T, C> for Reducer<T, C> {
    fn dispatch(&self, store: &Store, command: C) {
        store.assert_writable(&self.key);
        let cell = self.materialize(store);
        cell.capability().require(EntryOp::Reduce, &self.key);
        if !cell.should_recompute() {
            cell.invalidate(store, true);
        }
        let last = cell.last_settled();
        self.run_reduction(store, &cell, Seed::Settled(last), Some(command));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::AsyncHandle;
    use crate::input::Input;

    fn accumulator() -> Reducer<i32, i32> {
        Reducer::new("acc", |_access, prev: i32, cmd: Option<i32>| {
            Ok(Material::from(prev + cmd.unwrap_or(0)))
        })
        .with_default(0)
    }

    #[test]
    fn commands_fold_into_the_seed() {
        let store = Store::new();
        let acc = accumulator();
        acc.reduce(&store, 3);
        assert_eq!(acc.get(&store).present(), Some(3));
        acc.reduce(&store, 4);
        assert_eq!(acc.get(&store).present(), Some(7));
    }

    #[test]
    fn read_of_a_fresh_reducer_runs_a_null_reduction() {
        let store = Store::new();
        let acc = accumulator();
        assert_eq!(acc.get(&store).present(), Some(0));
        assert_eq!(acc.state(&store), EntryState::Settled);
    }

    #[test]
    #[should_panic(expected = "no settled value and no initializer")]
    fn reducer_without_seed_is_a_protocol_error() {
        let store = Store::new();
        let acc: Reducer<i32, i32> =
            Reducer::new("bare", |_access, prev, _cmd| Ok(Material::from(prev)));
        let _ = acc.get(&store);
    }

    #[test]
    fn set_replaces_the_previous_value() {
        let store = Store::new();
        let acc = accumulator();
        acc.reduce(&store, 3);
        acc.set(&store, 100);
        acc.reduce(&store, 1);
        assert_eq!(acc.get(&store).present(), Some(101));
    }

    #[test]
    fn set_absent_falls_back_to_the_initializer() {
        let store = Store::new();
        let acc = accumulator();
        acc.reduce(&store, 9);
        acc.set(&store, Material::future(FutureValue::Absent));
        assert_eq!(acc.get(&store).present(), Some(0));
    }

    #[test]
    fn reduction_may_read_other_entries() {
        let store = Store::new();
        let step = Input::new("step").with_default(10);
        let acc: Reducer<i32, ()> = Reducer::new("acc", {
            let step = step.clone();
            move |access, prev, cmd| {
                let step = access.get(&step)?;
                Ok(Material::from(if cmd.is_some() { prev + step } else { prev }))
            }
        })
        .with_default(0);
        acc.reduce(&store, ());
        acc.reduce(&store, ());
        assert_eq!(acc.get(&store).present(), Some(20));

        // Changing the read entry invalidates the reducer; the null
        // reduction keeps the accumulated value.
        step.set(&store, 1);
        assert_eq!(acc.get(&store).present(), Some(20));
        acc.reduce(&store, ());
        assert_eq!(acc.get(&store).present(), Some(21));
    }

    #[test]
    fn seed_from_pending_material_suspends_the_reduction() {
        let store = Store::new();
        let acc = accumulator();
        let (completer, handle) = AsyncHandle::channel();
        acc.set(&store, Material::handle(handle));
        assert_eq!(acc.state(&store), EntryState::Pending);
        completer.resolve(40);
        assert_eq!(acc.state(&store), EntryState::Settled);
        acc.reduce(&store, 2);
        assert_eq!(acc.get(&store).present(), Some(42));
    }

    #[test]
    fn reduction_to_pending_material_settles_from_the_handle() {
        let store = Store::new();
        let acc: Reducer<i32, i32> = Reducer::new("acc", |_access, prev: i32, cmd| {
            let (completer, handle) = AsyncHandle::channel();
            completer.resolve(prev + cmd.unwrap_or(0));
            Ok(Material::handle(handle))
        })
        .with_default(5);
        acc.reduce(&store, 6);
        assert_eq!(acc.get(&store).present(), Some(11));
    }
}
