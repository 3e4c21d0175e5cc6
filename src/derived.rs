//! Derived entries: computed from other entries, with optional write
//! interception.

use std::rc::Rc;

use crate::access::{ReadAccess, Readable, Settable, WriteAccess};
use crate::entry::{launch, Capability, EntryCell, EntryOp, EntryState, SharedComputeFn};
use crate::error::FlowError;
use crate::handle::AsyncHandle;
use crate::key::Key;
use crate::snapshot::Codec;
use crate::store::{Store, Subscription};
use crate::value::{FutureValue, Material};

/// A derived entry: its value is computed from other entries.
///
/// The compute function reads other entries through the access object; each
/// read is recorded as a dependency edge, and unwrapping a pending value
/// suspends the pass until the awaited handle settles. When any recorded
/// dependency changes, the entry is invalidated and the next read
/// recomputes.
///
/// # Example
///
/// ```
/// use value_flow::{Derived, Input, Material, Store};
///
/// let store = Store::new();
/// let base = Input::new("base").with_default(2);
/// let doubled = Derived::new("doubled", {
///     let base = base.clone();
///     move |access| {
///         let value = access.get(&base)?;
///         Ok(Material::from(value * 2))
///     }
/// });
/// assert_eq!(doubled.get(&store).present(), Some(4));
/// ```
pub struct Derived<T> {
    key: Key,
    compute: Rc<dyn Fn(&ReadAccess) -> Result<Material<T>, FlowError>>,
    generation: u64,
    codec: Option<Rc<dyn Codec<T>>>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            compute: self.compute.clone(),
            generation: self.generation,
            codec: self.codec.clone(),
        }
    }
}

impl<T: Clone + 'static> Derived<T> {
    /// Define a derived entry from its compute function.
    pub fn new(
        key: impl Into<Key>,
        compute: impl Fn(&ReadAccess) -> Result<Material<T>, FlowError> + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            compute: Rc::new(compute),
            generation: 0,
            codec: None,
        }
    }

    /// Tag the definition with a generation token.
    ///
    /// Changing the token (hot-swap of the compute function) disposes the
    /// entry's memo table on the next pass.
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
        store.materialize(&self.key, Capability::Readable, self.codec.as_ref())
    }

    /// The current future-value, recomputing if stale.
    pub fn get(&self, store: &Store) -> FutureValue<T> {
        self.read(store)
    }

    /// Discard the cached value; the next read recomputes.
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

impl<T: Clone + 'static> Readable<T> for Derived<T> {
    fn key(&self) -> &Key {
        &self.key
    }

    fn read(&self, store: &Store) -> FutureValue<T> {
        let cell = self.materialize(store);
        cell.capability().require(EntryOp::Read, &self.key);
        if cell.should_recompute() {
            let compute = self.compute.clone();
            let f: SharedComputeFn<T> = Rc::new(move |access| compute(access));
            launch(store, &cell, self.generation, f);
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

/// A derived entry whose writes are intercepted.
///
/// Setting it does not store the material directly: the `on_set` callback
/// receives a write access and the settled value, and typically pushes
/// changes into the upstream inputs the computation reads, so the derived
/// value converges naturally. Setting pending material defers interception
/// until the handle settles; the optional `on_pending` hook observes the
/// handle in the meantime.
pub struct UpdatableDerived<T> {
    key: Key,
    compute: Rc<dyn Fn(&ReadAccess) -> Result<Material<T>, FlowError>>,
    on_set: Rc<dyn Fn(&WriteAccess, FutureValue<T>)>,
    on_pending: Option<Rc<dyn Fn(&WriteAccess, AsyncHandle<T>)>>,
    generation: u64,
    codec: Option<Rc<dyn Codec<T>>>,
}

impl<T> Clone for UpdatableDerived<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            compute: self.compute.clone(),
            on_set: self.on_set.clone(),
            on_pending: self.on_pending.clone(),
            generation: self.generation,
            codec: self.codec.clone(),
        }
    }
}

impl<T: Clone + 'static> UpdatableDerived<T> {
    /// Define an updatable derived entry from its compute function and
    /// write interceptor.
    ///
    /// The interceptor receives the settled value being written — present,
    /// errored, or absent, never pending.
    pub fn new(
        key: impl Into<Key>,
        compute: impl Fn(&ReadAccess) -> Result<Material<T>, FlowError> + 'static,
        on_set: impl Fn(&WriteAccess, FutureValue<T>) + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            compute: Rc::new(compute),
            on_set: Rc::new(on_set),
            on_pending: None,
            generation: 0,
            codec: None,
        }
    }

    /// Observe pending material as soon as it is written, before it settles.
    pub fn with_on_pending(mut self, hook: impl Fn(&WriteAccess, AsyncHandle<T>) + 'static) -> Self {
        self.on_pending = Some(Rc::new(hook));
        self
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
        store.materialize(&self.key, Capability::Settable, self.codec.as_ref())
    }

    /// The current future-value, recomputing if stale.
    pub fn get(&self, store: &Store) -> FutureValue<T> {
        self.read(store)
    }

    /// Run the write interceptor with this material.
    pub fn set(&self, store: &Store, material: impl Into<Material<T>>) {
        store.with_access(|access| access.set(self, material));
    }

    /// Discard the cached value; the next read recomputes.
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

impl<T: Clone + 'static> Readable<T> for UpdatableDerived<T> {
    fn key(&self) -> &Key {
        &self.key
    }

    fn read(&self, store: &Store) -> FutureValue<T> {
        let cell = self.materialize(store);
        cell.capability().require(EntryOp::Read, &self.key);
        if cell.should_recompute() {
            let compute = self.compute.clone();
            let f: SharedComputeFn<T> = Rc::new(move |access| compute(access));
            launch(store, &cell, self.generation, f);
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

impl<T: Clone + 'static> Settable<T> for UpdatableDerived<T> {
    fn write(&self, access: &WriteAccess, material: Material<T>) {
        let store = access.store();
        store.assert_writable(&self.key);
        let cell = self.materialize(store);
        cell.capability().require(EntryOp::Write, &self.key);
        match FutureValue::wrap(material) {
            FutureValue::Pending(handle) => {
                if let Some(hook) = &self.on_pending {
                    let hook = hook.clone();
                    let observed = handle.clone();
                    store.with_access_forbidding(Some(self.key.clone()), move |nested| {
                        hook(nested, observed)
                    });
                }
                // Interception waits for the settled value.
                let target = self.clone();
                let weak = store.downgrade();
                let source = handle.clone();
                handle.on_settle(move || {
                    let Some(store) = weak.upgrade() else {
                        return;
                    };
                    let settled = source.current();
                    store.with_access(|nested| nested.set(&target, Material::future(settled)));
                });
            }
            settled => {
                let on_set = self.on_set.clone();
                store.with_access_forbidding(Some(self.key.clone()), move |nested| {
                    on_set(nested, settled)
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Input;
    use std::cell::Cell;

    #[test]
    fn derived_recomputes_after_dependency_change() {
        let store = Store::new();
        let base = Input::new("base").with_default(1);
        let plus_one = Derived::new("plus_one", {
            let base = base.clone();
            move |access| Ok(Material::from(access.get(&base)? + 1))
        });
        assert_eq!(plus_one.get(&store).present(), Some(2));

        base.set(&store, 41);
        assert_eq!(plus_one.state(&store), EntryState::Invalid);
        assert_eq!(plus_one.get(&store).present(), Some(42));
    }

    #[test]
    fn derived_caches_between_reads() {
        let store = Store::new();
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let derived = Derived::new("d", move |_| {
            counter.set(counter.get() + 1);
            Ok(Material::from(0))
        });
        let _ = derived.get(&store);
        let _ = derived.get(&store);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn compute_failure_is_stored_as_error() {
        let store = Store::new();
        let derived: Derived<i32> =
            Derived::new("d", |_| Err(anyhow::anyhow!("broken").into()));
        assert!(derived.get(&store).error_cause().is_some());
    }

    #[test]
    fn updatable_interceptor_routes_to_inputs() {
        let store = Store::new();
        let base = Input::new("base").with_default(10);
        let mirror = UpdatableDerived::new(
            "mirror",
            {
                let base = base.clone();
                move |access| Ok(Material::from(access.get(&base)?))
            },
            {
                let base = base.clone();
                move |access, value| {
                    if let FutureValue::Present(value) = value {
                        access.set(&base, value);
                    }
                }
            },
        );
        assert_eq!(mirror.get(&store).present(), Some(10));
        mirror.set(&store, 33);
        assert_eq!(base.get(&store).present(), Some(33));
        assert_eq!(mirror.get(&store).present(), Some(33));
    }

    #[test]
    fn updatable_set_of_pending_material_defers_interception() {
        let store = Store::new();
        let base = Input::new("base").with_default(0);
        let pending_seen = Rc::new(Cell::new(false));
        let seen = pending_seen.clone();
        let mirror = UpdatableDerived::new(
            "mirror",
            {
                let base = base.clone();
                move |access| Ok(Material::from(access.get(&base)?))
            },
            {
                let base = base.clone();
                move |access, value| {
                    if let FutureValue::Present(value) = value {
                        access.set(&base, value);
                    }
                }
            },
        )
        .with_on_pending(move |_, _| seen.set(true));

        let (completer, handle) = crate::handle::AsyncHandle::channel();
        mirror.set(&store, Material::handle(handle));
        assert!(pending_seen.get());
        assert_eq!(base.get(&store).present(), Some(0), "not intercepted yet");
        completer.resolve(5);
        assert_eq!(base.get(&store).present(), Some(5));
    }

    #[test]
    #[should_panic(expected = "cannot set itself")]
    fn updatable_self_set_is_a_protocol_error() {
        let store = Store::new();
        let selfish: Rc<Cell<Option<UpdatableDerived<i32>>>> = Rc::new(Cell::new(None));
        let shared = selfish.clone();
        let entry = UpdatableDerived::new(
            "selfish",
            |_| Ok(Material::from(0)),
            move |access, value| {
                let target = shared.take().expect("definition installed");
                access.set(&target, Material::future(value));
            },
        );
        selfish.set(Some(entry.clone()));
        entry.set(&store, 1);
    }
}
