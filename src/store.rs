//! The registry: name → entry mapping and batched propagation.
//!
//! A [`Store`] is cheap to clone; all state lives behind one shared
//! allocation. Entries are created lazily on first access and live for the
//! store's lifetime.
//!
//! Invalidation and notification are batched: while a batch is open,
//! invalidations and subscriber callbacks accumulate instead of running.
//! Closing the outermost batch first drains invalidations to a fixpoint, then
//! fires every queued subscriber exactly once — observers never see a
//! partially propagated update.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use ahash::RandomState;

use crate::access::WriteAccess;
use crate::entry::{AnyEntry, Capability, EntryCell};
use crate::key::Key;
use crate::snapshot::{self, Bridge, Codec, Snapshot, SnapshotError, SourceAdapter};
use crate::tracer::{NoopTracer, Tracer};

/// The dependency-tracked cache of named asynchronous values.
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

pub(crate) struct WeakStore(Weak<StoreInner>);

impl WeakStore {
    pub(crate) fn upgrade(&self) -> Option<Store> {
        self.0.upgrade().map(|inner| Store { inner })
    }
}

pub(crate) struct StoreInner {
    entries: RefCell<HashMap<Key, Rc<dyn AnyEntry>, RandomState>>,
    batch: RefCell<BatchState>,
    draining: Cell<bool>,
    eval_stack: RefCell<Vec<Key>>,
    tracer: RefCell<Rc<dyn Tracer>>,
    pub(crate) bridge: Bridge,
    sealed: Cell<bool>,
}

#[derive(Default)]
struct BatchState {
    depth: usize,
    invalidations: Vec<Rc<dyn AnyEntry>>,
    invalidation_seen: HashSet<Key, RandomState>,
    notifications: Vec<Rc<dyn Fn()>>,
    notification_seen: HashSet<(Key, usize), RandomState>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    fn with_bridge(bridge: Bridge) -> Self {
        Store {
            inner: Rc::new(StoreInner {
                entries: RefCell::new(HashMap::with_hasher(RandomState::new())),
                batch: RefCell::new(BatchState::default()),
                draining: Cell::new(false),
                eval_stack: RefCell::new(Vec::new()),
                tracer: RefCell::new(Rc::new(NoopTracer)),
                bridge,
                sealed: Cell::new(false),
            }),
        }
    }

    /// A plain store: no recording, no replay.
    pub fn new() -> Self {
        Self::with_bridge(Bridge::direct())
    }

    /// A store that notes touched entries for snapshotting.
    pub fn recording() -> Self {
        Self::with_bridge(Bridge::recording())
    }

    /// A store that replays a snapshot: the first access to a recorded name
    /// is pre-seeded instead of recomputed.
    pub fn replaying(snapshot: Snapshot) -> Self {
        Self::with_bridge(Bridge::replaying(snapshot))
    }

    /// Install a tracer for engine diagnostics.
    pub fn set_tracer(&self, tracer: Rc<dyn Tracer>) {
        *self.inner.tracer.borrow_mut() = tracer;
    }

    pub(crate) fn tracer(&self) -> Rc<dyn Tracer> {
        self.inner.tracer.borrow().clone()
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore(Rc::downgrade(&self.inner))
    }

    pub(crate) fn bridge(&self) -> &Bridge {
        &self.inner.bridge
    }

    /// Resolve or create the typed entry cell for a key.
    ///
    /// Re-registering a name with a different value type or capability is a
    /// protocol error.
    pub(crate) fn cell<T: Clone + 'static>(
        &self,
        key: &Key,
        capability: Capability,
    ) -> Rc<EntryCell<T>> {
        let existing = self.inner.entries.borrow().get(key).cloned();
        if let Some(existing) = existing {
            if existing.capability() != capability {
                panic!(
                    "entry `{key}` is already registered as {:?}",
                    existing.capability()
                );
            }
            return existing
                .as_any()
                .downcast::<EntryCell<T>>()
                .unwrap_or_else(|_| {
                    panic!("entry `{key}` is already registered with a different value type")
                });
        }
        let cell = EntryCell::<T>::new(key.clone(), capability);
        let erased = cell.clone() as Rc<dyn AnyEntry>;
        self.inner
            .entries
            .borrow_mut()
            .insert(key.clone(), erased.clone());
        self.inner.bridge.wire_pending_edges(key, &erased);
        cell
    }

    /// Resolve the typed cell the way entry kinds do: create it lazily, note
    /// the definition when recording, and consume a waiting replay record.
    pub(crate) fn materialize<T: Clone + 'static>(
        &self,
        key: &Key,
        capability: Capability,
        codec: Option<&Rc<dyn Codec<T>>>,
    ) -> Rc<EntryCell<T>> {
        let cell = self.cell::<T>(key, capability);
        if self.inner.bridge.is_recording() {
            self.inner
                .bridge
                .note(Rc::new(SourceAdapter::new(key.clone(), codec.cloned())));
        }
        snapshot::try_restore(self, key, &cell, codec);
        cell
    }

    /// The typed entry cell, if the key was ever materialized.
    pub(crate) fn existing_cell<T: Clone + 'static>(&self, key: &Key) -> Option<Rc<EntryCell<T>>> {
        let existing = self.inner.entries.borrow().get(key).cloned()?;
        Some(existing.as_any().downcast::<EntryCell<T>>().unwrap_or_else(|_| {
            panic!("entry `{key}` is already registered with a different value type")
        }))
    }

    pub(crate) fn existing_any(&self, key: &Key) -> Option<Rc<dyn AnyEntry>> {
        self.inner.entries.borrow().get(key).cloned()
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Open a batch. Reentrant; reference-counted.
    pub fn start_batch(&self) {
        self.inner.batch.borrow_mut().depth += 1;
    }

    /// Close a batch. Closing the outermost batch drains pending
    /// invalidations and fires queued subscriber callbacks.
    pub fn end_batch(&self) {
        {
            let mut batch = self.inner.batch.borrow_mut();
            if batch.depth == 0 {
                panic!("end_batch without a matching start_batch");
            }
            batch.depth -= 1;
            if batch.depth > 0 {
                return;
            }
        }
        if !self.inner.draining.get() {
            self.drain();
        }
    }

    /// Queue subscriber callbacks, deduplicated per subscription.
    pub(crate) fn queue_notifications(&self, key: &Key, subs: Vec<(usize, Rc<dyn Fn()>)>) {
        {
            let mut batch = self.inner.batch.borrow_mut();
            for (id, callback) in subs {
                if batch.notification_seen.insert((key.clone(), id)) {
                    batch.notifications.push(callback);
                }
            }
        }
        self.drain_if_idle();
    }

    /// Queue downstream entries for invalidation, deduplicated per key.
    pub(crate) fn queue_invalidations(&self, entries: Vec<Rc<dyn AnyEntry>>) {
        {
            let mut batch = self.inner.batch.borrow_mut();
            for entry in entries {
                if batch.invalidation_seen.insert(entry.key().clone()) {
                    batch.invalidations.push(entry);
                }
            }
        }
        self.drain_if_idle();
    }

    fn drain_if_idle(&self) {
        let idle = self.inner.batch.borrow().depth == 0;
        if idle && !self.inner.draining.get() {
            self.drain();
        }
    }

    /// Propagate all pending invalidations to a fixpoint, then fire each
    /// queued subscriber callback exactly once.
    fn drain(&self) {
        self.inner.draining.set(true);
        loop {
            let pending = {
                let mut batch = self.inner.batch.borrow_mut();
                if batch.invalidations.is_empty() {
                    break;
                }
                batch.invalidation_seen.clear();
                std::mem::take(&mut batch.invalidations)
            };
            for entry in pending {
                entry.invalidate_dyn(self, false);
            }
        }
        self.inner.draining.set(false);
        let callbacks = {
            let mut batch = self.inner.batch.borrow_mut();
            batch.notification_seen.clear();
            std::mem::take(&mut batch.notifications)
        };
        for callback in callbacks {
            callback();
        }
    }

    // ------------------------------------------------------------------
    // Evaluation stack (cycle detection)
    // ------------------------------------------------------------------

    pub(crate) fn eval_push(&self, key: &Key) {
        self.inner.eval_stack.borrow_mut().push(key.clone());
    }

    pub(crate) fn eval_pop(&self) {
        self.inner.eval_stack.borrow_mut().pop();
    }

    /// The cycle path, if reading `key` would re-enter a running computation.
    pub(crate) fn cycle_with(&self, key: &Key) -> Option<Vec<String>> {
        let stack = self.inner.eval_stack.borrow();
        if !stack.contains(key) {
            return None;
        }
        let mut path: Vec<String> = stack.iter().map(|k| k.to_string()).collect();
        path.push(key.to_string());
        Some(path)
    }

    // ------------------------------------------------------------------
    // Write window
    // ------------------------------------------------------------------

    /// Close the one-shot initialization window of a recording store.
    ///
    /// Writes after sealing are protocol errors; a recording pass must not
    /// mutate state once serialization may have begun.
    pub fn seal(&self) {
        self.inner.sealed.set(true);
    }

    pub(crate) fn assert_writable(&self, key: &Key) {
        if self.inner.sealed.get() && self.inner.bridge.is_recording() {
            panic!("entry `{key}` cannot be written after the recording store is sealed");
        }
    }

    // ------------------------------------------------------------------
    // Write access blocks
    // ------------------------------------------------------------------

    /// Run a closure against a write access object inside one batch.
    ///
    /// All invalidations triggered by the closure are propagated together,
    /// and every affected subscriber fires at most once, after the closure
    /// returns. The access object is locked afterwards; escaping clones
    /// cannot write outside the window.
    pub fn with_access<R>(&self, f: impl FnOnce(&WriteAccess) -> R) -> R {
        self.with_access_forbidding(None, f)
    }

    pub(crate) fn with_access_forbidding<R>(
        &self,
        forbidden: Option<Key>,
        f: impl FnOnce(&WriteAccess) -> R,
    ) -> R {
        let access = WriteAccess::new(self.clone(), forbidden);
        self.start_batch();
        let out = f(&access);
        access.lock();
        self.end_batch();
        out
    }

    // ------------------------------------------------------------------
    // Snapshot bridge plumbing
    // ------------------------------------------------------------------

    /// Serialize the settled noted entries of a recording store into a
    /// snapshot chunk.
    ///
    /// Pending entries are deferred to a later flush; with `last` set a
    /// still-pending entry is an error. A name serialized once with a codec
    /// must not be re-serialized without one, nor the reverse.
    pub fn flush(&self, last: bool) -> Result<Snapshot, SnapshotError> {
        self.inner.bridge.flush(self, last)
    }
}

/// Handle to one subscriber callback; dropping it unsubscribes.
pub struct Subscription {
    store: WeakStore,
    key: Key,
    id: usize,
}

impl Subscription {
    pub(crate) fn new(store: WeakStore, key: Key, id: usize) -> Self {
        Self { store, key, id }
    }

    /// Remove the callback now instead of on drop.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            if let Some(entry) = store.existing_any(&self.key) {
                entry.unsubscribe(self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FutureValue;

    #[test]
    fn cells_are_created_lazily_and_shared() {
        let store = Store::new();
        let key = Key::new("x");
        let a = store.cell::<i32>(&key, Capability::Settable);
        let b = store.cell::<i32>(&key, Capability::Settable);
        assert!(Rc::ptr_eq(&a, &b));
        assert!(store.existing_any(&key).is_some());
        assert!(store.existing_any(&Key::new("y")).is_none());
    }

    #[test]
    #[should_panic(expected = "different value type")]
    fn type_mismatch_is_a_protocol_error() {
        let store = Store::new();
        let key = Key::new("x");
        let _ = store.cell::<i32>(&key, Capability::Settable);
        let _ = store.cell::<String>(&key, Capability::Settable);
    }

    #[test]
    #[should_panic(expected = "already registered as")]
    fn capability_mismatch_is_a_protocol_error() {
        let store = Store::new();
        let key = Key::new("x");
        let _ = store.cell::<i32>(&key, Capability::Settable);
        let _ = store.cell::<i32>(&key, Capability::Readable);
    }

    #[test]
    #[should_panic(expected = "without a matching start_batch")]
    fn unbalanced_end_batch_panics() {
        let store = Store::new();
        store.end_batch();
    }

    #[test]
    fn batch_defers_subscriber_callbacks() {
        let store = Store::new();
        let key = Key::new("x");
        let cell = store.cell::<i32>(&key, Capability::Settable);
        let hits = Rc::new(Cell::new(0));
        let hits2 = hits.clone();
        cell.subscribe(Rc::new(move || hits2.set(hits2.get() + 1)));
        cell.apply(&store, FutureValue::Present(1), None);

        store.start_batch();
        cell.invalidate(&store, false);
        assert_eq!(hits.get(), 0, "notification must wait for the batch");
        store.end_batch();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn duplicate_invalidation_in_one_batch_notifies_once() {
        let store = Store::new();
        let key = Key::new("x");
        let cell = store.cell::<i32>(&key, Capability::Settable);
        let hits = Rc::new(Cell::new(0));
        let hits2 = hits.clone();
        cell.subscribe(Rc::new(move || hits2.set(hits2.get() + 1)));
        cell.apply(&store, FutureValue::Present(1), None);

        store.start_batch();
        cell.invalidate(&store, false);
        cell.invalidate(&store, false);
        store.end_batch();
        assert_eq!(hits.get(), 1);
    }
}
