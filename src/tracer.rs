//! Observability hooks for the engine.
//!
//! The engine never logs directly. Diagnostics that matter — invalidation
//! fan-out, stale fiber settlements, snapshot restores — are emitted as
//! [`FlowEvent`]s through the store's [`Tracer`]. The default [`NoopTracer`]
//! discards everything; tests attach an [`EventCollector`] and assert on the
//! collected trace.

use std::cell::RefCell;

use crate::key::Key;

/// An observable engine event.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    /// An entry left its settled or pending state.
    EntryInvalidated {
        /// The invalidated entry.
        key: Key,
        /// Number of recorded upstream dependencies at invalidation time.
        up_deps: usize,
        /// Number of downstream dependents scheduled for invalidation.
        down_deps: usize,
        /// Number of subscriptions scheduled for notification.
        subscribers: usize,
    },
    /// An in-flight fiber was canceled during invalidation.
    FiberCanceled {
        /// The owning entry.
        key: Key,
    },
    /// A fiber settled after it was no longer the entry's current fiber.
    ///
    /// The settlement is swallowed; `canceled` tells whether the stale fiber
    /// had been canceled (expected) or produced a real late outcome.
    StaleFiberSettled {
        /// The owning entry.
        key: Key,
        /// Whether the stale fiber was canceled.
        canceled: bool,
    },
    /// An entry with no restart callback fell back to canceling its output.
    RestartFallback {
        /// The owning entry.
        key: Key,
    },
    /// An entry was pre-seeded from a snapshot record instead of computing.
    EntryRestored {
        /// The restored entry.
        key: Key,
    },
    /// An entry was written into a snapshot.
    EntrySerialized {
        /// The serialized entry.
        key: Key,
        /// `true` when the value payload was encoded, `false` for a
        /// dependencies-only record.
        full: bool,
    },
    /// A memo table was disposed because its generation token changed.
    MemoTableRebuilt {
        /// The owning entry.
        key: Key,
        /// The new generation token.
        generation: u64,
    },
}

/// Receiver for engine events.
pub trait Tracer {
    /// Handle one event. Implementations must not re-enter the store.
    fn emit(&self, event: FlowEvent);
}

/// Tracer that discards all events.
#[derive(Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn emit(&self, _event: FlowEvent) {}
}

/// Tracer that collects events for inspection in tests.
#[derive(Default)]
pub struct EventCollector {
    events: RefCell<Vec<FlowEvent>>,
}

impl EventCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the events collected so far.
    pub fn events(&self) -> Vec<FlowEvent> {
        self.events.borrow().clone()
    }

    /// Drain and return the collected events.
    pub fn take(&self) -> Vec<FlowEvent> {
        std::mem::take(&mut self.events.borrow_mut())
    }

    /// Count events matching a predicate.
    pub fn count(&self, pred: impl Fn(&FlowEvent) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| pred(e)).count()
    }
}

impl Tracer for EventCollector {
    fn emit(&self, event: FlowEvent) {
        self.events.borrow_mut().push(event);
    }
}
