//! Dependency propagation and batched notification across the graph.

use std::cell::Cell;
use std::rc::Rc;

use value_flow::{
    Derived, EntryState, EventCollector, FlowEvent, Input, Material, Readable, Reducer, Store,
};

fn counter() -> (Rc<Cell<usize>>, impl Fn() + 'static) {
    let hits = Rc::new(Cell::new(0));
    let shared = hits.clone();
    (hits, move || shared.set(shared.get() + 1))
}

#[test]
fn upstream_change_invalidates_downstream_and_notifies() {
    let store = Store::new();
    let base = Input::new("base").with_default(1);
    let tenfold = Derived::new("tenfold", {
        let base = base.clone();
        move |access| Ok(Material::from(access.get(&base)? * 10))
    });
    assert_eq!(tenfold.get(&store).present(), Some(10));

    let (hits, callback) = counter();
    let _sub = tenfold.subscribe(&store, callback);

    base.set(&store, 7);
    assert_eq!(hits.get(), 1);
    assert_eq!(tenfold.state(&store), EntryState::Invalid);
    assert_eq!(tenfold.get(&store).present(), Some(70));
}

#[test]
fn duplicate_invalidation_in_one_batch_notifies_once() {
    let store = Store::new();
    let base = Input::new("base").with_default(1);
    let mirror = Derived::new("mirror", {
        let base = base.clone();
        move |access| Ok(Material::from(access.get(&base)?))
    });
    let _ = mirror.get(&store);

    let (hits, callback) = counter();
    let _sub = mirror.subscribe(&store, callback);

    store.with_access(|access| {
        access.refresh(&base);
        access.refresh(&base);
    });
    assert_eq!(hits.get(), 1);
}

#[test]
fn batch_combines_notifications_from_several_upstreams() {
    let store = Store::new();
    let a = Input::new("a").with_default(1);
    let b = Input::new("b").with_default(2);
    let sum = Derived::new("sum", {
        let a = a.clone();
        let b = b.clone();
        move |access| Ok(Material::from(access.get(&a)? + access.get(&b)?))
    });
    assert_eq!(sum.get(&store).present(), Some(3));

    let (hits, callback) = counter();
    let _sub = sum.subscribe(&store, callback);

    store.with_access(|access| {
        access.set(&b, 20);
        access.set(&a, 10);
    });
    assert_eq!(hits.get(), 1, "one combined notification per batch");
    assert_eq!(sum.get(&store).present(), Some(30));
}

#[test]
fn notifications_wait_for_the_outermost_batch() {
    let store = Store::new();
    let base = Input::new("base").with_default(1);
    let _ = base.get(&store);
    let (hits, callback) = counter();
    let _sub = base.subscribe(&store, callback);

    store.start_batch();
    base.set(&store, 2);
    assert_eq!(hits.get(), 0, "the outer batch is still open");
    store.end_batch();
    assert_eq!(hits.get(), 1);
}

#[test]
fn reducer_commands_run_one_invalidate_notify_cycle_each() {
    let store = Store::new();
    let collector = Rc::new(EventCollector::new());
    store.set_tracer(collector.clone());

    let acc: Reducer<i32, i32> = Reducer::new("acc", |_access, prev, cmd: Option<i32>| {
        Ok(Material::from(prev + cmd.unwrap_or(0)))
    })
    .with_default(0);
    assert_eq!(acc.get(&store).present(), Some(0));

    let (hits, callback) = counter();
    let _sub = acc.subscribe(&store, callback);

    acc.reduce(&store, 3);
    assert_eq!(hits.get(), 1);
    assert_eq!(acc.get(&store).present(), Some(3));

    acc.reduce(&store, 4);
    assert_eq!(hits.get(), 2);
    assert_eq!(acc.get(&store).present(), Some(7));

    let invalidations = collector.count(|event| {
        matches!(event, FlowEvent::EntryInvalidated { key, .. } if key.as_str() == "acc")
    });
    assert_eq!(invalidations, 2);
}

#[test]
fn transitive_invalidation_reaches_the_whole_chain() {
    let store = Store::new();
    let base = Input::new("base").with_default(1);
    let middle = Derived::new("middle", {
        let base = base.clone();
        move |access| Ok(Material::from(access.get(&base)? + 1))
    });
    let top = Derived::new("top", {
        let middle = middle.clone();
        move |access| Ok(Material::from(access.get(&middle)? + 1))
    });
    assert_eq!(top.get(&store).present(), Some(3));

    let (hits, callback) = counter();
    let _sub = top.subscribe(&store, callback);

    base.set(&store, 10);
    assert_eq!(hits.get(), 1);
    assert_eq!(top.get(&store).present(), Some(12));
}

#[test]
fn mutual_dependency_yields_an_error_naming_the_cycle() {
    let store = Store::new();
    let second_slot: Rc<std::cell::RefCell<Option<Derived<i32>>>> =
        Rc::new(std::cell::RefCell::new(None));
    let first = Derived::new("first", {
        let second_slot = second_slot.clone();
        move |access| {
            let second = second_slot.borrow().clone().expect("second installed");
            Ok(Material::from(access.get(&second)? + 1))
        }
    });
    let second = Derived::new("second", {
        let first = first.clone();
        move |access| Ok(Material::from(access.get(&first)? + 1))
    });
    *second_slot.borrow_mut() = Some(second);

    let cause = first
        .get(&store)
        .error_cause()
        .expect("cycle must error, not hang")
        .to_string();
    assert!(cause.contains("dependency cycle"), "got: {cause}");
    assert!(cause.contains("first -> second -> first"), "got: {cause}");
}
