//! Dependency ordering, cycles and cascades across full flushes.

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use unitwork::prelude::*;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

fn registry() -> Arc<MetadataRegistry> {
    Arc::new(
        MetadataRegistry::new()
            .with(
                EntityMetadata::new("Node", "nodes")
                    .field(FieldMapping::id("id"))
                    .association(
                        AssociationMapping::many_to_one("next", "Node")
                            .join_column("next_id", "id")
                            .required(),
                    ),
            )
            .unwrap()
            .with(
                EntityMetadata::new("Person", "people")
                    .field(FieldMapping::id("id"))
                    .field(FieldMapping::new("name"))
                    .association(
                        AssociationMapping::many_to_one("partner", "Person")
                            .join_column("partner_id", "id"),
                    ),
            )
            .unwrap()
            .with(
                EntityMetadata::new("Order", "orders")
                    .field(FieldMapping::id("id"))
                    .field(FieldMapping::new("customer"))
                    .association(
                        AssociationMapping::one_to_many("lines", "Line", "order")
                            .cascade(CascadeSet::parse("persist, remove").unwrap())
                            .orphan_removal(true)
                            .order_by("position"),
                    ),
            )
            .unwrap()
            .with(
                EntityMetadata::new("Line", "lines")
                    .field(FieldMapping::id("id"))
                    .field(FieldMapping::new("position"))
                    .field(FieldMapping::new("sku"))
                    .association(
                        AssociationMapping::many_to_one("order", "Order")
                            .join_column("order_id", "id")
                            .required(),
                    ),
            )
            .unwrap(),
    )
}

type MemorySession = Session<MemoryStore, MemoryStore>;

fn session() -> (MemorySession, MemoryStore) {
    let reg = registry();
    let store = MemoryStore::new(Arc::clone(&reg));
    (Session::new(reg, store.clone(), store.clone()), store)
}

fn with_id(session: &mut MemorySession, entity: &str, id: i64) -> InstanceId {
    let e = session.new_entity(entity).unwrap();
    session.set_field(e, "id", id).unwrap();
    e
}

fn line(session: &mut MemorySession, order: InstanceId, id: i64, sku: &str) -> InstanceId {
    let l = with_id(session, "Line", id);
    session.set_field(l, "position", id).unwrap();
    session.set_field(l, "sku", sku).unwrap();
    session.set_reference(l, "order", Some(order)).unwrap();
    l
}

#[test]
fn required_cycle_fails_before_any_write() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = session();

    rt.block_on(async {
        let a = with_id(&mut session, "Node", 1);
        let b = with_id(&mut session, "Node", 2);
        session.set_reference(a, "next", Some(b)).unwrap();
        session.set_reference(b, "next", Some(a)).unwrap();
        session.persist(a).unwrap();
        session.persist(b).unwrap();

        match expect_err(session.flush(&cx).await) {
            Error::UnresolvedDependency(e) => assert_eq!(e.cycle.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.stats().write_batches, 0);
        assert_eq!(store.row_count("nodes"), 0);
        assert_eq!(session.pending_counts().new, 2);

        // A self-reference is a cycle of one.
        session.clear();
        let lone = with_id(&mut session, "Node", 3);
        session.set_reference(lone, "next", Some(lone)).unwrap();
        session.persist(lone).unwrap();
        assert!(matches!(
            expect_err(session.flush(&cx).await),
            Error::UnresolvedDependency(_)
        ));
        assert_eq!(store.stats().write_batches, 0);
    });
}

#[test]
fn nullable_cycle_is_broken_with_an_extra_update() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = session();

    rt.block_on(async {
        let ann = with_id(&mut session, "Person", 1);
        let bob = with_id(&mut session, "Person", 2);
        session.set_reference(ann, "partner", Some(bob)).unwrap();
        session.set_reference(bob, "partner", Some(ann)).unwrap();
        session.persist(ann).unwrap();
        session.persist(bob).unwrap();

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 2);
        assert_eq!(result.extra_updates, 1);
        assert_eq!(store.stats().write_batches, 1);
        let partners: Vec<(Value, Value)> = store
            .rows("people")
            .into_iter()
            .map(|row| (row["id"].clone(), row["partner_id"].clone()))
            .collect();
        assert!(partners.contains(&(Value::BigInt(1), Value::BigInt(2))));
        assert!(partners.contains(&(Value::BigInt(2), Value::BigInt(1))));
        assert!(!session.has_changes());
    });
}

#[test]
fn persisted_graph_round_trips_after_clear() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = session();

    rt.block_on(async {
        let order = with_id(&mut session, "Order", 7);
        session.set_field(order, "customer", "grace").unwrap();
        session.persist(order).unwrap();
        // Lines become reachable after the order is already managed.
        for (id, sku) in [(1, "bolt"), (2, "nut")] {
            let l = line(&mut session, order, id, sku);
            unwrap_outcome(session.collection_add(&cx, order, "lines", l).await);
        }

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 3);
        assert_eq!(store.rows("orders")[0]["id"], Value::BigInt(7));

        session.clear();
        let order = unwrap_outcome(session.get(&cx, "Order", 7_i64).await).unwrap();
        assert_eq!(session.get_field(order, "customer").unwrap(), Value::from("grace"));
        let lines = unwrap_outcome(session.collection(&cx, order, "lines").await);
        let skus: Vec<Value> = lines
            .iter()
            .map(|l| session.get_field(*l, "sku").unwrap())
            .collect();
        assert_eq!(skus, vec![Value::from("bolt"), Value::from("nut")]);
        assert_eq!(session.reference_slot(lines[0], "order").unwrap(), RefSlot::Set(Some(order)));
    });
}

#[test]
fn orphans_and_cascaded_removes_are_deleted_child_first() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = session();
    store.insert_row("orders", [("id", Value::BigInt(1)), ("customer", "ada".into())]);
    for (id, sku) in [(1_i64, "cog"), (2, "gear"), (3, "belt")] {
        store.insert_row(
            "lines",
            [
                ("id", Value::BigInt(id)),
                ("position", Value::BigInt(id)),
                ("sku", sku.into()),
                ("order_id", Value::BigInt(1)),
            ],
        );
    }

    rt.block_on(async {
        let order = unwrap_outcome(session.get(&cx, "Order", 1_i64).await).unwrap();
        let lines = unwrap_outcome(session.collection(&cx, order, "lines").await);
        assert!(unwrap_outcome(session.collection_remove(&cx, order, "lines", lines[1]).await));

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.deleted, 1);
        assert_eq!(session.state(lines[1]), EntityState::Detached);
        assert_eq!(store.row_count("lines"), 2);

        session.remove(order).unwrap();
        assert_eq!(session.state(lines[0]), EntityState::Removed);
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.deleted, 3);
        assert_eq!(store.row_count("orders"), 0);
        assert_eq!(store.row_count("lines"), 0);
    });
}

#[test]
fn rejected_batch_leaves_session_ready_to_retry() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = session();
    store.insert_row("orders", [("id", Value::BigInt(1)), ("customer", "ada".into())]);

    rt.block_on(async {
        let order = unwrap_outcome(session.get(&cx, "Order", 1_i64).await).unwrap();
        session.set_field(order, "customer", "lovelace").unwrap();
        let l = line(&mut session, order, 5, "spring");
        unwrap_outcome(session.collection_add(&cx, order, "lines", l).await);

        store.fail_next_write(unitwork::WriteErrorKind::Constraint, "check failed");
        match expect_err(session.flush(&cx).await) {
            Error::Write(e) => assert!(!e.retryable),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.state(l), EntityState::New);
        assert!(session.is_modified(order).unwrap());
        assert_eq!(store.rows("orders")[0]["customer"], Value::from("ada"));

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!((result.inserted, result.updated), (1, 1));
        assert_eq!(session.state(l), EntityState::Managed);
        assert_eq!(store.rows("orders")[0]["customer"], Value::from("lovelace"));
    });
}
