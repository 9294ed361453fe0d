//! Memberships keyed by (user, merchant) owning a keyed many-to-many
//! collection of privileges.

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

fn registry() -> Arc<MetadataRegistry> {
    registry_with(IdGeneration::Assigned)
}

fn registry_with(privilege_ids: IdGeneration) -> Arc<MetadataRegistry> {
    Arc::new(
        MetadataRegistry::new()
            .with(
                EntityMetadata::new("User", "users")
                    .field(FieldMapping::id("id"))
                    .field(FieldMapping::new("name")),
            )
            .unwrap()
            .with(EntityMetadata::new("Merchant", "merchants").field(FieldMapping::id("mid")))
            .unwrap()
            .with(
                EntityMetadata::new("Membership", "memberships")
                    .field(FieldMapping::new("role"))
                    .association(
                        AssociationMapping::many_to_one("user", "User")
                            .join_column("userid", "id")
                            .identifier(),
                    )
                    .association(
                        AssociationMapping::many_to_one("merchant", "Merchant")
                            .join_column("merchantid", "mid")
                            .identifier(),
                    )
                    .association(
                        AssociationMapping::many_to_many("privileges", "Privilege")
                            .join_table(
                                JoinTable::new("membership_privileges")
                                    .local("userid", "userid")
                                    .local("merchantid", "merchantid")
                                    .remote("privilegeid", "privilegeid"),
                            )
                            .cascade(CascadeSet::parse("persist").unwrap())
                            .index_by("code"),
                    ),
            )
            .unwrap()
            .with(
                EntityMetadata::new("Privilege", "privileges")
                    .id_generation(privilege_ids)
                    .field(FieldMapping::id("privilegeid"))
                    .field(FieldMapping::new("code")),
            )
            .unwrap(),
    )
}

fn membership_identity() -> EntityIdentity {
    EntityIdentity::new([("userid", 1_i64), ("merchantid", 2_i64)])
}

type MemorySession = Session<MemoryStore, MemoryStore>;

fn privilege(session: &mut MemorySession, id: i64, code: &str) -> InstanceId {
    let p = session.new_entity("Privilege").unwrap();
    session.set_field(p, "privilegeid", id).unwrap();
    session.set_field(p, "code", code).unwrap();
    p
}

/// Persists user 1, merchant 2 and their membership holding privileges
/// 1..=3 (`read`, `write`, `admin`), then flushes.
fn seed(cx: &Cx, session: &mut MemorySession) -> (InstanceId, Vec<InstanceId>) {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let user = session.new_entity("User").unwrap();
        session.set_field(user, "id", 1_i64).unwrap();
        session.set_field(user, "name", "ada").unwrap();
        let merchant = session.new_entity("Merchant").unwrap();
        session.set_field(merchant, "mid", 2_i64).unwrap();
        session.persist(user).unwrap();
        session.persist(merchant).unwrap();

        let membership = session.new_entity("Membership").unwrap();
        session.set_reference(membership, "user", Some(user)).unwrap();
        session.set_reference(membership, "merchant", Some(merchant)).unwrap();
        session.set_field(membership, "role", "owner").unwrap();

        let privileges = vec![
            privilege(session, 1, "read"),
            privilege(session, 2, "write"),
            privilege(session, 3, "admin"),
        ];
        for p in &privileges {
            assert!(unwrap_outcome(session.collection_add(cx, membership, "privileges", *p).await));
        }
        session.persist(membership).unwrap();
        assert_eq!(session.identity(membership), Some(membership_identity()));

        let result = unwrap_outcome(session.flush(cx).await);
        // user, merchant, membership and three privileges reached by cascade
        assert_eq!(result.inserted, 6);
        assert_eq!(result.links_inserted, 3);
        (membership, privileges)
    })
}

#[test]
fn cascade_persist_writes_rows_and_links() {
    let cx = Cx::for_testing();
    let reg = registry();
    let store = MemoryStore::new(Arc::clone(&reg));
    let mut session = Session::new(reg, store.clone(), store.clone());

    let (membership, privileges) = seed(&cx, &mut session);
    for p in &privileges {
        assert_eq!(session.state(*p), EntityState::Managed);
    }
    assert_eq!(store.row_count("memberships"), 1);
    assert_eq!(store.row_count("privileges"), 3);
    let links = store.rows("membership_privileges");
    assert_eq!(links.len(), 3);
    assert!(links
        .iter()
        .all(|row| row["userid"] == Value::BigInt(1) && row["merchantid"] == Value::BigInt(2)));
    assert!(!session.has_changes());
    assert!(!session.is_modified(membership).unwrap());
}

#[test]
fn clear_then_readd_same_elements_writes_nothing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let reg = registry();
    let store = MemoryStore::new(Arc::clone(&reg));
    let mut session = Session::new(reg, store.clone(), store.clone());
    let (membership, privileges) = seed(&cx, &mut session);

    rt.block_on(async {
        unwrap_outcome(session.collection_clear(&cx, membership, "privileges").await);
        for p in &privileges {
            unwrap_outcome(session.collection_add(&cx, membership, "privileges", *p).await);
        }
        let delta = session
            .tracked_collection(membership, "privileges")
            .unwrap()
            .compute_delta();
        assert!(delta.is_empty());
        assert!(!session.has_changes());

        let batches = store.stats().write_batches;
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.total(), 0);
        assert_eq!(store.stats().write_batches, batches);
        assert_eq!(store.row_count("membership_privileges"), 3);
    });
}

#[test]
fn readded_key_with_new_identity_is_a_fresh_link() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let reg = registry();
    let store = MemoryStore::new(Arc::clone(&reg));
    let mut session = Session::new(reg, store.clone(), store.clone());
    let (membership, privileges) = seed(&cx, &mut session);

    rt.block_on(async {
        let read = Value::from("read");
        let removed =
            unwrap_outcome(session.collection_remove_key(&cx, membership, "privileges", &read).await);
        assert_eq!(removed, Some(privileges[0]));
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!((result.links_deleted, result.links_inserted), (1, 0));
        assert_eq!(store.row_count("membership_privileges"), 2);

        // Same key, different row.
        let replacement = privilege(&mut session, 4, "read");
        unwrap_outcome(session.collection_add(&cx, membership, "privileges", replacement).await);
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 1);
        assert_eq!((result.links_deleted, result.links_inserted), (0, 1));
        assert_eq!(
            unwrap_outcome(session.collection_get_key(&cx, membership, "privileges", &read).await),
            Some(replacement)
        );
        let mut linked: Vec<Value> = store
            .rows("membership_privileges")
            .into_iter()
            .map(|row| row["privilegeid"].clone())
            .collect();
        linked.sort_by_key(|v| v.as_i64());
        assert_eq!(linked, vec![Value::BigInt(2), Value::BigInt(3), Value::BigInt(4)]);
    });
}

#[test]
fn collection_reloads_by_composite_owner() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let reg = registry();
    let store = MemoryStore::new(Arc::clone(&reg));
    let mut session = Session::new(reg, store.clone(), store.clone());
    seed(&cx, &mut session);

    rt.block_on(async {
        session.clear();
        let membership = unwrap_outcome(session.find(&cx, "Membership", membership_identity()).await)
            .expect("membership row");
        assert_eq!(session.get_field(membership, "role").unwrap(), Value::from("owner"));
        let user = session.reference_slot(membership, "user").unwrap().target().unwrap();
        assert_eq!(session.proxy_state(user).unwrap(), ProxyState::Uninitialized);

        let elements = unwrap_outcome(session.collection(&cx, membership, "privileges").await);
        assert_eq!(elements.len(), 3);
        let admin = unwrap_outcome(
            session
                .collection_get_key(&cx, membership, "privileges", &Value::from("admin"))
                .await,
        )
        .unwrap();
        assert_eq!(session.get_field(admin, "privilegeid").unwrap(), Value::BigInt(3));
        assert!(!session.has_changes());
    });
}

/// Clears the session and reloads the membership with its privileges.
async fn reload(cx: &Cx, session: &mut MemorySession) -> (InstanceId, Vec<InstanceId>) {
    session.clear();
    let membership = unwrap_outcome(session.find(cx, "Membership", membership_identity()).await)
        .expect("membership row");
    let privileges = unwrap_outcome(session.collection(cx, membership, "privileges").await);
    (membership, privileges)
}

#[test]
fn membership_privileges_survive_three_flush_cycles() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let reg = registry_with(IdGeneration::Identity);
    let store = MemoryStore::new(Arc::clone(&reg));
    let mut session = Session::new(reg, store.clone(), store.clone());

    rt.block_on(async {
        let user = session.new_entity("User").unwrap();
        session.set_field(user, "id", 1_i64).unwrap();
        let merchant = session.new_entity("Merchant").unwrap();
        session.set_field(merchant, "mid", 2_i64).unwrap();
        let membership = session.new_entity("Membership").unwrap();
        session.set_reference(membership, "user", Some(user)).unwrap();
        session.set_reference(membership, "merchant", Some(merchant)).unwrap();
        for code in ["read", "write", "admin"] {
            let p = session.new_entity("Privilege").unwrap();
            session.set_field(p, "code", code).unwrap();
            unwrap_outcome(session.collection_add(&cx, membership, "privileges", p).await);
        }
        session.persist(user).unwrap();
        session.persist(merchant).unwrap();
        session.persist(membership).unwrap();
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!((result.inserted, result.links_inserted), (6, 3));
        assert_eq!(store.row_count("membership_privileges"), 3);

        // One privilege removed.
        let (membership, privileges) = reload(&cx, &mut session).await;
        assert_eq!(privileges.len(), 3);
        let removed = unwrap_outcome(
            session
                .collection_remove_key(&cx, membership, "privileges", &Value::from("write"))
                .await,
        );
        assert!(removed.is_some());
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.links_deleted, 1);
        assert_eq!(store.row_count("membership_privileges"), 2);
        let (membership, privileges) = reload(&cx, &mut session).await;
        assert_eq!(privileges.len(), 2);

        // Cleared to nothing.
        unwrap_outcome(session.collection_clear(&cx, membership, "privileges").await);
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.links_deleted, 2);
        assert_eq!(store.row_count("membership_privileges"), 0);
        let (membership, privileges) = reload(&cx, &mut session).await;
        assert!(privileges.is_empty());
        assert_eq!(store.row_count("privileges"), 3);

        // A new privilege whose key is generated in the same batch as its link.
        let audit = session.new_entity("Privilege").unwrap();
        session.set_field(audit, "code", "audit").unwrap();
        unwrap_outcome(session.collection_add(&cx, membership, "privileges", audit).await);
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!((result.inserted, result.links_inserted), (1, 1));
        assert_eq!(session.get_field(audit, "privilegeid").unwrap(), Value::BigInt(4));
        let links = store.rows("membership_privileges");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0]["privilegeid"], Value::BigInt(4));

        let (membership, privileges) = reload(&cx, &mut session).await;
        assert_eq!(privileges.len(), 1);
        let audit = unwrap_outcome(
            session
                .collection_get_key(&cx, membership, "privileges", &Value::from("audit"))
                .await,
        )
        .expect("audit privilege");
        assert_eq!(session.get_field(audit, "privilegeid").unwrap(), Value::BigInt(4));
        assert!(!session.has_changes());
    });
}
