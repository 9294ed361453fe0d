//! Cascade graph walk.
//!
//! Starting from one instance, follows every association whose mapping
//! enables the operation and collects the instances it reaches. The walk is
//! iterative with an explicit visited set, so cyclic and self-referential
//! graphs terminate and every instance is reported at most once.
//!
//! Which edges are followed depends on the operation:
//!
//! | op | to-one | collection |
//! |----|--------|------------|
//! | persist | targets that are new, managed or removed | elements added since the snapshot |
//! | remove | managed targets | every live element |
//! | detach, refresh | loaded targets | loaded elements |
//!
//! Associations that are not loaded cannot be walked synchronously. For
//! `remove` they are reported as [`PendingCascade`]s and settled at flush.

use crate::entity::{EntityEntry, EntityState, InstanceId, PendingCascade, RefSlot};
use std::collections::{BTreeMap, HashSet};
use unitwork_core::{AssociationMapping, CascadeOp};

/// Result of one walk.
#[derive(Debug, Default)]
pub(crate) struct CascadeWalk {
    /// Reached instances in visit order, the root first.
    pub(crate) reached: Vec<InstanceId>,
    /// Unloaded associations the walk could not follow.
    pub(crate) pending: Vec<(InstanceId, PendingCascade)>,
}

/// True if `assoc` propagates `op`. Orphan removal implies remove.
pub(crate) fn cascades(assoc: &AssociationMapping, op: CascadeOp) -> bool {
    assoc.cascade.contains(op) || (op == CascadeOp::Remove && assoc.orphan_removal)
}

#[tracing::instrument(level = "trace", skip(entries))]
pub(crate) fn walk(
    entries: &BTreeMap<InstanceId, EntityEntry>,
    root: InstanceId,
    op: CascadeOp,
) -> CascadeWalk {
    let mut walk = CascadeWalk::default();
    let mut visited: HashSet<InstanceId> = HashSet::new();
    let mut stack = vec![root];

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(entry) = entries.get(&id) else {
            // Detached or unknown: nothing to walk.
            continue;
        };
        walk.reached.push(id);

        if op == CascadeOp::Remove && !entry.proxy.is_initialized() {
            if entry
                .metadata
                .associations
                .iter()
                .any(|a| cascades(a, CascadeOp::Remove))
            {
                walk.pending.push((id, PendingCascade::RemoveThroughProxy));
            }
            continue;
        }

        let mut next = Vec::new();
        for assoc in entry.metadata.associations.iter().filter(|a| cascades(a, op)) {
            if assoc.is_collection() {
                let Some(collection) = entry.collections.get(&assoc.name) else {
                    continue;
                };
                if !collection.is_initialized() {
                    if op == CascadeOp::Remove {
                        walk.pending.push((
                            id,
                            PendingCascade::RemoveThroughCollection(assoc.name.clone()),
                        ));
                    }
                    continue;
                }
                let elements = match op {
                    CascadeOp::Persist => collection.compute_delta().added,
                    _ => collection.elements(),
                };
                next.extend(elements.into_iter().filter(|e| follows(entries, *e, op)));
            } else {
                match entry.references.get(&assoc.name) {
                    Some(RefSlot::Set(Some(target))) => {
                        if follows(entries, *target, op) {
                            next.push(*target);
                        }
                    }
                    Some(RefSlot::Unloaded) if op == CascadeOp::Remove => {
                        walk.pending.push((
                            id,
                            PendingCascade::RemoveThroughReference(assoc.name.clone()),
                        ));
                    }
                    _ => {}
                }
            }
        }
        // Reverse so that the first association is visited first.
        stack.extend(next.into_iter().rev());
    }

    tracing::trace!(
        op = %op,
        root = %root,
        reached = walk.reached.len(),
        pending = walk.pending.len(),
        "Cascade walk complete"
    );
    walk
}

fn follows(entries: &BTreeMap<InstanceId, EntityEntry>, target: InstanceId, op: CascadeOp) -> bool {
    let Some(entry) = entries.get(&target) else {
        return false;
    };
    match op {
        CascadeOp::Persist => entry.state != EntityState::Detached,
        CascadeOp::Remove => entry.state == EntityState::Managed,
        CascadeOp::Detach | CascadeOp::Refresh | CascadeOp::Merge => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use unitwork_core::{CascadeSet, EntityIdentity, EntityMetadata, FieldMapping};

    fn node_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("Node", "nodes")
                .field(FieldMapping::id("id"))
                .association(
                    AssociationMapping::many_to_one("next", "Node")
                        .join_column("next_id", "id")
                        .cascade(CascadeSet::ALL),
                )
                .association(
                    AssociationMapping::one_to_many("children", "Node", "next")
                        .cascade(CascadeSet::parse("remove").unwrap()),
                ),
        )
    }

    fn arena(n: u64) -> BTreeMap<InstanceId, EntityEntry> {
        (1..=n)
            .map(|i| (InstanceId(i), EntityEntry::new(InstanceId(i), node_meta())))
            .collect()
    }

    fn link(entries: &mut BTreeMap<InstanceId, EntityEntry>, from: u64, to: u64) {
        entries
            .get_mut(&InstanceId(from))
            .unwrap()
            .references
            .insert("next".into(), RefSlot::Set(Some(InstanceId(to))));
    }

    #[test]
    fn cycle_terminates_and_visits_once() {
        let mut entries = arena(3);
        link(&mut entries, 1, 2);
        link(&mut entries, 2, 3);
        link(&mut entries, 3, 1);
        let walk = walk(&entries, InstanceId(1), CascadeOp::Persist);
        assert_eq!(
            walk.reached,
            vec![InstanceId(1), InstanceId(2), InstanceId(3)]
        );
    }

    #[test]
    fn self_reference_terminates() {
        let mut entries = arena(1);
        link(&mut entries, 1, 1);
        let walk = walk(&entries, InstanceId(1), CascadeOp::Detach);
        assert_eq!(walk.reached, vec![InstanceId(1)]);
    }

    #[test]
    fn remove_only_follows_managed_targets() {
        let mut entries = arena(2);
        link(&mut entries, 1, 2);
        let new_target = walk(&entries, InstanceId(1), CascadeOp::Remove);
        assert_eq!(new_target.reached, vec![InstanceId(1)]);

        entries.get_mut(&InstanceId(2)).unwrap().state = EntityState::Managed;
        let managed_target = walk(&entries, InstanceId(1), CascadeOp::Remove);
        assert_eq!(managed_target.reached, vec![InstanceId(1), InstanceId(2)]);
    }

    #[test]
    fn persist_follows_added_collection_elements() {
        let mut entries = arena(2);
        let parent = entries.get_mut(&InstanceId(1)).unwrap();
        parent
            .collections
            .get_mut("children")
            .unwrap()
            .add(InstanceId(2));
        // `children` cascades remove only.
        assert_eq!(
            walk(&entries, InstanceId(1), CascadeOp::Persist).reached,
            vec![InstanceId(1)]
        );
        entries.get_mut(&InstanceId(2)).unwrap().state = EntityState::Managed;
        assert_eq!(
            walk(&entries, InstanceId(1), CascadeOp::Remove).reached,
            vec![InstanceId(1), InstanceId(2)]
        );
    }

    #[test]
    fn unloaded_associations_become_pending() {
        let mut entries = BTreeMap::new();
        entries.insert(
            InstanceId(1),
            EntityEntry::proxy(InstanceId(1), node_meta(), EntityIdentity::single("id", 1_i64)),
        );
        let walk_proxy = walk(&entries, InstanceId(1), CascadeOp::Remove);
        assert_eq!(
            walk_proxy.pending,
            vec![(InstanceId(1), PendingCascade::RemoveThroughProxy)]
        );

        let entry = entries.get_mut(&InstanceId(1)).unwrap();
        entry.proxy.complete();
        entry.references.insert("next".into(), RefSlot::Set(None));
        let walk_lazy = walk(&entries, InstanceId(1), CascadeOp::Remove);
        assert_eq!(
            walk_lazy.pending,
            vec![(
                InstanceId(1),
                PendingCascade::RemoveThroughCollection("children".into())
            )]
        );
    }

    #[test]
    fn detached_root_reaches_nothing() {
        let entries = arena(0);
        assert!(walk(&entries, InstanceId(9), CascadeOp::Persist).reached.is_empty());
    }
}
