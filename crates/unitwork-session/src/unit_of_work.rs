//! Unit of Work pattern implementation.
//!
//! The Unit of Work owns every in-memory instance of a session, tracks its
//! lifecycle state and original snapshot, and expands persist, remove and
//! detach requests along cascading associations.
//!
//! # Overview
//!
//! The Unit of Work:
//! - Holds the instance arena, the identity map and the change tracker
//! - Schedules inserts (`persist`) and deletes (`remove`), cascading both
//! - Computes per-instance change sets against the original snapshot
//! - Compiles a flush into an ordered write batch (see [`crate::flush`])
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(registry);
//!
//! let user = uow.new_entity("User")?;
//! uow.set_field(user, "id", Value::BigInt(1))?;
//! uow.persist(user)?;
//!
//! assert_eq!(uow.state(user), EntityState::Managed);
//! assert_eq!(uow.pending_counts().new, 1);
//! ```

use crate::cascade;
use crate::change_tracker::{ChangeSet, ChangeTracker};
use crate::collection::{ElementKey, TrackedCollection};
use crate::entity::{EntityEntry, EntityState, InstanceId, PendingCascade, RefSlot, Tombstone};
use crate::identity_map::IdentityMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use unitwork_core::{
    AssociationMapping, CascadeOp, EntityIdentity, EntityMetadata, Error, IdGeneration,
    MetadataRegistry, Result, StateErrorKind, Value,
};

/// Identifier associations nested deeper than this are treated as cyclic.
pub(crate) const MAX_IDENTITY_DEPTH: usize = 32;

/// Tracks every instance of one session and its pending operations.
pub struct UnitOfWork {
    registry: Arc<MetadataRegistry>,
    pub(crate) entries: BTreeMap<InstanceId, EntityEntry>,
    pub(crate) tombstones: HashMap<InstanceId, Tombstone>,
    pub(crate) identity_map: IdentityMap,
    pub(crate) tracker: ChangeTracker,
    next_id: u64,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("instances", &self.entries.len())
            .field("identities", &self.identity_map.len())
            .field("snapshots", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

/// In-memory state restored when a flush fails.
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint {
    entries: Vec<(InstanceId, SavedEntry)>,
    identity_map: IdentityMap,
}

#[derive(Debug, Clone)]
struct SavedEntry {
    state: EntityState,
    scheduled_insert: bool,
    identity: Option<EntityIdentity>,
    pending_cascades: Vec<PendingCascade>,
    /// Generated identifier field of an instance with no identity yet, and
    /// its value before the flush.
    generated_id: Option<(String, Option<Value>)>,
}

impl UnitOfWork {
    pub fn new(registry: Arc<MetadataRegistry>) -> Self {
        Self {
            registry,
            entries: BTreeMap::new(),
            tombstones: HashMap::new(),
            identity_map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            next_id: 1,
        }
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    fn allocate(&mut self) -> InstanceId {
        let id = InstanceId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Create a `NEW` instance of `entity`.
    pub fn new_entity(&mut self, entity: &str) -> Result<InstanceId> {
        let meta = self.registry.get(entity)?;
        let id = self.allocate();
        self.entries.insert(id, EntityEntry::new(id, meta));
        tracing::trace!(entity = %entity, instance = %id, "Created new instance");
        Ok(id)
    }

    /// Create an uninitialized proxy for `identity` and register it.
    ///
    /// Fails with `IdentityConflict` if the identity is already managed.
    pub fn create_proxy(&mut self, entity: &str, identity: EntityIdentity) -> Result<InstanceId> {
        let meta = self.registry.get(entity)?;
        let identity = Self::checked_identity(&meta, identity)?;
        if self.identity_map.contains(&meta.name, &identity) {
            return Err(Error::identity_conflict(&meta.name, identity));
        }
        let id = self.allocate();
        self.identity_map.register(&meta.name, &identity, id)?;
        tracing::trace!(entity = %entity, identity = %identity, instance = %id, "Created proxy");
        self.entries
            .insert(id, EntityEntry::proxy(id, meta, identity));
        Ok(id)
    }

    /// The managed instance for `identity`, or a new proxy for it.
    pub fn get_reference(&mut self, entity: &str, identity: EntityIdentity) -> Result<InstanceId> {
        let meta = self.registry.get(entity)?;
        let identity = Self::checked_identity(&meta, identity)?;
        match self.identity_map.lookup(&meta.name, &identity) {
            Some(id) => Ok(id),
            None => self.create_proxy(entity, identity),
        }
    }

    /// Reject identities whose part names do not match the metadata.
    fn checked_identity(meta: &EntityMetadata, identity: EntityIdentity) -> Result<EntityIdentity> {
        let parts = meta.identity_parts();
        let names: Vec<&str> = identity.fields().collect();
        if names != parts {
            return Err(Error::invalid_mapping(
                &meta.name,
                format!(
                    "identity {identity} does not match identifier ({}) of '{}'",
                    parts.join(", "),
                    meta.name
                ),
            ));
        }
        if identity.has_null() {
            let field = parts.first().copied().unwrap_or_default();
            return Err(Error::missing_identifier(&meta.name, field));
        }
        Ok(identity)
    }

    pub fn lookup(&self, entity: &str, identity: &EntityIdentity) -> Option<InstanceId> {
        self.identity_map.lookup(entity, identity)
    }

    /// The tracked entry of `id`; `Detached` if it left the unit of work.
    pub fn entry(&self, id: InstanceId) -> Result<&EntityEntry> {
        self.entries.get(&id).ok_or_else(|| detached(id))
    }

    pub(crate) fn entry_mut(&mut self, id: InstanceId) -> Result<&mut EntityEntry> {
        self.entries.get_mut(&id).ok_or_else(|| detached(id))
    }

    pub fn state(&self, id: InstanceId) -> EntityState {
        self.entries
            .get(&id)
            .map_or(EntityState::Detached, |e| e.state)
    }

    /// Identity of a tracked or former instance.
    pub fn identity(&self, id: InstanceId) -> Option<EntityIdentity> {
        match self.entries.get(&id) {
            Some(entry) => entry.identity.clone(),
            None => self.tombstones.get(&id).and_then(|t| t.identity.clone()),
        }
    }

    /// Entity type name of a tracked or former instance.
    pub fn entity_name(&self, id: InstanceId) -> Option<&str> {
        match self.entries.get(&id) {
            Some(entry) => Some(entry.entity()),
            None => self.tombstones.get(&id).map(|t| t.entity.as_str()),
        }
    }

    /// Tracked instances in creation order.
    pub fn instances(&self) -> impl Iterator<Item = (InstanceId, &EntityEntry)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read a field. Identifier fields of an uninitialized proxy are served
    /// from its identity; any other field requires the proxy to be resolved.
    pub fn get_field(&self, id: InstanceId, name: &str) -> Result<Value> {
        let entry = self.entry(id)?;
        let field = entry.metadata.require_field(name)?;
        if !entry.proxy.is_initialized() {
            if field.id {
                return Ok(entry
                    .identity
                    .as_ref()
                    .and_then(|i| i.get(name).cloned())
                    .unwrap_or(Value::Null));
            }
            return Err(uninitialized(entry, name));
        }
        Ok(entry.field(name))
    }

    pub fn set_field(&mut self, id: InstanceId, name: &str, value: Value) -> Result<()> {
        let entry = self.entry_mut(id)?;
        let meta = Arc::clone(&entry.metadata);
        let field = meta.require_field(name)?;
        if !entry.proxy.is_initialized() {
            return Err(uninitialized(entry, name));
        }
        if field.id
            && entry.identity.is_some()
            && entry.field(name).normalized() != value.normalized()
        {
            return Err(Error::state(
                StateErrorKind::InvalidAssignment,
                format!(
                    "identifier field '{}.{name}' of {id} cannot change once assigned",
                    meta.name
                ),
            ));
        }
        entry.fields.insert(name.to_string(), value);
        Ok(())
    }

    pub fn reference(&self, id: InstanceId, association: &str) -> Result<RefSlot> {
        let entry = self.entry(id)?;
        let assoc = entry.metadata.require_association(association)?;
        if assoc.is_collection() {
            return Err(not_single_valued(&entry.metadata, association));
        }
        Ok(entry
            .references
            .get(association)
            .copied()
            .unwrap_or(RefSlot::Unloaded))
    }

    /// Point a single-valued association at `target` (or at nothing).
    ///
    /// Only the owning side is written at flush; keeping an inverse side in
    /// step is up to the caller.
    pub fn set_reference(
        &mut self,
        id: InstanceId,
        association: &str,
        target: Option<InstanceId>,
    ) -> Result<()> {
        let meta = Arc::clone(&self.entry(id)?.metadata);
        let assoc = meta.require_association(association)?;
        if assoc.is_collection() {
            return Err(not_single_valued(&meta, association));
        }
        if let Some(t) = target {
            self.check_target(assoc, t)?;
        }
        let entry = self.entry_mut(id)?;
        if !entry.proxy.is_initialized() {
            return Err(uninitialized(entry, association));
        }
        if assoc.id
            && entry.identity.is_some()
            && entry.references.get(association).and_then(RefSlot::target) != target
        {
            return Err(Error::state(
                StateErrorKind::InvalidAssignment,
                format!(
                    "identifier association '{}.{association}' of {id} cannot change once assigned",
                    meta.name
                ),
            ));
        }
        entry
            .references
            .insert(association.to_string(), RefSlot::Set(target));
        Ok(())
    }

    fn check_target(&self, assoc: &AssociationMapping, target: InstanceId) -> Result<()> {
        let target_entry = self.entry(target)?;
        if target_entry.entity() != assoc.target {
            return Err(Error::state(
                StateErrorKind::InvalidAssignment,
                format!(
                    "'{}' expects {} but {target} is a {}",
                    assoc.name,
                    assoc.target,
                    target_entry.entity()
                ),
            ));
        }
        Ok(())
    }

    pub fn collection(&self, id: InstanceId, association: &str) -> Result<&TrackedCollection> {
        let entry = self.entry(id)?;
        entry.metadata.require_association(association)?;
        entry
            .collections
            .get(association)
            .ok_or_else(|| not_collection(&entry.metadata, association))
    }

    /// Mutable access to an initialized collection.
    fn loaded_collection_mut(
        &mut self,
        id: InstanceId,
        association: &str,
    ) -> Result<&mut TrackedCollection> {
        let entry = self.entry_mut(id)?;
        let meta = Arc::clone(&entry.metadata);
        meta.require_association(association)?;
        let collection = entry
            .collections
            .get_mut(association)
            .ok_or_else(|| not_collection(&meta, association))?;
        if !collection.is_initialized() {
            return Err(Error::state(
                StateErrorKind::Uninitialized,
                format!("collection '{}.{association}' of {id} is not loaded", meta.name),
            ));
        }
        Ok(collection)
    }

    pub fn collection_add(
        &mut self,
        id: InstanceId,
        association: &str,
        element: InstanceId,
    ) -> Result<bool> {
        let meta = Arc::clone(&self.entry(id)?.metadata);
        let assoc = meta.require_association(association)?;
        self.check_target(assoc, element)?;
        let key = assoc
            .index_by
            .as_deref()
            .and_then(|field| self.index_value(element, field));
        let collection = self.loaded_collection_mut(id, association)?;
        Ok(collection.add_keyed(element, key))
    }

    pub fn collection_remove(
        &mut self,
        id: InstanceId,
        association: &str,
        element: InstanceId,
    ) -> Result<bool> {
        Ok(self
            .loaded_collection_mut(id, association)?
            .remove(element))
    }

    pub fn collection_clear(&mut self, id: InstanceId, association: &str) -> Result<()> {
        self.loaded_collection_mut(id, association)?.clear();
        Ok(())
    }

    pub fn collection_remove_key(
        &mut self,
        id: InstanceId,
        association: &str,
        key: &Value,
    ) -> Result<Option<InstanceId>> {
        Ok(self
            .loaded_collection_mut(id, association)?
            .remove_key(key))
    }

    /// Value an element is indexed by in an `index_by` collection.
    pub(crate) fn index_value(&self, element: InstanceId, field: &str) -> Option<Value> {
        let entry = self.entries.get(&element)?;
        let value = entry.field(field);
        if !value.is_null() {
            return Some(value);
        }
        self.derive_identity(element)
            .and_then(|identity| identity.get(field).cloned())
    }

    /// What makes `element` "the same row" in collection deltas.
    pub(crate) fn element_key(&self, element: InstanceId) -> ElementKey {
        match self.identity(element) {
            Some(identity) => ElementKey::Identity(identity),
            None => ElementKey::Instance(element),
        }
    }

    /// Delta of one collection compared by row identity.
    pub fn collection_delta(
        &self,
        id: InstanceId,
        association: &str,
    ) -> Result<crate::collection::CollectionDelta> {
        let collection = self.collection(id, association)?;
        Ok(collection.compute_delta_with(|e| self.element_key(e)))
    }

    /// Identity of `id`: the assigned one, or the one its identifier fields
    /// and identifier associations describe right now.
    pub(crate) fn derive_identity(&self, id: InstanceId) -> Option<EntityIdentity> {
        self.derive_identity_at(id, 0)
    }

    fn derive_identity_at(&self, id: InstanceId, depth: usize) -> Option<EntityIdentity> {
        if depth > MAX_IDENTITY_DEPTH {
            return None;
        }
        let Some(entry) = self.entries.get(&id) else {
            return self.tombstones.get(&id).and_then(|t| t.identity.clone());
        };
        if let Some(identity) = &entry.identity {
            return Some(identity.clone());
        }
        let mut parts = Vec::new();
        for part in entry.metadata.identity_parts() {
            let value = self.identity_part_value(entry, part, depth)?;
            if value.is_null() {
                return None;
            }
            parts.push((part.to_string(), value));
        }
        Some(EntityIdentity::new(parts))
    }

    fn identity_part_value(&self, entry: &EntityEntry, part: &str, depth: usize) -> Option<Value> {
        if entry.metadata.get_field(part).is_some_and(|f| f.id) {
            return Some(entry.field(part));
        }
        for assoc in entry.metadata.associations.iter().filter(|a| a.id) {
            if let Some(jc) = assoc.join_columns.iter().find(|jc| jc.column == part) {
                let target = entry.references.get(&assoc.name)?.target()?;
                let identity = self.derive_identity_at(target, depth + 1)?;
                return identity.get(&jc.referenced).cloned();
            }
        }
        None
    }

    /// Make `id` managed and schedule its insert, cascading along
    /// `persist` associations. Idempotent for managed instances.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn persist(&mut self, id: InstanceId) -> Result<()> {
        self.entry(id)?;
        let walk = cascade::walk(&self.entries, id, CascadeOp::Persist);
        self.schedule_persist(&walk.reached)
    }

    /// Schedule every `NEW` or `REMOVED` instance in `ids`.
    ///
    /// All identities are checked before anything changes, so a conflict
    /// leaves the unit of work as it was.
    pub(crate) fn schedule_persist(&mut self, ids: &[InstanceId]) -> Result<()> {
        let mut planned: Vec<(InstanceId, Option<EntityIdentity>)> = Vec::new();
        let mut batch: HashMap<(String, EntityIdentity), InstanceId> = HashMap::new();
        for &id in ids {
            let entry = self.entry(id)?;
            if entry.state != EntityState::New {
                continue;
            }
            let meta = &entry.metadata;
            if meta.id_generation == IdGeneration::Assigned {
                for field in meta.fields.iter().filter(|f| f.id) {
                    if entry.field(&field.name).is_null() {
                        return Err(Error::missing_identifier(&meta.name, &field.name));
                    }
                }
            }
            let identity = self.derive_identity(id);
            if let Some(identity) = &identity {
                let existing = self
                    .identity_map
                    .lookup(&meta.name, identity)
                    .or_else(|| batch.get(&(meta.name.clone(), identity.clone())).copied());
                if existing.is_some_and(|other| other != id) {
                    return Err(Error::identity_conflict(&meta.name, identity.clone()));
                }
                batch.insert((meta.name.clone(), identity.clone()), id);
            }
            planned.push((id, identity));
        }

        for &id in ids {
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.state == EntityState::Removed {
                    tracing::trace!(instance = %id, "Persist revives removed instance");
                    entry.state = EntityState::Managed;
                    entry.pending_cascades.clear();
                }
            }
        }
        for (id, identity) in planned {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            entry.state = EntityState::Managed;
            entry.scheduled_insert = true;
            if let Some(identity) = identity {
                self.identity_map.register(entry.entity(), &identity, id)?;
                entry.identity = Some(identity);
            }
            tracing::trace!(
                entity = %entry.entity(),
                instance = %id,
                identity = ?entry.identity,
                "Scheduled insert"
            );
        }
        Ok(())
    }

    /// Schedule `id` for deletion, cascading along `remove` associations.
    ///
    /// Removing an instance whose insert is still pending cancels the
    /// insert and returns it to `NEW`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn remove(&mut self, id: InstanceId) -> Result<()> {
        let entry = self.entry(id)?;
        match entry.state {
            EntityState::New => {
                return Err(Error::state(
                    StateErrorKind::NotManaged,
                    format!("{} {id} is new and was never persisted", entry.entity()),
                ));
            }
            EntityState::Removed => return Ok(()),
            EntityState::Managed | EntityState::Detached => {}
        }
        self.cascade_remove(id);
        Ok(())
    }

    /// Remove `id` and everything its `remove` associations reach.
    pub(crate) fn cascade_remove(&mut self, id: InstanceId) {
        let walk = cascade::walk(&self.entries, id, CascadeOp::Remove);
        for reached in walk.reached {
            self.schedule_remove(reached);
        }
        for (owner, pending) in walk.pending {
            if let Some(entry) = self.entries.get_mut(&owner) {
                if !entry.pending_cascades.contains(&pending) {
                    entry.pending_cascades.push(pending);
                }
            }
        }
    }

    fn schedule_remove(&mut self, id: InstanceId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.state != EntityState::Managed {
            return;
        }
        if entry.scheduled_insert {
            entry.scheduled_insert = false;
            entry.state = EntityState::New;
            if let Some(identity) = entry.identity.take() {
                self.identity_map.forget(&entry.metadata.name, &identity);
            }
            tracing::trace!(instance = %id, "Remove cancels pending insert");
        } else {
            entry.state = EntityState::Removed;
            tracing::trace!(entity = %entry.entity(), instance = %id, "Scheduled delete");
        }
    }

    /// Pending cascades left by removals through unloaded associations.
    pub(crate) fn pending_cascades(&self) -> Vec<(InstanceId, PendingCascade)> {
        self.entries
            .iter()
            .flat_map(|(id, e)| e.pending_cascades.iter().map(|p| (*id, p.clone())))
            .collect()
    }

    /// Stop tracking `id` and everything its `detach` associations reach.
    /// Returns the detached instances.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detach(&mut self, id: InstanceId) -> Result<Vec<InstanceId>> {
        self.entry(id)?;
        let walk = cascade::walk(&self.entries, id, CascadeOp::Detach);
        for reached in &walk.reached {
            self.evict(*reached);
        }
        Ok(walk.reached)
    }

    pub(crate) fn evict(&mut self, id: InstanceId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        if let Some(identity) = &entry.identity {
            if self.identity_map.lookup(entry.entity(), identity) == Some(id) {
                self.identity_map.forget(entry.entity(), identity);
            }
        }
        self.tracker.clear(id);
        self.tombstones.insert(
            id,
            Tombstone {
                entity: entry.metadata.name.clone(),
                identity: entry.identity,
            },
        );
    }

    /// Detach every instance. Pending operations are discarded.
    pub fn clear(&mut self) {
        let ids: Vec<InstanceId> = self.entries.keys().copied().collect();
        let count = ids.len();
        for id in ids {
            self.evict(id);
        }
        self.identity_map.clear();
        self.tracker.clear_all();
        tracing::debug!(detached = count, "Unit of work cleared");
    }

    /// Changed fields and to-one associations of `id` since its snapshot.
    pub fn change_set(&self, id: InstanceId) -> Result<ChangeSet> {
        let entry = self.entry(id)?;
        if !entry.proxy.is_initialized() {
            return Ok(ChangeSet::default());
        }
        Ok(self.tracker.compute_change_set(id, entry))
    }

    /// True if `id` would be written by the next flush.
    pub(crate) fn needs_update(&self, id: InstanceId, entry: &EntityEntry) -> bool {
        entry.state == EntityState::Managed
            && !entry.scheduled_insert
            && entry.proxy.is_initialized()
            && self.tracker.is_dirty(id, entry)
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for (id, entry) in &self.entries {
            match entry.state {
                EntityState::Managed if entry.scheduled_insert => counts.new += 1,
                EntityState::Managed if self.needs_update(*id, entry) => counts.dirty += 1,
                EntityState::Removed => counts.deleted += 1,
                _ => {}
            }
            if entry.state == EntityState::Managed {
                counts.collections += entry
                    .collections
                    .values()
                    .filter(|c| c.is_initialized())
                    .filter(|c| !c.compute_delta_with(|e| self.element_key(e)).is_empty())
                    .count();
            }
        }
        counts
    }

    pub fn has_changes(&self) -> bool {
        !self.pending_counts().is_empty()
            || self.entries.values().any(|e| !e.pending_cascades.is_empty())
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            entries: self
                .entries
                .iter()
                .map(|(id, e)| {
                    (
                        *id,
                        SavedEntry {
                            state: e.state,
                            scheduled_insert: e.scheduled_insert,
                            identity: e.identity.clone(),
                            pending_cascades: e.pending_cascades.clone(),
                            generated_id: e
                                .identity
                                .is_none()
                                .then(|| e.metadata.generated_id_field())
                                .flatten()
                                .map(|f| (f.name.clone(), e.fields.get(&f.name).cloned())),
                        },
                    )
                })
                .collect(),
            identity_map: self.identity_map.clone(),
        }
    }

    /// Roll lifecycle state back to `checkpoint`. Instances loaded since the
    /// checkpoint stay managed.
    pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
        let known: HashSet<InstanceId> = checkpoint.entries.iter().map(|(id, _)| *id).collect();
        for (id, saved) in checkpoint.entries {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.state = saved.state;
                entry.scheduled_insert = saved.scheduled_insert;
                entry.identity = saved.identity;
                entry.pending_cascades = saved.pending_cascades;
                match saved.generated_id {
                    Some((field, Some(value))) => {
                        entry.fields.insert(field, value);
                    }
                    Some((field, None)) => {
                        entry.fields.remove(&field);
                    }
                    None => {}
                }
            }
        }
        self.identity_map = checkpoint.identity_map;
        for (id, entry) in &self.entries {
            if known.contains(id) {
                continue;
            }
            if let Some(identity) = &entry.identity {
                if let Err(e) = self.identity_map.register(entry.entity(), identity, *id) {
                    tracing::warn!(instance = %id, error = %e, "Could not re-register loaded instance");
                }
            }
        }
        tracing::debug!("Unit of work restored to pre-flush state");
    }
}

fn detached(id: InstanceId) -> Error {
    Error::state(
        StateErrorKind::Detached,
        format!("instance {id} is not tracked by this unit of work"),
    )
}

fn uninitialized(entry: &EntityEntry, name: &str) -> Error {
    Error::state(
        StateErrorKind::Uninitialized,
        format!(
            "'{}.{name}' accessed on an uninitialized proxy for {}; resolve it first",
            entry.entity(),
            entry
                .identity
                .as_ref()
                .map_or_else(|| "?".to_string(), ToString::to_string)
        ),
    )
}

fn not_single_valued(meta: &EntityMetadata, association: &str) -> Error {
    Error::state(
        StateErrorKind::InvalidAssignment,
        format!("'{}.{association}' is a collection", meta.name),
    )
}

fn not_collection(meta: &EntityMetadata, association: &str) -> Error {
    Error::state(
        StateErrorKind::InvalidAssignment,
        format!("'{}.{association}' is not a collection", meta.name),
    )
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    /// Instances pending INSERT.
    pub new: usize,
    /// Instances pending UPDATE.
    pub dirty: usize,
    /// Instances pending DELETE.
    pub deleted: usize,
    /// Collections with a non-empty delta.
    pub collections: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted + self.collections
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::{CascadeSet, FieldMapping, JoinTable};

    fn registry() -> Arc<MetadataRegistry> {
        Arc::new(
            MetadataRegistry::new()
                .with(
                    EntityMetadata::new("User", "users")
                        .field(FieldMapping::id("id"))
                        .field(FieldMapping::new("name")),
                )
                .unwrap()
                .with(
                    EntityMetadata::new("Merchant", "merchants")
                        .field(FieldMapping::id("mid"))
                        .id_generation(IdGeneration::Identity),
                )
                .unwrap()
                .with(
                    EntityMetadata::new("Membership", "memberships")
                        .association(
                            AssociationMapping::many_to_one("user", "User")
                                .join_column("userid", "id")
                                .identifier(),
                        )
                        .association(
                            AssociationMapping::many_to_one("merchant", "Merchant")
                                .join_column("merchantid", "mid")
                                .identifier()
                                .cascade(CascadeSet::parse("persist").unwrap()),
                        )
                        .association(
                            AssociationMapping::many_to_many("privileges", "Privilege")
                                .join_table(
                                    JoinTable::new("membership_privileges")
                                        .local("userid", "userid")
                                        .local("merchantid", "merchantid")
                                        .remote("privilegeid", "privilegeid"),
                                )
                                .cascade(CascadeSet::parse("persist, remove").unwrap())
                                .index_by("privilegeid"),
                        ),
                )
                .unwrap()
                .with(
                    EntityMetadata::new("Privilege", "privileges")
                        .field(FieldMapping::id("privilegeid"))
                        .field(FieldMapping::new("name")),
                )
                .unwrap(),
        )
    }

    fn user(uow: &mut UnitOfWork, id: i64) -> InstanceId {
        let u = uow.new_entity("User").unwrap();
        uow.set_field(u, "id", Value::BigInt(id)).unwrap();
        u
    }

    #[test]
    fn persist_assigned_identity_registers() {
        let mut uow = UnitOfWork::new(registry());
        let u = user(&mut uow, 1);
        assert_eq!(uow.state(u), EntityState::New);
        uow.persist(u).unwrap();
        uow.persist(u).unwrap();
        assert_eq!(uow.state(u), EntityState::Managed);
        assert_eq!(
            uow.lookup("User", &EntityIdentity::single("id", 1_i64)),
            Some(u)
        );
        assert_eq!(uow.pending_counts().new, 1);
    }

    #[test]
    fn persist_without_assigned_id_fails_cleanly() {
        let mut uow = UnitOfWork::new(registry());
        let u = uow.new_entity("User").unwrap();
        let err = uow.persist(u).unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
        assert_eq!(uow.state(u), EntityState::New);
    }

    #[test]
    fn duplicate_identity_conflicts() {
        let mut uow = UnitOfWork::new(registry());
        let a = user(&mut uow, 1);
        let b = user(&mut uow, 1);
        uow.persist(a).unwrap();
        assert!(matches!(uow.persist(b), Err(Error::IdentityConflict(_))));
        assert_eq!(uow.state(b), EntityState::New);
    }

    #[test]
    fn cascade_persist_defers_generated_identity() {
        let mut uow = UnitOfWork::new(registry());
        let u = user(&mut uow, 1);
        uow.persist(u).unwrap();
        let m = uow.new_entity("Merchant").unwrap();
        let ms = uow.new_entity("Membership").unwrap();
        uow.set_reference(ms, "user", Some(u)).unwrap();
        uow.set_reference(ms, "merchant", Some(m)).unwrap();
        uow.persist(ms).unwrap();
        assert_eq!(uow.state(m), EntityState::Managed);
        assert!(uow.entry(m).unwrap().is_scheduled_insert());
        assert_eq!(uow.identity(m), None);
        assert_eq!(uow.identity(ms), None);

        uow.set_field(m, "mid", Value::BigInt(5)).unwrap();
        let identity = uow.derive_identity(ms).unwrap();
        assert_eq!(identity.get("userid"), Some(&Value::BigInt(1)));
        assert_eq!(identity.get("merchantid"), Some(&Value::BigInt(5)));
    }

    #[test]
    fn remove_of_pending_insert_cancels_it() {
        let mut uow = UnitOfWork::new(registry());
        let u = user(&mut uow, 1);
        uow.persist(u).unwrap();
        uow.remove(u).unwrap();
        assert_eq!(uow.state(u), EntityState::New);
        assert!(uow.lookup("User", &EntityIdentity::single("id", 1_i64)).is_none());
        assert!(uow.pending_counts().is_empty());

        let err = uow.remove(u).unwrap_err();
        assert!(matches!(
            err,
            Error::State(ref s) if s.kind == StateErrorKind::NotManaged
        ));
    }

    #[test]
    fn remove_managed_and_revive() {
        let mut uow = UnitOfWork::new(registry());
        let p = uow
            .create_proxy("Privilege", EntityIdentity::single("privilegeid", 3_i64))
            .unwrap();
        assert_eq!(uow.state(p), EntityState::Managed);
        uow.remove(p).unwrap();
        assert_eq!(uow.state(p), EntityState::Removed);
        assert_eq!(uow.pending_counts().deleted, 1);
        uow.persist(p).unwrap();
        assert_eq!(uow.state(p), EntityState::Managed);
        assert!(uow.pending_counts().is_empty());
    }

    #[test]
    fn proxy_fields_need_resolution() {
        let mut uow = UnitOfWork::new(registry());
        let p = uow
            .create_proxy("Privilege", EntityIdentity::single("privilegeid", 3_i64))
            .unwrap();
        assert_eq!(uow.get_field(p, "privilegeid").unwrap(), Value::BigInt(3));
        let err = uow.get_field(p, "name").unwrap_err();
        assert!(matches!(
            err,
            Error::State(ref s) if s.kind == StateErrorKind::Uninitialized
        ));
        assert!(uow.set_field(p, "name", Value::Text("x".into())).is_err());
        assert_eq!(
            uow.get_reference("Privilege", EntityIdentity::single("privilegeid", 3_i64))
                .unwrap(),
            p
        );
        assert!(
            uow.create_proxy("Privilege", EntityIdentity::single("privilegeid", 3_i64))
                .is_err()
        );
        assert!(
            uow.create_proxy("Privilege", EntityIdentity::single("id", 3_i64))
                .is_err()
        );
    }

    #[test]
    fn identifier_cannot_change_once_assigned() {
        let mut uow = UnitOfWork::new(registry());
        let u = user(&mut uow, 1);
        uow.persist(u).unwrap();
        let err = uow.set_field(u, "id", Value::BigInt(2)).unwrap_err();
        assert!(matches!(
            err,
            Error::State(ref s) if s.kind == StateErrorKind::InvalidAssignment
        ));
        uow.set_field(u, "id", Value::Int(1)).unwrap();
    }

    #[test]
    fn keyed_collection_add_uses_index_field() {
        let mut uow = UnitOfWork::new(registry());
        let ms = uow.new_entity("Membership").unwrap();
        let p = uow.new_entity("Privilege").unwrap();
        uow.set_field(p, "privilegeid", Value::BigInt(2)).unwrap();
        assert!(uow.collection_add(ms, "privileges", p).unwrap());
        assert_eq!(
            uow.collection(ms, "privileges")
                .unwrap()
                .get_key(&Value::BigInt(2)),
            Some(p)
        );
        let u = user(&mut uow, 9);
        assert!(uow.collection_add(ms, "privileges", u).is_err());
        assert!(uow.set_reference(ms, "privileges", Some(p)).is_err());
    }

    #[test]
    fn detach_and_clear_make_handles_detached() {
        let mut uow = UnitOfWork::new(registry());
        let a = user(&mut uow, 1);
        let b = user(&mut uow, 2);
        uow.persist(a).unwrap();
        uow.persist(b).unwrap();
        assert_eq!(uow.detach(a).unwrap(), vec![a]);
        assert_eq!(uow.state(a), EntityState::Detached);
        assert_eq!(uow.identity(a), Some(EntityIdentity::single("id", 1_i64)));
        assert!(matches!(uow.persist(a), Err(Error::State(_))));
        uow.clear();
        assert_eq!(uow.state(b), EntityState::Detached);
        assert!(uow.identity_map().is_empty());
        assert!(uow.is_empty());
    }

    #[test]
    fn checkpoint_restore_rolls_back_scheduling() {
        let mut uow = UnitOfWork::new(registry());
        let a = user(&mut uow, 1);
        let checkpoint = uow.checkpoint();
        uow.persist(a).unwrap();
        let loaded = uow
            .create_proxy("User", EntityIdentity::single("id", 2_i64))
            .unwrap();
        uow.restore(checkpoint);
        assert_eq!(uow.state(a), EntityState::New);
        assert!(uow.lookup("User", &EntityIdentity::single("id", 1_i64)).is_none());
        assert_eq!(
            uow.lookup("User", &EntityIdentity::single("id", 2_i64)),
            Some(loaded)
        );
    }

    #[test]
    fn restore_clears_identifiers_written_during_flush() {
        let mut uow = UnitOfWork::new(registry());
        let m = uow.new_entity("Merchant").unwrap();
        uow.persist(m).unwrap();
        let checkpoint = uow.checkpoint();
        uow.set_field(m, "mid", Value::BigInt(9)).unwrap();
        uow.restore(checkpoint);
        assert_eq!(uow.get_field(m, "mid").unwrap(), Value::Null);
        assert!(uow.entry(m).unwrap().is_scheduled_insert());
        assert_eq!(uow.derive_identity(m), None);
    }
}
