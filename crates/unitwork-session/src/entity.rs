//! Instances tracked by the unit of work.
//!
//! Entities are not Rust structs owned by the caller: every in-memory entity
//! lives in the unit of work's arena and is addressed by an [`InstanceId`].
//! Cross-entity references hold ids, never pointers, so cyclic and
//! self-referential object graphs need no shared ownership.

use crate::collection::TrackedCollection;
use crate::proxy::ProxyState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use unitwork_core::{EntityIdentity, EntityMetadata, Value};

/// Handle of one in-memory entity instance.
///
/// Ids are never reused within a unit of work, so a handle kept after its
/// instance was detached keeps reporting [`EntityState::Detached`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub(crate) u64);

impl InstanceId {
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Not known to storage and not scheduled for insertion.
    New,
    /// Tracked by the unit of work (possibly with an insert pending).
    Managed,
    /// Scheduled for deletion at the next flush.
    Removed,
    /// No longer tracked.
    Detached,
}

impl EntityState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityState::New => "NEW",
            EntityState::Managed => "MANAGED",
            EntityState::Removed => "REMOVED",
            EntityState::Detached => "DETACHED",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of a single-valued association on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefSlot {
    /// Not known yet (inverse one-to-one that was not join-fetched).
    Unloaded,
    /// Known target, or `None` for no target.
    Set(Option<InstanceId>),
}

impl RefSlot {
    pub const fn target(&self) -> Option<InstanceId> {
        match self {
            RefSlot::Unloaded => None,
            RefSlot::Set(t) => *t,
        }
    }
}

/// A cascade that could not finish synchronously because the association
/// it walks is not loaded. Settled at the start of the next flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingCascade {
    /// Resolve this proxy, then cascade removal along its associations.
    RemoveThroughProxy,
    /// Load this inverse to-one association, then cascade removal to its target.
    RemoveThroughReference(String),
    /// Load this collection, then cascade removal into its elements.
    RemoveThroughCollection(String),
}

/// Per-instance record owned by the unit of work.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub(crate) metadata: Arc<EntityMetadata>,
    pub(crate) identity: Option<EntityIdentity>,
    pub(crate) state: EntityState,
    pub(crate) fields: BTreeMap<String, Value>,
    pub(crate) references: BTreeMap<String, RefSlot>,
    pub(crate) collections: BTreeMap<String, TrackedCollection>,
    pub(crate) proxy: ProxyState,
    /// An insert is pending for this instance.
    pub(crate) scheduled_insert: bool,
    pub(crate) pending_cascades: Vec<PendingCascade>,
}

impl EntityEntry {
    /// A NEW instance with every association empty and loaded.
    pub(crate) fn new(id: InstanceId, metadata: Arc<EntityMetadata>) -> Self {
        let mut entry = Self::blank(metadata, ProxyState::Initialized);
        for assoc in &entry.metadata.associations {
            if assoc.is_collection() {
                entry.collections.insert(
                    assoc.name.clone(),
                    TrackedCollection::new_loaded(id, &assoc.name, assoc.index_by.is_some()),
                );
            } else {
                entry
                    .references
                    .insert(assoc.name.clone(), RefSlot::Set(None));
            }
        }
        entry
    }

    /// A MANAGED, uninitialized proxy for `identity`.
    pub(crate) fn proxy(
        id: InstanceId,
        metadata: Arc<EntityMetadata>,
        identity: EntityIdentity,
    ) -> Self {
        let mut entry = Self::blank(metadata, ProxyState::Uninitialized);
        for assoc in &entry.metadata.associations {
            if assoc.is_collection() {
                entry.collections.insert(
                    assoc.name.clone(),
                    TrackedCollection::new_lazy(id, &assoc.name, assoc.index_by.is_some()),
                );
            } else {
                entry.references.insert(assoc.name.clone(), RefSlot::Unloaded);
            }
        }
        entry.state = EntityState::Managed;
        entry.identity = Some(identity);
        entry
    }

    fn blank(metadata: Arc<EntityMetadata>, proxy: ProxyState) -> Self {
        Self {
            metadata,
            identity: None,
            state: EntityState::New,
            fields: BTreeMap::new(),
            references: BTreeMap::new(),
            collections: BTreeMap::new(),
            proxy,
            scheduled_insert: false,
            pending_cascades: Vec::new(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    pub fn identity(&self) -> Option<&EntityIdentity> {
        self.identity.as_ref()
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn proxy_state(&self) -> ProxyState {
        self.proxy
    }

    pub fn is_scheduled_insert(&self) -> bool {
        self.scheduled_insert
    }

    /// Current value of a scalar field (NULL if never set).
    pub fn field(&self, name: &str) -> Value {
        self.fields.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn reference(&self, association: &str) -> Option<RefSlot> {
        self.references.get(association).copied()
    }

    pub fn collection(&self, association: &str) -> Option<&TrackedCollection> {
        self.collections.get(association)
    }

    pub(crate) fn collection_mut(&mut self, association: &str) -> Option<&mut TrackedCollection> {
        self.collections.get_mut(association)
    }

    /// Current to-one targets, for snapshots.
    pub(crate) fn reference_targets(&self) -> BTreeMap<String, Option<InstanceId>> {
        self.references
            .iter()
            .filter_map(|(name, slot)| match slot {
                RefSlot::Set(t) => Some((name.clone(), *t)),
                RefSlot::Unloaded => None,
            })
            .collect()
    }
}

/// What survives of an instance after it leaves the unit of work.
#[derive(Debug, Clone)]
pub(crate) struct Tombstone {
    pub(crate) entity: String,
    pub(crate) identity: Option<EntityIdentity>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::{AssociationMapping, FieldMapping};

    fn meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("Driver", "drivers")
                .field(FieldMapping::id("id"))
                .association(AssociationMapping::one_to_many("rides", "Ride", "driver"))
                .association(
                    AssociationMapping::many_to_one("car", "Car").join_column("car_id", "id"),
                ),
        )
    }

    #[test]
    fn new_entry_has_loaded_empty_associations() {
        let entry = EntityEntry::new(InstanceId(1), meta());
        assert_eq!(entry.state(), EntityState::New);
        assert_eq!(entry.reference("car"), Some(RefSlot::Set(None)));
        let rides = entry.collection("rides").unwrap();
        assert!(rides.is_initialized());
        assert!(rides.is_empty());
        assert_eq!(entry.field("id"), Value::Null);
    }

    #[test]
    fn proxy_entry_is_managed_and_lazy() {
        let entry = EntityEntry::proxy(
            InstanceId(2),
            meta(),
            EntityIdentity::single("id", 7_i64),
        );
        assert_eq!(entry.state(), EntityState::Managed);
        assert_eq!(entry.proxy_state(), ProxyState::Uninitialized);
        assert_eq!(entry.reference("car"), Some(RefSlot::Unloaded));
        assert!(!entry.collection("rides").unwrap().is_initialized());
        assert!(entry.reference_targets().is_empty());
    }

    #[test]
    fn display_formats() {
        assert_eq!(InstanceId(12).to_string(), "#12");
        assert_eq!(EntityState::Managed.to_string(), "MANAGED");
    }
}
