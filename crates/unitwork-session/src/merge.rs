//! Detached entity state and merge planning.
//!
//! A [`DetachedEntity`] is a plain description of an entity outside any
//! unit of work: field values, to-one references and collection contents.
//! Merging copies it onto the managed instance with the same identity, or
//! onto a new instance when there is none. Nested entities are merged too
//! when the association between them cascades `merge`; otherwise only
//! their identity is used.

use crate::entity::{InstanceId, RefSlot};
use crate::unit_of_work::UnitOfWork;
use serde::Serialize;
use std::collections::BTreeMap;
use unitwork_core::{
    CascadeOp, EntityIdentity, EntityMetadata, Error, MetadataRegistry, Result, StateErrorKind,
    Value,
};

/// Value of an association in a [`DetachedEntity`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DetachedRef {
    /// No target.
    Null,
    /// A target known only by identity.
    Identity(EntityIdentity),
    /// A full nested entity.
    Entity(Box<DetachedEntity>),
}

impl From<EntityIdentity> for DetachedRef {
    fn from(identity: EntityIdentity) -> Self {
        DetachedRef::Identity(identity)
    }
}

impl From<DetachedEntity> for DetachedRef {
    fn from(entity: DetachedEntity) -> Self {
        DetachedRef::Entity(Box::new(entity))
    }
}

/// State of an entity outside the unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetachedEntity {
    pub entity: String,
    pub fields: BTreeMap<String, Value>,
    /// To-one associations; absent ones are left untouched by a merge.
    pub references: BTreeMap<String, DetachedRef>,
    /// Collection contents; absent collections are left untouched.
    pub collections: BTreeMap<String, Vec<DetachedRef>>,
}

impl DetachedEntity {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            fields: BTreeMap::new(),
            references: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn reference(mut self, association: impl Into<String>, target: impl Into<DetachedRef>) -> Self {
        self.references.insert(association.into(), target.into());
        self
    }

    #[must_use]
    pub fn null_reference(mut self, association: impl Into<String>) -> Self {
        self.references.insert(association.into(), DetachedRef::Null);
        self
    }

    #[must_use]
    pub fn collection<I, T>(mut self, association: impl Into<String>, elements: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<DetachedRef>,
    {
        self.collections.insert(
            association.into(),
            elements.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// The identity this state describes, if every identifier part is set.
    pub fn identity(&self, registry: &MetadataRegistry) -> Result<Option<EntityIdentity>> {
        let meta = registry.get(&self.entity)?;
        Ok(self.identity_with(registry, &meta))
    }

    fn identity_with(&self, registry: &MetadataRegistry, meta: &EntityMetadata) -> Option<EntityIdentity> {
        let mut parts = Vec::new();
        for part in meta.identity_parts() {
            let value = if meta.get_field(part).is_some() {
                self.fields.get(part).cloned()
            } else {
                self.derived_part(registry, meta, part)
            }?;
            if value.is_null() {
                return None;
            }
            parts.push((part.to_string(), value));
        }
        Some(EntityIdentity::new(parts))
    }

    /// Identity part read through an identifier association.
    fn derived_part(&self, registry: &MetadataRegistry, meta: &EntityMetadata, part: &str) -> Option<Value> {
        let assoc = meta
            .associations
            .iter()
            .filter(|a| a.id)
            .find(|a| a.join_columns.iter().any(|jc| jc.column == part))?;
        let jc = assoc.join_columns.iter().find(|jc| jc.column == part)?;
        let target = match self.references.get(&assoc.name)? {
            DetachedRef::Null => return None,
            DetachedRef::Identity(identity) => identity.clone(),
            DetachedRef::Entity(nested) => {
                let target_meta = registry.get(&nested.entity).ok()?;
                nested.identity_with(registry, &target_meta)?
            }
        };
        target.get(&jc.referenced).cloned()
    }
}

/// One entity of a merge, flattened out of the nested description.
#[derive(Debug)]
pub(crate) struct MergeNode {
    pub(crate) state: DetachedEntity,
    pub(crate) identity: Option<EntityIdentity>,
    /// Nested nodes per association, by index into the node list.
    pub(crate) nested: BTreeMap<String, Vec<Option<usize>>>,
}

/// Flatten `root` into merge nodes, the root first. Nested entities are
/// their own nodes only where the association cascades `merge`.
pub(crate) fn flatten(registry: &MetadataRegistry, root: &DetachedEntity) -> Result<Vec<MergeNode>> {
    let mut nodes: Vec<MergeNode> = Vec::new();
    let mut queue: Vec<DetachedEntity> = vec![root.clone()];
    let mut next = 0;
    while next < queue.len() {
        let state = queue[next].clone();
        next += 1;
        let meta = registry.get(&state.entity)?;
        let mut nested: BTreeMap<String, Vec<Option<usize>>> = BTreeMap::new();
        let links = state
            .references
            .iter()
            .map(|(name, target)| (name, std::slice::from_ref(target)))
            .chain(state.collections.iter().map(|(name, elements)| (name, elements.as_slice())));
        for (name, targets) in links {
            let assoc = meta.require_association(name)?;
            let slots = nested.entry(name.clone()).or_default();
            for target in targets {
                match target {
                    DetachedRef::Entity(child) if assoc.cascade.contains(CascadeOp::Merge) => {
                        if child.entity != assoc.target {
                            return Err(Error::state(
                                StateErrorKind::InvalidAssignment,
                                format!(
                                    "'{}.{name}' expects {} but a {} was given",
                                    meta.name, assoc.target, child.entity
                                ),
                            ));
                        }
                        slots.push(Some(queue.len()));
                        queue.push((**child).clone());
                    }
                    _ => slots.push(None),
                }
            }
        }
        let identity = state.identity_with(registry, &meta);
        nodes.push(MergeNode {
            state,
            identity,
            nested,
        });
    }
    Ok(nodes)
}

impl UnitOfWork {
    /// Describe `id` as detached state: fields, loaded references and loaded
    /// collections, with targets given by identity.
    pub fn to_detached(&self, id: InstanceId) -> Result<DetachedEntity> {
        let entry = self.entry(id)?;
        if !entry.proxy.is_initialized() {
            return Err(Error::state(
                StateErrorKind::Uninitialized,
                format!("{} {id} is an uninitialized proxy", entry.entity()),
            ));
        }
        let mut state = DetachedEntity::new(entry.entity());
        state.fields = entry.fields.clone();
        for (name, slot) in &entry.references {
            match slot {
                RefSlot::Unloaded => {}
                RefSlot::Set(None) => {
                    state.references.insert(name.clone(), DetachedRef::Null);
                }
                RefSlot::Set(Some(target)) => {
                    if let Some(identity) = self.derive_identity(*target) {
                        state
                            .references
                            .insert(name.clone(), DetachedRef::Identity(identity));
                    }
                }
            }
        }
        for (name, collection) in &entry.collections {
            if !collection.is_initialized() {
                continue;
            }
            let elements = collection
                .elements()
                .into_iter()
                .filter_map(|e| self.derive_identity(e))
                .map(DetachedRef::Identity)
                .collect();
            state.collections.insert(name.clone(), elements);
        }
        Ok(state)
    }

    /// Copy the scalar fields of `state` onto `id`. Identifier fields are
    /// only written while the instance has no identity.
    pub(crate) fn merge_fields(&mut self, id: InstanceId, state: &DetachedEntity) -> Result<()> {
        let has_identity = self.entry(id)?.identity.is_some();
        for (name, value) in &state.fields {
            let meta = std::sync::Arc::clone(&self.entry(id)?.metadata);
            let field = meta.require_field(name)?;
            if field.id && has_identity {
                continue;
            }
            self.set_field(id, name, value.clone())?;
        }
        Ok(())
    }

    /// Instance for a non-cascading target given only by identity.
    pub(crate) fn merge_target(&mut self, entity: &str, target: &DetachedRef) -> Result<Option<InstanceId>> {
        match target {
            DetachedRef::Null => Ok(None),
            DetachedRef::Identity(identity) => self.get_reference(entity, identity.clone()).map(Some),
            DetachedRef::Entity(nested) => {
                let identity = nested.identity(self.registry())?.ok_or_else(|| {
                    Error::state(
                        StateErrorKind::UnpersistedReference,
                        format!(
                            "{} without identity reached through an association that does not cascade merge",
                            nested.entity
                        ),
                    )
                })?;
                self.get_reference(entity, identity).map(Some)
            }
        }
    }

    /// Replace the contents of a loaded collection with `elements`, keeping
    /// elements that stay and their position.
    pub(crate) fn replace_collection(
        &mut self,
        owner: InstanceId,
        association: &str,
        elements: &[InstanceId],
    ) -> Result<()> {
        let current = self.collection(owner, association)?.elements();
        for element in current.iter().filter(|e| !elements.contains(e)) {
            self.collection_remove(owner, association, *element)?;
        }
        for element in elements {
            self.collection_add(owner, association, *element)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use unitwork_core::{AssociationMapping, CascadeSet, FieldMapping};

    fn registry() -> Arc<MetadataRegistry> {
        Arc::new(
            MetadataRegistry::new()
                .with(
                    EntityMetadata::new("Order", "orders")
                        .field(FieldMapping::id("id"))
                        .field(FieldMapping::new("status"))
                        .association(
                            AssociationMapping::one_to_many("lines", "Line", "order")
                                .cascade(CascadeSet::ALL),
                        )
                        .association(
                            AssociationMapping::many_to_one("customer", "Customer")
                                .join_column("customer_id", "id"),
                        ),
                )
                .unwrap()
                .with(
                    EntityMetadata::new("Line", "lines")
                        .field(FieldMapping::id("no"))
                        .association(
                            AssociationMapping::many_to_one("order", "Order")
                                .join_column("order_id", "id")
                                .identifier(),
                        ),
                )
                .unwrap()
                .with(EntityMetadata::new("Customer", "customers").field(FieldMapping::id("id")))
                .unwrap(),
        )
    }

    #[test]
    fn identity_reads_identifier_associations() {
        let reg = registry();
        let line = DetachedEntity::new("Line")
            .field("no", 2_i64)
            .reference("order", EntityIdentity::single("id", 7_i64));
        let identity = line.identity(&reg).unwrap().unwrap();
        assert_eq!(identity.get("no"), Some(&Value::BigInt(2)));
        assert_eq!(identity.get("order_id"), Some(&Value::BigInt(7)));

        assert_eq!(DetachedEntity::new("Line").field("no", 2_i64).identity(&reg).unwrap(), None);
    }

    #[test]
    fn flatten_follows_merge_cascades_only() {
        let reg = registry();
        let order = DetachedEntity::new("Order")
            .field("id", 7_i64)
            .reference("customer", DetachedEntity::new("Customer").field("id", 1_i64))
            .collection(
                "lines",
                [
                    DetachedEntity::new("Line").field("no", 1_i64),
                    DetachedEntity::new("Line").field("no", 2_i64),
                ],
            );
        let nodes = flatten(&reg, &order).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].nested["customer"], vec![None]);
        assert_eq!(nodes[0].nested["lines"], vec![Some(1), Some(2)]);
        assert_eq!(nodes[1].state.entity, "Line");
    }

    #[test]
    fn flatten_rejects_wrong_target_type() {
        let reg = registry();
        let order = DetachedEntity::new("Order")
            .field("id", 7_i64)
            .collection("lines", [DetachedEntity::new("Customer").field("id", 1_i64)]);
        assert!(matches!(flatten(&reg, &order), Err(Error::State(_))));
    }

    #[test]
    fn detached_state_uses_identities() {
        let reg = registry();
        let mut uow = UnitOfWork::new(Arc::clone(&reg));
        let customer = uow
            .get_reference("Customer", EntityIdentity::single("id", 1_i64))
            .unwrap();
        let order = uow.new_entity("Order").unwrap();
        uow.set_field(order, "id", Value::BigInt(7)).unwrap();
        uow.set_field(order, "status", Value::Text("open".into())).unwrap();
        uow.set_reference(order, "customer", Some(customer)).unwrap();

        let state = uow.to_detached(order).unwrap();
        assert_eq!(state.fields["status"], Value::Text("open".into()));
        assert_eq!(
            state.references["customer"],
            DetachedRef::Identity(EntityIdentity::single("id", 1_i64))
        );
        assert_eq!(state.collections["lines"], Vec::new());
        assert!(uow.to_detached(customer).is_err());
    }
}
