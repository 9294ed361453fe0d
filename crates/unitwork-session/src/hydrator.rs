//! Join-aware result hydration.
//!
//! Turns raw rows labelled `alias__column` into linked instances. A join
//! over a to-many association repeats the root once per child row, so roots
//! are collapsed by identity and returned in the order each first appeared.
//! Ordering clauses therefore order children inside collections, never the
//! roots relative to each other.
//!
//! Instances are resolved through the identity map: a row for an identity
//! that is already managed and initialized does not touch its fields unless
//! the pass refreshes.

use crate::collection::ElementKey;
use crate::entity::{EntityState, InstanceId, RefSlot};
use crate::unit_of_work::UnitOfWork;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use unitwork_core::{
    AssociationMapping, EntityIdentity, EntityMetadata, Error, Result, Row, Value,
};
use unitwork_query::ResolvedPlan;

/// State of one hydration pass.
struct Pass<'a> {
    uow: &'a mut UnitOfWork,
    plan: &'a ResolvedPlan,
    refresh: bool,
    /// Instances whose fields were written by this pass.
    populated: HashSet<InstanceId>,
    /// Collections seen by this pass and whether this pass is filling them.
    loading: HashMap<(InstanceId, String), bool>,
}

impl UnitOfWork {
    /// Hydrate `rows` fetched with `plan`. Returns the distinct roots in
    /// first-occurrence order.
    ///
    /// With `refresh`, rows overwrite the fields of managed instances and
    /// reload their join-fetched collections.
    #[tracing::instrument(level = "debug", skip_all, fields(root = %plan.root_alias, rows = rows.len()))]
    pub fn hydrate(
        &mut self,
        plan: &ResolvedPlan,
        rows: &[Row],
        refresh: bool,
    ) -> Result<Vec<InstanceId>> {
        let root_meta = Arc::clone(plan.root()?);
        let mut pass = Pass {
            uow: self,
            plan,
            refresh,
            populated: HashSet::new(),
            loading: HashMap::new(),
        };
        let mut roots = Vec::new();
        let mut seen = HashSet::new();

        for row in rows {
            let mut in_row: HashMap<&str, Option<InstanceId>> = HashMap::new();
            let root = pass.materialize(&plan.root_alias, &root_meta, row)?;
            in_row.insert(plan.root_alias.as_str(), root);
            let Some(root) = root else {
                continue;
            };
            if seen.insert(root) {
                roots.push(root);
            }
            for join in plan.fetched() {
                let meta = Arc::clone(plan.entity(&join.join.alias)?);
                let child = pass.materialize(&join.join.alias, &meta, row)?;
                in_row.insert(join.join.alias.as_str(), child);
                if let Some(Some(parent)) = in_row.get(join.join.parent.as_str()).copied() {
                    pass.link(parent, &join.association, child)?;
                }
            }
        }

        let populated = pass.finish();
        tracing::debug!(
            roots = roots.len(),
            populated = populated,
            "Hydrated rows"
        );
        Ok(roots)
    }

    /// Replace the contents of a lazy collection with `elements` read from
    /// storage and mark it initialized.
    pub(crate) fn fill_collection(
        &mut self,
        owner: InstanceId,
        association: &str,
        elements: &[InstanceId],
    ) -> Result<()> {
        let meta = Arc::clone(&self.entry(owner)?.metadata);
        let assoc = meta.require_association(association)?;
        let keyed: Vec<(InstanceId, ElementKey, Option<Value>)> = elements
            .iter()
            .map(|e| {
                let index = assoc
                    .index_by
                    .as_deref()
                    .and_then(|field| self.index_value(*e, field));
                (*e, self.element_key(*e), index)
            })
            .collect();
        let collection = self
            .entry_mut(owner)?
            .collection_mut(association)
            .ok_or_else(|| Error::unknown_association(&meta.name, association))?;
        collection.begin_load();
        for (element, key, index) in keyed {
            collection.hydrate_add(element, key, index);
        }
        tracing::trace!(
            owner = %owner,
            association = %association,
            elements = elements.len(),
            "Collection loaded"
        );
        Ok(())
    }

    /// Record the loaded target of a to-one association as both current and
    /// persisted value.
    pub(crate) fn fill_reference(
        &mut self,
        owner: InstanceId,
        association: &str,
        target: Option<InstanceId>,
    ) -> Result<()> {
        self.entry_mut(owner)?
            .references
            .insert(association.to_string(), RefSlot::Set(target));
        self.tracker.set_baseline_reference(owner, association, target);
        Ok(())
    }
}

/// Identity of the entity selected under `alias`, if the row carries one.
/// An outer join without a match yields `None`.
pub(crate) fn row_identity(alias: &str, meta: &EntityMetadata, row: &Row) -> Option<EntityIdentity> {
    let mut parts = Vec::new();
    for part in meta.identity_parts() {
        let value = row.aliased(alias, meta.identity_part_column(part))?;
        if value.is_null() {
            return None;
        }
        parts.push((part.to_string(), value.clone()));
    }
    Some(EntityIdentity::new(parts))
}

impl Pass<'_> {
    /// Resolve or create the instance for `alias` in `row`, populating it
    /// if this pass is responsible for its fields.
    fn materialize(
        &mut self,
        alias: &str,
        meta: &Arc<EntityMetadata>,
        row: &Row,
    ) -> Result<Option<InstanceId>> {
        let Some(identity) = row_identity(alias, meta, row) else {
            return Ok(None);
        };
        let id = match self.uow.lookup(&meta.name, &identity) {
            Some(id) => id,
            None => self.uow.create_proxy(&meta.name, identity)?,
        };
        if self.populated.contains(&id) {
            return Ok(Some(id));
        }
        let entry = self.uow.entry(id)?;
        let populate = !entry.proxy.is_initialized()
            || (self.refresh && entry.state == EntityState::Managed && !entry.scheduled_insert);
        if populate {
            self.populate(id, alias, meta, row)?;
        }
        Ok(Some(id))
    }

    fn populate(
        &mut self,
        id: InstanceId,
        alias: &str,
        meta: &Arc<EntityMetadata>,
        row: &Row,
    ) -> Result<()> {
        let mut fields = BTreeMap::new();
        for field in &meta.fields {
            if let Some(value) = row.aliased(alias, &field.column) {
                fields.insert(field.name.clone(), value.clone());
            }
        }
        let mut references = Vec::new();
        for assoc in meta.foreign_keys() {
            // Join-fetched associations are linked from their own columns.
            if self.plan.fetched_join(alias, &assoc.name).is_some() {
                continue;
            }
            if let Some(target) = self.foreign_key_target(alias, assoc, row)? {
                references.push((assoc.name.clone(), target));
            }
        }

        let entry = self.uow.entry_mut(id)?;
        entry.fields.extend(fields);
        for (name, target) in references {
            entry.references.insert(name, RefSlot::Set(target));
        }
        entry.proxy.complete();
        self.populated.insert(id);
        tracing::trace!(instance = %id, alias = %alias, "Populated instance from row");
        Ok(())
    }

    /// Target of an owning to-one association read from its foreign key
    /// columns: `Some(None)` for NULL, `None` if the columns were not selected.
    fn foreign_key_target(
        &mut self,
        alias: &str,
        assoc: &AssociationMapping,
        row: &Row,
    ) -> Result<Option<Option<InstanceId>>> {
        let target = self.uow.registry().get(&assoc.target)?;
        let mut parts = Vec::new();
        for part in target.identity_parts() {
            let Some(jc) = assoc.join_columns.iter().find(|jc| jc.referenced == part) else {
                return Ok(None);
            };
            let Some(value) = row.aliased(alias, &jc.column) else {
                return Ok(None);
            };
            if value.is_null() {
                return Ok(Some(None));
            }
            parts.push((part.to_string(), value.clone()));
        }
        let id = self
            .uow
            .get_reference(&target.name, EntityIdentity::new(parts))?;
        Ok(Some(Some(id)))
    }

    /// Attach `child` to `parent.assoc` as read from a fetched join.
    fn link(
        &mut self,
        parent: InstanceId,
        assoc: &AssociationMapping,
        child: Option<InstanceId>,
    ) -> Result<()> {
        if !assoc.is_collection() {
            let populated = self.populated.contains(&parent);
            let entry = self.uow.entry_mut(parent)?;
            let unloaded = matches!(entry.references.get(&assoc.name), None | Some(RefSlot::Unloaded));
            if populated {
                entry.references.insert(assoc.name.clone(), RefSlot::Set(child));
            } else if unloaded {
                self.uow.fill_reference(parent, &assoc.name, child)?;
            }
            return Ok(());
        }

        let key = (parent, assoc.name.clone());
        let loading = match self.loading.get(&key) {
            Some(loading) => *loading,
            None => {
                let reload = self.refresh && self.populated.contains(&parent);
                let entry = self.uow.entry_mut(parent)?;
                let entity = entry.metadata.name.clone();
                let collection = entry
                    .collection_mut(&assoc.name)
                    .ok_or_else(|| Error::unknown_association(&entity, &assoc.name))?;
                let loading = reload || !collection.is_initialized();
                if loading {
                    collection.begin_load();
                }
                self.loading.insert(key, loading);
                loading
            }
        };
        let Some(child) = child else {
            return Ok(());
        };
        if !loading {
            return Ok(());
        }
        let element_key = self.uow.element_key(child);
        let index = assoc
            .index_by
            .as_deref()
            .and_then(|field| self.uow.index_value(child, field));
        if let Some(collection) = self.uow.entry_mut(parent)?.collection_mut(&assoc.name) {
            collection.hydrate_add(child, element_key, index);
        }
        Ok(())
    }

    /// Snapshot everything this pass populated. Returns how many.
    fn finish(self) -> usize {
        for id in &self.populated {
            if let Some(entry) = self.uow.entries.get(id) {
                self.uow.tracker.snapshot(*id, entry);
            }
        }
        self.populated.len()
    }
}
