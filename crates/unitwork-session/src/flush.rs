//! Flush operation ordering and batching.
//!
//! A flush compiles everything the unit of work knows into one ordered
//! batch of [`WriteCommand`]s:
//!
//! 1. link-table DELETEs (removed collection elements, links of removed rows)
//! 2. INSERTs, parent-first along foreign keys
//! 3. extra UPDATEs filling foreign keys deferred to break nullable cycles
//! 4. UPDATEs of changed columns
//! 5. link-table INSERTs
//! 6. UPDATEs nulling foreign keys to break nullable cycles among deletes
//! 7. DELETEs, child-first along foreign keys
//!
//! A cycle made only of required foreign keys cannot be ordered and fails
//! with `UnresolvedDependency` before anything is written.

use crate::cascade;
use crate::entity::{EntityState, InstanceId, RefSlot};
use crate::unit_of_work::{MAX_IDENTITY_DEPTH, UnitOfWork};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use unitwork_core::{
    AssociationKind, AssociationMapping, CascadeOp, Columns, DependencyError, EntityMetadata,
    Error, IdGeneration, JoinColumn, JoinTable, Param, Result, StateErrorKind, Value,
    WriteCommand, WriteResult,
};

/// What a flush does with a `NEW` instance reached through an association
/// that does not cascade persist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum NewEntityPolicy {
    /// Fail the flush with `StateError::UnpersistedReference`.
    #[default]
    Reject,
    /// Write NULL for the foreign key and skip link rows.
    Ignore,
}

/// Summary of a completed flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub links_inserted: usize,
    pub links_deleted: usize,
    /// Updates added to break nullable foreign key cycles.
    pub extra_updates: usize,
}

impl FlushResult {
    pub fn total(&self) -> usize {
        self.inserted
            + self.updated
            + self.deleted
            + self.links_inserted
            + self.links_deleted
            + self.extra_updates
    }
}

/// A compiled flush.
#[derive(Debug, Clone, Default)]
pub struct FlushPlan {
    pub commands: Vec<WriteCommand>,
    /// Inserted instances in dependency order, with their command index.
    pub(crate) inserts: Vec<(InstanceId, usize)>,
    pub(crate) deletes: Vec<InstanceId>,
    /// Instances whose snapshot advances on success.
    pub(crate) touched: Vec<InstanceId>,
    pub(crate) result: FlushResult,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn result(&self) -> FlushResult {
        self.result
    }
}

// ============================================================================
// Dependency ordering
// ============================================================================

/// `before` must be written before `after` because `owner.association`
/// is a foreign key between them.
#[derive(Debug, Clone)]
struct Edge {
    before: InstanceId,
    after: InstanceId,
    owner: InstanceId,
    association: String,
    required: bool,
    active: bool,
}

#[derive(Debug, Default)]
struct DependencyGraph {
    nodes: BTreeSet<InstanceId>,
    edges: Vec<Edge>,
}

impl DependencyGraph {
    fn new(nodes: impl IntoIterator<Item = InstanceId>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
            edges: Vec::new(),
        }
    }

    fn add(&mut self, before: InstanceId, after: InstanceId, owner: InstanceId, assoc: &AssociationMapping) {
        if !self.nodes.contains(&before) || !self.nodes.contains(&after) {
            return;
        }
        self.edges.push(Edge {
            before,
            after,
            owner,
            association: assoc.name.clone(),
            required: !assoc.nullable,
            active: true,
        });
    }

    /// Topological order plus the edges that had to be deferred.
    /// Fails with the nodes of a cycle made only of required edges.
    fn order(mut self) -> std::result::Result<(Vec<InstanceId>, Vec<Edge>), Vec<InstanceId>> {
        if let Some(cycle) = self.find_cycle(|e| e.required, &self.nodes) {
            return Err(cycle.iter().map(|i| self.edges[*i].before).collect());
        }

        let mut in_degree: HashMap<InstanceId, usize> = HashMap::new();
        for edge in &self.edges {
            *in_degree.entry(edge.after).or_default() += 1;
        }
        let mut ready: BTreeSet<InstanceId> = self
            .nodes
            .iter()
            .copied()
            .filter(|n| in_degree.get(n).copied().unwrap_or(0) == 0)
            .collect();
        let mut remaining = self.nodes.clone();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut deferred = Vec::new();

        loop {
            while let Some(node) = ready.pop_first() {
                remaining.remove(&node);
                order.push(node);
                for edge in self.edges.iter().filter(|e| e.active && e.before == node) {
                    let degree = in_degree.entry(edge.after).or_default();
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 && remaining.contains(&edge.after) {
                        ready.insert(edge.after);
                    }
                }
            }
            if remaining.is_empty() {
                break;
            }
            let cycle = self
                .find_cycle(|e| e.active, &remaining)
                .unwrap_or_default();
            let Some(&idx) = cycle.iter().find(|i| !self.edges[**i].required) else {
                // Only reachable if the required-cycle check above missed one.
                return Err(remaining.into_iter().collect());
            };
            let edge = &mut self.edges[idx];
            edge.active = false;
            tracing::trace!(
                owner = %edge.owner,
                association = %edge.association,
                "Deferring nullable foreign key to break cycle"
            );
            let degree = in_degree.entry(edge.after).or_default();
            *degree = degree.saturating_sub(1);
            if *degree == 0 {
                ready.insert(edge.after);
            }
            deferred.push(edge.clone());
        }
        Ok((order, deferred))
    }

    /// Edge indices of some cycle among `within` using edges accepted by `allowed`.
    fn find_cycle(&self, allowed: impl Fn(&Edge) -> bool, within: &BTreeSet<InstanceId>) -> Option<Vec<usize>> {
        let mut color: HashMap<InstanceId, u8> = HashMap::new();
        let mut path = Vec::new();
        for &start in within {
            if color.get(&start).copied().unwrap_or(0) == 0 {
                if let Some(cycle) = self.dfs(start, &allowed, within, &mut color, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs(
        &self,
        node: InstanceId,
        allowed: &impl Fn(&Edge) -> bool,
        within: &BTreeSet<InstanceId>,
        color: &mut HashMap<InstanceId, u8>,
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        color.insert(node, 1);
        for (i, edge) in self.edges.iter().enumerate() {
            if edge.before != node || !allowed(edge) || !within.contains(&edge.after) {
                continue;
            }
            match color.get(&edge.after).copied().unwrap_or(0) {
                1 => {
                    let start = path
                        .iter()
                        .position(|j| self.edges[*j].before == edge.after)
                        .unwrap_or(path.len());
                    let mut cycle = path[start..].to_vec();
                    cycle.push(i);
                    return Some(cycle);
                }
                0 => {
                    path.push(i);
                    if let Some(cycle) = self.dfs(edge.after, allowed, within, color, path) {
                        return Some(cycle);
                    }
                    path.pop();
                }
                _ => {}
            }
        }
        color.insert(node, 2);
        None
    }
}

// ============================================================================
// Planning
// ============================================================================

struct Planner<'a> {
    uow: &'a UnitOfWork,
    reserved: &'a HashMap<InstanceId, Value>,
    policy: NewEntityPolicy,
    insert_index: HashMap<InstanceId, usize>,
    plan: FlushPlan,
}

impl UnitOfWork {
    /// In-memory work that must happen before a flush is planned:
    /// persist cascades from every managed instance and orphan removal.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn prepare_flush(&mut self) -> Result<()> {
        let roots: Vec<InstanceId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == EntityState::Managed)
            .map(|(id, _)| *id)
            .collect();
        let mut seen = HashSet::new();
        let mut reached = Vec::new();
        for root in roots {
            for id in cascade::walk(&self.entries, root, CascadeOp::Persist).reached {
                if seen.insert(id) && self.state(id) == EntityState::New {
                    reached.push(id);
                }
            }
        }
        self.schedule_persist(&reached)?;

        let orphans = self.find_orphans();
        if !orphans.is_empty() {
            tracing::debug!(count = orphans.len(), "Removing orphans");
        }
        for orphan in orphans {
            self.cascade_remove(orphan);
        }
        Ok(())
    }

    fn find_orphans(&self) -> Vec<InstanceId> {
        let mut orphans = Vec::new();
        for (id, entry) in &self.entries {
            if entry.state != EntityState::Managed || !entry.proxy.is_initialized() {
                continue;
            }
            for assoc in entry.metadata.associations.iter().filter(|a| a.orphan_removal) {
                if assoc.is_collection() {
                    let Some(collection) = entry.collections.get(&assoc.name) else {
                        continue;
                    };
                    if collection.is_initialized() {
                        let delta = collection.compute_delta_with(|e| self.element_key(e));
                        orphans.extend(delta.removed);
                    }
                } else if let Some(snapshot) = self.tracker.get_snapshot(*id) {
                    let current = entry.references.get(&assoc.name).and_then(RefSlot::target);
                    if let Some(Some(old)) = snapshot.reference(&assoc.name) {
                        if current != Some(old) {
                            orphans.push(old);
                        }
                    }
                }
            }
        }
        orphans.retain(|o| self.state(*o) == EntityState::Managed);
        orphans
    }

    /// Instances whose insert needs a value from the identifier generator.
    pub(crate) fn sequence_pending(&self) -> Vec<(InstanceId, String)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == EntityState::Managed && e.scheduled_insert)
            .filter(|(_, e)| e.metadata.id_generation == IdGeneration::Sequence)
            .filter(|(_, e)| {
                e.metadata
                    .generated_id_field()
                    .is_some_and(|f| e.field(&f.name).is_null())
            })
            .map(|(id, e)| (*id, e.metadata.name.clone()))
            .collect()
    }

    /// Compile the pending state into an ordered write batch.
    #[tracing::instrument(level = "debug", skip(self, reserved))]
    pub(crate) fn plan_flush(
        &self,
        reserved: &HashMap<InstanceId, Value>,
        policy: NewEntityPolicy,
    ) -> Result<FlushPlan> {
        let mut planner = Planner {
            uow: self,
            reserved,
            policy,
            insert_index: HashMap::new(),
            plan: FlushPlan::default(),
        };
        planner.build()?;
        let plan = planner.plan;
        tracing::debug!(
            commands = plan.commands.len(),
            inserts = plan.result.inserted,
            updates = plan.result.updated,
            deletes = plan.result.deleted,
            links_inserted = plan.result.links_inserted,
            links_deleted = plan.result.links_deleted,
            extra_updates = plan.result.extra_updates,
            "Flush plan compiled"
        );
        Ok(plan)
    }

    /// Advance in-memory state after the write executor accepted `plan`.
    ///
    /// Generated identifiers are checked before the first mutation. If
    /// registering one fails, the values already written to instance fields
    /// are put back by [`UnitOfWork::restore`].
    #[tracing::instrument(level = "debug", skip_all)]
    pub(crate) fn apply_flush(
        &mut self,
        plan: &FlushPlan,
        results: &[WriteResult],
        reserved: &HashMap<InstanceId, Value>,
    ) -> Result<()> {
        let mut generated: Vec<(InstanceId, String, Value)> = Vec::new();
        for (id, index) in &plan.inserts {
            let entry = self.entry(*id)?;
            let Some(field) = entry.metadata.generated_id_field() else {
                continue;
            };
            match entry.metadata.id_generation {
                IdGeneration::Identity => {
                    let value = results
                        .get(*index)
                        .and_then(|r| r.generated.clone())
                        .filter(|v| !v.is_null())
                        .ok_or_else(|| {
                            Error::Custom(format!(
                                "write executor reported no generated identifier for command #{index}"
                            ))
                        })?;
                    generated.push((*id, field.name.clone(), value));
                }
                IdGeneration::Sequence => {
                    if let Some(value) = reserved.get(id) {
                        generated.push((*id, field.name.clone(), value.clone()));
                    }
                }
                IdGeneration::Assigned => {}
            }
        }

        for (id, field, value) in generated {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.fields.insert(field, value);
            }
        }
        for (id, _) in &plan.inserts {
            let identity = self.derive_identity(*id);
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            entry.scheduled_insert = false;
            if entry.identity.is_none() {
                if let Some(identity) = identity {
                    self.identity_map.register(&entry.metadata.name, &identity, *id)?;
                    entry.identity = Some(identity);
                }
            }
        }

        let gone: HashSet<InstanceId> = plan.deletes.iter().copied().collect();
        for id in &plan.deletes {
            self.evict(*id);
        }
        if !gone.is_empty() {
            for entry in self.entries.values_mut() {
                for collection in entry.collections.values_mut() {
                    collection.forget_elements(&gone);
                }
            }
        }

        for id in &plan.touched {
            if let Some(entry) = self.entries.get(id) {
                self.tracker.snapshot(*id, entry);
            }
        }
        self.accept_collection_snapshots();
        for entry in self.entries.values_mut() {
            entry.pending_cascades.clear();
        }
        tracing::debug!(
            inserted = plan.inserts.len(),
            deleted = plan.deletes.len(),
            snapshots = plan.touched.len(),
            "Flush applied"
        );
        Ok(())
    }

    fn accept_collection_snapshots(&mut self) {
        let mut keys = HashMap::new();
        let mut index: HashMap<(InstanceId, String), HashMap<InstanceId, Option<Value>>> =
            HashMap::new();
        for (owner, entry) in &self.entries {
            if entry.state != EntityState::Managed {
                continue;
            }
            for (name, collection) in &entry.collections {
                if !collection.is_initialized() {
                    continue;
                }
                let index_by = entry
                    .metadata
                    .get_association(name)
                    .and_then(|a| a.index_by.clone());
                for element in collection.elements() {
                    keys.entry(element)
                        .or_insert_with(|| self.element_key(element));
                    if let Some(field) = &index_by {
                        index
                            .entry((*owner, name.clone()))
                            .or_default()
                            .insert(element, self.index_value(element, field));
                    }
                }
            }
        }
        for (owner, entry) in &mut self.entries {
            if entry.state != EntityState::Managed {
                continue;
            }
            for (name, collection) in &mut entry.collections {
                if !collection.is_initialized() {
                    continue;
                }
                collection.accept_snapshot_with(|e| {
                    keys.get(&e)
                        .cloned()
                        .unwrap_or(crate::collection::ElementKey::Instance(e))
                });
                if let Some(values) = index.get(&(*owner, name.clone())) {
                    collection.rekey(|e| values.get(&e).cloned().flatten());
                }
            }
        }
    }

    /// `Type[id=1]` for persisted instances, `Type<new #3>` otherwise.
    pub(crate) fn describe(&self, id: InstanceId) -> String {
        let entity = self.entity_name(id).unwrap_or("?");
        match self.identity(id) {
            Some(identity) => format!("{entity}{identity}"),
            None => format!("{entity}<new {id}>"),
        }
    }
}

impl Planner<'_> {
    fn build(&mut self) -> Result<()> {
        let uow = self.uow;
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for (id, entry) in &uow.entries {
            match entry.state {
                EntityState::Managed if entry.scheduled_insert => inserts.push(*id),
                EntityState::Managed if uow.needs_update(*id, entry) => updates.push(*id),
                EntityState::Removed if entry.identity.is_some() => deletes.push(*id),
                _ => {}
            }
        }

        let (insert_order, deferred) = self.order_inserts(&inserts)?;
        let (delete_order, nulled) = self.order_deletes(&deletes)?;

        self.push_link_deletes(&deletes)?;
        for id in &insert_order {
            self.push_insert(*id, &deferred)?;
        }
        for edge in &deferred {
            self.push_fk_update(edge.owner, &edge.association, true)?;
            self.plan.result.extra_updates += 1;
        }
        for id in &updates {
            self.push_update(*id)?;
        }
        self.push_link_inserts()?;
        for edge in &nulled {
            self.push_fk_update(edge.owner, &edge.association, false)?;
            self.plan.result.extra_updates += 1;
        }
        for id in &delete_order {
            self.push_delete(*id)?;
        }

        self.plan.touched = insert_order.iter().chain(updates.iter()).copied().collect();
        self.plan.deletes = delete_order;
        Ok(())
    }

    fn order_inserts(&self, inserts: &[InstanceId]) -> Result<(Vec<InstanceId>, Vec<Edge>)> {
        let mut graph = DependencyGraph::new(inserts.iter().copied());
        for id in inserts {
            let entry = self.uow.entry(*id)?;
            for assoc in entry.metadata.foreign_keys() {
                if let Some(target) = entry.references.get(&assoc.name).and_then(RefSlot::target) {
                    graph.add(target, *id, *id, assoc);
                }
            }
        }
        graph.order().map_err(|cycle| self.cycle_error("insert", &cycle))
    }

    fn order_deletes(&self, deletes: &[InstanceId]) -> Result<(Vec<InstanceId>, Vec<Edge>)> {
        let mut graph = DependencyGraph::new(deletes.iter().copied());
        for id in deletes {
            let entry = self.uow.entry(*id)?;
            let snapshot = self.uow.tracker.get_snapshot(*id);
            for assoc in entry.metadata.foreign_keys() {
                let stored = match snapshot.and_then(|s| s.reference(&assoc.name)) {
                    Some(target) => target,
                    None => entry.references.get(&assoc.name).and_then(RefSlot::target),
                };
                if let Some(target) = stored {
                    if target != *id {
                        // The referencing row goes first.
                        graph.add(*id, target, *id, assoc);
                    }
                }
            }
        }
        graph.order().map_err(|cycle| self.cycle_error("delete", &cycle))
    }

    fn cycle_error(&self, phase: &str, cycle: &[InstanceId]) -> Error {
        let names: Vec<String> = cycle.iter().map(|id| self.uow.describe(*id)).collect();
        tracing::debug!(phase = phase, cycle = ?names, "Required foreign key cycle");
        Error::UnresolvedDependency(DependencyError {
            message: format!(
                "cannot order {phase}s: required foreign keys form a cycle {}",
                names.join(" -> ")
            ),
            cycle: names,
        })
    }

    /// Whether a reference to `target` can be written. Applies the
    /// new-entity policy to instances that will not exist in storage.
    fn writable(&self, owner: InstanceId, association: &str, target: InstanceId) -> Result<bool> {
        let known = match self.uow.entries.get(&target) {
            Some(entry) => entry.state != EntityState::New,
            None => self.uow.identity(target).is_some(),
        };
        if known {
            return Ok(true);
        }
        match self.policy {
            NewEntityPolicy::Reject => Err(Error::state(
                StateErrorKind::UnpersistedReference,
                format!(
                    "{} referenced by '{association}' of {} is new and the association does not cascade persist",
                    self.uow.describe(target),
                    self.uow.describe(owner)
                ),
            )),
            NewEntityPolicy::Ignore => {
                tracing::warn!(
                    owner = %self.uow.describe(owner),
                    association = %association,
                    target = %target,
                    "Skipping reference to unpersisted instance"
                );
                Ok(false)
            }
        }
    }

    /// Parameter for identity part `part` of `id`, which may be generated
    /// by an insert earlier in the batch.
    fn part_param(&self, id: InstanceId, part: &str) -> Result<Param> {
        self.part_param_at(id, part, 0)
    }

    fn part_param_at(&self, id: InstanceId, part: &str, depth: usize) -> Result<Param> {
        let entity = self.uow.entity_name(id).unwrap_or("?").to_string();
        if depth > MAX_IDENTITY_DEPTH {
            return Err(Error::invalid_mapping(&entity, "identifier associations form a cycle"));
        }
        if let Some(identity) = self.uow.identity(id) {
            return identity
                .get(part)
                .cloned()
                .map(Param::Value)
                .ok_or_else(|| Error::missing_identifier(&entity, part));
        }
        let entry = self.uow.entry(id)?;
        let meta = &entry.metadata;
        if meta.get_field(part).is_some_and(|f| f.id) {
            if meta.id_generation == IdGeneration::Identity && entry.scheduled_insert {
                return self
                    .insert_index
                    .get(&id)
                    .map(|command| Param::Generated { command: *command })
                    .ok_or_else(|| {
                        Error::Custom(format!(
                            "{} is referenced before its insert",
                            self.uow.describe(id)
                        ))
                    });
            }
            let value = self
                .reserved
                .get(&id)
                .cloned()
                .unwrap_or_else(|| entry.field(part));
            if value.is_null() {
                return Err(Error::missing_identifier(&entity, part));
            }
            return Ok(Param::Value(value));
        }
        for assoc in meta.associations.iter().filter(|a| a.id) {
            if let Some(jc) = assoc.join_columns.iter().find(|jc| jc.column == part) {
                let target = entry
                    .references
                    .get(&assoc.name)
                    .and_then(RefSlot::target)
                    .ok_or_else(|| Error::missing_identifier(&entity, &assoc.name))?;
                return self.part_param_at(target, &jc.referenced, depth + 1);
            }
        }
        Err(Error::missing_identifier(&entity, part))
    }

    /// `(column, param)` for every identity part of `id`.
    fn key_params(&self, id: InstanceId, meta: &EntityMetadata) -> Result<Columns> {
        meta.identity_parts()
            .into_iter()
            .map(|part| {
                Ok((
                    meta.identity_part_column(part).to_string(),
                    self.part_param(id, part)?,
                ))
            })
            .collect()
    }

    /// Foreign key columns of `assoc` pointing at `target` (NULL if none).
    fn fk_params(
        &self,
        owner: InstanceId,
        assoc: &AssociationMapping,
        target: Option<InstanceId>,
    ) -> Result<Columns> {
        let target = match target {
            Some(t) if self.writable(owner, &assoc.name, t)? => Some(t),
            _ => None,
        };
        assoc
            .join_columns
            .iter()
            .map(|jc| {
                let param = match target {
                    Some(t) => self.part_param(t, &jc.referenced)?,
                    None => Param::Value(Value::Null),
                };
                Ok((jc.column.clone(), param))
            })
            .collect()
    }

    fn push_insert(&mut self, id: InstanceId, deferred: &[Edge]) -> Result<()> {
        let uow = self.uow;
        let entry = uow.entry(id)?;
        let meta = Arc::clone(&entry.metadata);
        let mut columns: Columns = Vec::new();
        let mut generated = None;
        for field in &meta.fields {
            if field.id && meta.id_generation == IdGeneration::Identity {
                generated = Some(field.column.clone());
                continue;
            }
            let value = match self.reserved.get(&id) {
                Some(v) if field.id => v.clone(),
                _ => entry.field(&field.name),
            };
            columns.push((field.column.clone(), Param::Value(value)));
        }
        for assoc in meta.foreign_keys() {
            let is_deferred = deferred
                .iter()
                .any(|e| e.owner == id && e.association == assoc.name);
            let target = if is_deferred {
                None
            } else {
                entry.references.get(&assoc.name).and_then(RefSlot::target)
            };
            for (column, param) in self.fk_params(id, assoc, target)? {
                if !columns.iter().any(|(c, _)| *c == column) {
                    columns.push((column, param));
                }
            }
        }
        let index = self.plan.commands.len();
        self.insert_index.insert(id, index);
        self.plan.inserts.push((id, index));
        self.plan.commands.push(WriteCommand::Insert {
            entity: meta.name.clone(),
            table: meta.table.clone(),
            columns,
            generated,
        });
        self.plan.result.inserted += 1;
        Ok(())
    }

    /// UPDATE of one foreign key: to its current target (`fill`) or to NULL.
    fn push_fk_update(&mut self, owner: InstanceId, association: &str, fill: bool) -> Result<()> {
        let uow = self.uow;
        let entry = uow.entry(owner)?;
        let meta = Arc::clone(&entry.metadata);
        let assoc = meta.require_association(association)?;
        let target = if fill {
            entry.references.get(association).and_then(RefSlot::target)
        } else {
            None
        };
        let set = self.fk_params(owner, assoc, target)?;
        let key = self.key_params(owner, &meta)?;
        self.plan.commands.push(WriteCommand::Update {
            entity: meta.name.clone(),
            table: meta.table.clone(),
            key,
            set,
        });
        Ok(())
    }

    fn push_update(&mut self, id: InstanceId) -> Result<()> {
        let uow = self.uow;
        let entry = uow.entry(id)?;
        let meta = Arc::clone(&entry.metadata);
        let changes = uow.tracker.compute_change_set(id, entry);
        let mut set: Columns = Vec::new();
        for (name, (_, new)) in &changes.fields {
            let Some(field) = meta.get_field(name) else {
                continue;
            };
            if field.id {
                continue;
            }
            set.push((field.column.clone(), Param::Value(new.clone())));
        }
        for (name, (_, new)) in &changes.associations {
            let Some(assoc) = meta.get_association(name) else {
                continue;
            };
            if !assoc.has_foreign_key() || assoc.id {
                continue;
            }
            for (column, param) in self.fk_params(id, assoc, *new)? {
                if !set.iter().any(|(c, _)| *c == column) {
                    set.push((column, param));
                }
            }
        }
        if set.is_empty() {
            return Ok(());
        }
        let key = self.key_params(id, &meta)?;
        self.plan.commands.push(WriteCommand::Update {
            entity: meta.name.clone(),
            table: meta.table.clone(),
            key,
            set,
        });
        self.plan.result.updated += 1;
        Ok(())
    }

    fn push_delete(&mut self, id: InstanceId) -> Result<()> {
        let uow = self.uow;
        let entry = uow.entry(id)?;
        let meta = Arc::clone(&entry.metadata);
        let key = self.key_params(id, &meta)?;
        self.plan.commands.push(WriteCommand::Delete {
            entity: meta.name.clone(),
            table: meta.table.clone(),
            key,
        });
        self.plan.result.deleted += 1;
        Ok(())
    }

    fn push_link_command(&mut self, command: WriteCommand) {
        if self.plan.commands.contains(&command) {
            return;
        }
        match command {
            WriteCommand::LinkInsert { .. } => self.plan.result.links_inserted += 1,
            WriteCommand::LinkDelete { .. } => self.plan.result.links_deleted += 1,
            _ => {}
        }
        self.plan.commands.push(command);
    }

    fn link_side(&self, id: InstanceId, columns: &[JoinColumn]) -> Result<Columns> {
        columns
            .iter()
            .map(|jc| Ok((jc.column.clone(), self.part_param(id, &jc.referenced)?)))
            .collect()
    }

    fn push_link_deletes(&mut self, deletes: &[InstanceId]) -> Result<()> {
        let uow = self.uow;
        // Elements dropped from owning many-to-many collections.
        for (owner, entry) in &uow.entries {
            if entry.state != EntityState::Managed || entry.scheduled_insert {
                continue;
            }
            for (assoc, table) in owning_link_tables(&entry.metadata) {
                let Some(collection) = entry.collections.get(&assoc.name) else {
                    continue;
                };
                if !collection.is_initialized() {
                    continue;
                }
                let delta = collection.compute_delta_with(|e| uow.element_key(e));
                for element in delta.removed {
                    let mut columns = self.link_side(*owner, &table.local)?;
                    columns.extend(self.link_side(element, &table.remote)?);
                    self.push_link_command(WriteCommand::LinkDelete {
                        table: table.name.clone(),
                        columns,
                    });
                }
            }
        }
        // Every link row of a removed instance, from both sides.
        let names = uow.registry().entity_names();
        for id in deletes {
            let entry = uow.entry(*id)?;
            for (_, table) in owning_link_tables(&entry.metadata) {
                let columns = self.link_side(*id, &table.local)?;
                self.push_link_command(WriteCommand::LinkDelete {
                    table: table.name.clone(),
                    columns,
                });
            }
            for name in &names {
                let other = uow.registry().get(name)?;
                for (assoc, table) in owning_link_tables(&other) {
                    if assoc.target != entry.metadata.name {
                        continue;
                    }
                    let columns = self.link_side(*id, &table.remote)?;
                    self.push_link_command(WriteCommand::LinkDelete {
                        table: table.name.clone(),
                        columns,
                    });
                }
            }
        }
        Ok(())
    }

    fn push_link_inserts(&mut self) -> Result<()> {
        let uow = self.uow;
        for (owner, entry) in &uow.entries {
            if entry.state != EntityState::Managed {
                continue;
            }
            for (assoc, table) in owning_link_tables(&entry.metadata) {
                let Some(collection) = entry.collections.get(&assoc.name) else {
                    continue;
                };
                if !collection.is_initialized() {
                    continue;
                }
                let delta = collection.compute_delta_with(|e| uow.element_key(e));
                for element in delta.added {
                    if uow.state(element) == EntityState::Removed {
                        tracing::warn!(
                            owner = %uow.describe(*owner),
                            element = %uow.describe(element),
                            "Skipping link to removed instance"
                        );
                        continue;
                    }
                    if !self.writable(*owner, &assoc.name, element)? {
                        continue;
                    }
                    let mut columns = self.link_side(*owner, &table.local)?;
                    columns.extend(self.link_side(element, &table.remote)?);
                    self.push_link_command(WriteCommand::LinkInsert {
                        table: table.name.clone(),
                        columns,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Owning many-to-many associations of `meta` with their link tables.
fn owning_link_tables(
    meta: &EntityMetadata,
) -> impl Iterator<Item = (&AssociationMapping, &JoinTable)> {
    meta.associations
        .iter()
        .filter(|a| a.kind == AssociationKind::ManyToMany && a.is_owning())
        .filter_map(|a| a.join_table.as_ref().map(|t| (a, t)))
}
