//! Change tracking and dirty detection.
//!
//! This module provides snapshot-based change tracking to detect when
//! instances have been modified since they were loaded or last flushed.

use crate::entity::{EntityEntry, InstanceId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use unitwork_core::Value;

/// Last-known-persisted state of one instance.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    fields: BTreeMap<String, Value>,
    /// Loaded to-one targets. Associations that were unloaded when the
    /// snapshot was taken are absent.
    references: BTreeMap<String, Option<InstanceId>>,
    taken_at: Instant,
}

impl EntitySnapshot {
    pub fn new(
        fields: BTreeMap<String, Value>,
        references: BTreeMap<String, Option<InstanceId>>,
    ) -> Self {
        Self {
            fields,
            references,
            taken_at: Instant::now(),
        }
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Value {
        self.fields.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn reference(&self, association: &str) -> Option<Option<InstanceId>> {
        self.references.get(association).copied()
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Changed fields and to-one associations of one instance, as (old, new).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub fields: BTreeMap<String, (Value, Value)>,
    pub associations: BTreeMap<String, (Option<InstanceId>, Option<InstanceId>)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.associations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len() + self.associations.len()
    }
}

/// Tracks changes to instances in the unit of work.
///
/// Uses snapshot comparison to detect when instances have been modified.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<InstanceId, EntitySnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current state of `entry` as its persisted baseline.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub fn snapshot(&mut self, id: InstanceId, entry: &EntityEntry) {
        tracing::trace!(
            entity = %entry.entity(),
            fields = entry.fields.len(),
            "Taking instance snapshot"
        );
        self.snapshots.insert(
            id,
            EntitySnapshot::new(entry.fields.clone(), entry.reference_targets()),
        );
    }

    /// Replace a single field's baseline (storage wrote exactly this value).
    pub fn set_baseline_field(&mut self, id: InstanceId, name: &str, value: Value) {
        if let Some(snapshot) = self.snapshots.get_mut(&id) {
            snapshot.fields.insert(name.to_string(), value);
        }
    }

    /// Record the baseline of a to-one association that was just loaded.
    pub fn set_baseline_reference(
        &mut self,
        id: InstanceId,
        association: &str,
        target: Option<InstanceId>,
    ) {
        if let Some(snapshot) = self.snapshots.get_mut(&id) {
            snapshot.references.insert(association.to_string(), target);
        }
    }

    /// Check if an instance has changed since its snapshot.
    ///
    /// An instance without a snapshot is treated as dirty.
    pub fn is_dirty(&self, id: InstanceId, entry: &EntityEntry) -> bool {
        match self.snapshots.get(&id) {
            None => true,
            Some(_) => !self.compute_change_set(id, entry).is_empty(),
        }
    }

    /// Field-by-field and association-by-association comparison against the
    /// snapshot. Without a snapshot every set field counts as changed.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub fn compute_change_set(&self, id: InstanceId, entry: &EntityEntry) -> ChangeSet {
        let mut changes = ChangeSet::default();
        let snapshot = self.snapshots.get(&id);
        for field in &entry.metadata.fields {
            let current = entry.field(&field.name);
            let original = snapshot.map_or(Value::Null, |s| s.field(&field.name));
            if current.normalized() != original.normalized() {
                changes
                    .fields
                    .insert(field.name.clone(), (original, current));
            }
        }
        for (name, target) in entry.reference_targets() {
            let original = match snapshot {
                Some(s) => match s.reference(&name) {
                    Some(t) => t,
                    // Was unloaded at snapshot time; only an assignment makes it dirty.
                    None => {
                        if target.is_none() {
                            continue;
                        }
                        None
                    }
                },
                None => None,
            };
            if original != target {
                changes.associations.insert(name, (original, target));
            }
        }
        if !changes.is_empty() {
            tracing::trace!(
                entity = %entry.entity(),
                changed = changes.len(),
                fields = ?changes.fields.keys().collect::<Vec<_>>(),
                "Detected changes"
            );
        }
        changes
    }

    pub fn has_snapshot(&self, id: InstanceId) -> bool {
        self.snapshots.contains_key(&id)
    }

    pub fn get_snapshot(&self, id: InstanceId) -> Option<&EntitySnapshot> {
        self.snapshots.get(&id)
    }

    /// Clear the snapshot of one instance.
    pub fn clear(&mut self, id: InstanceId) {
        self.snapshots.remove(&id);
    }

    /// Clear all snapshots.
    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
