//! Identity Map pattern for tracking unique instances per identity.
//!
//! The Identity Map ensures that each stored row corresponds to exactly one
//! in-memory instance within a unit of work:
//!
//! - **Uniqueness**: the same (entity type, identity) always yields the same [`InstanceId`]
//! - **Cache**: avoids redundant loads for rows already in memory
//! - **Consistency**: changes made through one handle are seen through every path that reaches the row
//!
//! The map only records which instance owns an identity. It never triggers
//! loads and never owns instance data; that lives in the unit of work arena.

use crate::entity::InstanceId;
use std::collections::HashMap;
use unitwork_core::{EntityIdentity, Error, Result};

/// Key of one identity map slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub entity: String,
    pub identity: EntityIdentity,
}

impl ObjectKey {
    pub fn new(entity: impl Into<String>, identity: EntityIdentity) -> Self {
        Self {
            entity: entity.into(),
            identity,
        }
    }
}

/// Maps (entity type, identity) to the single instance representing that row.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, InstanceId>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `instance` under `identity`.
    ///
    /// Registering the same instance again is a no-op. Fails with
    /// `IdentityConflict` if a different instance already holds the slot.
    pub fn register(
        &mut self,
        entity: &str,
        identity: &EntityIdentity,
        instance: InstanceId,
    ) -> Result<()> {
        let key = ObjectKey::new(entity, identity.clone());
        match self.entries.get(&key) {
            Some(existing) if *existing == instance => Ok(()),
            Some(existing) => {
                tracing::debug!(
                    entity = %entity,
                    identity = %identity,
                    existing = %existing,
                    rejected = %instance,
                    "Identity conflict"
                );
                Err(Error::identity_conflict(entity, identity.clone()))
            }
            None => {
                self.entries.insert(key, instance);
                Ok(())
            }
        }
    }

    /// The instance registered under `identity`, if any.
    pub fn lookup(&self, entity: &str, identity: &EntityIdentity) -> Option<InstanceId> {
        if self.entries.is_empty() {
            return None;
        }
        self.entries
            .get(&ObjectKey::new(entity, identity.clone()))
            .copied()
    }

    pub fn contains(&self, entity: &str, identity: &EntityIdentity) -> bool {
        self.lookup(entity, identity).is_some()
    }

    /// Drop the slot for `identity`, returning the instance that held it.
    pub fn forget(&mut self, entity: &str, identity: &EntityIdentity) -> Option<InstanceId> {
        self.entries
            .remove(&ObjectKey::new(entity, identity.clone()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, InstanceId)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }
}
