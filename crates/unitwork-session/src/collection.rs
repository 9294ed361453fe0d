//! Persistent collections.
//!
//! A [`TrackedCollection`] wraps one collection-valued association of one
//! owner instance. It keeps the live element sequence next to the snapshot
//! last synchronized with storage, so a flush only writes the difference.
//!
//! Deltas are computed by element identity, never by position or index key:
//! clearing a collection and re-adding the same rows is a no-op, while
//! re-adding an equal index key for a different row is a fresh insert.

use crate::entity::InstanceId;
use serde::Serialize;
use std::collections::HashSet;
use unitwork_core::{EntityIdentity, Value};

/// What makes two collection elements "the same row".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementKey {
    /// The element's persisted identity.
    Identity(EntityIdentity),
    /// The element has no identity yet; only the instance itself matches.
    Instance(InstanceId),
}

/// Elements added and removed since the last snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionDelta {
    pub added: Vec<InstanceId>,
    pub removed: Vec<InstanceId>,
}

impl CollectionDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    /// Index key for `index_by` collections.
    key: Option<Value>,
    element: InstanceId,
}

/// A collection-valued association with snapshot-based change tracking.
#[derive(Debug, Clone)]
pub struct TrackedCollection {
    owner: InstanceId,
    association: String,
    live: Vec<Slot>,
    snapshot: Vec<(InstanceId, ElementKey)>,
    dirty: bool,
    initialized: bool,
    keyed: bool,
}

impl TrackedCollection {
    /// An empty, initialized collection (owner created in memory).
    pub(crate) fn new_loaded(owner: InstanceId, association: &str, keyed: bool) -> Self {
        Self {
            owner,
            association: association.to_string(),
            live: Vec::new(),
            snapshot: Vec::new(),
            dirty: false,
            initialized: true,
            keyed,
        }
    }

    /// An uninitialized collection, loaded on first access.
    pub(crate) fn new_lazy(owner: InstanceId, association: &str, keyed: bool) -> Self {
        Self {
            initialized: false,
            ..Self::new_loaded(owner, association, keyed)
        }
    }

    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    pub fn association(&self) -> &str {
        &self.association
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_keyed(&self) -> bool {
        self.keyed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Live elements in sequence order.
    pub fn elements(&self) -> Vec<InstanceId> {
        self.live.iter().map(|s| s.element).collect()
    }

    /// Live `(index key, element)` pairs of a keyed collection.
    pub fn keyed_elements(&self) -> Vec<(Option<Value>, InstanceId)> {
        self.live.iter().map(|s| (s.key.clone(), s.element)).collect()
    }

    pub fn contains(&self, element: InstanceId) -> bool {
        self.live.iter().any(|s| s.element == element)
    }

    /// Append `element`. Returns `false` if it is already present.
    pub fn add(&mut self, element: InstanceId) -> bool {
        self.add_keyed(element, None)
    }

    /// Append `element` under an index key. A keyed element already stored
    /// under an equal key is replaced.
    pub(crate) fn add_keyed(&mut self, element: InstanceId, key: Option<Value>) -> bool {
        if self.contains(element) {
            return false;
        }
        if let Some(k) = &key {
            if self.keyed {
                self.remove_key(k);
            }
        }
        self.live.push(Slot { key, element });
        self.dirty = true;
        true
    }

    /// Remove `element`. Returns `false` if it was not present.
    pub fn remove(&mut self, element: InstanceId) -> bool {
        let before = self.live.len();
        self.live.retain(|s| s.element != element);
        let removed = self.live.len() != before;
        self.dirty |= removed;
        removed
    }

    pub fn clear(&mut self) {
        if !self.live.is_empty() {
            self.dirty = true;
        }
        self.live.clear();
    }

    /// Element stored under index key `key`.
    pub fn get_key(&self, key: &Value) -> Option<InstanceId> {
        let key = key.normalized();
        self.live
            .iter()
            .find(|s| s.key.as_ref().is_some_and(|k| k.normalized() == key))
            .map(|s| s.element)
    }

    /// Remove the element stored under index key `key`.
    pub fn remove_key(&mut self, key: &Value) -> Option<InstanceId> {
        let element = self.get_key(key)?;
        self.remove(element);
        Some(element)
    }

    /// Delta by instance: which live instances are not in the snapshot and
    /// the reverse. Pure; repeated calls agree until the next mutation.
    pub fn compute_delta(&self) -> CollectionDelta {
        let snap: HashSet<InstanceId> = self.snapshot.iter().map(|(e, _)| *e).collect();
        let live: HashSet<InstanceId> = self.live.iter().map(|s| s.element).collect();
        CollectionDelta {
            added: dedup(self.live.iter().map(|s| s.element).filter(|e| !snap.contains(e))),
            removed: dedup(self.snapshot.iter().map(|(e, _)| *e).filter(|e| !live.contains(e))),
        }
    }

    /// Delta by row identity. `key_of` maps a live element to its key; a
    /// removed element and an added element with equal keys cancel out.
    pub fn compute_delta_with(&self, key_of: impl Fn(InstanceId) -> ElementKey) -> CollectionDelta {
        let snap: HashSet<&ElementKey> = self.snapshot.iter().map(|(_, k)| k).collect();
        let live_keys: Vec<(InstanceId, ElementKey)> =
            self.live.iter().map(|s| (s.element, key_of(s.element))).collect();
        let live: HashSet<&ElementKey> = live_keys.iter().map(|(_, k)| k).collect();
        let mut seen = HashSet::new();
        let added = live_keys
            .iter()
            .filter(|(_, k)| !snap.contains(k) && seen.insert(k.clone()))
            .map(|(e, _)| *e)
            .collect();
        let removed = dedup(
            self.snapshot
                .iter()
                .filter(|(_, k)| !live.contains(k))
                .map(|(e, _)| *e),
        );
        CollectionDelta { added, removed }
    }

    /// Elements of the snapshot.
    pub fn snapshot_elements(&self) -> Vec<InstanceId> {
        self.snapshot.iter().map(|(e, _)| *e).collect()
    }

    /// Make the live sequence the new baseline, keyed by instance.
    pub fn accept_snapshot(&mut self) {
        self.accept_snapshot_with(ElementKey::Instance);
    }

    /// Make the live sequence the new baseline.
    pub(crate) fn accept_snapshot_with(&mut self, key_of: impl Fn(InstanceId) -> ElementKey) {
        self.snapshot = self
            .live
            .iter()
            .map(|s| (s.element, key_of(s.element)))
            .collect();
        self.dirty = false;
    }

    /// Recompute index keys from the elements' current field values.
    pub(crate) fn rekey(&mut self, key_of: impl Fn(InstanceId) -> Option<Value>) {
        if !self.keyed {
            return;
        }
        for slot in &mut self.live {
            slot.key = key_of(slot.element);
        }
    }

    /// Start filling an uninitialized collection from storage.
    pub(crate) fn begin_load(&mut self) {
        self.live.clear();
        self.snapshot.clear();
        self.initialized = true;
        self.dirty = false;
    }

    /// Add an element read from storage to both the live sequence and the
    /// snapshot. Already present elements are ignored.
    pub(crate) fn hydrate_add(&mut self, element: InstanceId, key: ElementKey, index: Option<Value>) {
        if self.contains(element) {
            return;
        }
        self.live.push(Slot {
            key: index,
            element,
        });
        self.snapshot.push((element, key));
    }

    /// Drop references to elements that left the unit of work.
    pub(crate) fn forget_elements(&mut self, gone: &HashSet<InstanceId>) {
        self.live.retain(|s| !gone.contains(&s.element));
        self.snapshot.retain(|(e, _)| !gone.contains(e));
    }

    /// Back to the uninitialized state (refresh of the owner).
    pub(crate) fn reset_lazy(&mut self) {
        self.live.clear();
        self.snapshot.clear();
        self.dirty = false;
        self.initialized = false;
    }
}

fn dedup(iter: impl Iterator<Item = InstanceId>) -> Vec<InstanceId> {
    let mut seen = HashSet::new();
    iter.filter(|e| seen.insert(*e)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(elements: &[u64]) -> TrackedCollection {
        let mut c = TrackedCollection::new_loaded(InstanceId(100), "privileges", true);
        c.begin_load();
        for e in elements {
            c.hydrate_add(
                InstanceId(*e),
                ElementKey::Identity(EntityIdentity::single("privilegeid", *e as i64)),
                Some(Value::BigInt(*e as i64)),
            );
        }
        c
    }

    fn by_identity(e: InstanceId) -> ElementKey {
        ElementKey::Identity(EntityIdentity::single("privilegeid", e.0 as i64))
    }

    #[test]
    fn add_and_remove_produce_delta() {
        let mut c = loaded(&[1, 2, 3]);
        assert!(c.compute_delta().is_empty());
        assert!(c.remove(InstanceId(2)));
        assert!(c.add(InstanceId(4)));
        assert!(!c.add(InstanceId(4)));
        let delta = c.compute_delta();
        assert_eq!(delta.added, vec![InstanceId(4)]);
        assert_eq!(delta.removed, vec![InstanceId(2)]);
        assert_eq!(c.compute_delta(), delta);
        assert!(c.is_dirty());
    }

    #[test]
    fn accept_snapshot_empties_delta() {
        let mut c = loaded(&[1]);
        c.add(InstanceId(2));
        c.accept_snapshot_with(by_identity);
        assert!(c.compute_delta().is_empty());
        assert!(c.compute_delta_with(by_identity).is_empty());
        assert!(!c.is_dirty());
    }

    #[test]
    fn clear_then_readd_is_a_noop() {
        let mut c = loaded(&[1, 2, 3]);
        c.clear();
        c.add(InstanceId(1));
        c.add(InstanceId(2));
        c.add(InstanceId(3));
        assert!(c.compute_delta().is_empty());
        assert!(c.compute_delta_with(by_identity).is_empty());
    }

    #[test]
    fn readd_of_other_instance_with_same_identity_cancels() {
        let mut c = loaded(&[1, 2]);
        c.clear();
        c.add(InstanceId(9));
        let key_of = |e: InstanceId| {
            if e == InstanceId(9) {
                by_identity(InstanceId(1))
            } else {
                by_identity(e)
            }
        };
        let delta = c.compute_delta_with(key_of);
        assert!(delta.added.is_empty());
        assert_eq!(delta.removed, vec![InstanceId(2)]);
    }

    #[test]
    fn keyed_access() {
        let mut c = loaded(&[1, 2]);
        assert_eq!(c.get_key(&Value::Int(2)), Some(InstanceId(2)));
        assert_eq!(c.remove_key(&Value::BigInt(1)), Some(InstanceId(1)));
        assert_eq!(c.get_key(&Value::BigInt(1)), None);
        c.add_keyed(InstanceId(5), Some(Value::BigInt(2)));
        assert_eq!(c.get_key(&Value::BigInt(2)), Some(InstanceId(5)));
        assert_eq!(c.len(), 1);

        c.rekey(|e| Some(Value::BigInt(e.0 as i64 * 10)));
        assert_eq!(c.get_key(&Value::BigInt(50)), Some(InstanceId(5)));
    }

    #[test]
    fn lazy_collection_starts_uninitialized() {
        let mut c = TrackedCollection::new_lazy(InstanceId(1), "rides", false);
        assert!(!c.is_initialized());
        c.begin_load();
        c.hydrate_add(InstanceId(2), ElementKey::Instance(InstanceId(2)), None);
        c.hydrate_add(InstanceId(2), ElementKey::Instance(InstanceId(2)), None);
        assert!(c.is_initialized());
        assert_eq!(c.elements(), vec![InstanceId(2)]);
        assert!(c.compute_delta().is_empty());

        c.reset_lazy();
        assert!(!c.is_initialized());
        assert!(c.is_empty());
    }

    #[test]
    fn forgotten_elements_leave_both_sides() {
        let mut c = loaded(&[1, 2]);
        let gone: HashSet<InstanceId> = [InstanceId(1)].into_iter().collect();
        c.forget_elements(&gone);
        assert_eq!(c.elements(), vec![InstanceId(2)]);
        assert_eq!(c.snapshot_elements(), vec![InstanceId(2)]);
    }
}
