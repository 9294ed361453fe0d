//! Lazy-load counting for spotting N+1 access patterns.
//!
//! The session reports each round-trip it makes on behalf of one instance:
//! resolving an uninitialized proxy, filling an owner's unloaded to-one
//! reference and initializing a lazy collection. Loads are grouped by
//! entity type and what was loaded. Once a group has been loaded for
//! `threshold` distinct instances, one warning goes to target
//! `unitwork::n1` naming the first of them. A join-fetch in the query
//! that produced those instances usually removes the group entirely.
//!
//! ```ignore
//! let config = SessionConfig::default().n1_threshold(3);
//! let mut session = Session::with_config(registry, store.clone(), store, config);
//!
//! let teams = session.query(&cx, &FetchPlan::new("Team", "t")).await?;
//! for team in &teams {
//!     // one fetch per team; the third one warns
//!     session.load_collection(&cx, *team, "heroes").await?;
//! }
//! ```

use crate::entity::InstanceId;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Instances listed in a warning.
const REPORTED_INSTANCES: usize = 5;

/// What one lazy load fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LazyLoad {
    Proxy,
    /// Named reference or collection of the owning instance.
    Association(String),
}

impl fmt::Display for LazyLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LazyLoad::Proxy => f.write_str("<proxy>"),
            LazyLoad::Association(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct N1Stats {
    /// Lazy loads recorded since the last reset.
    pub loads: usize,
    /// Distinct (entity, load) groups.
    pub groups: usize,
    /// Groups that reached the threshold.
    pub flagged: usize,
}

#[derive(Debug, Default)]
struct LoadGroup {
    loads: usize,
    instances: BTreeSet<InstanceId>,
    warned: bool,
}

/// Per-session lazy-load counter.
#[derive(Debug)]
pub struct N1Detector {
    threshold: usize,
    groups: HashMap<(String, LazyLoad), LoadGroup>,
}

impl N1Detector {
    /// A threshold of zero counts as one.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            groups: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Note that `load` was fetched for `instance`, an instance of `entity`.
    pub fn record(&mut self, entity: &str, load: LazyLoad, instance: InstanceId) {
        let group = self
            .groups
            .entry((entity.to_string(), load.clone()))
            .or_default();
        group.loads += 1;
        group.instances.insert(instance);
        tracing::trace!(
            target: "unitwork::n1",
            entity = entity,
            association = %load,
            instance = %instance,
            loads = group.loads,
            "Lazy load"
        );
        if group.warned || group.instances.len() < self.threshold {
            return;
        }
        group.warned = true;
        let first: Vec<String> = group
            .instances
            .iter()
            .take(REPORTED_INSTANCES)
            .map(ToString::to_string)
            .collect();
        tracing::warn!(
            target: "unitwork::n1",
            entity = entity,
            association = %load,
            instances = group.instances.len(),
            threshold = self.threshold,
            first = %first.join(", "),
            "Same association lazily loaded for many instances; join-fetch it instead"
        );
    }

    /// Loads recorded for one group, counting repeats on the same instance.
    pub fn loads(&self, entity: &str, load: &LazyLoad) -> usize {
        self.group(entity, load).map_or(0, |g| g.loads)
    }

    /// Distinct instances a group was loaded for, in handle order.
    pub fn instances(&self, entity: &str, load: &LazyLoad) -> Vec<InstanceId> {
        self.group(entity, load)
            .map(|g| g.instances.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_flagged(&self, entity: &str, load: &LazyLoad) -> bool {
        self.group(entity, load).is_some_and(|g| g.warned)
    }

    pub fn stats(&self) -> N1Stats {
        N1Stats {
            loads: self.groups.values().map(|g| g.loads).sum(),
            groups: self.groups.len(),
            flagged: self.groups.values().filter(|g| g.warned).count(),
        }
    }

    /// Forget every group; warnings may fire again.
    pub fn reset(&mut self) {
        self.groups.clear();
    }

    fn group(&self, entity: &str, load: &LazyLoad) -> Option<&LoadGroup> {
        self.groups.get(&(entity.to_string(), load.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team() -> LazyLoad {
        LazyLoad::Association("team".into())
    }

    #[test]
    fn groups_by_entity_and_load() {
        let mut detector = N1Detector::new(10);
        detector.record("Hero", team(), InstanceId(1));
        detector.record("Hero", team(), InstanceId(2));
        detector.record("Hero", LazyLoad::Proxy, InstanceId(1));
        detector.record("Team", LazyLoad::Association("heroes".into()), InstanceId(7));

        assert_eq!(detector.loads("Hero", &team()), 2);
        assert_eq!(detector.loads("Hero", &LazyLoad::Proxy), 1);
        assert_eq!(detector.loads("Team", &team()), 0);
        assert_eq!(
            detector.stats(),
            N1Stats {
                loads: 4,
                groups: 3,
                flagged: 0
            }
        );
    }

    #[test]
    fn flags_on_distinct_instances_only() {
        let mut detector = N1Detector::new(2);
        detector.record("Hero", team(), InstanceId(4));
        detector.record("Hero", team(), InstanceId(4));
        assert!(!detector.is_flagged("Hero", &team()));

        detector.record("Hero", team(), InstanceId(3));
        assert!(detector.is_flagged("Hero", &team()));
        assert_eq!(detector.instances("Hero", &team()), vec![InstanceId(3), InstanceId(4)]);
        detector.record("Hero", team(), InstanceId(5));
        assert_eq!(detector.stats().flagged, 1);
    }

    #[test]
    fn reset_forgets_groups() {
        let mut detector = N1Detector::new(1);
        detector.record("Hero", team(), InstanceId(1));
        assert!(detector.is_flagged("Hero", &team()));
        detector.reset();
        assert_eq!(detector.stats(), N1Stats::default());
        assert!(detector.instances("Hero", &team()).is_empty());
    }

    #[test]
    fn zero_threshold_behaves_as_one() {
        assert_eq!(N1Detector::new(0).threshold(), 1);
        assert_eq!(LazyLoad::Proxy.to_string(), "<proxy>");
        assert_eq!(team().to_string(), "team");
    }
}
