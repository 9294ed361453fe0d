//! Root-level pagination over join-multiplied results.
//!
//! A join over a to-many association returns one row per child, so an
//! offset and limit applied to rows cut pages in the middle of a root. The
//! paginator instead pages over distinct roots:
//!
//! 1. select the distinct root identities of the requested window, in the
//!    order the roots first appear in the ordered joined rows;
//! 2. if any were found, re-run the plan without a window, restricted to
//!    exactly those identities, hydrate, and return the roots in phase 1
//!    order.
//!
//! Counting counts distinct roots, never rows. Plans without a to-many join
//! produce one row per root and run in a single phase.

use crate::entity::InstanceId;
use crate::hydrator::row_identity;
use crate::unit_of_work::UnitOfWork;
use asupersync::{Cx, Outcome};
use std::collections::HashSet;
use unitwork_core::{EntityIdentity, Error, MetadataRegistry, Result, Row};
use unitwork_query::{COUNT_COLUMN, Condition, FetchPlan, Projection, QueryExecutor};

/// A pageable query.
#[derive(Debug, Clone)]
pub struct Paginator {
    plan: FetchPlan,
    fetch_join_collection: bool,
}

impl Paginator {
    /// Paginate `plan`; its `offset` and `limit` select the page.
    pub fn new(plan: FetchPlan) -> Self {
        Self {
            plan,
            fetch_join_collection: true,
        }
    }

    /// With `false`, trust that the plan has no to-many join and always run
    /// a single phase.
    #[must_use]
    pub fn fetch_join_collection(mut self, value: bool) -> Self {
        self.fetch_join_collection = value;
        self
    }

    pub fn plan(&self) -> &FetchPlan {
        &self.plan
    }

    /// Move the window to `offset`/`limit`.
    #[must_use]
    pub fn window(mut self, offset: usize, limit: usize) -> Self {
        self.plan.offset = Some(offset);
        self.plan.limit = Some(limit);
        self
    }

    /// True if the page needs the identity pre-selection phase.
    pub fn is_two_phase(&self, registry: &MetadataRegistry) -> Result<bool> {
        if !self.fetch_join_collection {
            return Ok(false);
        }
        self.plan.multiplies_roots(registry)
    }

    /// Plan counting distinct roots.
    pub fn count_plan(&self) -> FetchPlan {
        let mut plan = self.plan.unpaged().projection(Projection::CountRoots);
        plan.order_by.clear();
        plan
    }

    /// Phase 1: distinct root identities of the window.
    pub fn identity_plan(&self) -> FetchPlan {
        self.plan.clone().projection(Projection::RootIdentities)
    }

    /// Phase 2: the full plan restricted to `identities`, without a window.
    pub fn page_plan(&self, identities: Vec<EntityIdentity>) -> FetchPlan {
        let alias = self.plan.alias.clone();
        self.plan
            .unpaged()
            .projection(Projection::Entities)
            .filter(Condition::IdentityIn { alias, identities })
    }

    /// Number of distinct roots matching the plan, ignoring the window.
    #[tracing::instrument(level = "debug", skip_all, fields(root = %self.plan.root))]
    pub async fn count<Q: QueryExecutor>(&self, cx: &Cx, executor: &Q) -> Outcome<u64, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let rows = match executor.fetch(cx, &self.count_plan()).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let count = rows
            .first()
            .and_then(|row| row.get_by_name(COUNT_COLUMN))
            .and_then(unitwork_core::Value::as_i64)
            .unwrap_or(0);
        tracing::debug!(count = count, "Counted distinct roots");
        Outcome::Ok(u64::try_from(count).unwrap_or(0))
    }

    /// The roots of the current window, hydrated into `uow`.
    #[tracing::instrument(level = "debug", skip_all, fields(root = %self.plan.root))]
    pub async fn page<Q: QueryExecutor>(
        &self,
        cx: &Cx,
        executor: &Q,
        uow: &mut UnitOfWork,
        refresh: bool,
    ) -> Outcome<Vec<InstanceId>, Error> {
        let registry = std::sync::Arc::clone(uow.registry());
        let two_phase = match self.is_two_phase(&registry) {
            Ok(two_phase) => two_phase,
            Err(e) => return Outcome::Err(e),
        };
        let resolved = match self.plan.resolve(&registry) {
            Ok(resolved) => resolved,
            Err(e) => return Outcome::Err(e),
        };

        if !two_phase {
            tracing::debug!("Single-phase page");
            let rows = match fetch(cx, executor, &self.plan).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            return match uow.hydrate(&resolved, &rows, refresh) {
                Ok(roots) => Outcome::Ok(roots),
                Err(e) => Outcome::Err(e),
            };
        }

        let root = match resolved.root() {
            Ok(root) => std::sync::Arc::clone(root),
            Err(e) => return Outcome::Err(e),
        };
        let id_rows = match fetch(cx, executor, &self.identity_plan()).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let identities: Vec<EntityIdentity> = id_rows
            .iter()
            .filter_map(|row| row_identity(&self.plan.alias, &root, row))
            .collect();
        tracing::debug!(identities = identities.len(), "Phase 1 selected root identities");
        if identities.is_empty() {
            return Outcome::Ok(Vec::new());
        }

        let rows = match fetch(cx, executor, &self.page_plan(identities.clone())).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let hydrated: HashSet<InstanceId> = match uow.hydrate(&resolved, &rows, refresh) {
            Ok(roots) => roots.into_iter().collect(),
            Err(e) => return Outcome::Err(e),
        };
        let page: Vec<InstanceId> = identities
            .iter()
            .filter_map(|identity| uow.lookup(&root.name, identity))
            .filter(|id| hydrated.contains(id))
            .collect();
        if page.len() != identities.len() {
            tracing::warn!(
                selected = identities.len(),
                hydrated = page.len(),
                "Roots selected in phase 1 were not returned in phase 2"
            );
        }
        Outcome::Ok(page)
    }
}

async fn fetch<Q: QueryExecutor>(cx: &Cx, executor: &Q, plan: &FetchPlan) -> Outcome<Vec<Row>, Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    tracing::trace!(plan = %plan, "Fetching");
    executor.fetch(cx, plan).await
}
