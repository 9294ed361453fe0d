//! Session and Unit of Work for unitwork.
//!
//! `unitwork-session` is the **unit-of-work layer**. It tracks every
//! in-memory entity of one logical session, resolves lazy references and
//! collections, and reconciles pending changes with storage in one ordered
//! write batch.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: at most one in-memory instance per persisted identity.
//! - **Lazy loading**: proxies for unfetched to-one associations and
//!   uninitialized collections, loaded on first real access.
//! - **Change tracking**: snapshots, per-field change sets and collection deltas.
//! - **Flush**: cascades, dependency ordering and all-or-nothing snapshot
//!   advancement around one `WriteExecutor` call.
//! - **Hydration and pagination**: join-aware row hydration and root-level
//!   paging over join-multiplied results.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: no autoflush; nothing is written before `flush`.
//! - **Handles, not pointers**: entities live in the unit of work's arena and
//!   are addressed by [`InstanceId`], so cyclic graphs need no shared ownership.
//! - **Synchronous bookkeeping**: only store round-trips are `async`.
//! - **Cancel-correct**: async operations take `Cx` and return `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(registry, store.clone(), store);
//!
//! let team = session.new_entity("Team")?;
//! session.set_field(team, "id", Value::BigInt(1))?;
//! session.persist(team)?;
//!
//! // Get by identity (uses the identity map)
//! let hero = session.get(&cx, "Hero", 7_i64).await?;
//!
//! // Mark for deletion
//! session.remove(hero)?;
//!
//! // Write everything in dependency order
//! session.flush(&cx).await?;
//! ```

mod cascade;
pub mod change_tracker;
pub mod collection;
pub mod entity;
pub mod flush;
pub mod hydrator;
pub mod identity_map;
pub mod merge;
pub mod n1_detection;
pub mod paginator;
pub mod proxy;
pub mod unit_of_work;

pub use change_tracker::{ChangeSet, ChangeTracker, EntitySnapshot};
pub use collection::{CollectionDelta, ElementKey, TrackedCollection};
pub use entity::{EntityEntry, EntityState, InstanceId, RefSlot};
pub use flush::{FlushPlan, FlushResult, NewEntityPolicy};
pub use identity_map::{IdentityMap, ObjectKey};
pub use merge::{DetachedEntity, DetachedRef};
pub use n1_detection::{LazyLoad, N1Detector, N1Stats};
pub use paginator::Paginator;
pub use proxy::ProxyState;
pub use unit_of_work::{PendingCounts, UnitOfWork};

use asupersync::{Cx, Outcome};
use entity::PendingCascade;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use unitwork_core::{
    CascadeOp, EntityIdentity, Error, IdGenerator, MetadataRegistry, Result, Row, StateErrorKind,
    Value, WriteExecutor,
};
use unitwork_query::{Condition, FetchPlan, OrderBy, QueryExecutor, ResolvedPlan};

/// Alias under which single-entity loads select their entity.
const LOAD_ALIAS: &str = "e";

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` aborts the operation.
type SessionEventFn = Box<dyn FnMut() -> std::result::Result<(), Error> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> std::result::Result<(), Error> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush computes anything. `Err` aborts the flush.
    BeforeFlush,
    /// Fired after a flush was written and applied.
    AfterFlush,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    /// What flush does with a new instance reached through an association
    /// that does not cascade persist.
    pub new_entity_policy: NewEntityPolicy,
    /// Whether rows overwrite the fields of already managed instances.
    pub refresh_on_hydrate: bool,
    /// Whether pagination assumes a to-many join may be present.
    pub fetch_join_collection: bool,
    /// Lazy loads per (entity, association) before an N+1 warning.
    /// `None` disables detection.
    pub n1_threshold: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            new_entity_policy: NewEntityPolicy::Reject,
            refresh_on_hydrate: false,
            fetch_join_collection: true,
            n1_threshold: None,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new_entity_policy(mut self, policy: NewEntityPolicy) -> Self {
        self.new_entity_policy = policy;
        self
    }

    #[must_use]
    pub fn refresh_on_hydrate(mut self, value: bool) -> Self {
        self.refresh_on_hydrate = value;
        self
    }

    #[must_use]
    pub fn fetch_join_collection(mut self, value: bool) -> Self {
        self.fetch_join_collection = value;
        self
    }

    #[must_use]
    pub fn n1_threshold(mut self, threshold: usize) -> Self {
        self.n1_threshold = Some(threshold);
        self
    }
}

/// Identifier generator for sessions whose entities never use
/// [`unitwork_core::IdGeneration::Sequence`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdGenerator;

impl IdGenerator for NoIdGenerator {
    fn next_id(&self, _cx: &Cx, entity: &str) -> impl Future<Output = Outcome<Value, Error>> + Send {
        let message = format!("no identifier generator configured for sequence entity '{entity}'");
        async move { Outcome::Err(Error::Custom(message)) }
    }
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It owns the unit of work for one logical sequence of operations and the
/// executors it talks to storage through. It is not meant to be shared
/// between concurrent tasks; every mutating operation takes `&mut self`.
pub struct Session<Q, W, G = NoIdGenerator> {
    query: Q,
    writer: W,
    ids: G,
    uow: UnitOfWork,
    config: SessionConfig,
    /// N+1 query detection tracker (optional).
    n1_detector: Option<N1Detector>,
    /// Session-level event callbacks.
    event_callbacks: SessionEventCallbacks,
}

impl<Q: QueryExecutor, W: WriteExecutor> Session<Q, W, NoIdGenerator> {
    /// Create a new session over `registry`.
    pub fn new(registry: Arc<MetadataRegistry>, query: Q, writer: W) -> Self {
        Self::with_config(registry, query, writer, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(
        registry: Arc<MetadataRegistry>,
        query: Q,
        writer: W,
        config: SessionConfig,
    ) -> Self {
        Self {
            query,
            writer,
            ids: NoIdGenerator,
            uow: UnitOfWork::new(registry),
            n1_detector: config.n1_threshold.map(N1Detector::new),
            config,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }
}

impl<Q: QueryExecutor, W: WriteExecutor, G: IdGenerator> Session<Q, W, G> {
    /// Use `ids` for entities with sequence-generated identifiers.
    pub fn with_id_generator<H: IdGenerator>(self, ids: H) -> Session<Q, W, H> {
        Session {
            query: self.query,
            writer: self.writer,
            ids,
            uow: self.uow,
            config: self.config,
            n1_detector: self.n1_detector,
            event_callbacks: self.event_callbacks,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        self.uow.registry()
    }

    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    pub fn query_executor(&self) -> &Q {
        &self.query
    }

    pub fn write_executor(&self) -> &W {
        &self.writer
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> std::result::Result<(), Error> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> std::result::Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Create a `NEW` instance of `entity`.
    pub fn new_entity(&mut self, entity: &str) -> Result<InstanceId> {
        self.uow.new_entity(entity)
    }

    /// Schedule `id` for insertion, cascading along `persist` associations.
    pub fn persist(&mut self, id: InstanceId) -> Result<()> {
        self.uow.persist(id)
    }

    /// Schedule `id` for deletion, cascading along `remove` associations.
    pub fn remove(&mut self, id: InstanceId) -> Result<()> {
        self.uow.remove(id)
    }

    /// Stop tracking `id`, cascading along `detach` associations.
    pub fn detach(&mut self, id: InstanceId) -> Result<Vec<InstanceId>> {
        self.uow.detach(id)
    }

    /// Detach everything. Pending changes are discarded.
    pub fn clear(&mut self) {
        self.uow.clear();
    }

    pub fn state(&self, id: InstanceId) -> EntityState {
        self.uow.state(id)
    }

    pub fn identity(&self, id: InstanceId) -> Option<EntityIdentity> {
        self.uow.identity(id)
    }

    pub fn proxy_state(&self, id: InstanceId) -> Result<ProxyState> {
        Ok(self.uow.entry(id)?.proxy_state())
    }

    /// True if an instance with this identity is tracked.
    pub fn contains(&self, entity: &str, identity: &EntityIdentity) -> bool {
        self.uow.lookup(entity, identity).is_some()
    }

    /// Read a loaded field. Fails on uninitialized proxies except for
    /// identifier fields; see [`Session::load_field`].
    pub fn get_field(&self, id: InstanceId, name: &str) -> Result<Value> {
        self.uow.get_field(id, name)
    }

    pub fn set_field(&mut self, id: InstanceId, name: &str, value: impl Into<Value>) -> Result<()> {
        self.uow.set_field(id, name, value.into())
    }

    /// The managed instance for `identity`, or an uninitialized proxy for it.
    pub fn reference(&mut self, entity: &str, identity: EntityIdentity) -> Result<InstanceId> {
        self.uow.get_reference(entity, identity)
    }

    /// Current value of a to-one association without loading it.
    pub fn reference_slot(&self, id: InstanceId, association: &str) -> Result<RefSlot> {
        self.uow.reference(id, association)
    }

    pub fn set_reference(
        &mut self,
        id: InstanceId,
        association: &str,
        target: Option<InstanceId>,
    ) -> Result<()> {
        self.uow.set_reference(id, association, target)
    }

    /// A collection as it is in memory, loaded or not.
    pub fn tracked_collection(&self, id: InstanceId, association: &str) -> Result<&TrackedCollection> {
        self.uow.collection(id, association)
    }

    pub fn change_set(&self, id: InstanceId) -> Result<ChangeSet> {
        self.uow.change_set(id)
    }

    pub fn is_modified(&self, id: InstanceId) -> Result<bool> {
        Ok(!self.uow.change_set(id)?.is_empty())
    }

    /// Describe `id` as detached state, for a later [`Session::merge`].
    pub fn to_detached(&self, id: InstanceId) -> Result<DetachedEntity> {
        self.uow.to_detached(id)
    }

    // ========================================================================
    // Loading
    // ========================================================================

    async fn fetch_rows(&self, cx: &Cx, plan: &FetchPlan) -> Outcome<Vec<Row>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        tracing::trace!(plan = %plan, "Fetching");
        self.query.fetch(cx, plan).await
    }

    fn resolve_plan(&self, plan: &FetchPlan) -> Result<ResolvedPlan> {
        plan.resolve(self.uow.registry())
    }

    /// Fetch `plan` and hydrate the rows. Returns the distinct roots.
    async fn load(&mut self, cx: &Cx, plan: &FetchPlan, refresh: bool) -> Outcome<Vec<InstanceId>, Error> {
        let resolved = match self.resolve_plan(plan) {
            Ok(resolved) => resolved,
            Err(e) => return Outcome::Err(e),
        };
        let rows = match self.fetch_rows(cx, plan).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match self.uow.hydrate(&resolved, &rows, refresh) {
            Ok(roots) => Outcome::Ok(roots),
            Err(e) => Outcome::Err(e),
        }
    }

    fn identity_plan(entity: &str, identity: EntityIdentity) -> FetchPlan {
        FetchPlan::new(entity, LOAD_ALIAS).filter(Condition::IdentityIn {
            alias: LOAD_ALIAS.to_string(),
            identities: vec![identity],
        })
    }

    fn record_lazy_load(&mut self, entity: &str, load: LazyLoad, instance: InstanceId) {
        if let Some(detector) = &mut self.n1_detector {
            detector.record(entity, load, instance);
        }
    }

    /// Run `plan` and hydrate its rows. Roots come back in first-occurrence
    /// order, collapsed by identity.
    #[tracing::instrument(level = "debug", skip(self, cx, plan), fields(root = %plan.root))]
    pub async fn query(&mut self, cx: &Cx, plan: &FetchPlan) -> Outcome<Vec<InstanceId>, Error> {
        let refresh = self.config.refresh_on_hydrate;
        self.load(cx, plan, refresh).await
    }

    /// The instance with `identity`, loading it if it is not tracked.
    ///
    /// Returns `None` if no row exists or the instance is scheduled for
    /// removal. A tracked proxy is resolved first.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(identity = %identity))]
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity: &str,
        identity: EntityIdentity,
    ) -> Outcome<Option<InstanceId>, Error> {
        let meta = match self.uow.registry().get(entity) {
            Ok(meta) => meta,
            Err(e) => return Outcome::Err(e),
        };
        if let Some(id) = self.uow.lookup(&meta.name, &identity) {
            if self.uow.state(id) == EntityState::Removed {
                return Outcome::Ok(None);
            }
            return match self.resolve(cx, id).await {
                Outcome::Ok(()) => Outcome::Ok(Some(id)),
                Outcome::Err(Error::DanglingReference(_)) => Outcome::Ok(None),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            };
        }
        let plan = Self::identity_plan(&meta.name, identity);
        match self.load(cx, &plan, false).await {
            Outcome::Ok(roots) => Outcome::Ok(roots.first().copied()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// [`Session::find`] for entities with a single-part identifier.
    pub async fn get(
        &mut self,
        cx: &Cx,
        entity: &str,
        key: impl Into<Value>,
    ) -> Outcome<Option<InstanceId>, Error> {
        let meta = match self.uow.registry().get(entity) {
            Ok(meta) => meta,
            Err(e) => return Outcome::Err(e),
        };
        let parts = meta.identity_parts();
        let [part] = parts.as_slice() else {
            return Outcome::Err(Error::invalid_mapping(
                &meta.name,
                format!(
                    "'{}' has a composite identifier ({}); use find",
                    meta.name,
                    parts.join(", ")
                ),
            ));
        };
        let identity = EntityIdentity::single(*part, key);
        self.find(cx, entity, identity).await
    }

    /// Initialize a proxy. No-op for initialized instances.
    ///
    /// A missing row fails with `DanglingReference` and leaves the proxy
    /// uninitialized and registered.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn resolve(&mut self, cx: &Cx, id: InstanceId) -> Outcome<(), Error> {
        let (entity, identity) = {
            let entry = match self.uow.entry_mut(id) {
                Ok(entry) => entry,
                Err(e) => return Outcome::Err(e),
            };
            if !entry.proxy.begin() {
                return Outcome::Ok(());
            }
            let Some(identity) = entry.identity.clone() else {
                entry.proxy.abort();
                return Outcome::Err(Error::state(
                    StateErrorKind::Uninitialized,
                    format!("{} {id} has no identity to load", entry.entity()),
                ));
            };
            (entry.metadata.name.clone(), identity)
        };
        tracing::debug!(entity = %entity, identity = %identity, "Resolving proxy");

        let plan = Self::identity_plan(&entity, identity.clone());
        let rows = match self.fetch_rows(cx, &plan).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => {
                self.abort_proxy(id);
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.abort_proxy(id);
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.abort_proxy(id);
                return Outcome::Panicked(p);
            }
        };
        if rows.is_empty() {
            self.abort_proxy(id);
            tracing::warn!(entity = %entity, identity = %identity, "Proxy points at a missing row");
            return Outcome::Err(Error::dangling_reference(entity, identity));
        }
        let hydrated = self
            .resolve_plan(&plan)
            .and_then(|resolved| self.uow.hydrate(&resolved, &rows, false));
        if let Err(e) = hydrated {
            self.abort_proxy(id);
            return Outcome::Err(e);
        }
        self.record_lazy_load(&entity, LazyLoad::Proxy, id);
        Outcome::Ok(())
    }

    fn abort_proxy(&mut self, id: InstanceId) {
        if let Ok(entry) = self.uow.entry_mut(id) {
            entry.proxy.abort();
        }
    }

    /// Read a field, resolving the instance first if it is a proxy.
    pub async fn load_field(&mut self, cx: &Cx, id: InstanceId, name: &str) -> Outcome<Value, Error> {
        let needs_load = match self.uow.entry(id) {
            Ok(entry) => {
                !entry.proxy.is_initialized()
                    && entry.metadata.get_field(name).is_some_and(|f| !f.id)
            }
            Err(e) => return Outcome::Err(e),
        };
        if needs_load {
            match self.resolve(cx, id).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        match self.uow.get_field(id, name) {
            Ok(value) => Outcome::Ok(value),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Target of a to-one association, loading it if it is not known yet.
    ///
    /// The target itself may come back as an uninitialized proxy.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn load_reference(
        &mut self,
        cx: &Cx,
        id: InstanceId,
        association: &str,
    ) -> Outcome<Option<InstanceId>, Error> {
        match self.uow.reference(id, association) {
            Ok(RefSlot::Set(target)) => return Outcome::Ok(target),
            Ok(RefSlot::Unloaded) => {}
            Err(e) => return Outcome::Err(e),
        }
        let (meta, owner) = match self.uow.entry(id) {
            Ok(entry) => (Arc::clone(&entry.metadata), entry.identity.clone()),
            Err(e) => return Outcome::Err(e),
        };
        let assoc = match meta.require_association(association) {
            Ok(assoc) => assoc.clone(),
            Err(e) => return Outcome::Err(e),
        };

        if assoc.has_foreign_key() {
            // The foreign key lives on the owner's row.
            match self.resolve(cx, id).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            return match self.uow.reference(id, association) {
                Ok(slot) => Outcome::Ok(slot.target()),
                Err(e) => Outcome::Err(e),
            };
        }

        let Some(owner) = owner else {
            return match self.uow.fill_reference(id, association, None) {
                Ok(()) => Outcome::Ok(None),
                Err(e) => Outcome::Err(e),
            };
        };
        let plan = FetchPlan::new(&assoc.target, LOAD_ALIAS).filter(Condition::ElementOf {
            alias: LOAD_ALIAS.to_string(),
            owner_entity: meta.name.clone(),
            association: association.to_string(),
            owner,
        });
        let target = match self.load(cx, &plan, false).await {
            Outcome::Ok(roots) => roots.first().copied(),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if let Err(e) = self.uow.fill_reference(id, association, target) {
            return Outcome::Err(e);
        }
        self.record_lazy_load(&meta.name, LazyLoad::Association(association.to_string()), id);
        Outcome::Ok(target)
    }

    /// Initialize a collection from storage if it is not loaded yet.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn load_collection(&mut self, cx: &Cx, id: InstanceId, association: &str) -> Outcome<(), Error> {
        match self.uow.collection(id, association) {
            Ok(collection) if collection.is_initialized() => return Outcome::Ok(()),
            Ok(_) => {}
            Err(e) => return Outcome::Err(e),
        }
        let (meta, owner) = match self.uow.entry(id) {
            Ok(entry) => (Arc::clone(&entry.metadata), entry.identity.clone()),
            Err(e) => return Outcome::Err(e),
        };
        let Some(owner) = owner else {
            return match self.uow.fill_collection(id, association, &[]) {
                Ok(()) => Outcome::Ok(()),
                Err(e) => Outcome::Err(e),
            };
        };
        let assoc = match meta.require_association(association) {
            Ok(assoc) => assoc.clone(),
            Err(e) => return Outcome::Err(e),
        };
        let mut plan = FetchPlan::new(&assoc.target, LOAD_ALIAS).filter(Condition::ElementOf {
            alias: LOAD_ALIAS.to_string(),
            owner_entity: meta.name.clone(),
            association: association.to_string(),
            owner,
        });
        if let Some(ordering) = &assoc.order_by {
            match OrderBy::parse_list(ordering, Some(LOAD_ALIAS)) {
                Ok(terms) => {
                    for term in terms {
                        plan = plan.order(term);
                    }
                }
                Err(e) => return Outcome::Err(e),
            }
        }
        let elements = match self.load(cx, &plan, false).await {
            Outcome::Ok(elements) => elements,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if let Err(e) = self.uow.fill_collection(id, association, &elements) {
            return Outcome::Err(e);
        }
        self.record_lazy_load(&meta.name, LazyLoad::Association(association.to_string()), id);
        Outcome::Ok(())
    }

    /// Elements of a collection, loading it first if needed.
    pub async fn collection(
        &mut self,
        cx: &Cx,
        id: InstanceId,
        association: &str,
    ) -> Outcome<Vec<InstanceId>, Error> {
        match self.load_collection(cx, id, association).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match self.uow.collection(id, association) {
            Ok(collection) => Outcome::Ok(collection.elements()),
            Err(e) => Outcome::Err(e),
        }
    }

    pub async fn collection_add(
        &mut self,
        cx: &Cx,
        id: InstanceId,
        association: &str,
        element: InstanceId,
    ) -> Outcome<bool, Error> {
        match self.load_collection(cx, id, association).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match self.uow.collection_add(id, association, element) {
            Ok(added) => Outcome::Ok(added),
            Err(e) => Outcome::Err(e),
        }
    }

    pub async fn collection_remove(
        &mut self,
        cx: &Cx,
        id: InstanceId,
        association: &str,
        element: InstanceId,
    ) -> Outcome<bool, Error> {
        match self.load_collection(cx, id, association).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match self.uow.collection_remove(id, association, element) {
            Ok(removed) => Outcome::Ok(removed),
            Err(e) => Outcome::Err(e),
        }
    }

    pub async fn collection_clear(&mut self, cx: &Cx, id: InstanceId, association: &str) -> Outcome<(), Error> {
        match self.load_collection(cx, id, association).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match self.uow.collection_clear(id, association) {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Element stored under `key` in an `index_by` collection.
    pub async fn collection_get_key(
        &mut self,
        cx: &Cx,
        id: InstanceId,
        association: &str,
        key: &Value,
    ) -> Outcome<Option<InstanceId>, Error> {
        match self.load_collection(cx, id, association).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match self.uow.collection(id, association) {
            Ok(collection) => Outcome::Ok(collection.get_key(key)),
            Err(e) => Outcome::Err(e),
        }
    }

    pub async fn collection_remove_key(
        &mut self,
        cx: &Cx,
        id: InstanceId,
        association: &str,
        key: &Value,
    ) -> Outcome<Option<InstanceId>, Error> {
        match self.load_collection(cx, id, association).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match self.uow.collection_remove_key(id, association, key) {
            Ok(removed) => Outcome::Ok(removed),
            Err(e) => Outcome::Err(e),
        }
    }

    // ========================================================================
    // Pagination
    // ========================================================================

    /// A paginator over `plan` configured from this session.
    pub fn paginate(&self, plan: FetchPlan) -> Paginator {
        Paginator::new(plan).fetch_join_collection(self.config.fetch_join_collection)
    }

    /// Number of distinct roots of `paginator`'s plan.
    pub async fn count(&self, cx: &Cx, paginator: &Paginator) -> Outcome<u64, Error> {
        paginator.count(cx, &self.query).await
    }

    /// The current page of `paginator`, hydrated into this session.
    pub async fn page(&mut self, cx: &Cx, paginator: &Paginator) -> Outcome<Vec<InstanceId>, Error> {
        let refresh = self.config.refresh_on_hydrate;
        paginator.page(cx, &self.query, &mut self.uow, refresh).await
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Reload `id` from storage, discarding in-memory changes, and cascade
    /// along `refresh` associations.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn refresh(&mut self, cx: &Cx, id: InstanceId) -> Outcome<(), Error> {
        match self.uow.entry(id) {
            Ok(entry) if entry.state == EntityState::Managed && !entry.scheduled_insert => {}
            Ok(entry) => {
                return Outcome::Err(Error::state(
                    StateErrorKind::NotManaged,
                    format!(
                        "{} {id} is {} and has no persisted state to refresh",
                        entry.entity(),
                        if entry.scheduled_insert { "pending insert" } else { entry.state.as_str() }
                    ),
                ));
            }
            Err(e) => return Outcome::Err(e),
        }
        let targets = cascade::walk(&self.uow.entries, id, CascadeOp::Refresh).reached;
        for target in targets {
            match self.refresh_one(cx, target).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    async fn refresh_one(&mut self, cx: &Cx, id: InstanceId) -> Outcome<(), Error> {
        let (entity, identity, initialized) = match self.uow.entry(id) {
            Ok(entry) if entry.state == EntityState::Managed && !entry.scheduled_insert => {
                match entry.identity.clone() {
                    Some(identity) => (
                        entry.metadata.name.clone(),
                        identity,
                        entry.proxy.is_initialized(),
                    ),
                    None => return Outcome::Ok(()),
                }
            }
            Ok(_) => return Outcome::Ok(()),
            Err(e) => return Outcome::Err(e),
        };
        if !initialized {
            return self.resolve(cx, id).await;
        }

        let plan = Self::identity_plan(&entity, identity.clone());
        let rows = match self.fetch_rows(cx, &plan).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if rows.is_empty() {
            return Outcome::Err(Error::dangling_reference(entity, identity));
        }
        let resolved = match self.resolve_plan(&plan) {
            Ok(resolved) => resolved,
            Err(e) => return Outcome::Err(e),
        };
        if let Ok(entry) = self.uow.entry_mut(id) {
            let meta = Arc::clone(&entry.metadata);
            for collection in entry.collections.values_mut() {
                collection.reset_lazy();
            }
            for assoc in meta.associations.iter().filter(|a| !a.is_collection() && !a.has_foreign_key()) {
                entry.references.insert(assoc.name.clone(), RefSlot::Unloaded);
            }
        }
        match self.uow.hydrate(&resolved, &rows, true) {
            Ok(_) => {
                tracing::trace!(instance = %id, "Refreshed");
                Outcome::Ok(())
            }
            Err(e) => Outcome::Err(e),
        }
    }

    // ========================================================================
    // Merge (Detached State Reattachment)
    // ========================================================================

    /// Copy detached state into this session.
    ///
    /// The state lands on the managed instance with the same identity,
    /// loading it from storage if needed; without one a new instance is
    /// created and persisted. Nested entities reached through associations
    /// that cascade `merge` are merged the same way. Returns the instance
    /// that received the root state.
    #[tracing::instrument(level = "debug", skip(self, cx, state), fields(entity = %state.entity))]
    pub async fn merge(&mut self, cx: &Cx, state: &DetachedEntity) -> Outcome<InstanceId, Error> {
        let nodes = match merge::flatten(self.uow.registry(), state) {
            Ok(nodes) => nodes,
            Err(e) => return Outcome::Err(e),
        };

        let mut instances = Vec::with_capacity(nodes.len());
        let mut created = Vec::new();
        for node in &nodes {
            let existing = match &node.identity {
                Some(identity) => {
                    if let Some(id) = self.uow.lookup(&node.state.entity, identity) {
                        if self.uow.state(id) == EntityState::Removed {
                            return Outcome::Err(Error::state(
                                StateErrorKind::Removed,
                                format!("cannot merge into removed {}{identity}", node.state.entity),
                            ));
                        }
                    }
                    match self.find(cx, &node.state.entity, identity.clone()).await {
                        Outcome::Ok(found) => found,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                None => None,
            };
            let id = match existing {
                Some(id) => id,
                None => match self.uow.new_entity(&node.state.entity) {
                    Ok(id) => {
                        created.push(id);
                        id
                    }
                    Err(e) => return Outcome::Err(e),
                },
            };
            instances.push(id);
        }

        for (node, &id) in nodes.iter().zip(&instances) {
            if let Err(e) = self.uow.merge_fields(id, &node.state) {
                return Outcome::Err(e);
            }
            let meta = match self.uow.entry(id) {
                Ok(entry) => Arc::clone(&entry.metadata),
                Err(e) => return Outcome::Err(e),
            };
            for (name, target) in &node.state.references {
                let slot = node.nested.get(name).and_then(|s| s.first().copied()).flatten();
                let resolved = match slot {
                    Some(index) => Ok(instances.get(index).copied()),
                    None => meta
                        .require_association(name)
                        .and_then(|assoc| self.uow.merge_target(&assoc.target, target)),
                };
                let linked = resolved.and_then(|t| self.uow.set_reference(id, name, t));
                if let Err(e) = linked {
                    return Outcome::Err(e);
                }
            }
            for (name, elements) in &node.state.collections {
                match self.load_collection(cx, id, name).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                let target = match meta.require_association(name) {
                    Ok(assoc) => assoc.target.clone(),
                    Err(e) => return Outcome::Err(e),
                };
                let slots = node.nested.get(name).cloned().unwrap_or_default();
                let mut members = Vec::with_capacity(elements.len());
                for (i, element) in elements.iter().enumerate() {
                    let member = match slots.get(i).copied().flatten() {
                        Some(index) => Ok(instances.get(index).copied()),
                        None => self.uow.merge_target(&target, element),
                    };
                    match member {
                        Ok(Some(member)) => members.push(member),
                        Ok(None) => {}
                        Err(e) => return Outcome::Err(e),
                    }
                }
                if let Err(e) = self.uow.replace_collection(id, name, &members) {
                    return Outcome::Err(e);
                }
            }
        }

        for id in &created {
            if self.uow.state(*id) == EntityState::New {
                if let Err(e) = self.uow.persist(*id) {
                    return Outcome::Err(e);
                }
            }
        }
        tracing::debug!(
            merged = instances.len(),
            created = created.len(),
            "Merged detached state"
        );
        match instances.first() {
            Some(root) => Outcome::Ok(*root),
            None => Outcome::Err(Error::Custom("merge produced no instance".to_string())),
        }
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write every pending change in one ordered batch.
    ///
    /// On any failure, including cancellation, the in-memory lifecycle state
    /// is rolled back to what it was before the call and no snapshot moves.
    /// Whether storage kept part of the batch depends on the write executor.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }
        let started = Instant::now();
        let checkpoint = self.uow.checkpoint();

        match self.flush_inner(cx).await {
            Outcome::Ok(result) => {
                tracing::info!(
                    inserted = result.inserted,
                    updated = result.updated,
                    deleted = result.deleted,
                    links_inserted = result.links_inserted,
                    links_deleted = result.links_deleted,
                    extra_updates = result.extra_updates,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Flush complete"
                );
                if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
                    return Outcome::Err(e);
                }
                Outcome::Ok(result)
            }
            Outcome::Err(e) => {
                self.uow.restore(checkpoint);
                tracing::warn!(error = %e, kind = e.kind_name(), "Flush failed; in-memory state restored");
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.uow.restore(checkpoint);
                tracing::warn!("Flush cancelled; in-memory state restored");
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.uow.restore(checkpoint);
                Outcome::Panicked(p)
            }
        }
    }

    async fn flush_inner(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        match self.settle_pending_cascades(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Err(e) = self.uow.prepare_flush() {
            return Outcome::Err(e);
        }

        let mut reserved = HashMap::new();
        for (id, entity) in self.uow.sequence_pending() {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            match self.ids.next_id(cx, &entity).await {
                Outcome::Ok(value) => {
                    tracing::trace!(instance = %id, entity = %entity, value = %value, "Reserved identifier");
                    reserved.insert(id, value);
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let plan = match self.uow.plan_flush(&reserved, self.config.new_entity_policy) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        let results = if plan.is_empty() {
            tracing::debug!("Nothing to write");
            Vec::new()
        } else {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            match self.writer.execute(cx, &plan.commands).await {
                Outcome::Ok(results) => results,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };
        if results.len() != plan.len() {
            return Outcome::Err(Error::Custom(format!(
                "write executor returned {} results for {} commands",
                results.len(),
                plan.len()
            )));
        }
        match self.uow.apply_flush(&plan, &results, &reserved) {
            Ok(()) => Outcome::Ok(plan.result()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Load whatever unloaded associations earlier removals could not walk
    /// and finish those cascades.
    async fn settle_pending_cascades(&mut self, cx: &Cx) -> Outcome<(), Error> {
        loop {
            let pending = self.uow.pending_cascades();
            if pending.is_empty() {
                return Outcome::Ok(());
            }
            tracing::debug!(count = pending.len(), "Settling pending remove cascades");
            for (owner, cascade) in pending {
                let loaded = match &cascade {
                    PendingCascade::RemoveThroughProxy => self.resolve(cx, owner).await,
                    PendingCascade::RemoveThroughReference(name) => {
                        match self.load_reference(cx, owner, name).await {
                            Outcome::Ok(_) => Outcome::Ok(()),
                            Outcome::Err(e) => Outcome::Err(e),
                            Outcome::Cancelled(r) => Outcome::Cancelled(r),
                            Outcome::Panicked(p) => Outcome::Panicked(p),
                        }
                    }
                    PendingCascade::RemoveThroughCollection(name) => {
                        self.load_collection(cx, owner, name).await
                    }
                };
                match loaded {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                if let Ok(entry) = self.uow.entry_mut(owner) {
                    entry.pending_cascades.retain(|p| *p != cascade);
                }
                self.uow.cascade_remove(owner);
            }
        }
    }

    // ========================================================================
    // N+1 Query Detection
    // ========================================================================

    /// Start counting lazy loads; replaces any earlier counts.
    pub fn enable_n1_detection(&mut self, threshold: usize) {
        self.n1_detector = Some(N1Detector::new(threshold));
    }

    pub fn disable_n1_detection(&mut self) {
        self.n1_detector = None;
    }

    #[must_use]
    pub fn n1_detection_enabled(&self) -> bool {
        self.n1_detector.is_some()
    }

    pub fn n1_detector(&self) -> Option<&N1Detector> {
        self.n1_detector.as_ref()
    }

    #[must_use]
    pub fn n1_stats(&self) -> Option<N1Stats> {
        self.n1_detector.as_ref().map(N1Detector::stats)
    }

    /// Forget lazy-load counts, e.g. between units of work on one session.
    pub fn reset_n1_tracking(&mut self) {
        if let Some(detector) = &mut self.n1_detector {
            detector.reset();
        }
    }

    // ========================================================================
    // Debug
    // ========================================================================

    pub fn pending_counts(&self) -> PendingCounts {
        self.uow.pending_counts()
    }

    pub fn has_changes(&self) -> bool {
        self.uow.has_changes()
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let counts = self.uow.pending_counts();
        SessionDebugInfo {
            tracked: self.uow.len(),
            identities: self.uow.identity_map().len(),
            uninitialized_proxies: self
                .uow
                .instances()
                .filter(|(_, e)| !e.proxy_state().is_initialized())
                .count(),
            pending_new: counts.new,
            pending_dirty: counts.dirty,
            pending_delete: counts.deleted,
            pending_collections: counts.collections,
            pending_cascades: self.uow.pending_cascades().len(),
        }
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDebugInfo {
    /// Total tracked instances.
    pub tracked: usize,
    /// Instances registered in the identity map.
    pub identities: usize,
    pub uninitialized_proxies: usize,
    /// Instances pending INSERT.
    pub pending_new: usize,
    /// Instances pending UPDATE.
    pub pending_dirty: usize,
    /// Instances pending DELETE.
    pub pending_delete: usize,
    /// Collections with unwritten changes.
    pub pending_collections: usize,
    /// Remove cascades waiting for an unloaded association.
    pub pending_cascades: usize,
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use std::sync::Mutex;
    use unitwork_core::{
        AssociationMapping, CascadeSet, EntityMetadata, FieldMapping, IdGeneration, WriteErrorKind,
    };
    use unitwork_memory::MemoryStore;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => std::panic::panic_any(format!("expected an error, got: {other:?}")),
        }
    }

    fn registry() -> Arc<MetadataRegistry> {
        Arc::new(
            MetadataRegistry::new()
                .with(
                    EntityMetadata::new("Team", "teams")
                        .field(FieldMapping::id("id"))
                        .field(FieldMapping::new("name"))
                        .association(
                            AssociationMapping::one_to_many("heroes", "Hero", "team")
                                .cascade(CascadeSet::parse("persist,remove,refresh").unwrap())
                                .order_by("name"),
                        ),
                )
                .unwrap()
                .with(
                    EntityMetadata::new("Hero", "heroes")
                        .field(FieldMapping::id("id"))
                        .field(FieldMapping::new("name"))
                        .association(
                            AssociationMapping::many_to_one("team", "Team")
                                .join_column("team_id", "id"),
                        ),
                )
                .unwrap()
                .with(
                    EntityMetadata::new("Ticket", "tickets")
                        .field(FieldMapping::id("id"))
                        .field(FieldMapping::new("title"))
                        .id_generation(IdGeneration::Sequence),
                )
                .unwrap(),
        )
    }

    /// Team 1 "Avengers" with heroes 1 "Thor" and 2 "Hulk".
    fn seeded() -> (Arc<MetadataRegistry>, MemoryStore) {
        let reg = registry();
        let store = MemoryStore::new(Arc::clone(&reg));
        store.insert_row(
            "teams",
            [("id", Value::BigInt(1)), ("name", Value::Text("Avengers".into()))],
        );
        for (id, name) in [(1, "Thor"), (2, "Hulk")] {
            store.insert_row(
                "heroes",
                [
                    ("id", Value::BigInt(id)),
                    ("name", Value::Text(name.into())),
                    ("team_id", Value::BigInt(1)),
                ],
            );
        }
        (reg, store)
    }

    fn session(reg: &Arc<MetadataRegistry>, store: &MemoryStore) -> Session<MemoryStore, MemoryStore> {
        Session::new(Arc::clone(reg), store.clone(), store.clone())
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.new_entity_policy, NewEntityPolicy::Reject);
        assert!(!config.refresh_on_hydrate);
        assert!(config.fetch_join_collection);
        assert_eq!(config.n1_threshold, None);

        let config = config.n1_threshold(2).refresh_on_hydrate(true);
        assert_eq!(config.n1_threshold, Some(2));
        assert!(config.refresh_on_hydrate);
    }

    #[test]
    fn test_reference_is_managed_proxy_until_resolved() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (reg, store) = seeded();
        let mut session = session(&reg, &store);

        rt.block_on(async {
            let thor = session
                .reference("Hero", EntityIdentity::single("id", 1_i64))
                .unwrap();
            assert_eq!(session.state(thor), EntityState::Managed);
            assert_eq!(session.proxy_state(thor).unwrap(), ProxyState::Uninitialized);
            assert_eq!(session.get_field(thor, "id").unwrap(), Value::BigInt(1));
            assert!(session.get_field(thor, "name").is_err());

            let name = unwrap_outcome(session.load_field(&cx, thor, "name").await);
            assert_eq!(name, Value::Text("Thor".into()));
            assert_eq!(session.proxy_state(thor).unwrap(), ProxyState::Initialized);
            assert_eq!(session.state(thor), EntityState::Managed);

            // The same identity keeps resolving to the same instance.
            let again = unwrap_outcome(session.get(&cx, "Hero", 1_i64).await);
            assert_eq!(again, Some(thor));
        });
    }

    #[test]
    fn test_dangling_reference_leaves_proxy_registered() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (reg, store) = seeded();
        let mut session = session(&reg, &store);

        rt.block_on(async {
            let ghost = session
                .reference("Hero", EntityIdentity::single("id", 9_i64))
                .unwrap();
            let identities = session.unit_of_work().identity_map().len();
            let err = expect_err(session.resolve(&cx, ghost).await);
            assert!(matches!(err, Error::DanglingReference(_)));
            assert_eq!(session.proxy_state(ghost).unwrap(), ProxyState::Uninitialized);
            assert_eq!(session.unit_of_work().identity_map().len(), identities);
            assert_eq!(unwrap_outcome(session.get(&cx, "Hero", 9_i64).await), None);
        });
    }

    #[test]
    fn test_lazy_collection_loads_once_in_order() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (reg, store) = seeded();
        let mut session = session(&reg, &store);

        rt.block_on(async {
            let team = unwrap_outcome(session.get(&cx, "Team", 1_i64).await).unwrap();
            assert!(!session.tracked_collection(team, "heroes").unwrap().is_initialized());

            let fetches = store.stats().fetches;
            let heroes = unwrap_outcome(session.collection(&cx, team, "heroes").await);
            let names: Vec<Value> = heroes
                .iter()
                .map(|h| session.get_field(*h, "name").unwrap())
                .collect();
            assert_eq!(names, vec![Value::Text("Hulk".into()), Value::Text("Thor".into())]);
            assert_eq!(session.reference_slot(heroes[0], "team").unwrap(), RefSlot::Set(Some(team)));

            unwrap_outcome(session.collection(&cx, team, "heroes").await);
            assert_eq!(store.stats().fetches, fetches + 1);
        });
    }

    #[test]
    fn test_n1_detection_counts_lazy_loads() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (reg, store) = seeded();
        let mut session = Session::with_config(
            Arc::clone(&reg),
            store.clone(),
            store.clone(),
            SessionConfig::default().n1_threshold(2),
        );

        rt.block_on(async {
            let plan = FetchPlan::new("Hero", "h").order(OrderBy::asc("h", "id"));
            let heroes = unwrap_outcome(session.query(&cx, &plan).await);
            for hero in &heroes {
                let team = unwrap_outcome(session.load_reference(&cx, *hero, "team").await).unwrap();
                unwrap_outcome(session.resolve(&cx, team).await);
            }
            // Both heroes share one team: it is resolved only once.
            let detector = session.n1_detector().unwrap();
            assert_eq!(detector.loads("Team", &LazyLoad::Proxy), 1);
            // Hydration already set the references from foreign keys.
            assert_eq!(detector.loads("Hero", &LazyLoad::Association("team".into())), 0);
            assert!(!detector.is_flagged("Team", &LazyLoad::Proxy));
            assert_eq!(session.n1_stats().unwrap().flagged, 0);

            let team = session.reference_slot(heroes[0], "team").unwrap().target().unwrap();
            unwrap_outcome(session.load_collection(&cx, team, "heroes").await);
            assert_eq!(
                session
                    .n1_detector()
                    .unwrap()
                    .instances("Team", &LazyLoad::Association("heroes".into())),
                vec![team]
            );
            session.reset_n1_tracking();
            assert_eq!(session.n1_stats().unwrap().loads, 0);
        });
    }

    #[test]
    fn test_n1_detection_flags_per_instance_collection_loads() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (reg, store) = seeded();
        store.insert_row(
            "teams",
            [("id", Value::BigInt(2)), ("name", Value::Text("Defenders".into()))],
        );
        let mut session = session(&reg, &store);
        session.enable_n1_detection(2);

        rt.block_on(async {
            let teams = unwrap_outcome(
                session
                    .query(&cx, &FetchPlan::new("Team", "t").order(OrderBy::asc("t", "id")))
                    .await,
            );
            let heroes = LazyLoad::Association("heroes".into());
            unwrap_outcome(session.load_collection(&cx, teams[0], "heroes").await);
            // Already initialized: no second fetch, nothing recorded.
            unwrap_outcome(session.load_collection(&cx, teams[0], "heroes").await);
            assert!(!session.n1_detector().unwrap().is_flagged("Team", &heroes));

            unwrap_outcome(session.load_collection(&cx, teams[1], "heroes").await);
            let detector = session.n1_detector().unwrap();
            assert!(detector.is_flagged("Team", &heroes));
            assert_eq!(detector.loads("Team", &heroes), 2);
            assert_eq!(detector.instances("Team", &heroes).len(), 2);
        });
    }

    #[test]
    fn test_flush_events_fire_and_abort() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (reg, store) = seeded();
        let mut session = session(&reg, &store);
        let log = Arc::new(Mutex::new(Vec::new()));

        let before = Arc::clone(&log);
        session.on_before_flush(move || {
            before.lock().unwrap().push("before");
            Ok(())
        });
        let after = Arc::clone(&log);
        session.on_after_flush(move || {
            after.lock().unwrap().push("after");
            Ok(())
        });

        rt.block_on(async {
            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(result.total(), 0);
            assert_eq!(*log.lock().unwrap(), vec!["before", "after"]);

            session.on_before_flush(|| Err(Error::Custom("veto".into())));
            let team = session.new_entity("Team").unwrap();
            session.set_field(team, "id", 2_i64).unwrap();
            session.persist(team).unwrap();
            let err = expect_err(session.flush(&cx).await);
            assert!(matches!(err, Error::Custom(ref m) if m == "veto"));
            assert_eq!(store.stats().write_batches, 0);
            assert_eq!(session.pending_counts().new, 1);
        });
    }

    #[test]
    fn test_failed_flush_restores_state() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (reg, store) = seeded();
        let mut session = session(&reg, &store);

        rt.block_on(async {
            let thor = unwrap_outcome(session.get(&cx, "Hero", 1_i64).await).unwrap();
            session.set_field(thor, "name", "Thor Odinson").unwrap();
            let team = session.new_entity("Team").unwrap();
            session.set_field(team, "id", 2_i64).unwrap();
            session.persist(team).unwrap();

            store.fail_next_write(WriteErrorKind::Io, "connection reset");
            let err = expect_err(session.flush(&cx).await);
            assert!(matches!(err, Error::Write(_)));
            assert!(session.is_modified(thor).unwrap());
            assert_eq!(session.pending_counts().new, 1);
            assert_eq!(store.row_count("teams"), 1);

            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!((result.inserted, result.updated), (1, 1));
            assert!(!session.has_changes());
            assert_eq!(store.row_count("teams"), 2);
        });
    }

    #[test]
    fn test_sequence_ids_need_a_generator() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (reg, store) = seeded();

        rt.block_on(async {
            let mut plain = session(&reg, &store);
            let ticket = plain.new_entity("Ticket").unwrap();
            plain.set_field(ticket, "title", "first").unwrap();
            plain.persist(ticket).unwrap();
            assert!(matches!(expect_err(plain.flush(&cx).await), Error::Custom(_)));
            assert_eq!(plain.identity(ticket), None);

            let mut session = session(&reg, &store).with_id_generator(store.clone());
            let ticket = session.new_entity("Ticket").unwrap();
            session.set_field(ticket, "title", "first").unwrap();
            session.persist(ticket).unwrap();
            unwrap_outcome(session.flush(&cx).await);
            assert_eq!(
                session.identity(ticket),
                Some(EntityIdentity::single("id", 1_i64))
            );
            assert_eq!(store.row_count("tickets"), 1);
        });
    }

    #[test]
    fn test_refresh_discards_changes_and_cascades() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (reg, store) = seeded();
        let mut session = session(&reg, &store);

        rt.block_on(async {
            let team = unwrap_outcome(session.get(&cx, "Team", 1_i64).await).unwrap();
            let heroes = unwrap_outcome(session.collection(&cx, team, "heroes").await);
            session.set_field(team, "name", "Defenders").unwrap();
            session.set_field(heroes[0], "name", "Bruce").unwrap();

            unwrap_outcome(session.refresh(&cx, team).await);
            assert_eq!(session.get_field(team, "name").unwrap(), Value::Text("Avengers".into()));
            assert_eq!(session.get_field(heroes[0], "name").unwrap(), Value::Text("Hulk".into()));
            assert!(!session.has_changes());

            let fresh = session.new_entity("Team").unwrap();
            assert!(matches!(
                expect_err(session.refresh(&cx, fresh).await),
                Error::State(_)
            ));
        });
    }

    #[test]
    fn test_merge_updates_managed_and_creates_missing() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (reg, store) = seeded();
        let mut session = session(&reg, &store);

        rt.block_on(async {
            let state = DetachedEntity::new("Hero")
                .field("id", 2_i64)
                .field("name", "Smart Hulk")
                .reference("team", EntityIdentity::single("id", 1_i64));
            let hulk = unwrap_outcome(session.merge(&cx, &state).await);
            assert_eq!(session.state(hulk), EntityState::Managed);
            assert_eq!(
                session.change_set(hulk).unwrap().fields["name"].1,
                Value::Text("Smart Hulk".into())
            );

            let newcomer = DetachedEntity::new("Hero").field("id", 3_i64).field("name", "Vision");
            let vision = unwrap_outcome(session.merge(&cx, &newcomer).await);
            assert!(session.unit_of_work().entry(vision).unwrap().is_scheduled_insert());

            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!((result.inserted, result.updated), (1, 1));
            assert_eq!(store.row_count("heroes"), 3);
        });
    }

    #[test]
    fn test_debug_state_counts() {
        let (reg, store) = seeded();
        let mut session = session(&reg, &store);
        let proxy = session
            .reference("Team", EntityIdentity::single("id", 1_i64))
            .unwrap();
        let hero = session.new_entity("Hero").unwrap();
        session.set_field(hero, "id", 5_i64).unwrap();
        session.set_reference(hero, "team", Some(proxy)).unwrap();
        session.persist(hero).unwrap();

        let info = session.debug_state();
        assert_eq!(info.tracked, 2);
        assert_eq!(info.identities, 2);
        assert_eq!(info.uninitialized_proxies, 1);
        assert_eq!(info.pending_new, 1);
        assert_eq!(info.pending_delete, 0);
    }
}
