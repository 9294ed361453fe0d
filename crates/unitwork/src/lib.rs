//! unitwork - a Unit of Work persistence engine.
//!
//! unitwork tracks in-memory entities, reconciles them with a relational
//! store and resolves associations between them:
//!
//! - An identity map guaranteeing one instance per persisted identity
//! - Lazy proxies and lazily loaded, tracked collections
//! - Snapshot-based change tracking and collection deltas
//! - Cascading persist, remove, merge, refresh and detach
//! - Dependency-ordered, all-or-nothing flushes
//! - Join-aware hydration and root-level pagination
//!
//! Entities are described by runtime metadata, not by Rust types. The engine
//! talks to storage only through the [`QueryExecutor`], [`WriteExecutor`] and
//! [`IdGenerator`] traits; [`MemoryStore`] implements all three.
//!
//! # Quick Start
//!
//! ```ignore
//! use unitwork::prelude::*;
//!
//! let registry = Arc::new(
//!     MetadataRegistry::new()
//!         .with(
//!             EntityMetadata::new("Team", "teams")
//!                 .field(FieldMapping::id("id"))
//!                 .field(FieldMapping::new("name"))
//!                 .association(
//!                     AssociationMapping::one_to_many("heroes", "Hero", "team")
//!                         .cascade(CascadeSet::ALL),
//!                 ),
//!         )?
//!         .with(
//!             EntityMetadata::new("Hero", "heroes")
//!                 .field(FieldMapping::id("id"))
//!                 .field(FieldMapping::new("name"))
//!                 .association(
//!                     AssociationMapping::many_to_one("team", "Team").join_column("team_id", "id"),
//!                 ),
//!         )?,
//! );
//! let store = MemoryStore::new(registry.clone());
//! let mut session = Session::new(registry, store.clone(), store);
//!
//! let team = session.new_entity("Team")?;
//! session.set_field(team, "id", 1_i64)?;
//! session.persist(team)?;
//! session.flush(&cx).await?;
//!
//! // Load heroes with their teams in one round-trip
//! let plan = FetchPlan::new("Hero", "h").join_fetch("h", "team", "t");
//! let heroes = session.query(&cx, &plan).await?;
//! ```

pub use unitwork_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    AssociationKind,
    AssociationMapping,
    CascadeOp,
    CascadeSet,
    EntityIdentity,
    EntityMetadata,
    Error,
    FieldMapping,
    IdGeneration,
    IdGenerator,
    JoinColumn,
    JoinTable,
    MetadataRegistry,
    MetadataSource,
    Param,
    Result,
    Row,
    Value,
    WriteCommand,
    WriteExecutor,
    WriteResult,
    // Errors
    error::{
        DanglingReferenceError, DependencyError, IdentityConflictError, MappingError,
        MappingErrorKind, QueryError, QueryErrorKind, StateError, StateErrorKind, WriteError,
        WriteErrorKind,
    },
};

pub use unitwork_query::{
    Condition, FetchPlan, IncludePath, JoinType, OrderBy, OrderDirection, Projection,
    QueryExecutor,
};

pub use unitwork_session::{
    ChangeSet, CollectionDelta, DetachedEntity, DetachedRef, EntityState, FlushResult,
    InstanceId, LazyLoad, N1Detector, N1Stats, NewEntityPolicy, NoIdGenerator, Paginator,
    PendingCounts, ProxyState, RefSlot, Session, SessionConfig, SessionDebugInfo, SessionEvent,
    TrackedCollection, UnitOfWork,
};

pub use unitwork_memory::{MemoryStore, StoreStats};

/// Commonly used items.
pub mod prelude {
    pub use crate::{
        AssociationMapping, CascadeSet, Condition, Cx, DetachedEntity, EntityIdentity,
        EntityMetadata, EntityState, Error, FetchPlan, FieldMapping, IdGeneration, InstanceId,
        JoinTable, MemoryStore, MetadataRegistry, OrderBy, Outcome, Paginator, ProxyState,
        RefSlot, Result, Session, SessionConfig, Value,
    };
    pub use std::sync::Arc;
}
