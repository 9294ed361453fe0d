//! Compiled fetch plans for the unitwork persistence engine.
//!
//! This crate describes *what* to load: a root entity, join paths along
//! associations, filters, ordering and a page window. Storage drivers
//! implement [`QueryExecutor`] to turn a [`FetchPlan`] into rows.

pub mod executor;
pub mod order;
pub mod plan;

pub use executor::QueryExecutor;
pub use order::{OrderBy, OrderDirection};
pub use plan::{
    COUNT_COLUMN, Condition, FetchPlan, IncludePath, JoinFetch, JoinType, Projection,
    ResolvedJoin, ResolvedPlan,
};
