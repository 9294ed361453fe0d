//! Core types and traits for the unitwork persistence engine.
//!
//! - `Value` and `Row` for dynamically typed storage data
//! - `EntityIdentity` for simple and composite primary keys
//! - `MetadataRegistry` describing entity types and their associations
//! - `WriteExecutor` / `IdGenerator` collaborator traits
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod executor;
pub mod identity;
pub mod metadata;
pub mod row;
pub mod value;

pub use error::{
    DanglingReferenceError, DependencyError, Error, IdentityConflictError, MappingError,
    MappingErrorKind, QueryError, QueryErrorKind, Result, StateError, StateErrorKind,
    WriteError, WriteErrorKind,
};
pub use executor::{Columns, IdGenerator, Param, WriteCommand, WriteExecutor, WriteResult};
pub use identity::EntityIdentity;
pub use metadata::{
    AssociationKind, AssociationMapping, CascadeOp, CascadeSet, EntityMetadata, FieldMapping,
    IdGeneration, JoinColumn, JoinTable, MetadataRegistry, MetadataSource,
};
pub use row::{ALIAS_SEPARATOR, Row, RowHeader, aliased_column};
pub use value::Value;
