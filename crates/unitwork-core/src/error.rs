//! Error types for unit-of-work operations.

use crate::identity::EntityIdentity;
use std::fmt;

/// The primary error type for all unitwork operations.
#[derive(Debug)]
pub enum Error {
    /// Two distinct instances claim the same identity.
    IdentityConflict(IdentityConflictError),
    /// A followed reference points at a row that no longer exists.
    DanglingReference(DanglingReferenceError),
    /// A cycle of required foreign keys among entities scheduled in one flush.
    UnresolvedDependency(DependencyError),
    /// The write executor rejected the flush batch.
    Write(WriteError),
    /// The query executor failed.
    Query(QueryError),
    /// Metadata lookup or validation failed.
    Mapping(MappingError),
    /// Operation not valid for the instance's lifecycle state.
    State(StateError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct IdentityConflictError {
    pub entity: String,
    pub identity: EntityIdentity,
}

#[derive(Debug, Clone)]
pub struct DanglingReferenceError {
    pub entity: String,
    pub identity: EntityIdentity,
}

#[derive(Debug, Clone)]
pub struct DependencyError {
    /// Instances on the cycle, rendered as `Type#identity` or `Type<new>`.
    pub cycle: Vec<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct WriteError {
    pub kind: WriteErrorKind,
    pub message: String,
    /// Index of the failing command within the submitted batch.
    pub command_index: Option<usize>,
    pub retryable: bool,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// Unique, primary key or foreign key violation
    Constraint,
    /// Update or delete addressed a row that does not exist
    Missing,
    /// The executor refused the batch (injected failure, read-only store, ...)
    Rejected,
    /// Transport failure
    Io,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// The plan uses a feature the executor does not implement
    Unsupported,
    /// The plan references something the store does not know
    NotFound,
    /// Other store error
    Database,
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub entity: Option<String>,
    pub name: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// No metadata registered for the entity type
    UnknownEntity,
    /// The entity type has no such persistent field
    UnknownField,
    /// The entity type has no such association
    UnknownAssociation,
    /// Metadata is internally inconsistent
    InvalidMapping,
    /// An identifier value is missing or NULL
    MissingIdentifier,
}

#[derive(Debug, Clone)]
pub struct StateError {
    pub kind: StateErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    /// The handle no longer refers to a tracked instance
    Detached,
    /// The instance is new and was never persisted
    NotManaged,
    /// The instance is scheduled for removal
    Removed,
    /// A proxy field was read before the proxy was resolved
    Uninitialized,
    /// A new entity was reached through an association without persist cascade
    UnpersistedReference,
    /// The value assigned does not fit the association
    InvalidAssignment,
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Only executor failures flagged retryable by the executor qualify; the
    /// engine-level kinds describe programmer or data errors that a retry
    /// cannot fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Write(w) => w.retryable,
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Database),
            _ => false,
        }
    }

    /// Short name of the error kind, for structured logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::IdentityConflict(_) => "identity_conflict",
            Error::DanglingReference(_) => "dangling_reference",
            Error::UnresolvedDependency(_) => "unresolved_dependency",
            Error::Write(_) => "write",
            Error::Query(_) => "query",
            Error::Mapping(_) => "mapping",
            Error::State(_) => "state",
            Error::Cancelled => "cancelled",
            Error::Custom(_) => "custom",
        }
    }

    pub fn identity_conflict(entity: impl Into<String>, identity: EntityIdentity) -> Self {
        Error::IdentityConflict(IdentityConflictError {
            entity: entity.into(),
            identity,
        })
    }

    pub fn dangling_reference(entity: impl Into<String>, identity: EntityIdentity) -> Self {
        Error::DanglingReference(DanglingReferenceError {
            entity: entity.into(),
            identity,
        })
    }

    pub fn unknown_entity(entity: &str) -> Self {
        Error::Mapping(MappingError {
            kind: MappingErrorKind::UnknownEntity,
            entity: Some(entity.to_string()),
            name: None,
            message: format!("no metadata registered for entity '{entity}'"),
        })
    }

    pub fn unknown_field(entity: &str, field: &str) -> Self {
        Error::Mapping(MappingError {
            kind: MappingErrorKind::UnknownField,
            entity: Some(entity.to_string()),
            name: Some(field.to_string()),
            message: format!("entity '{entity}' has no field '{field}'"),
        })
    }

    pub fn unknown_association(entity: &str, association: &str) -> Self {
        Error::Mapping(MappingError {
            kind: MappingErrorKind::UnknownAssociation,
            entity: Some(entity.to_string()),
            name: Some(association.to_string()),
            message: format!("entity '{entity}' has no association '{association}'"),
        })
    }

    pub fn invalid_mapping(entity: &str, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            kind: MappingErrorKind::InvalidMapping,
            entity: Some(entity.to_string()),
            name: None,
            message: message.into(),
        })
    }

    pub fn missing_identifier(entity: &str, field: &str) -> Self {
        Error::Mapping(MappingError {
            kind: MappingErrorKind::MissingIdentifier,
            entity: Some(entity.to_string()),
            name: Some(field.to_string()),
            message: format!("entity '{entity}' has no value for identifier field '{field}'"),
        })
    }

    pub fn state(kind: StateErrorKind, message: impl Into<String>) -> Self {
        Error::State(StateError {
            kind,
            message: message.into(),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IdentityConflict(e) => write!(
                f,
                "Identity conflict: another instance of '{}' is already registered as {}",
                e.entity, e.identity
            ),
            Error::DanglingReference(e) => write!(
                f,
                "Dangling reference: no row for '{}' with identity {}",
                e.entity, e.identity
            ),
            Error::UnresolvedDependency(e) => write!(
                f,
                "Unresolved dependency: {} ({})",
                e.message,
                e.cycle.join(" -> ")
            ),
            Error::Write(e) => {
                if let Some(idx) = e.command_index {
                    write!(f, "Write error at command {}: {}", idx, e.message)
                } else {
                    write!(f, "Write error: {}", e.message)
                }
            }
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e.message),
            Error::State(e) => write!(f, "State error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Write(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<WriteError> for Error {
    fn from(err: WriteError) -> Self {
        Error::Write(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::State(err)
    }
}

impl From<DependencyError> for Error {
    fn from(err: DependencyError) -> Self {
        Error::UnresolvedDependency(err)
    }
}

/// Result type alias for unitwork operations.
pub type Result<T> = std::result::Result<T, Error>;
