//! Error types for the eager-loading planner
//!
//! One enum covers every phase: registry construction, plan building,
//! guarded field access and plan execution. Execution errors reported by
//! the engine collaborator are carried unchanged.

/// Result type alias for planner operations
pub type OrmResult<T> = Result<T, OrmError>;

/// The phase an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorPhase {
    /// Schema registration and sealing; fatal to process init
    Registry,
    /// Directive classification and plan assembly; nothing has executed
    Planning,
    /// Field access on a materialized entity
    Access,
    /// Reported by the execution engine while running statements
    Execution,
    /// Configuration, serialization and transaction plumbing
    Infrastructure,
}

/// Error types for planner operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrmError {
    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("Entity '{entity}' has no relationship '{relationship}' (while resolving '{path}')")]
    UnknownRelationship {
        entity: String,
        relationship: String,
        path: String,
    },

    #[error("Relationship '{entity}.{relationship}' targets unregistered entity '{target}'")]
    DanglingRelationship {
        entity: String,
        relationship: String,
        target: String,
    },

    #[error("Entity '{0}' is already registered")]
    DuplicateEntity(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Join-fetch of '{entity}.{relationship}' multiplies root rows; allow multiplication or use a batched fetch")]
    AmbiguousCardinality { entity: String, relationship: String },

    #[error("Conflicting directives on '{path}' and '{other}': {reason}")]
    ConflictingDirectives {
        path: String,
        other: String,
        reason: String,
    },

    #[error("Relationship '{entity}.{relationship}' binds a composite key and the backend cannot batch-filter on composite keys")]
    CompositeKeyUnsupportedForBatch { entity: String, relationship: String },

    #[error("Entity '{entity}' has no field '{field}'")]
    UnknownField { entity: String, field: String },

    #[error("Invalid directive: {0}")]
    InvalidDirective(String),

    #[error("Lazy access to '{entity}.{field}' is not permitted")]
    LazyAccessViolation { entity: String, field: String },

    #[error("'{entity}.{field}' needs a fetch but the entity is detached from its query context")]
    DetachedAccessError { entity: String, field: String },

    #[error("'{entity}.{field}' has not been fetched yet; call load_relation first")]
    FetchRequired { entity: String, field: String },

    #[error("'{field}' is not a relationship of '{entity}'")]
    NotARelationship { entity: String, field: String },

    #[error("Relationship '{entity}.{field}' accessed with the wrong cardinality")]
    CardinalityMismatch { entity: String, field: String },

    #[error("Stale write on '{table}': {detail}")]
    StaleWrite { table: String, detail: String },

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Plan execution cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl OrmError {
    /// Classify the error by the phase that produced it
    pub fn phase(&self) -> ErrorPhase {
        match self {
            OrmError::UnknownEntity(_)
            | OrmError::UnknownRelationship { .. }
            | OrmError::DanglingRelationship { .. }
            | OrmError::DuplicateEntity(_)
            | OrmError::InvalidSchema(_) => ErrorPhase::Registry,
            OrmError::AmbiguousCardinality { .. }
            | OrmError::ConflictingDirectives { .. }
            | OrmError::CompositeKeyUnsupportedForBatch { .. }
            | OrmError::UnknownField { .. }
            | OrmError::InvalidDirective(_) => ErrorPhase::Planning,
            OrmError::LazyAccessViolation { .. }
            | OrmError::DetachedAccessError { .. }
            | OrmError::FetchRequired { .. }
            | OrmError::NotARelationship { .. }
            | OrmError::CardinalityMismatch { .. } => ErrorPhase::Access,
            OrmError::StaleWrite { .. }
            | OrmError::LockTimeout(_)
            | OrmError::Database(_)
            | OrmError::Cancelled => ErrorPhase::Execution,
            OrmError::Configuration(_)
            | OrmError::Serialization(_)
            | OrmError::Transaction(_) => ErrorPhase::Infrastructure,
        }
    }

    /// Shorthand for the access-guard violation
    pub fn lazy_access(entity: &str, field: &str) -> Self {
        OrmError::LazyAccessViolation {
            entity: entity.to_string(),
            field: field.to_string(),
        }
    }

    /// Shorthand for access after the query context is gone
    pub fn detached(entity: &str, field: &str) -> Self {
        OrmError::DetachedAccessError {
            entity: entity.to_string(),
            field: field.to_string(),
        }
    }

    /// Optimistic or pessimistic concurrency conflicts reported by the engine
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, OrmError::StaleWrite { .. } | OrmError::LockTimeout(_))
    }
}

// Convert from sqlx errors
impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        OrmError::Database(err.to_string())
    }
}

// Convert from serde_json errors
impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::Serialization(err.to_string())
    }
}

// Convert from serde_yaml errors
impl From<serde_yaml::Error> for OrmError {
    fn from(err: serde_yaml::Error) -> Self {
        OrmError::Configuration(err.to_string())
    }
}

/// A plan that stopped part-way through execution
///
/// `completed` lists the plan steps (0 is the root statement) whose
/// statements all finished before the failure. `error` is the engine's
/// error as reported, so callers can match on `StaleWrite` or
/// `LockTimeout` directly.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Plan execution stopped after {} completed step(s): {error}", .completed.len())]
pub struct ExecutionFailure {
    pub completed: Vec<usize>,
    pub failed_at: Option<usize>,
    #[source]
    pub error: OrmError,
}

impl ExecutionFailure {
    pub fn new(completed: Vec<usize>, failed_at: Option<usize>, error: OrmError) -> Self {
        Self {
            completed,
            failed_at,
            error,
        }
    }

    /// True when no statement ran to completion
    pub fn nothing_completed(&self) -> bool {
        self.completed.is_empty()
    }

    /// Discard the progress report and keep the underlying error
    pub fn into_error(self) -> OrmError {
        self.error
    }
}

impl From<ExecutionFailure> for OrmError {
    fn from(failure: ExecutionFailure) -> Self {
        failure.error
    }
}
