//! # eagerload: Relationship Eager-Loading Planner
//!
//! Plans how the relationships of an object-graph query are fetched:
//! joined into the root statement, loaded by keyed follow-up statements,
//! or guarded so that an unplanned access fails instead of issuing a
//! silent query.
//!
//! The planner never opens a connection itself. Statements are handed to
//! an [`ExecutionEngine`] passed in by the caller; the in-memory engine is
//! used by tests and the demo, the PostgreSQL engine runs on `sqlx`.

pub mod backends;
pub mod config;
pub mod error;
pub mod graph;
pub mod loading;
pub mod planner;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod transaction;

// Re-export core traits and types
pub use backends::{
    DatabaseBackendType, DatabaseValue, EngineTransaction, ExecutionEngine, MemoryEngine, PostgresEngine, Row,
};
pub use config::*;
pub use error::*;
pub use graph::{Entity, InverseHook, Related, RelationState, ResultGraph};
pub use loading::{
    AccessPolicy, AccessRule, ExecutionStats, LoadClass, LoadDirective, LoadStrategy, QueryPlan,
};
pub use planner::*;
pub use query::{Filter, JoinType, LockMode, OrderDirection, RootQuery, Statement};
pub use resolver::{RelationPath, RelationshipResolver};
pub use schema::{
    Cardinality, EntityType, FieldDef, FieldType, ForeignKey, RelationshipSpec, SchemaRegistry,
    SchemaRegistryBuilder,
};
pub use transaction::*;
