//! Structural query layer
//!
//! Root queries describe what the caller asked for; statements are what
//! the planner hands to the execution engine.

pub mod filter;
pub mod root;
pub mod statement;
pub mod types;

pub use filter::{Filter, OrderBy};
pub use root::{ExplicitJoin, RootQuery};
pub use statement::{column_label, Condition, JoinClause, OrderClause, SelectColumn, Statement};
pub use types::{JoinType, LockMode, OrderDirection, QueryOperator};
