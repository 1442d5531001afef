//! Execution Engine Backends
//!
//! The planner never talks to a database directly. It hands structured
//! statements to an [`ExecutionEngine`] collaborator, which renders and
//! runs them. This module defines that seam plus two implementations: an
//! in-memory engine used by tests and demos, and a PostgreSQL engine
//! backed by `sqlx`.

pub mod core;
pub mod memory;
pub mod postgres;

// Re-export core traits and types
pub use core::*;
pub use memory::MemoryEngine;
pub use postgres::PostgresEngine;

use serde::{Deserialize, Serialize};

/// Database backend type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackendType {
    #[serde(alias = "postgres")]
    PostgreSQL,
    MySQL,
    SQLite,
}

impl DatabaseBackendType {
    /// Whether `(a, b) IN ((..), (..))` filters are available
    pub fn supports_tuple_in(self) -> bool {
        !matches!(self, DatabaseBackendType::SQLite)
    }

    /// Render the n-th (1-based) bind placeholder
    pub fn placeholder(self, index: usize) -> String {
        match self {
            DatabaseBackendType::PostgreSQL => format!("${}", index),
            DatabaseBackendType::MySQL | DatabaseBackendType::SQLite => "?".to_string(),
        }
    }
}

impl Default for DatabaseBackendType {
    fn default() -> Self {
        DatabaseBackendType::PostgreSQL
    }
}

impl std::fmt::Display for DatabaseBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseBackendType::PostgreSQL => write!(f, "postgresql"),
            DatabaseBackendType::MySQL => write!(f, "mysql"),
            DatabaseBackendType::SQLite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for DatabaseBackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseBackendType::PostgreSQL),
            "mysql" => Ok(DatabaseBackendType::MySQL),
            "sqlite" => Ok(DatabaseBackendType::SQLite),
            _ => Err(format!("Unsupported database backend: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("postgres".parse::<DatabaseBackendType>(), Ok(DatabaseBackendType::PostgreSQL));
        assert_eq!("MySQL".parse::<DatabaseBackendType>(), Ok(DatabaseBackendType::MySQL));
        assert!("oracle".parse::<DatabaseBackendType>().is_err());
    }

    #[test]
    fn test_backend_capabilities() {
        assert!(DatabaseBackendType::PostgreSQL.supports_tuple_in());
        assert!(!DatabaseBackendType::SQLite.supports_tuple_in());
        assert_eq!(DatabaseBackendType::PostgreSQL.placeholder(3), "$3");
        assert_eq!(DatabaseBackendType::MySQL.placeholder(3), "?");
    }
}
