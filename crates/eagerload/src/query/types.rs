//! Query Types - operators, join kinds, ordering and lock modes

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backends::DatabaseBackendType;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Like,
    NotLike,
}

impl fmt::Display for QueryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOperator::Equal => write!(f, "="),
            QueryOperator::NotEqual => write!(f, "!="),
            QueryOperator::GreaterThan => write!(f, ">"),
            QueryOperator::GreaterThanOrEqual => write!(f, ">="),
            QueryOperator::LessThan => write!(f, "<"),
            QueryOperator::LessThanOrEqual => write!(f, "<="),
            QueryOperator::Like => write!(f, "LIKE"),
            QueryOperator::NotLike => write!(f, "NOT LIKE"),
        }
    }
}

/// Join types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER JOIN"),
            JoinType::Left => write!(f, "LEFT JOIN"),
        }
    }
}

/// Order by direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderDirection::Asc => write!(f, "ASC"),
            OrderDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// Row locking applied to the root statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockMode {
    #[default]
    None,
    ForUpdate,
    ForShare,
    ForUpdateNoWait,
    ForUpdateSkipLocked,
}

impl LockMode {
    pub fn is_locking(self) -> bool {
        !matches!(self, LockMode::None)
    }

    /// Locking clause for `dialect`, restricted to the rows of `alias` where
    /// the dialect allows it; SQLite has no row locks
    pub fn clause(self, dialect: DatabaseBackendType, alias: &str) -> Option<String> {
        if dialect == DatabaseBackendType::SQLite {
            return None;
        }

        let (base, suffix) = match self {
            LockMode::None => return None,
            LockMode::ForUpdate => ("FOR UPDATE", ""),
            LockMode::ForShare => ("FOR SHARE", ""),
            LockMode::ForUpdateNoWait => ("FOR UPDATE", " NOWAIT"),
            LockMode::ForUpdateSkipLocked => ("FOR UPDATE", " SKIP LOCKED"),
        };

        match dialect {
            DatabaseBackendType::PostgreSQL => Some(format!("{} OF {}{}", base, alias, suffix)),
            _ => Some(format!("{}{}", base, suffix)),
        }
    }
}
