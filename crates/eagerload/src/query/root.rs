//! Root query description handed to the planner

use crate::resolver::RelationPath;
use super::filter::{Filter, OrderBy};
use super::types::{LockMode, OrderDirection};

/// A join the caller placed in the root query explicitly
///
/// Its rows only reach a relationship field through a contains-eager
/// directive on the same path.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplicitJoin {
    pub path: RelationPath,
    pub filters: Vec<Filter>,
}

/// Root entity, filters, ordering, paging and locking
#[derive(Debug, Clone, PartialEq)]
pub struct RootQuery {
    pub entity: String,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub lock: LockMode,
    pub load_only: Option<Vec<String>>,
    pub joins: Vec<ExplicitJoin>,
}

impl RootQuery {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            lock: LockMode::None,
            load_only: None,
            joins: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.order_by.push(OrderBy {
            column: column.to_string(),
            direction: OrderDirection::Asc,
        });
        self
    }

    pub fn order_by_desc(mut self, column: &str) -> Self {
        self.order_by.push(OrderBy {
            column: column.to_string(),
            direction: OrderDirection::Desc,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock = mode;
        self
    }

    pub fn for_update(self) -> Self {
        self.lock(LockMode::ForUpdate)
    }

    /// Restrict the root columns; key columns are always added
    pub fn load_only(mut self, columns: &[&str]) -> Self {
        self.load_only = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Join a relationship path into the root statement
    pub fn join(self, path: impl Into<RelationPath>) -> Self {
        self.join_filtered(path, Vec::new())
    }

    /// Join a relationship path and filter the joined rows
    pub fn join_filtered(mut self, path: impl Into<RelationPath>, filters: Vec<Filter>) -> Self {
        let path = path.into();
        match self.joins.iter_mut().find(|j| j.path == path) {
            Some(existing) => existing.filters.extend(filters),
            None => self.joins.push(ExplicitJoin { path, filters }),
        }
        self
    }

    pub fn explicit_join(&self, path: &RelationPath) -> Option<&ExplicitJoin> {
        self.joins.iter().find(|j| &j.path == path)
    }

    pub fn is_paged(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }
}
