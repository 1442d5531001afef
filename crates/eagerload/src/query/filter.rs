//! Structural filters
//!
//! Column names are unqualified; a [`Condition`](super::Condition) binds a
//! filter to the row-set alias it applies to.

use serde::{Deserialize, Serialize};

use crate::backends::DatabaseValue;
use super::types::QueryOperator;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        column: String,
        op: QueryOperator,
        value: DatabaseValue,
    },
    In {
        column: String,
        values: Vec<DatabaseValue>,
    },
    NotIn {
        column: String,
        values: Vec<DatabaseValue>,
    },
    /// Composite membership: `(a, b) IN ((1, 2), (3, 4))`
    TupleIn {
        columns: Vec<String>,
        tuples: Vec<Vec<DatabaseValue>>,
    },
    IsNull(String),
    IsNotNull(String),
    Between {
        column: String,
        low: DatabaseValue,
        high: DatabaseValue,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    fn compare(column: &str, op: QueryOperator, value: impl Into<DatabaseValue>) -> Self {
        Filter::Compare {
            column: column.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: &str, value: impl Into<DatabaseValue>) -> Self {
        Self::compare(column, QueryOperator::Equal, value)
    }

    pub fn ne(column: &str, value: impl Into<DatabaseValue>) -> Self {
        Self::compare(column, QueryOperator::NotEqual, value)
    }

    pub fn gt(column: &str, value: impl Into<DatabaseValue>) -> Self {
        Self::compare(column, QueryOperator::GreaterThan, value)
    }

    pub fn ge(column: &str, value: impl Into<DatabaseValue>) -> Self {
        Self::compare(column, QueryOperator::GreaterThanOrEqual, value)
    }

    pub fn lt(column: &str, value: impl Into<DatabaseValue>) -> Self {
        Self::compare(column, QueryOperator::LessThan, value)
    }

    pub fn le(column: &str, value: impl Into<DatabaseValue>) -> Self {
        Self::compare(column, QueryOperator::LessThanOrEqual, value)
    }

    pub fn like(column: &str, pattern: &str) -> Self {
        Self::compare(column, QueryOperator::Like, pattern)
    }

    pub fn not_like(column: &str, pattern: &str) -> Self {
        Self::compare(column, QueryOperator::NotLike, pattern)
    }

    pub fn is_in<I, V>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        Filter::In {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_in<I, V>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        Filter::NotIn {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tuple_in(columns: &[String], tuples: Vec<Vec<DatabaseValue>>) -> Self {
        Filter::TupleIn {
            columns: columns.to_vec(),
            tuples,
        }
    }

    pub fn is_null(column: &str) -> Self {
        Filter::IsNull(column.to_string())
    }

    pub fn is_not_null(column: &str) -> Self {
        Filter::IsNotNull(column.to_string())
    }

    pub fn between(column: &str, low: impl Into<DatabaseValue>, high: impl Into<DatabaseValue>) -> Self {
        Filter::Between {
            column: column.to_string(),
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            filter => Filter::And(vec![filter, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut filters) => {
                filters.push(other);
                Filter::Or(filters)
            }
            filter => Filter::Or(vec![filter, other]),
        }
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Columns the filter reads
    pub fn columns(&self) -> Vec<&str> {
        let mut columns = Vec::new();
        self.collect_columns(&mut columns);
        columns
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::Compare { column, .. }
            | Filter::In { column, .. }
            | Filter::NotIn { column, .. }
            | Filter::Between { column, .. }
            | Filter::IsNull(column)
            | Filter::IsNotNull(column) => out.push(column),
            Filter::TupleIn { columns, .. } => out.extend(columns.iter().map(String::as_str)),
            Filter::And(filters) | Filter::Or(filters) => {
                filters.iter().for_each(|f| f.collect_columns(out))
            }
            Filter::Not(filter) => filter.collect_columns(out),
        }
    }
}

/// `ORDER BY` entry on an entity column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: super::OrderDirection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_composition() {
        let filter = Filter::eq("gender", "female")
            .and(Filter::gt("score", 80.0))
            .and(Filter::is_not_null("address"));
        match &filter {
            Filter::And(filters) => assert_eq!(filters.len(), 3),
            other => panic!("unexpected filter: {:?}", other),
        }
        assert_eq!(filter.columns(), vec!["gender", "score", "address"]);

        let filter = Filter::is_in("id", [1, 2, 3]).negate();
        assert!(matches!(filter, Filter::Not(_)));
    }
}
