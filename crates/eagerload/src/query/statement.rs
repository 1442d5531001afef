//! Executable statements and their SQL rendering
//!
//! The planner composes statements structurally. Rendering only covers
//! what that composition needs: an alias-qualified select list, joins,
//! `WHERE`, `ORDER BY`, paging and a row-lock clause.

use crate::backends::{DatabaseBackendType, DatabaseValue};
use super::filter::Filter;
use super::types::{JoinType, LockMode, OrderDirection};

/// Label under which a selected column is returned
pub fn column_label(alias: &str, column: &str) -> String {
    format!("{}__{}", alias, column)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectColumn {
    pub alias: String,
    pub column: String,
}

impl SelectColumn {
    pub fn label(&self) -> String {
        column_label(&self.alias, &self.column)
    }
}

/// `JOIN table AS alias ON parent.col = alias.col AND ...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClause {
    pub join_type: JoinType,
    pub table: String,
    pub alias: String,
    pub parent_alias: String,
    /// `(parent column, joined column)` pairs
    pub on: Vec<(String, String)>,
}

/// A filter bound to the row set it applies to
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub alias: String,
    pub filter: Filter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderClause {
    pub alias: String,
    pub column: String,
    pub direction: OrderDirection,
}

/// A single executable statement of a plan
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub dialect: DatabaseBackendType,
    pub table: String,
    pub alias: String,
    pub select: Vec<SelectColumn>,
    pub joins: Vec<JoinClause>,
    pub conditions: Vec<Condition>,
    pub order_by: Vec<OrderClause>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub lock: LockMode,
    /// Page the base table in a subquery before joining, so a multiplying
    /// join cannot cut the page short
    pub wrap_root: bool,
}

impl Statement {
    pub fn new(dialect: DatabaseBackendType, table: &str, alias: &str) -> Self {
        Self {
            dialect,
            table: table.to_string(),
            alias: alias.to_string(),
            select: Vec::new(),
            joins: Vec::new(),
            conditions: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            lock: LockMode::None,
            wrap_root: false,
        }
    }

    pub fn select_column(&mut self, alias: &str, column: &str) {
        let column = SelectColumn {
            alias: alias.to_string(),
            column: column.to_string(),
        };
        if !self.select.contains(&column) {
            self.select.push(column);
        }
    }

    pub fn add_condition(&mut self, alias: &str, filter: Filter) {
        self.conditions.push(Condition {
            alias: alias.to_string(),
            filter,
        });
    }

    /// Every alias the statement introduces, base table first
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.alias.as_str()).chain(self.joins.iter().map(|j| j.alias.as_str()))
    }

    /// Conditions evaluated before joining when the root is wrapped
    pub fn base_conditions(&self) -> impl Iterator<Item = &Condition> {
        self.conditions.iter().filter(move |c| c.alias == self.alias)
    }

    pub fn sql(&self) -> String {
        self.render().0
    }

    /// Bound values in placeholder order
    pub fn params(&self) -> Vec<DatabaseValue> {
        self.render().1
    }

    fn render(&self) -> (String, Vec<DatabaseValue>) {
        let mut sql = String::new();
        let mut params = Vec::new();

        sql.push_str("SELECT ");
        if self.select.is_empty() {
            sql.push('*');
        } else {
            let columns: Vec<String> = self
                .select
                .iter()
                .map(|c| format!("{}.{} AS {}", c.alias, c.column, c.label()))
                .collect();
            sql.push_str(&columns.join(", "));
        }

        sql.push_str(" FROM ");
        if self.wrap_root {
            sql.push_str(&format!("(SELECT {}.* FROM {} AS {}", self.alias, self.table, self.alias));
            let base: Vec<&Condition> = self.base_conditions().collect();
            self.push_where(&mut sql, &mut params, &base);
            self.push_order(&mut sql, |o| o.alias == self.alias);
            self.push_paging(&mut sql);
            sql.push_str(&format!(") AS {}", self.alias));
        } else {
            sql.push_str(&format!("{} AS {}", self.table, self.alias));
        }

        for join in &self.joins {
            sql.push_str(&format!(" {} {} AS {} ON ", join.join_type, join.table, join.alias));
            let on: Vec<String> = join
                .on
                .iter()
                .map(|(parent, child)| {
                    format!("{}.{} = {}.{}", join.parent_alias, parent, join.alias, child)
                })
                .collect();
            sql.push_str(&on.join(" AND "));
        }

        let outer: Vec<&Condition> = self
            .conditions
            .iter()
            .filter(|c| !self.wrap_root || c.alias != self.alias)
            .collect();
        self.push_where(&mut sql, &mut params, &outer);
        self.push_order(&mut sql, |_| true);
        if !self.wrap_root {
            self.push_paging(&mut sql);
        }

        if let Some(clause) = self.lock.clause(self.dialect, &self.alias) {
            sql.push(' ');
            sql.push_str(&clause);
        }

        (sql, params)
    }

    fn push_where(&self, sql: &mut String, params: &mut Vec<DatabaseValue>, conditions: &[&Condition]) {
        if conditions.is_empty() {
            return;
        }
        let rendered: Vec<String> = conditions
            .iter()
            .map(|c| self.render_filter(&c.alias, &c.filter, params))
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&rendered.join(" AND "));
    }

    fn push_order<F>(&self, sql: &mut String, keep: F)
    where
        F: Fn(&OrderClause) -> bool,
    {
        let clauses: Vec<String> = self
            .order_by
            .iter()
            .filter(|o| keep(o))
            .map(|o| format!("{}.{} {}", o.alias, o.column, o.direction))
            .collect();
        if !clauses.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&clauses.join(", "));
        }
    }

    fn push_paging(&self, sql: &mut String) {
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
    }

    fn bind(&self, value: &DatabaseValue, params: &mut Vec<DatabaseValue>) -> String {
        params.push(value.clone());
        self.dialect.placeholder(params.len())
    }

    fn render_filter(&self, alias: &str, filter: &Filter, params: &mut Vec<DatabaseValue>) -> String {
        let qualify = |column: &str| format!("{}.{}", alias, column);
        match filter {
            Filter::Compare { column, op, value } => {
                format!("{} {} {}", qualify(column), op, self.bind(value, params))
            }
            Filter::In { values, .. } if values.is_empty() => "1 = 0".to_string(),
            Filter::NotIn { values, .. } if values.is_empty() => "1 = 1".to_string(),
            Filter::In { column, values } | Filter::NotIn { column, values } => {
                let keyword = if matches!(filter, Filter::In { .. }) { "IN" } else { "NOT IN" };
                let placeholders: Vec<String> =
                    values.iter().map(|v| self.bind(v, params)).collect();
                format!("{} {} ({})", qualify(column), keyword, placeholders.join(", "))
            }
            Filter::TupleIn { tuples, .. } if tuples.is_empty() => "1 = 0".to_string(),
            Filter::TupleIn { columns, tuples } => {
                let columns: Vec<String> = columns.iter().map(|c| qualify(c)).collect();
                let tuples: Vec<String> = tuples
                    .iter()
                    .map(|tuple| {
                        let placeholders: Vec<String> =
                            tuple.iter().map(|v| self.bind(v, params)).collect();
                        format!("({})", placeholders.join(", "))
                    })
                    .collect();
                format!("({}) IN ({})", columns.join(", "), tuples.join(", "))
            }
            Filter::IsNull(column) => format!("{} IS NULL", qualify(column)),
            Filter::IsNotNull(column) => format!("{} IS NOT NULL", qualify(column)),
            Filter::Between { column, low, high } => {
                let low = self.bind(low, params);
                let high = self.bind(high, params);
                format!("{} BETWEEN {} AND {}", qualify(column), low, high)
            }
            Filter::And(filters) | Filter::Or(filters) if filters.is_empty() => {
                let identity = if matches!(filter, Filter::And(_)) { "1 = 1" } else { "1 = 0" };
                identity.to_string()
            }
            Filter::And(filters) | Filter::Or(filters) => {
                let joiner = if matches!(filter, Filter::And(_)) { " AND " } else { " OR " };
                let parts: Vec<String> = filters
                    .iter()
                    .map(|f| self.render_filter(alias, f, params))
                    .collect();
                format!("({})", parts.join(joiner))
            }
            Filter::Not(inner) => format!("NOT ({})", self.render_filter(alias, inner, params)),
        }
    }
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn students(dialect: DatabaseBackendType) -> Statement {
        let mut statement = Statement::new(dialect, "students", "t0");
        statement.select_column("t0", "id");
        statement.select_column("t0", "name");
        statement.select_column("t0", "id");
        statement
    }

    #[test]
    fn test_select_with_join_and_filters() {
        let mut statement = students(DatabaseBackendType::PostgreSQL);
        statement.joins.push(JoinClause {
            join_type: JoinType::Left,
            table: "student_clazz".into(),
            alias: "t1".into(),
            parent_alias: "t0".into(),
            on: vec![("id".into(), "student_id".into())],
        });
        statement.select_column("t1", "class_id");
        statement.add_condition("t0", Filter::eq("gender", "female"));
        statement.add_condition("t0", Filter::is_in("id", [1, 2]));

        assert_eq!(
            statement.sql(),
            "SELECT t0.id AS t0__id, t0.name AS t0__name, t1.class_id AS t1__class_id \
             FROM students AS t0 LEFT JOIN student_clazz AS t1 ON t0.id = t1.student_id \
             WHERE t0.gender = $1 AND t0.id IN ($2, $3)"
        );
        assert_eq!(
            statement.params(),
            vec![
                DatabaseValue::from("female"),
                DatabaseValue::Int32(1),
                DatabaseValue::Int32(2)
            ]
        );
        assert_eq!(statement.aliases().collect::<Vec<_>>(), vec!["t0", "t1"]);
    }

    #[test]
    fn test_dialect_placeholders_and_tuple_in() {
        let mut statement = Statement::new(DatabaseBackendType::MySQL, "emails", "t0");
        statement.select_column("t0", "email");
        statement.add_condition(
            "t0",
            Filter::tuple_in(
                &["email".to_string(), "student_id".to_string()],
                vec![vec!["a@example.com".into(), 1.into()]],
            ),
        );
        assert_eq!(
            statement.sql(),
            "SELECT t0.email AS t0__email FROM emails AS t0 WHERE (t0.email, t0.student_id) IN ((?, ?))"
        );
    }

    #[test]
    fn test_empty_membership_renders_false() {
        let mut statement = students(DatabaseBackendType::PostgreSQL);
        statement.add_condition("t0", Filter::is_in("id", Vec::<i32>::new()));
        assert!(statement.sql().ends_with("WHERE 1 = 0"));
        assert!(statement.params().is_empty());
    }

    #[test]
    fn test_wrapped_root_pages_before_joining() {
        let mut statement = students(DatabaseBackendType::PostgreSQL);
        statement.wrap_root = true;
        statement.limit = Some(2);
        statement.lock = LockMode::ForUpdate;
        statement.order_by.push(OrderClause {
            alias: "t0".into(),
            column: "id".into(),
            direction: OrderDirection::Asc,
        });
        statement.add_condition("t0", Filter::gt("score", 50));
        statement.joins.push(JoinClause {
            join_type: JoinType::Left,
            table: "emails".into(),
            alias: "t1".into(),
            parent_alias: "t0".into(),
            on: vec![("id".into(), "student_id".into())],
        });

        assert_eq!(
            statement.sql(),
            "SELECT t0.id AS t0__id, t0.name AS t0__name \
             FROM (SELECT t0.* FROM students AS t0 WHERE t0.score > $1 ORDER BY t0.id ASC LIMIT 2) AS t0 \
             LEFT JOIN emails AS t1 ON t0.id = t1.student_id ORDER BY t0.id ASC FOR UPDATE OF t0"
        );
    }
}
