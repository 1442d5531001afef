//! In-memory execution engine
//!
//! Evaluates [`Statement`]s structurally against tables of plain rows
//! (unqualified column names), returning rows labelled the way a SQL
//! engine would return the rendered statement. Used by the test suite and
//! the demo; it records every statement it receives and can be told to
//! fail on a table.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use regex::Regex;

use super::core::{DatabaseValue, EngineTransaction, ExecutionEngine, Row};
use super::DatabaseBackendType;
use crate::error::{OrmError, OrmResult};
use crate::query::{
    column_label, Condition, Filter, JoinType, OrderClause, OrderDirection, QueryOperator,
    Statement,
};

#[derive(Debug, Default)]
struct MemoryState {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    executed: Mutex<Vec<Statement>>,
    failures: Mutex<HashMap<String, OrmError>>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// Table-backed engine that answers statements without SQL
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    backend: DatabaseBackendType,
    state: Arc<MemoryState>,
}

impl MemoryEngine {
    pub fn new(backend: DatabaseBackendType) -> Self {
        Self {
            backend,
            state: Arc::default(),
        }
    }

    /// Append a row to `table`
    pub fn insert(&self, table: &str, row: Row) {
        let mut tables = self.state.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn table_len(&self, table: &str) -> usize {
        let tables = self.state.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(table).map(Vec::len).unwrap_or(0)
    }

    /// Make every statement touching `table` fail with `error`
    pub fn fail_on(&self, table: &str, error: OrmError) {
        let mut failures = self.state.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.insert(table.to_string(), error);
    }

    pub fn clear_failures(&self) {
        let mut failures = self.state.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.clear();
    }

    /// Statements received so far, in order
    pub fn executed(&self) -> Vec<Statement> {
        self.state
            .executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn statement_count(&self) -> usize {
        self.state
            .executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn reset_log(&self) {
        self.state
            .executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn commit_count(&self) -> usize {
        self.state.commits.load(AtomicOrdering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.state.rollbacks.load(AtomicOrdering::SeqCst)
    }
}

impl MemoryState {
    fn run(&self, statement: &Statement) -> OrmResult<Vec<Row>> {
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(statement.clone());

        {
            let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let touched = std::iter::once(&statement.table).chain(statement.joins.iter().map(|j| &j.table));
            for table in touched {
                if let Some(error) = failures.get(table) {
                    return Err(error.clone());
                }
            }
        }

        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(evaluate(statement, &tables))
    }
}

#[async_trait]
impl ExecutionEngine for MemoryEngine {
    fn backend(&self) -> DatabaseBackendType {
        self.backend
    }

    async fn execute(&self, statement: &Statement) -> OrmResult<Vec<Row>> {
        self.state.run(statement)
    }

    async fn begin_transaction(&self) -> OrmResult<Box<dyn EngineTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Transaction over the shared tables; reads see every committed row
pub struct MemoryTransaction {
    state: Arc<MemoryState>,
}

#[async_trait]
impl EngineTransaction for MemoryTransaction {
    async fn execute(&mut self, statement: &Statement) -> OrmResult<Vec<Row>> {
        self.state.run(statement)
    }

    async fn commit(self: Box<Self>) -> OrmResult<()> {
        self.state.commits.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> OrmResult<()> {
        self.state.rollbacks.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }
}

/// One candidate result row: the row bound to each alias, `None` for an
/// outer join without a match
type Bound<'t> = HashMap<&'t str, Option<&'t Row>>;

fn evaluate(statement: &Statement, tables: &HashMap<String, Vec<Row>>) -> Vec<Row> {
    let base_alias = statement.alias.as_str();
    let base_rows = tables.get(&statement.table).map(Vec::as_slice).unwrap_or(&[]);

    let mut bound: Vec<Bound<'_>> = base_rows
        .iter()
        .map(|row| HashMap::from([(base_alias, Some(row))]))
        .collect();

    if statement.wrap_root {
        let base: Vec<&Condition> = statement.base_conditions().collect();
        bound.retain(|b| matches_all(&base, b));
        sort(&mut bound, statement.order_by.iter().filter(|o| o.alias == base_alias));
        page(&mut bound, statement.limit, statement.offset);
    }

    for join in &statement.joins {
        let rows = tables.get(&join.table).map(Vec::as_slice).unwrap_or(&[]);
        let mut joined = Vec::with_capacity(bound.len());
        for b in bound {
            let parent = b.get(join.parent_alias.as_str()).copied().flatten();
            let matches: Vec<&Row> = match parent {
                Some(parent) => rows
                    .iter()
                    .filter(|child| {
                        join.on.iter().all(|(p, c)| {
                            match (parent.get(p), child.get(c)) {
                                (Some(a), Some(b)) => a.compare(b) == Some(Ordering::Equal),
                                _ => false,
                            }
                        })
                    })
                    .collect(),
                None => Vec::new(),
            };

            if matches.is_empty() {
                if join.join_type == JoinType::Left {
                    let mut b = b;
                    b.insert(join.alias.as_str(), None);
                    joined.push(b);
                }
                continue;
            }
            for child in matches {
                let mut b = b.clone();
                b.insert(join.alias.as_str(), Some(child));
                joined.push(b);
            }
        }
        bound = joined;
    }

    let outer: Vec<&Condition> = statement
        .conditions
        .iter()
        .filter(|c| !statement.wrap_root || c.alias != base_alias)
        .collect();
    bound.retain(|b| matches_all(&outer, b));
    sort(&mut bound, statement.order_by.iter());
    if !statement.wrap_root {
        page(&mut bound, statement.limit, statement.offset);
    }

    bound
        .iter()
        .map(|b| {
            let mut row = Row::new();
            for column in &statement.select {
                let value = b
                    .get(column.alias.as_str())
                    .copied()
                    .flatten()
                    .and_then(|r| r.get(&column.column))
                    .cloned()
                    .unwrap_or(DatabaseValue::Null);
                row.push(column_label(&column.alias, &column.column), value);
            }
            row
        })
        .collect()
}

fn matches_all(conditions: &[&Condition], bound: &Bound<'_>) -> bool {
    conditions.iter().all(|c| {
        let row = bound.get(c.alias.as_str()).copied().flatten();
        eval(&c.filter, row) == Some(true)
    })
}

fn sort<'o, I>(bound: &mut [Bound<'_>], order: I)
where
    I: Iterator<Item = &'o OrderClause> + Clone,
{
    bound.sort_by(|a, b| {
        for clause in order.clone() {
            let left = value_of(a, &clause.alias, &clause.column);
            let right = value_of(b, &clause.alias, &clause.column);
            let ordering = match (left.is_null(), right.is_null()) {
                (true, true) => Ordering::Equal,
                // NULLS LAST for ascending, as PostgreSQL does
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => left.compare(&right).unwrap_or(Ordering::Equal),
            };
            let ordering = match clause.direction {
                OrderDirection::Asc => ordering,
                OrderDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn page<T>(rows: &mut Vec<T>, limit: Option<u64>, offset: Option<u64>) {
    let offset = offset.unwrap_or(0) as usize;
    if offset > 0 {
        rows.drain(..offset.min(rows.len()));
    }
    if let Some(limit) = limit {
        rows.truncate(limit as usize);
    }
}

fn value_of(bound: &Bound<'_>, alias: &str, column: &str) -> DatabaseValue {
    bound
        .get(alias)
        .copied()
        .flatten()
        .and_then(|r| r.get(column))
        .cloned()
        .unwrap_or(DatabaseValue::Null)
}

/// Three-valued filter evaluation; `None` is SQL's UNKNOWN
fn eval(filter: &Filter, row: Option<&Row>) -> Option<bool> {
    let get = |column: &str| -> DatabaseValue {
        row.and_then(|r| r.get(column))
            .cloned()
            .unwrap_or(DatabaseValue::Null)
    };

    match filter {
        Filter::Compare { column, op, value } => {
            let current = get(column);
            match op {
                QueryOperator::Like | QueryOperator::NotLike => {
                    let (Some(text), Some(pattern)) = (current.as_str(), value.as_str()) else {
                        return None;
                    };
                    let matched = like(text, pattern);
                    Some(if *op == QueryOperator::Like { matched } else { !matched })
                }
                _ => {
                    let ordering = current.compare(value)?;
                    Some(match op {
                        QueryOperator::Equal => ordering == Ordering::Equal,
                        QueryOperator::NotEqual => ordering != Ordering::Equal,
                        QueryOperator::GreaterThan => ordering == Ordering::Greater,
                        QueryOperator::GreaterThanOrEqual => ordering != Ordering::Less,
                        QueryOperator::LessThan => ordering == Ordering::Less,
                        QueryOperator::LessThanOrEqual => ordering != Ordering::Greater,
                        QueryOperator::Like | QueryOperator::NotLike => false,
                    })
                }
            }
        }
        Filter::In { column, values } => member(&get(column), values),
        Filter::NotIn { column, values } => member(&get(column), values).map(|m| !m),
        Filter::TupleIn { columns, tuples } => {
            let current: Vec<DatabaseValue> = columns.iter().map(|c| get(c)).collect();
            if current.iter().any(DatabaseValue::is_null) {
                return None;
            }
            Some(tuples.iter().any(|tuple| {
                tuple.len() == current.len()
                    && tuple
                        .iter()
                        .zip(&current)
                        .all(|(a, b)| a.compare(b) == Some(Ordering::Equal))
            }))
        }
        Filter::IsNull(column) => Some(get(column).is_null()),
        Filter::IsNotNull(column) => Some(!get(column).is_null()),
        Filter::Between { column, low, high } => {
            let current = get(column);
            let above = current.compare(low)? != Ordering::Less;
            let below = current.compare(high)? != Ordering::Greater;
            Some(above && below)
        }
        Filter::And(filters) => {
            let mut result = Some(true);
            for f in filters {
                match eval(f, row) {
                    Some(false) => return Some(false),
                    None => result = None,
                    Some(true) => {}
                }
            }
            result
        }
        Filter::Or(filters) => {
            let mut result = Some(false);
            for f in filters {
                match eval(f, row) {
                    Some(true) => return Some(true),
                    None => result = None,
                    Some(false) => {}
                }
            }
            result
        }
        Filter::Not(inner) => eval(inner, row).map(|v| !v),
    }
}

fn member(current: &DatabaseValue, values: &[DatabaseValue]) -> Option<bool> {
    if current.is_null() {
        return None;
    }
    Some(
        values
            .iter()
            .any(|v| current.compare(v) == Some(Ordering::Equal)),
    )
}

/// SQL `LIKE` with `%` and `_` wildcards
fn like(text: &str, pattern: &str) -> bool {
    let mut expr = String::from("(?s)^");
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    expr.push('$');
    Regex::new(&expr).map(|re| re.is_match(text)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{JoinClause, LockMode};

    fn engine() -> MemoryEngine {
        let engine = MemoryEngine::default();
        for (id, name) in [(1, "Alice"), (2, "Bob"), (3, "Carol")] {
            engine.insert(
                "students",
                Row::from_pairs([("id", DatabaseValue::Int32(id)), ("name", name.into())]),
            );
        }
        for (email, student) in [("a1@x", 1), ("a2@x", 1), ("b@x", 2)] {
            engine.insert(
                "emails",
                Row::from_pairs([("email", email.into()), ("student_id", DatabaseValue::Int32(student))]),
            );
        }
        engine
    }

    fn students_with_emails(join_type: JoinType) -> Statement {
        let mut statement = Statement::new(DatabaseBackendType::PostgreSQL, "students", "t0");
        statement.select_column("t0", "id");
        statement.select_column("t1", "email");
        statement.joins.push(JoinClause {
            join_type,
            table: "emails".to_string(),
            alias: "t1".to_string(),
            parent_alias: "t0".to_string(),
            on: vec![("id".to_string(), "student_id".to_string())],
        });
        statement.order_by.push(OrderClause {
            alias: "t0".to_string(),
            column: "id".to_string(),
            direction: OrderDirection::Asc,
        });
        statement
    }

    #[tokio::test]
    async fn test_left_and_inner_joins() {
        let engine = engine();
        let rows = engine.execute(&students_with_emails(JoinType::Left)).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3].get("t0__id"), Some(&DatabaseValue::Int32(3)));
        assert_eq!(rows[3].get("t1__email"), Some(&DatabaseValue::Null));

        let rows = engine.execute(&students_with_emails(JoinType::Inner)).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(engine.statement_count(), 2);
    }

    #[tokio::test]
    async fn test_wrapped_root_pages_before_joining() {
        let engine = engine();
        let mut statement = students_with_emails(JoinType::Left);
        statement.limit = Some(1);
        let rows = engine.execute(&statement).await.unwrap();
        assert_eq!(rows.len(), 1);

        statement.wrap_root = true;
        let rows = engine.execute(&statement).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_filters() {
        let engine = engine();
        let mut statement = Statement::new(DatabaseBackendType::PostgreSQL, "emails", "t0");
        statement.select_column("t0", "email");
        statement.add_condition("t0", Filter::like("email", "a%"));
        statement.add_condition("t0", Filter::is_in("student_id", vec![DatabaseValue::Int64(1)]));
        statement.lock = LockMode::ForUpdate;
        assert_eq!(engine.execute(&statement).await.unwrap().len(), 2);

        statement.add_condition("t0", Filter::Not(Box::new(Filter::eq("email", "a1@x"))));
        assert_eq!(engine.execute(&statement).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection_and_transactions() {
        let engine = engine();
        engine.fail_on("emails", OrmError::LockTimeout("row locked".into()));
        let err = engine
            .execute(&students_with_emails(JoinType::Left))
            .await
            .unwrap_err();
        assert_eq!(err, OrmError::LockTimeout("row locked".into()));

        let tx = engine.begin_transaction().await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(engine.rollback_count(), 1);
        assert_eq!(engine.commit_count(), 0);
    }

    #[test]
    fn test_like_patterns() {
        assert!(like("alice@school.example", "%@school.example"));
        assert!(like("bob", "b_b"));
        assert!(!like("bob", "a%"));
    }
}
