//! Query Plan Assembler
//!
//! Turns a root query plus classified fetches into an ordered plan. Step 0
//! is always the root statement, carrying every join-fetch that hangs off
//! the root or off another joined level. Each batched fetch becomes its own
//! step, ordered breadth-first by path depth, with its own joined
//! descendants merged into it.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::backends::DatabaseValue;
use crate::config::PlannerConfig;
use crate::error::{OrmError, OrmResult};
use crate::query::{
    Filter, JoinClause, JoinType, OrderClause, OrderDirection, RootQuery, Statement,
};
use crate::resolver::{RelationPath, RelationshipResolver};
use crate::schema::{EntityType, RelationshipSpec};
use super::selector::{AccessPolicy, LoadClass, Selection};

/// One entity level inside a statement: where its columns come from and
/// which levels are joined below it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadNode {
    pub path: RelationPath,
    pub entity: String,
    pub alias: String,
    pub primary_key: Vec<String>,
    /// Columns selected for this level
    pub columns: Vec<String>,
    /// Fields left out by a column projection
    pub unloaded: Vec<String>,
    pub children: Vec<JoinedRelation>,
}

impl LoadNode {
    fn find(&self, path: &RelationPath) -> Option<&LoadNode> {
        if &self.path == path {
            return Some(self);
        }
        self.children
            .iter()
            .find(|c| path.starts_with(&c.node.path))
            .and_then(|c| c.node.find(path))
    }

    fn find_mut(&mut self, path: &RelationPath) -> Option<&mut LoadNode> {
        if &self.path == path {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find(|c| path.starts_with(&c.node.path))
            .and_then(|c| c.node.find_mut(path))
    }

    fn incoming_join(&self, path: &RelationPath) -> Option<JoinType> {
        self.children.iter().find_map(|c| {
            if &c.node.path == path {
                Some(c.join_type)
            } else if path.starts_with(&c.node.path) {
                c.node.incoming_join(path)
            } else {
                None
            }
        })
    }

    /// Number of levels in this subtree, the node included
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(|c| c.node.len()).sum::<usize>()
    }
}

/// A relationship populated from joined columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedRelation {
    pub relationship: RelationshipSpec,
    pub join_type: JoinType,
    pub node: LoadNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Root,
    Batched {
        /// Step whose results contain the owners
        parent: usize,
        /// Level of the owning entities
        owner_path: RelationPath,
        relationship: RelationshipSpec,
    },
}

/// One statement of the plan and the shape of its rows
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub index: usize,
    pub depth: usize,
    pub kind: StepKind,
    /// For batched steps the owner-key filter is added per execution
    pub statement: Statement,
    pub shape: LoadNode,
}

impl PlanStep {
    pub fn is_root(&self) -> bool {
        matches!(self.kind, StepKind::Root)
    }

    pub fn relationship(&self) -> Option<&RelationshipSpec> {
        match &self.kind {
            StepKind::Root => None,
            StepKind::Batched { relationship, .. } => Some(relationship),
        }
    }

    /// Statement filtered to one chunk of owner keys
    pub fn keyed_statement(&self, keys: &[Vec<DatabaseValue>]) -> Statement {
        let mut statement = self.statement.clone();
        if let Some(relationship) = self.relationship() {
            let remote = &relationship.foreign_key.remote_columns;
            let filter = if remote.len() == 1 {
                Filter::In {
                    column: remote[0].clone(),
                    values: keys.iter().filter_map(|k| k.first().cloned()).collect(),
                }
            } else {
                Filter::tuple_in(remote, keys.to_vec())
            };
            statement.add_condition(&self.statement.alias, filter);
        }
        statement
    }
}

/// Ordered, executable plan for one query call
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    root_entity: String,
    steps: Vec<PlanStep>,
    policy: AccessPolicy,
}

impl QueryPlan {
    pub fn root_entity(&self) -> &str {
        &self.root_entity
    }

    /// Root statement with its join-fetches
    pub fn root(&self) -> &Statement {
        &self.steps[0].statement
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn statements(&self) -> Vec<&Statement> {
        self.steps.iter().map(|s| &s.statement).collect()
    }

    /// Number of statements, before any key chunking
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Batched steps grouped by depth; steps in one group share no state
    pub fn execution_phases(&self) -> Vec<Vec<usize>> {
        let mut phases: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for step in self.steps.iter().filter(|s| !s.is_root()) {
            phases.entry(step.depth).or_default().push(step.index);
        }
        phases.into_values().collect()
    }

    /// One rendered line per statement
    pub fn explain(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            let _ = match &step.kind {
                StepKind::Root => writeln!(
                    out,
                    "[{}] root {}: {}",
                    step.index,
                    self.root_entity,
                    step.statement.sql()
                ),
                StepKind::Batched {
                    parent,
                    relationship,
                    ..
                } => writeln!(
                    out,
                    "[{}] batched {} by ({}) after step {}: {}",
                    step.index,
                    relationship.qualified_name(),
                    relationship.foreign_key.remote_columns.join(", "),
                    parent,
                    step.statement.sql()
                ),
            };
        }
        out
    }
}

struct StepBuilder {
    step: PlanStep,
    next_alias: usize,
    multiplies: bool,
}

impl StepBuilder {
    fn alias(&mut self) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        alias
    }
}

/// Builds [`QueryPlan`]s
pub struct QueryPlanAssembler<'a> {
    resolver: &'a RelationshipResolver,
    config: &'a PlannerConfig,
}

impl<'a> QueryPlanAssembler<'a> {
    pub fn new(resolver: &'a RelationshipResolver, config: &'a PlannerConfig) -> Self {
        Self { resolver, config }
    }

    pub fn assemble(&self, query: &RootQuery, selection: Selection) -> OrmResult<QueryPlan> {
        let registry = self.resolver.registry();
        let root_type = registry.lookup(&query.entity)?;

        let mut root = self.base_step(
            root_type,
            RelationPath::root(),
            query.load_only.as_deref(),
            None,
            StepKind::Root,
            0,
        )?;

        for filter in &query.filters {
            check_columns(root_type, filter.columns())?;
            root.step.statement.add_condition("t0", filter.clone());
        }
        for order in &query.order_by {
            check_columns(root_type, [order.column.as_str()])?;
            root.step.statement.order_by.push(OrderClause {
                alias: "t0".to_string(),
                column: order.column.clone(),
                direction: order.direction,
            });
        }

        let explicit = self.explicit_joins(query, &mut root)?;

        let mut steps = vec![root];
        let mut host: BTreeMap<RelationPath, usize> = BTreeMap::new();
        host.insert(RelationPath::root(), 0);

        for fetch in &selection.fetches {
            let parent = fetch.path.parent().unwrap_or_default();
            let host_index = *host.get(&parent).ok_or_else(|| {
                OrmError::InvalidDirective(format!("'{}' is not reachable from a fetched level", fetch.path))
            })?;
            let target = registry.lookup(&fetch.spec.target)?;

            match fetch.class {
                LoadClass::JoinFetch {
                    join_type,
                    multiplies,
                    routed,
                } => {
                    let builder = &mut steps[host_index];
                    let parent_alias = node_alias(&builder.step.shape, &parent)?;
                    let parent_join = builder.step.shape.incoming_join(&parent);

                    let (alias, join_type) = if routed {
                        let alias = explicit.get(&fetch.path).cloned().ok_or_else(|| {
                            OrmError::InvalidDirective(format!(
                                "contains-eager on '{}' needs a matching join in the root query",
                                fetch.path
                            ))
                        })?;
                        (alias, JoinType::Inner)
                    } else {
                        // Below an outer join everything must stay outer
                        let join_type = if parent_join == Some(JoinType::Left) {
                            JoinType::Left
                        } else {
                            join_type
                        };
                        let alias = builder.alias();
                        builder.step.statement.joins.push(join_clause(
                            &fetch.spec,
                            &target.table,
                            &alias,
                            &parent_alias,
                            join_type,
                        ));
                        (alias, join_type)
                    };

                    let node = self.node(
                        target,
                        fetch.path.clone(),
                        alias,
                        fetch.load_only.as_deref(),
                        Some(&fetch.spec),
                    )?;
                    select_node(&mut builder.step.statement, &node);
                    builder.multiplies |= multiplies;

                    let parent_node = builder.step.shape.find_mut(&parent).ok_or_else(|| {
                        OrmError::InvalidDirective(format!("no loaded level at '{}'", parent))
                    })?;
                    parent_node.children.push(JoinedRelation {
                        relationship: fetch.spec.clone(),
                        join_type,
                        node,
                    });
                    host.insert(fetch.path.clone(), host_index);
                }
                LoadClass::BatchedFetch { .. } => {
                    let index = steps.len();
                    let builder = self.base_step(
                        target,
                        fetch.path.clone(),
                        fetch.load_only.as_deref(),
                        Some(&fetch.spec),
                        StepKind::Batched {
                            parent: host_index,
                            owner_path: parent,
                            relationship: fetch.spec.clone(),
                        },
                        index,
                    )?;
                    steps.push(builder);
                    host.insert(fetch.path.clone(), index);
                }
                LoadClass::Forbidden | LoadClass::ImplicitLazy => {}
            }
        }

        let root = &mut steps[0];
        let statement = &mut root.step.statement;
        statement.limit = query.limit;
        statement.offset = query.offset;
        statement.lock = query.lock;
        statement.wrap_root = query.is_paged() && root.multiplies;

        let plan = QueryPlan {
            root_entity: query.entity.clone(),
            steps: steps.into_iter().map(|b| b.step).collect(),
            policy: selection.policy,
        };

        tracing::debug!(
            "Assembled plan for {}: {} statement(s), {} joined level(s) in root",
            plan.root_entity,
            plan.len(),
            plan.steps[0].shape.len() - 1
        );

        Ok(plan)
    }

    /// Statement that fetches the targets of `spec` for one owner
    pub fn relation_statement(
        &self,
        spec: &RelationshipSpec,
        level: RelationPath,
        key: &[DatabaseValue],
    ) -> OrmResult<(Statement, LoadNode)> {
        let target = self.resolver.registry().lookup(&spec.target)?;
        let builder = self.base_step(
            target,
            level,
            None,
            Some(spec),
            StepKind::Batched {
                parent: 0,
                owner_path: RelationPath::root(),
                relationship: spec.clone(),
            },
            0,
        )?;
        let statement = builder.step.keyed_statement(&[key.to_vec()]);
        Ok((statement, builder.step.shape))
    }

    fn base_step(
        &self,
        entity: &EntityType,
        path: RelationPath,
        load_only: Option<&[String]>,
        binding: Option<&RelationshipSpec>,
        kind: StepKind,
        index: usize,
    ) -> OrmResult<StepBuilder> {
        let mut statement = Statement::new(self.config.backend, &entity.table, "t0");
        let depth = path.depth();
        let shape = self.node(entity, path, "t0".to_string(), load_only, binding)?;
        select_node(&mut statement, &shape);

        if !matches!(kind, StepKind::Root) {
            for column in &entity.primary_key {
                statement.order_by.push(OrderClause {
                    alias: "t0".to_string(),
                    column: column.clone(),
                    direction: OrderDirection::Asc,
                });
            }
        }

        Ok(StepBuilder {
            step: PlanStep {
                index,
                depth,
                kind,
                statement,
                shape,
            },
            next_alias: 1,
            multiplies: false,
        })
    }

    fn node(
        &self,
        entity: &EntityType,
        path: RelationPath,
        alias: String,
        load_only: Option<&[String]>,
        binding: Option<&RelationshipSpec>,
    ) -> OrmResult<LoadNode> {
        let (columns, unloaded) = projection(entity, load_only, binding)?;
        Ok(LoadNode {
            path,
            entity: entity.name.clone(),
            alias,
            primary_key: entity.primary_key.clone(),
            columns,
            unloaded,
            children: Vec::new(),
        })
    }

    /// Add the caller's joins to the root statement, prefixes first
    fn explicit_joins(
        &self,
        query: &RootQuery,
        root: &mut StepBuilder,
    ) -> OrmResult<BTreeMap<RelationPath, String>> {
        let mut paths: Vec<RelationPath> = Vec::new();
        for join in &query.joins {
            for path in join.path.ancestors().chain(std::iter::once(join.path.clone())) {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths.sort_by_key(|p| p.depth());

        let mut aliases: BTreeMap<RelationPath, String> = BTreeMap::new();
        for path in paths {
            let spec = self
                .resolver
                .resolve(&query.entity, &path)?
                .pop()
                .ok_or_else(|| OrmError::InvalidDirective("empty join path".to_string()))?;
            let target = self.resolver.registry().lookup(&spec.target)?;
            let parent_alias = match path.parent() {
                Some(parent) if !parent.is_root() => aliases
                    .get(&parent)
                    .cloned()
                    .unwrap_or_else(|| "t0".to_string()),
                _ => "t0".to_string(),
            };

            let alias = root.alias();
            root.step.statement.joins.push(join_clause(
                &spec,
                &target.table,
                &alias,
                &parent_alias,
                JoinType::Inner,
            ));
            root.multiplies |= spec.is_collection();

            if let Some(join) = query.explicit_join(&path) {
                for filter in &join.filters {
                    check_columns(target, filter.columns())?;
                    root.step.statement.add_condition(&alias, filter.clone());
                }
            }
            aliases.insert(path, alias);
        }

        Ok(aliases)
    }
}

fn join_clause(
    spec: &RelationshipSpec,
    table: &str,
    alias: &str,
    parent_alias: &str,
    join_type: JoinType,
) -> JoinClause {
    JoinClause {
        join_type,
        table: table.to_string(),
        alias: alias.to_string(),
        parent_alias: parent_alias.to_string(),
        on: spec
            .foreign_key
            .pairs()
            .map(|(local, remote)| (local.to_string(), remote.to_string()))
            .collect(),
    }
}

fn node_alias(shape: &LoadNode, path: &RelationPath) -> OrmResult<String> {
    shape
        .find(path)
        .map(|n| n.alias.clone())
        .ok_or_else(|| OrmError::InvalidDirective(format!("no loaded level at '{}'", path)))
}

fn select_node(statement: &mut Statement, node: &LoadNode) {
    for column in &node.columns {
        statement.select_column(&node.alias, column);
    }
}

fn check_columns<'c, I>(entity: &EntityType, columns: I) -> OrmResult<()>
where
    I: IntoIterator<Item = &'c str>,
{
    for column in columns {
        if !entity.has_field(column) {
            return Err(OrmError::UnknownField {
                entity: entity.name.clone(),
                field: column.to_string(),
            });
        }
    }
    Ok(())
}

/// Loaded and unloaded columns for one level
///
/// Key columns, the version column and the columns binding the level to
/// its owner are always loaded.
fn projection(
    entity: &EntityType,
    load_only: Option<&[String]>,
    binding: Option<&RelationshipSpec>,
) -> OrmResult<(Vec<String>, Vec<String>)> {
    let Some(requested) = load_only else {
        return Ok((entity.field_names().map(str::to_string).collect(), Vec::new()));
    };
    check_columns(entity, requested.iter().map(String::as_str))?;

    let mut required = entity.key_columns();
    required.extend(entity.version_field.iter().cloned());
    if let Some(spec) = binding {
        required.extend(spec.foreign_key.remote_columns.iter().cloned());
    }

    let (columns, unloaded): (Vec<String>, Vec<String>) = entity
        .field_names()
        .map(str::to_string)
        .partition(|f| requested.contains(f) || required.contains(f));
    Ok((columns, unloaded))
}
