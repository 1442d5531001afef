//! Plan execution and row demultiplexing
//!
//! Rows are hydrated into an arena of slots first and turned into guarded
//! [`Entity`] trees only once every step has run. Joined rows are grouped
//! by the primary key of each level, so a multiplying join yields one
//! entity per distinct key.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::backends::{key_tuple, DatabaseValue, EngineTransaction, ExecutionEngine, KeyTuple, Row};
use crate::config::PlannerConfig;
use crate::error::{ExecutionFailure, OrmError, OrmResult};
use crate::graph::{Entity, LoadContext, Related, RelationState};
use crate::query::{column_label, Statement};
use crate::resolver::RelationPath;
use crate::schema::{Cardinality, RelationshipSpec};
use super::assembler::{LoadNode, PlanStep, QueryPlan, StepKind};
use super::selector::{AccessPolicy, AccessRule};

/// Statistics about one plan execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionStats {
    /// Statements sent to the engine, chunks included
    pub query_count: usize,
    pub rows_fetched: usize,
    /// Batched steps that matched no owner key and ran no statement
    pub skipped_steps: usize,
    /// Phases whose statements were dispatched concurrently
    pub parallel_phases: usize,
    pub total_duration: Duration,
}

#[derive(Debug, Clone)]
enum Loaded {
    One(Option<usize>),
    Many(Vec<usize>),
}

impl Loaded {
    fn empty(cardinality: Cardinality) -> Self {
        match cardinality {
            Cardinality::One => Loaded::One(None),
            Cardinality::Many => Loaded::Many(Vec::new()),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    entity: String,
    level: RelationPath,
    values: BTreeMap<String, DatabaseValue>,
    unloaded: Vec<String>,
    relations: BTreeMap<String, Loaded>,
}

impl Slot {
    fn attach(&mut self, relationship: &str, child: usize) {
        match self.relations.get_mut(relationship) {
            Some(Loaded::Many(children)) => children.push(child),
            Some(Loaded::One(current)) => {
                if current.is_none() {
                    *current = Some(child);
                }
            }
            None => {}
        }
    }
}

/// Hydrated rows of one execution, indexed by level
#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    levels: BTreeMap<RelationPath, Vec<usize>>,
    roots: Vec<usize>,
}

impl Arena {
    /// Group `rows` by the primary key of every level of `shape`
    ///
    /// Returns the distinct base slots in order of first appearance. Levels
    /// are not registered; see [`Arena::register`].
    pub(crate) fn hydrate(&mut self, shape: &LoadNode, rows: &[Row]) -> Vec<usize> {
        let mut bases: HashMap<KeyTuple, usize> = HashMap::new();
        let mut order = Vec::new();
        let mut seen: HashMap<(usize, String, KeyTuple), usize> = HashMap::new();

        for row in rows {
            let Some(key) = node_key(shape, row) else {
                continue;
            };
            let slot = match bases.get(&key) {
                Some(&slot) => slot,
                None => {
                    let slot = self.new_slot(shape, row);
                    bases.insert(key, slot);
                    order.push(slot);
                    slot
                }
            };
            self.hydrate_joined(shape, slot, row, &mut seen);
        }

        order
    }

    fn hydrate_joined(
        &mut self,
        node: &LoadNode,
        owner: usize,
        row: &Row,
        seen: &mut HashMap<(usize, String, KeyTuple), usize>,
    ) {
        for joined in &node.children {
            let child = &joined.node;
            // Outer join with no match
            let Some(key) = node_key(child, row) else {
                continue;
            };
            let name = &joined.relationship.name;
            let seen_key = (owner, name.clone(), key);
            let slot = match seen.get(&seen_key) {
                Some(&slot) => slot,
                None => {
                    let slot = self.new_slot(child, row);
                    seen.insert(seen_key, slot);
                    self.slots[owner].attach(name, slot);
                    slot
                }
            };
            self.hydrate_joined(child, slot, row, seen);
        }
    }

    fn new_slot(&mut self, node: &LoadNode, row: &Row) -> usize {
        let values = node
            .columns
            .iter()
            .map(|column| {
                let value = row
                    .get(&column_label(&node.alias, column))
                    .cloned()
                    .unwrap_or(DatabaseValue::Null);
                (column.clone(), value)
            })
            .collect();
        let relations = node
            .children
            .iter()
            .map(|c| {
                (
                    c.relationship.name.clone(),
                    Loaded::empty(c.relationship.cardinality),
                )
            })
            .collect();

        self.slots.push(Slot {
            entity: node.entity.clone(),
            level: node.path.clone(),
            values,
            unloaded: node.unloaded.clone(),
            relations,
        });
        self.slots.len() - 1
    }

    /// Copy a slot and everything hanging off it
    fn deep_clone(&mut self, slot: usize) -> usize {
        let source = self.slots[slot].clone();
        let mut relations = BTreeMap::new();
        for (name, loaded) in &source.relations {
            let copy = match loaded {
                Loaded::One(child) => Loaded::One(child.map(|c| self.deep_clone(c))),
                Loaded::Many(children) => {
                    Loaded::Many(children.iter().map(|&c| self.deep_clone(c)).collect())
                }
            };
            relations.insert(name.clone(), copy);
        }
        self.slots.push(Slot { relations, ..source });
        self.slots.len() - 1
    }

    /// Make a slot and its subtree visible as owners for later steps
    fn register(&mut self, slot: usize) {
        self.levels
            .entry(self.slots[slot].level.clone())
            .or_default()
            .push(slot);
        let children: Vec<usize> = self.slots[slot]
            .relations
            .values()
            .flat_map(|loaded| match loaded {
                Loaded::One(child) => child.iter().copied().collect::<Vec<_>>(),
                Loaded::Many(children) => children.clone(),
            })
            .collect();
        for child in children {
            self.register(child);
        }
    }

    /// Distinct owner-side keys at `level`, initializing the relationship
    /// on every owner so that unmatched owners end up empty
    fn owner_keys(&mut self, level: &RelationPath, spec: &RelationshipSpec) -> Vec<Vec<DatabaseValue>> {
        let owners = self.levels.get(level).cloned().unwrap_or_default();
        let mut seen: HashSet<KeyTuple> = HashSet::new();
        let mut keys = Vec::new();

        for owner in owners {
            let slot = &mut self.slots[owner];
            slot.relations
                .insert(spec.name.clone(), Loaded::empty(spec.cardinality));
            let local = &spec.foreign_key.local_columns;
            if let Some(key) = key_tuple(local, |c| slot.values.get(c)) {
                if seen.insert(key) {
                    keys.push(
                        local
                            .iter()
                            .map(|c| slot.values.get(c).cloned().unwrap_or(DatabaseValue::Null))
                            .collect(),
                    );
                }
            }
        }

        keys
    }

    /// Hand the rows of a batched step to their owners
    fn associate(&mut self, step: &PlanStep, owner_level: &RelationPath, spec: &RelationshipSpec, rows: &[Row]) {
        let prototypes = self.hydrate(&step.shape, rows);

        let mut by_key: HashMap<KeyTuple, Vec<usize>> = HashMap::new();
        for prototype in prototypes {
            let values = &self.slots[prototype].values;
            if let Some(key) = key_tuple(&spec.foreign_key.remote_columns, |c| values.get(c)) {
                by_key.entry(key).or_default().push(prototype);
            }
        }

        let owners = self.levels.get(owner_level).cloned().unwrap_or_default();
        let mut used: HashSet<usize> = HashSet::new();
        for owner in owners {
            let values = &self.slots[owner].values;
            let Some(key) = key_tuple(&spec.foreign_key.local_columns, |c| values.get(c)) else {
                continue;
            };
            let Some(matches) = by_key.get(&key) else {
                continue;
            };
            let take = match spec.cardinality {
                Cardinality::One => 1,
                Cardinality::Many => matches.len(),
            };
            for &prototype in matches.iter().take(take) {
                // Every owner gets its own copy of a shared target
                let child = if used.insert(prototype) {
                    prototype
                } else {
                    self.deep_clone(prototype)
                };
                self.slots[owner].attach(&spec.name, child);
                self.register(child);
            }
        }
    }

    /// Turn the root slots into guarded entities bound to `context`
    pub(crate) fn materialize(&self, context: &Arc<LoadContext>) -> OrmResult<Vec<Entity>> {
        self.roots
            .iter()
            .map(|&slot| self.entity(slot, context))
            .collect()
    }

    /// Entities for the given base slots
    pub(crate) fn entities(&self, slots: &[usize], context: &Arc<LoadContext>) -> OrmResult<Vec<Entity>> {
        slots.iter().map(|&slot| self.entity(slot, context)).collect()
    }

    fn entity(&self, slot: usize, context: &Arc<LoadContext>) -> OrmResult<Entity> {
        let source = &self.slots[slot];
        let entity_type = context.registry.lookup(&source.entity)?;

        let mut relations = BTreeMap::new();
        for spec in &entity_type.relationships {
            let state = match source.relations.get(&spec.name) {
                Some(Loaded::One(child)) => RelationState::Populated(Related::One(
                    child
                        .map(|c| self.entity(c, context).map(Box::new))
                        .transpose()?,
                )),
                Some(Loaded::Many(children)) => RelationState::Populated(Related::Many(
                    children
                        .iter()
                        .map(|&c| self.entity(c, context))
                        .collect::<OrmResult<Vec<_>>>()?,
                )),
                None => unfetched_state(&context.policy, &source.level, &spec.name),
            };
            relations.insert(spec.name.clone(), state);
        }

        Ok(Entity {
            entity_type: source.entity.clone(),
            level: source.level.clone(),
            values: source.values.clone(),
            unloaded: source.unloaded.clone(),
            version_field: entity_type.version_field.clone(),
            relations,
            context: Arc::downgrade(context),
        })
    }

    pub(crate) fn root_count(&self) -> usize {
        self.roots.len()
    }
}

fn unfetched_state(policy: &AccessPolicy, level: &RelationPath, name: &str) -> RelationState {
    match policy.rule_for(level, name) {
        AccessRule::Forbidden => RelationState::Forbidden,
        AccessRule::NotRequested => RelationState::NotRequested,
        AccessRule::Guarded => RelationState::Guarded,
    }
}

fn node_key(node: &LoadNode, row: &Row) -> Option<KeyTuple> {
    key_tuple(&node.primary_key, |c| row.get(&column_label(&node.alias, c)))
}

/// Where statements go: straight to the engine or into an open transaction
enum Runner<'r> {
    Engine(&'r dyn ExecutionEngine),
    Transaction(&'r mut dyn EngineTransaction),
}

impl Runner<'_> {
    async fn execute(&mut self, statement: &Statement) -> OrmResult<Vec<Row>> {
        match self {
            Runner::Engine(engine) => engine.execute(statement).await,
            Runner::Transaction(tx) => tx.execute(statement).await,
        }
    }
}

/// Runs a [`QueryPlan`] against an execution engine
pub struct PlanExecutor<'p> {
    plan: &'p QueryPlan,
    config: &'p PlannerConfig,
    cancel: CancellationToken,
}

impl<'p> PlanExecutor<'p> {
    pub fn new(plan: &'p QueryPlan, config: &'p PlannerConfig) -> Self {
        Self {
            plan,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between statements once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub(crate) async fn run(
        &self,
        engine: &dyn ExecutionEngine,
    ) -> Result<(Arena, ExecutionStats), ExecutionFailure> {
        self.run_with(Runner::Engine(engine)).await
    }

    pub(crate) async fn run_in_transaction(
        &self,
        tx: &mut dyn EngineTransaction,
    ) -> Result<(Arena, ExecutionStats), ExecutionFailure> {
        self.run_with(Runner::Transaction(tx)).await
    }

    async fn run_with(&self, mut runner: Runner<'_>) -> Result<(Arena, ExecutionStats), ExecutionFailure> {
        let start = Instant::now();
        let mut arena = Arena::default();
        let mut stats = ExecutionStats::default();
        let mut completed: Vec<usize> = Vec::new();

        let root = &self.plan.steps()[0];
        let rows = self
            .dispatch(&mut runner, &root.statement)
            .await
            .map_err(|e| self.fail(&completed, 0, e))?;
        stats.query_count += 1;
        stats.rows_fetched += rows.len();
        arena.roots = arena.hydrate(&root.shape, &rows);
        for slot in arena.roots.clone() {
            arena.register(slot);
        }
        completed.push(0);
        tracing::debug!(
            "Root statement for {} returned {} row(s), {} distinct root(s)",
            self.plan.root_entity(),
            rows.len(),
            arena.roots.len()
        );

        for phase in self.plan.execution_phases() {
            let mut batches: Vec<(usize, Vec<Statement>)> = Vec::new();
            for &index in &phase {
                let step = &self.plan.steps()[index];
                let StepKind::Batched {
                    owner_path,
                    relationship,
                    ..
                } = &step.kind
                else {
                    continue;
                };

                let keys = arena.owner_keys(owner_path, relationship);
                if keys.is_empty() {
                    tracing::warn!(
                        "Batched fetch of {} has no owner keys; skipping statement",
                        relationship.qualified_name()
                    );
                    stats.skipped_steps += 1;
                    completed.push(index);
                    continue;
                }

                let statements = keys
                    .chunks(self.config.max_batch_size.max(1))
                    .map(|chunk| step.keyed_statement(chunk))
                    .collect();
                batches.push((index, statements));
            }

            let concurrent = match &runner {
                Runner::Engine(engine)
                    if self.config.parallel_batches
                        && batches.iter().map(|(_, s)| s.len()).sum::<usize>() > 1 =>
                {
                    Some(*engine)
                }
                _ => None,
            };
            let results = match concurrent {
                Some(engine) => {
                    stats.parallel_phases += 1;
                    self.dispatch_concurrent(engine, &batches).await
                }
                None => self.dispatch_sequential(&mut runner, &batches).await,
            };

            let mut failure: Option<(usize, OrmError)> = None;
            for ((index, statements), result) in batches.iter().zip(results) {
                match result {
                    Ok(rows) => {
                        stats.query_count += statements.len();
                        stats.rows_fetched += rows.len();
                        if failure.is_none() {
                            let step = &self.plan.steps()[*index];
                            if let StepKind::Batched {
                                owner_path,
                                relationship,
                                ..
                            } = &step.kind
                            {
                                arena.associate(step, owner_path, relationship, &rows);
                            }
                            tracing::debug!(
                                "Step {} fetched {} row(s) in {} statement(s)",
                                index,
                                rows.len(),
                                statements.len()
                            );
                        }
                        completed.push(*index);
                    }
                    Err(error) => {
                        if failure.is_none() {
                            failure = Some((*index, error));
                        }
                    }
                }
            }

            if let Some((index, error)) = failure {
                return Err(self.fail(&completed, index, error));
            }
        }

        stats.total_duration = start.elapsed();
        Ok((arena, stats))
    }

    /// Run one statement unless the plan has been cancelled
    ///
    /// Cancellation is only observed here; a dispatched statement always
    /// runs to completion.
    async fn dispatch(&self, runner: &mut Runner<'_>, statement: &Statement) -> OrmResult<Vec<Row>> {
        if self.cancel.is_cancelled() {
            return Err(OrmError::Cancelled);
        }
        tracing::debug!("Dispatching: {}", statement.sql());
        runner.execute(statement).await
    }

    /// One result per step, its chunks merged; stops at the first failure
    async fn dispatch_sequential(
        &self,
        runner: &mut Runner<'_>,
        batches: &[(usize, Vec<Statement>)],
    ) -> Vec<OrmResult<Vec<Row>>> {
        let mut results = Vec::with_capacity(batches.len());
        for (_, statements) in batches {
            let mut merged = Vec::new();
            let mut outcome = Ok(());
            for statement in statements {
                match self.dispatch(runner, statement).await {
                    Ok(rows) => merged.extend(rows),
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            }
            let failed = outcome.is_err();
            results.push(outcome.map(|_| merged));
            if failed {
                break;
            }
        }
        results
    }

    async fn dispatch_concurrent(
        &self,
        engine: &dyn ExecutionEngine,
        batches: &[(usize, Vec<Statement>)],
    ) -> Vec<OrmResult<Vec<Row>>> {
        let futures = batches.iter().map(|(_, statements)| async move {
            let chunks = join_all(statements.iter().map(|statement| async move {
                self.dispatch(&mut Runner::Engine(engine), statement).await
            }))
            .await;
            let mut merged = Vec::new();
            for chunk in chunks {
                merged.extend(chunk?);
            }
            Ok::<_, OrmError>(merged)
        });
        join_all(futures).await
    }

    fn fail(&self, completed: &[usize], failed_at: usize, error: OrmError) -> ExecutionFailure {
        if error == OrmError::Cancelled {
            tracing::warn!(
                "Plan for {} cancelled before step {}",
                self.plan.root_entity(),
                failed_at
            );
        }
        let mut completed = completed.to_vec();
        completed.sort_unstable();
        ExecutionFailure::new(completed, Some(failed_at), error)
    }
}
