//! Result graphs
//!
//! A [`ResultGraph`] owns the query context its entities were loaded in.
//! Entities only hold a weak handle to it: once the graph is dropped, any
//! access that would need a fetch fails with `DetachedAccessError`.

pub mod entity;
pub mod hooks;

pub use entity::{Entity, Related, RelationState};
pub use hooks::InverseHook;

use std::sync::Arc;

use crate::backends::{DatabaseValue, ExecutionEngine};
use crate::config::PlannerConfig;
use crate::error::{OrmError, OrmResult};
use crate::loading::assembler::QueryPlanAssembler;
use crate::loading::executor::{Arena, ExecutionStats};
use crate::loading::selector::AccessPolicy;
use crate::resolver::RelationshipResolver;
use crate::schema::{Cardinality, SchemaRegistry};

/// Everything a guarded lazy fetch needs after the plan has run
pub struct LoadContext {
    pub(crate) engine: Arc<dyn ExecutionEngine>,
    pub(crate) registry: SchemaRegistry,
    pub(crate) config: Arc<PlannerConfig>,
    pub(crate) policy: AccessPolicy,
}

impl LoadContext {
    pub(crate) fn new(
        engine: Arc<dyn ExecutionEngine>,
        registry: SchemaRegistry,
        config: Arc<PlannerConfig>,
        policy: AccessPolicy,
    ) -> Self {
        Self {
            engine,
            registry,
            config,
            policy,
        }
    }
}

impl std::fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadContext")
            .field("backend", &self.engine.backend())
            .field("entities", &self.registry.len())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Root entities of one executed plan
#[derive(Debug)]
pub struct ResultGraph {
    context: Arc<LoadContext>,
    roots: Vec<Entity>,
    stats: ExecutionStats,
}

impl ResultGraph {
    pub(crate) fn new(context: Arc<LoadContext>, roots: Vec<Entity>, stats: ExecutionStats) -> Self {
        Self {
            context,
            roots,
            stats,
        }
    }

    pub fn roots(&self) -> &[Entity] {
        &self.roots
    }

    pub fn roots_mut(&mut self) -> &mut [Entity] {
        &mut self.roots
    }

    pub fn get(&self, index: usize) -> Option<&Entity> {
        self.roots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Entity> {
        self.roots.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entity> {
        self.roots.iter()
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.context.policy
    }

    /// Consistency hook for the schema these entities belong to
    pub fn inverse_hook(&self) -> InverseHook<'_> {
        InverseHook::new(&self.context.registry)
    }

    /// Add `child` to root `index`'s collection `relationship`, keeping a
    /// declared inverse in step
    pub fn attach(&mut self, index: usize, relationship: &str, child: Entity) -> OrmResult<()> {
        let parent = self
            .roots
            .get_mut(index)
            .ok_or_else(|| OrmError::InvalidDirective(format!("no root entity at index {}", index)))?;
        InverseHook::new(&self.context.registry).attach(parent, relationship, child)
    }

    /// Set root `index`'s single-valued `relationship`
    pub fn assign(&mut self, index: usize, relationship: &str, child: Option<Entity>) -> OrmResult<()> {
        let parent = self
            .roots
            .get_mut(index)
            .ok_or_else(|| OrmError::InvalidDirective(format!("no root entity at index {}", index)))?;
        InverseHook::new(&self.context.registry).assign(parent, relationship, child)
    }

    /// Give up the query context; the entities become detached
    pub fn into_roots(self) -> Vec<Entity> {
        self.roots
    }
}

impl std::ops::Index<usize> for ResultGraph {
    type Output = Entity;

    fn index(&self, index: usize) -> &Entity {
        &self.roots[index]
    }
}

impl IntoIterator for ResultGraph {
    type Item = Entity;
    type IntoIter = std::vec::IntoIter<Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.roots.into_iter()
    }
}

impl<'g> IntoIterator for &'g ResultGraph {
    type Item = &'g Entity;
    type IntoIter = std::slice::Iter<'g, Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.roots.iter()
    }
}

/// The single fetch behind a `Guarded` relationship
pub(crate) async fn fetch_relation(
    context: &Arc<LoadContext>,
    owner: &Entity,
    name: &str,
) -> OrmResult<Related> {
    let spec = context.registry.relationship(&owner.entity_type, name)?;

    let mut key: Vec<DatabaseValue> = Vec::with_capacity(spec.foreign_key.local_columns.len());
    for column in &spec.foreign_key.local_columns {
        match owner.values.get(column) {
            Some(value) if !value.is_null() => key.push(value.clone()),
            _ => return Ok(empty(spec.cardinality)),
        }
    }

    let resolver = RelationshipResolver::new(context.registry.clone());
    let assembler = QueryPlanAssembler::new(&resolver, &context.config);
    let (statement, shape) = assembler.relation_statement(spec, owner.level.child(name), &key)?;

    tracing::debug!("Lazy fetch of {}: {}", spec.qualified_name(), statement.sql());
    let rows = context.engine.execute(&statement).await?;

    let mut arena = Arena::default();
    let slots = arena.hydrate(&shape, &rows);
    let entities = arena.entities(&slots, context)?;

    Ok(match spec.cardinality {
        Cardinality::One => Related::One(entities.into_iter().next().map(Box::new)),
        Cardinality::Many => Related::Many(entities),
    })
}

fn empty(cardinality: Cardinality) -> Related {
    match cardinality {
        Cardinality::One => Related::One(None),
        Cardinality::Many => Related::Many(Vec::new()),
    }
}
