//! Caller-facing planner
//!
//! `plan()` validates a directive set against the sealed registry and
//! returns an immutable [`QueryPlan`] without touching the engine.
//! `execute()` runs a plan through an explicitly passed engine handle and
//! returns a [`ResultGraph`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backends::ExecutionEngine;
use crate::config::PlannerConfig;
use crate::error::{ExecutionFailure, OrmError, OrmResult};
use crate::graph::{LoadContext, ResultGraph};
use crate::loading::executor::{Arena, ExecutionStats, PlanExecutor};
use crate::loading::{LoadDirective, LoadStrategySelector, QueryPlan, QueryPlanAssembler};
use crate::query::RootQuery;
use crate::resolver::RelationshipResolver;
use crate::schema::SchemaRegistry;
use crate::transaction::TransactionScope;

/// Plans and executes eager-loading queries over one sealed registry
#[derive(Debug, Clone)]
pub struct Planner {
    registry: SchemaRegistry,
    resolver: RelationshipResolver,
    config: Arc<PlannerConfig>,
}

impl Planner {
    pub fn new(registry: SchemaRegistry, config: PlannerConfig) -> OrmResult<Self> {
        config.validate()?;
        tracing::debug!(
            "Planner ready for {} entity type(s) on {}",
            registry.len(),
            config.backend
        );
        Ok(Self {
            resolver: RelationshipResolver::new(registry.clone()),
            registry,
            config: Arc::new(config),
        })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Build the plan for `query` under `directives`
    ///
    /// Every planning error is returned before any statement exists.
    pub fn plan(&self, query: &RootQuery, directives: &[LoadDirective]) -> OrmResult<QueryPlan> {
        let selection = LoadStrategySelector::new(&self.resolver, &self.config).select(query, directives)?;
        let plan = QueryPlanAssembler::new(&self.resolver, &self.config).assemble(query, selection)?;
        tracing::debug!(
            "Planned {} statement(s) for {} with {} directive(s)",
            plan.len(),
            query.entity,
            directives.len()
        );
        Ok(plan)
    }

    /// Run `plan` against `engine`
    pub async fn execute(
        &self,
        engine: Arc<dyn ExecutionEngine>,
        plan: &QueryPlan,
    ) -> Result<ResultGraph, ExecutionFailure> {
        self.execute_with_cancellation(engine, plan, CancellationToken::new())
            .await
    }

    /// Run `plan`, stopping before the next statement once `token` is cancelled
    pub async fn execute_with_cancellation(
        &self,
        engine: Arc<dyn ExecutionEngine>,
        plan: &QueryPlan,
        token: CancellationToken,
    ) -> Result<ResultGraph, ExecutionFailure> {
        self.check_backend(engine.as_ref())?;
        let (arena, stats) = PlanExecutor::new(plan, &self.config)
            .with_cancellation(token)
            .run(engine.as_ref())
            .await?;
        self.finish(engine, plan, arena, stats)
    }

    /// Run `plan` on the transaction held by `scope`
    ///
    /// Statements run one after another; `parallel_batches` does not apply.
    pub async fn execute_in(
        &self,
        scope: &mut TransactionScope,
        plan: &QueryPlan,
    ) -> Result<ResultGraph, ExecutionFailure> {
        let engine = scope.engine().clone();
        self.check_backend(engine.as_ref())?;
        let tx = scope
            .handle()
            .map_err(|e| ExecutionFailure::new(Vec::new(), None, e))?;
        let (arena, stats) = PlanExecutor::new(plan, &self.config)
            .run_in_transaction(tx)
            .await?;
        self.finish(engine, plan, arena, stats)
    }

    /// Plan and execute in one call
    pub async fn load(
        &self,
        engine: Arc<dyn ExecutionEngine>,
        query: &RootQuery,
        directives: &[LoadDirective],
    ) -> OrmResult<ResultGraph> {
        let plan = self.plan(query, directives)?;
        Ok(self.execute(engine, &plan).await?)
    }

    /// Statements are rendered for the configured dialect; refuse any other engine
    fn check_backend(&self, engine: &dyn ExecutionEngine) -> Result<(), ExecutionFailure> {
        if engine.backend() == self.config.backend {
            return Ok(());
        }
        Err(ExecutionFailure::new(
            Vec::new(),
            None,
            OrmError::Configuration(format!(
                "planner is configured for {} but the engine speaks {}",
                self.config.backend,
                engine.backend()
            )),
        ))
    }

    fn finish(
        &self,
        engine: Arc<dyn ExecutionEngine>,
        plan: &QueryPlan,
        arena: Arena,
        stats: ExecutionStats,
    ) -> Result<ResultGraph, ExecutionFailure> {
        let context = Arc::new(LoadContext::new(
            engine,
            self.registry.clone(),
            Arc::clone(&self.config),
            plan.policy().clone(),
        ));
        let roots = arena
            .materialize(&context)
            .map_err(|e| ExecutionFailure::new((0..plan.len()).collect(), None, e))?;

        tracing::debug!(
            "Materialized {} {} root(s) from {} statement(s) in {:?}",
            arena.root_count(),
            plan.root_entity(),
            stats.query_count,
            stats.total_duration
        );
        Ok(ResultGraph::new(context, roots, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{DatabaseBackendType, MemoryEngine};
    use crate::schema::school;

    fn planner() -> Planner {
        Planner::new(school::registry().unwrap(), PlannerConfig::default()).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let err = Planner::new(
            school::registry().unwrap(),
            PlannerConfig::default().with_max_batch_size(0),
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::Configuration(_)));
    }

    #[test]
    fn test_plan_errors_before_execution() {
        let planner = planner();
        let err = planner
            .plan(&RootQuery::new("Student"), &[LoadDirective::join_fetch("emails")])
            .unwrap_err();
        assert!(matches!(err, OrmError::AmbiguousCardinality { .. }));
    }

    #[tokio::test]
    async fn test_load_populates_requested_relations() {
        let engine = MemoryEngine::default();
        school::seed(&engine);

        let graph = planner()
            .load(
                Arc::new(engine.clone()),
                &RootQuery::new("Student").order_by("id"),
                &[LoadDirective::batched("emails"), LoadDirective::join_fetch("clazz")],
            )
            .await
            .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.stats().query_count, 2);
        assert_eq!(engine.statement_count(), 2);
        assert_eq!(graph[0].many("emails").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_engine_must_speak_the_configured_dialect() {
        let engine = MemoryEngine::new(DatabaseBackendType::MySQL);
        school::seed(&engine);
        let planner = planner();
        let plan = planner
            .plan(&RootQuery::new("Student"), &[LoadDirective::batched("emails")])
            .unwrap();

        let failure = planner
            .execute(Arc::new(engine.clone()), &plan)
            .await
            .unwrap_err();
        assert!(failure.nothing_completed());
        assert_eq!(failure.failed_at, None);
        assert!(matches!(failure.error, OrmError::Configuration(_)));
        assert_eq!(engine.statement_count(), 0);

        let mut scope = TransactionScope::begin(Arc::new(engine.clone())).await.unwrap();
        let failure = planner.execute_in(&mut scope, &plan).await.unwrap_err();
        assert!(matches!(failure.error, OrmError::Configuration(_)));
        scope.rollback().await.unwrap();
        assert_eq!(engine.statement_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_in_transaction() {
        let engine = MemoryEngine::default();
        school::seed(&engine);
        let planner = planner();
        let plan = planner
            .plan(&RootQuery::new("Student"), &[LoadDirective::batched("emails")])
            .unwrap();

        let mut scope = TransactionScope::begin(Arc::new(engine.clone())).await.unwrap();
        let graph = planner.execute_in(&mut scope, &plan).await.unwrap();
        scope.commit().await.unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(engine.commit_count(), 1);
    }
}
