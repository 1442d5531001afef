//! Plan execution: partial failure reporting, chunking, cancellation,
//! concurrency and transactions

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eagerload::schema::school;
use eagerload::{
    with_transaction, DatabaseBackendType, EngineTransaction, ExecutionEngine, LoadDirective,
    LockMode, MemoryEngine, OrmError, OrmResult, Planner, PlannerConfig, RootQuery, Row, Statement,
};
use tokio_util::sync::CancellationToken;

/// Delays statements on one table and counts every statement that finishes
struct SlowEngine {
    inner: MemoryEngine,
    table: &'static str,
    delay: Duration,
    finished: AtomicUsize,
}

impl SlowEngine {
    fn new(inner: MemoryEngine, table: &'static str, delay: Duration) -> Self {
        Self {
            inner,
            table,
            delay,
            finished: AtomicUsize::new(0),
        }
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionEngine for SlowEngine {
    fn backend(&self) -> DatabaseBackendType {
        self.inner.backend()
    }

    async fn execute(&self, statement: &Statement) -> OrmResult<Vec<Row>> {
        if statement.table == self.table {
            tokio::time::sleep(self.delay).await;
        }
        let rows = self.inner.execute(statement).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        rows
    }

    async fn begin_transaction(&self) -> OrmResult<Box<dyn EngineTransaction>> {
        self.inner.begin_transaction().await
    }
}

fn seeded() -> MemoryEngine {
    let engine = MemoryEngine::default();
    school::seed(&engine);
    engine
}

fn planner_with(config: PlannerConfig) -> Planner {
    Planner::new(school::registry().unwrap(), config).unwrap()
}

fn students() -> RootQuery {
    RootQuery::new("Student").order_by("id")
}

#[tokio::test]
async fn stale_write_reports_completed_steps() {
    let engine = seeded();
    engine.fail_on(
        "emails",
        OrmError::StaleWrite {
            table: "emails".into(),
            detail: "row version changed".into(),
        },
    );

    let planner = planner_with(PlannerConfig::default());
    let plan = planner
        .plan(&students(), &[LoadDirective::batched("emails")])
        .unwrap();
    let failure = planner
        .execute(Arc::new(engine.clone()), &plan)
        .await
        .unwrap_err();

    assert_eq!(failure.completed, vec![0]);
    assert_eq!(failure.failed_at, Some(1));
    assert!(failure.error.is_concurrency_conflict());
    assert!(matches!(failure.error, OrmError::StaleWrite { .. }));
    // Surfaced once, never retried
    assert_eq!(engine.statement_count(), 2);
}

#[tokio::test]
async fn lock_timeout_on_root_completes_nothing() {
    let engine = seeded();
    engine.fail_on("students", OrmError::LockTimeout("row is locked".into()));

    let planner = planner_with(PlannerConfig::default());
    let plan = planner
        .plan(
            &students().lock(LockMode::ForUpdateNoWait),
            &[LoadDirective::batched("emails")],
        )
        .unwrap();
    assert!(plan.root().sql().contains("NOWAIT"));

    let failure = planner
        .execute(Arc::new(engine.clone()), &plan)
        .await
        .unwrap_err();
    assert!(failure.nothing_completed());
    assert_eq!(failure.failed_at, Some(0));
    assert_eq!(
        OrmError::from(failure),
        OrmError::LockTimeout("row is locked".into())
    );
}

#[tokio::test]
async fn large_key_sets_are_chunked() {
    let engine = seeded();
    let planner = planner_with(PlannerConfig::default().with_max_batch_size(2));
    let graph = planner
        .load(Arc::new(engine.clone()), &students(), &[LoadDirective::batched("emails")])
        .await
        .unwrap();

    // Three owner keys in chunks of two
    assert_eq!(graph.stats().query_count, 3);
    assert_eq!(engine.statement_count(), 3);
    assert_eq!(graph[0].many("emails").unwrap().len(), 2);
    assert_eq!(graph[1].many("emails").unwrap().len(), 1);
}

#[tokio::test]
async fn empty_roots_skip_batched_steps() {
    let engine = seeded();
    let planner = planner_with(PlannerConfig::default());
    let graph = planner
        .load(
            Arc::new(engine.clone()),
            &students().filter(eagerload::Filter::eq("name", "Nobody")),
            &[LoadDirective::batched("emails")],
        )
        .await
        .unwrap();

    assert!(graph.is_empty());
    assert_eq!(graph.stats().skipped_steps, 1);
    assert_eq!(engine.statement_count(), 1);
}

#[tokio::test]
async fn cancelled_plans_stop_before_dispatch() {
    let engine = seeded();
    let planner = planner_with(PlannerConfig::default());
    let plan = planner
        .plan(&students(), &[LoadDirective::batched("emails")])
        .unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let failure = planner
        .execute_with_cancellation(Arc::new(engine.clone()), &plan, token)
        .await
        .unwrap_err();

    assert_eq!(failure.error, OrmError::Cancelled);
    assert!(failure.nothing_completed());
    assert_eq!(engine.statement_count(), 0);
}

#[tokio::test]
async fn cancellation_lets_the_running_statement_finish() {
    let engine = Arc::new(SlowEngine::new(seeded(), "emails", Duration::from_millis(200)));
    let planner = planner_with(PlannerConfig::default());
    let plan = planner
        .plan(
            &students(),
            &[
                LoadDirective::batched("emails"),
                LoadDirective::batched("emails.verifications"),
            ],
        )
        .unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let failure = planner
        .execute_with_cancellation(engine.clone(), &plan, token)
        .await
        .unwrap_err();

    // The e-mail batch was in flight when the token fired
    assert_eq!(engine.finished(), 2);
    assert_eq!(failure.completed, vec![0, 1]);
    assert_eq!(failure.failed_at, Some(2));
    assert_eq!(failure.error, OrmError::Cancelled);
}

#[tokio::test]
async fn late_failure_lists_every_completed_phase() {
    let engine = seeded();
    engine.fail_on(
        "email_verifications",
        OrmError::StaleWrite {
            table: "email_verifications".into(),
            detail: "row version changed".into(),
        },
    );

    let planner = planner_with(PlannerConfig::default());
    let plan = planner
        .plan(
            &students(),
            &[
                LoadDirective::join_fetch("clazz"),
                LoadDirective::batched("emails"),
                LoadDirective::batched("emails.verifications"),
            ],
        )
        .unwrap();
    let failure = planner
        .execute(Arc::new(engine.clone()), &plan)
        .await
        .unwrap_err();

    assert_eq!(failure.completed, vec![0, 1]);
    assert_eq!(failure.failed_at, Some(2));
    assert!(failure.error.is_concurrency_conflict());
    assert_eq!(engine.statement_count(), 3);
}

#[tokio::test]
async fn sibling_batches_can_run_concurrently() {
    let directives = [LoadDirective::batched("emails"), LoadDirective::batched("clazz")];

    let sequential = planner_with(PlannerConfig::default())
        .load(Arc::new(seeded()), &students(), &directives)
        .await
        .unwrap();
    let parallel = planner_with(PlannerConfig::default().with_parallel_batches(true))
        .load(Arc::new(seeded()), &students(), &directives)
        .await
        .unwrap();

    assert_eq!(sequential.stats().parallel_phases, 0);
    assert_eq!(parallel.stats().parallel_phases, 1);
    assert_eq!(parallel.stats().query_count, 3);
    assert_eq!(sequential.roots(), parallel.roots());
}

#[tokio::test]
async fn transaction_commits_a_successful_load() {
    let engine = seeded();
    let planner = planner_with(PlannerConfig::default().with_parallel_batches(true));
    let plan = planner
        .plan(&students(), &[LoadDirective::batched("emails"), LoadDirective::batched("clazz")])
        .unwrap();

    let handle: Arc<dyn ExecutionEngine> = Arc::new(engine.clone());
    let count = with_transaction(handle, move |scope| {
        Box::pin(async move {
            let graph = planner.execute_in(scope, &plan).await?;
            Ok(graph.len())
        })
    })
    .await
    .unwrap();

    assert_eq!(count, 3);
    assert_eq!(engine.commit_count(), 1);
    assert_eq!(engine.rollback_count(), 0);
}

#[tokio::test]
async fn transaction_rolls_back_a_failed_load() {
    let engine = seeded();
    engine.fail_on("student_clazz", OrmError::LockTimeout("lock wait timeout".into()));
    let planner = planner_with(PlannerConfig::default());
    let plan = planner
        .plan(&students(), &[LoadDirective::batched("clazz")])
        .unwrap();

    let handle: Arc<dyn ExecutionEngine> = Arc::new(engine.clone());
    let err = with_transaction(handle, move |scope| {
        Box::pin(async move {
            let graph = planner.execute_in(scope, &plan).await?;
            Ok(graph.len())
        })
    })
    .await
    .unwrap_err();

    assert_eq!(err, OrmError::LockTimeout("lock wait timeout".into()));
    assert_eq!(engine.commit_count(), 0);
    assert_eq!(engine.rollback_count(), 1);
}
