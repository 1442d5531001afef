//! End-to-end planning and loading over the school schema

use std::sync::Arc;

use eagerload::schema::school;
use eagerload::{
    DatabaseBackendType, DatabaseValue, Filter, LoadDirective, MemoryEngine, OrmError, Planner,
    PlannerConfig, RootQuery,
};

fn planner_with(config: PlannerConfig) -> Planner {
    Planner::new(school::registry().unwrap(), config).unwrap()
}

fn planner() -> Planner {
    planner_with(PlannerConfig::default())
}

fn seeded() -> MemoryEngine {
    let engine = MemoryEngine::default();
    school::seed(&engine);
    engine
}

fn students() -> RootQuery {
    RootQuery::new("Student").order_by("id")
}

#[tokio::test]
async fn batched_emails_and_joined_clazz_use_two_statements() {
    let planner = planner();
    let engine = seeded();
    let plan = planner
        .plan(
            &students(),
            &[LoadDirective::batched("emails"), LoadDirective::join_fetch("clazz")],
        )
        .unwrap();
    assert_eq!(plan.len(), 2);
    assert_eq!(plan.statements().len(), 2);

    let graph = planner.execute(Arc::new(engine.clone()), &plan).await.unwrap();
    assert_eq!(engine.statement_count(), 2);
    assert_eq!(graph.len(), 3);

    let emails: Vec<usize> = graph
        .iter()
        .map(|s| s.many("emails").unwrap().len())
        .collect();
    assert_eq!(emails, vec![2, 1, 0]);

    let alice_class = graph[0].one("clazz").unwrap().unwrap();
    assert_eq!(alice_class.column("class_id").unwrap(), &DatabaseValue::Int32(1));
    assert!(graph[2].one("clazz").unwrap().is_none());
}

#[tokio::test]
async fn unrequested_collection_raises_on_access() {
    let planner = planner();
    let graph = planner
        .load(
            Arc::new(seeded()),
            &students(),
            &[LoadDirective::join_fetch("clazz")],
        )
        .await
        .unwrap();

    let err = graph[0].many("emails").unwrap_err();
    assert_eq!(err, OrmError::lazy_access("Student", "emails"));
}

#[test]
fn joined_collection_without_multiplication_is_ambiguous() {
    let err = planner()
        .plan(&students(), &[LoadDirective::join_fetch("emails")])
        .unwrap_err();
    assert_eq!(
        err,
        OrmError::AmbiguousCardinality {
            entity: "Student".into(),
            relationship: "emails".into(),
        }
    );
}

#[test]
fn forbidding_a_path_conflicts_with_fetches_below_it() {
    let err = planner()
        .plan(
            &students(),
            &[
                LoadDirective::forbid("clazz"),
                LoadDirective::join_fetch("clazz.clazzTeacher").allow_multiplication(),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, OrmError::ConflictingDirectives { .. }));
}

#[test]
fn composite_batch_needs_tuple_in() {
    let sqlite = planner_with(PlannerConfig::for_backend(DatabaseBackendType::SQLite));
    let err = sqlite
        .plan(
            &students(),
            &[LoadDirective::batched("emails"), LoadDirective::batched("emails.verifications")],
        )
        .unwrap_err();
    assert_eq!(
        err,
        OrmError::CompositeKeyUnsupportedForBatch {
            entity: "Email".into(),
            relationship: "verifications".into(),
        }
    );

    // Same directives plan fine where tuple IN is available
    assert!(planner()
        .plan(
            &students(),
            &[LoadDirective::batched("emails"), LoadDirective::batched("emails.verifications")],
        )
        .is_ok());
}

#[test]
fn planning_is_idempotent() {
    let planner = planner();
    let query = students().filter(Filter::gt("score", 50.0)).limit(2);
    let directives = [
        LoadDirective::join_fetch("clazz"),
        LoadDirective::join_fetch("clazz.clazzTeacher").allow_multiplication(),
        LoadDirective::batched("emails"),
        LoadDirective::forbid_all(),
    ];

    let first = planner.plan(&query, &directives).unwrap();
    let second = planner.plan(&query, &directives).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.explain(), second.explain());
}

#[tokio::test]
async fn batched_and_joined_single_valued_relations_agree() {
    let planner = planner();

    let joined = planner
        .load(Arc::new(seeded()), &students(), &[LoadDirective::join_fetch("clazz")])
        .await
        .unwrap();
    let batched = planner
        .load(Arc::new(seeded()), &students(), &[LoadDirective::batched("clazz")])
        .await
        .unwrap();

    assert_eq!(joined.stats().query_count, 1);
    assert_eq!(batched.stats().query_count, 2);
    assert_eq!(joined.roots(), batched.roots());
}

#[tokio::test]
async fn nested_batches_run_after_their_owners() {
    let planner = planner();
    let engine = seeded();
    let graph = planner
        .load(
            Arc::new(engine.clone()),
            &students(),
            &[
                LoadDirective::batched("emails.verifications"),
                LoadDirective::batched("clazz"),
            ],
        )
        .await
        .unwrap();

    // emails is implied for the nested path
    assert_eq!(graph.stats().query_count, 4);
    let executed: Vec<String> = engine.executed().into_iter().map(|s| s.table).collect();
    assert_eq!(executed.first().map(String::as_str), Some("students"));
    assert_eq!(executed.last().map(String::as_str), Some("email_verifications"));

    let verified: usize = graph[0]
        .many("emails")
        .unwrap()
        .iter()
        .map(|e| e.many("verifications").unwrap().len())
        .sum();
    assert_eq!(verified, 1);
}

#[tokio::test]
async fn contains_eager_keeps_only_filtered_join_rows() {
    let planner = planner();
    let query = students().join_filtered("emails", vec![Filter::like("email", "%@school.example")]);
    let graph = planner
        .load(
            Arc::new(seeded()),
            &query,
            &[LoadDirective::contains_eager("emails").allow_multiplication()],
        )
        .await
        .unwrap();

    // Carol has no matching e-mail and the routed join is inner
    assert_eq!(graph.len(), 2);
    let alice = graph[0].many("emails").unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(
        alice[0].column("email").unwrap(),
        &DatabaseValue::from("alice@school.example")
    );
    assert_eq!(graph.stats().query_count, 1);
}

#[test]
fn contains_eager_requires_a_root_join() {
    let err = planner()
        .plan(
            &students(),
            &[LoadDirective::contains_eager("clazz")],
        )
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidDirective(_)));
}

#[tokio::test]
async fn paged_root_with_joined_collection_pages_owners() {
    let planner = planner();
    let graph = planner
        .load(
            Arc::new(seeded()),
            &students().limit(1),
            &[LoadDirective::join_fetch("emails").allow_multiplication()],
        )
        .await
        .unwrap();

    assert_eq!(graph.len(), 1);
    assert_eq!(graph[0].many("emails").unwrap().len(), 2);
}

#[tokio::test]
async fn version_field_is_exposed() {
    let graph = planner()
        .load(Arc::new(seeded()), &students(), &[])
        .await
        .unwrap();
    assert!(matches!(graph[0].version(), Some(DatabaseValue::DateTime(_))));
    assert!(graph[0].values().contains_key("updated_at"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sealed_registry_is_shared_across_tasks() {
    let registry = school::registry().unwrap();
    let planner = Planner::new(registry.clone(), PlannerConfig::default()).unwrap();
    let directives = [LoadDirective::batched("emails.verifications"), LoadDirective::join_fetch("clazz")];
    let expected = planner.plan(&students(), &directives).unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let planner = planner.clone();
            let directives = directives.clone();
            tokio::spawn(async move {
                let target = registry.relationship("Student", "clazz").unwrap().target.clone();
                let plan = planner.plan(&students(), &directives).unwrap();
                (target, plan)
            })
        })
        .collect();

    for task in tasks {
        let (target, plan) = task.await.unwrap();
        assert_eq!(target, "StudentClazz");
        assert_eq!(plan, expected);
    }
    assert_eq!(registry.len(), 9);
}
