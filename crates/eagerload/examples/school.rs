//! Example: eager-loading students with their e-mails and class
//!
//! Plans a batched fetch of `emails` and a join-fetch of `clazz`, runs it
//! against the in-memory school data and prints the result graph.
//!
//! Run with `RUST_LOG=eagerload=debug` to see each dispatched statement.

use std::sync::Arc;

use eagerload::schema::school;
use eagerload::{LoadDirective, MemoryEngine, OrmError, OrmResult, Planner, PlannerConfig, RootQuery};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> OrmResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PlannerConfig::from_env()?;
    let engine = MemoryEngine::new(config.backend);
    school::seed(&engine);

    let planner = Planner::new(school::registry()?, config)?;
    let plan = planner.plan(
        &RootQuery::new("Student").order_by("id"),
        &[
            LoadDirective::batched("emails"),
            LoadDirective::join_fetch("clazz"),
            LoadDirective::forbid_all(),
        ],
    )?;

    println!("Plan ({} statements):", plan.len());
    print!("{}", plan.explain());

    let graph = planner.execute(Arc::new(engine.clone()), &plan).await?;
    println!(
        "\nLoaded {} students with {} statements:",
        graph.len(),
        graph.stats().query_count
    );

    for student in &graph {
        let emails: Vec<String> = student
            .many("emails")?
            .iter()
            .map(|e| e.column("email").map(|v| v.to_string()))
            .collect::<OrmResult<_>>()?;
        let class = match student.one("clazz")? {
            Some(enrolment) => enrolment.column("class_id")?.to_string(),
            None => "-".to_string(),
        };
        println!(
            "  {:<6} class={:<2} emails=[{}]",
            student.column("name")?,
            class,
            emails.join(", ")
        );
    }

    // Clubs were not requested: access fails instead of querying
    if let Some(first) = graph.get(0) {
        match first.many("clubs") {
            Err(err @ OrmError::LazyAccessViolation { .. }) => println!("\n{}", err),
            other => println!("\nunexpected: {:?}", other.map(|c| c.len())),
        }
    }

    Ok(())
}
