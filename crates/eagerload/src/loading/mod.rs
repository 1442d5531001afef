//! Relationship loading: directives, strategy selection, plan assembly
//! and execution

pub mod assembler;
pub mod directive;
pub mod executor;
pub mod selector;

pub use assembler::{JoinedRelation, LoadNode, PlanStep, QueryPlan, QueryPlanAssembler, StepKind};
pub use directive::{DirectiveScope, LoadDirective, LoadStrategy};
pub use executor::ExecutionStats;
pub use selector::{
    classify, AccessPolicy, AccessRule, ClassifiedFetch, LoadClass, LoadStrategySelector, Selection,
};
