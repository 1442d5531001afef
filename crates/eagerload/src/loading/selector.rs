//! Load Strategy Selector
//!
//! Classifies each requested relationship into a join-fetch, a batched
//! fetch, or an access policy, and rejects directive sets that contradict
//! each other before anything is assembled.

use std::collections::BTreeMap;

use crate::config::{LazyPolicy, PlannerConfig};
use crate::error::{OrmError, OrmResult};
use crate::query::{JoinType, RootQuery};
use crate::resolver::{RelationPath, RelationshipResolver};
use crate::schema::RelationshipSpec;
use super::directive::{DirectiveScope, LoadDirective, LoadStrategy};

/// How a relationship will be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadClass {
    /// Joined into the statement hosting the owner
    JoinFetch {
        join_type: JoinType,
        /// A collection join repeats the owner's row once per related row
        multiplies: bool,
        /// Rows come from a join the root query already carries
        routed: bool,
    },
    /// Fetched by a follow-up statement keyed by the owners' columns
    BatchedFetch { composite: bool },
    /// Access raises `LazyAccessViolation`
    Forbidden,
    /// Access performs a single explicit fetch
    ImplicitLazy,
}

impl LoadClass {
    pub fn is_fetch(self) -> bool {
        matches!(self, LoadClass::JoinFetch { .. } | LoadClass::BatchedFetch { .. })
    }
}

/// Classify one relationship under one requested strategy
///
/// Pure: the result depends only on the arguments.
pub fn classify(
    spec: &RelationshipSpec,
    strategy: LoadStrategy,
    allow_multiplication: bool,
    config: &PlannerConfig,
) -> OrmResult<LoadClass> {
    match strategy {
        LoadStrategy::JoinFetch | LoadStrategy::ContainsEager => {
            if spec.is_collection() && !allow_multiplication {
                return Err(OrmError::AmbiguousCardinality {
                    entity: spec.owner.clone(),
                    relationship: spec.name.clone(),
                });
            }

            let routed = strategy == LoadStrategy::ContainsEager;
            let join_type = if routed {
                // The caller's join decides which owners survive
                JoinType::Inner
            } else if spec.is_collection() || spec.nullable || config.prefer_outer_join {
                JoinType::Left
            } else {
                JoinType::Inner
            };

            Ok(LoadClass::JoinFetch {
                join_type,
                multiplies: spec.is_collection(),
                routed,
            })
        }
        LoadStrategy::BatchedFetch => {
            if spec.composite_key && !config.supports_composite_in() {
                return Err(OrmError::CompositeKeyUnsupportedForBatch {
                    entity: spec.owner.clone(),
                    relationship: spec.name.clone(),
                });
            }
            Ok(LoadClass::BatchedFetch {
                composite: spec.composite_key,
            })
        }
        LoadStrategy::ForbidLazy => Ok(LoadClass::Forbidden),
        LoadStrategy::Lazy => Ok(LoadClass::ImplicitLazy),
    }
}

/// Access state of a relationship that was not fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessRule {
    /// Explicitly or wildcard forbidden
    Forbidden,
    /// Not covered by any directive under the `raise` policy
    NotRequested,
    /// Lazy fetch permitted
    Guarded,
}

/// Policy for relationships the plan does not fetch
///
/// Most specific wins: an explicit directive on the path, then a
/// level-only wildcard on the owner's level, then the wildcard whose level
/// is the longest prefix of the owner's level, then the configured default.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccessPolicy {
    explicit: BTreeMap<RelationPath, LoadStrategy>,
    wildcards: BTreeMap<RelationPath, LoadStrategy>,
    levels: BTreeMap<RelationPath, LoadStrategy>,
    default: LazyPolicy,
}

impl AccessPolicy {
    pub fn new(default: LazyPolicy) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    /// Rule for relationship `name` on an entity reached by `level`
    pub fn rule_for(&self, level: &RelationPath, name: &str) -> AccessRule {
        let path = level.child(name);
        if let Some(strategy) = self.explicit.get(&path) {
            return Self::rule_of(*strategy);
        }
        if let Some(strategy) = self.levels.get(level) {
            return Self::rule_of(*strategy);
        }

        let wildcard = self
            .wildcards
            .iter()
            .filter(|(scope, _)| level.starts_with(scope))
            .max_by_key(|(scope, _)| scope.depth());
        if let Some((_, strategy)) = wildcard {
            return Self::rule_of(*strategy);
        }

        match self.default {
            LazyPolicy::Raise => AccessRule::NotRequested,
            LazyPolicy::Allow => AccessRule::Guarded,
        }
    }

    fn rule_of(strategy: LoadStrategy) -> AccessRule {
        match strategy {
            LoadStrategy::Lazy => AccessRule::Guarded,
            _ => AccessRule::Forbidden,
        }
    }

    pub fn default_policy(&self) -> LazyPolicy {
        self.default
    }
}

/// A fetch the assembler has to place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFetch {
    pub path: RelationPath,
    pub spec: RelationshipSpec,
    pub class: LoadClass,
    pub load_only: Option<Vec<String>>,
    /// Added for an intermediate segment no directive named
    pub implied: bool,
}

/// Selector output: fetches ordered parent-first, plus the access policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub fetches: Vec<ClassifiedFetch>,
    pub policy: AccessPolicy,
}

impl Selection {
    pub fn fetch(&self, path: &RelationPath) -> Option<&ClassifiedFetch> {
        self.fetches.iter().find(|f| &f.path == path)
    }
}

#[derive(Debug, Clone)]
struct Requested {
    strategy: LoadStrategy,
    allow_multiplication: bool,
    load_only: Option<Vec<String>>,
    implied: bool,
}

/// Applies [`classify`] to a whole directive set
#[derive(Debug, Clone)]
pub struct LoadStrategySelector<'a> {
    resolver: &'a RelationshipResolver,
    config: &'a PlannerConfig,
}

impl<'a> LoadStrategySelector<'a> {
    pub fn new(resolver: &'a RelationshipResolver, config: &'a PlannerConfig) -> Self {
        Self { resolver, config }
    }

    pub fn select(&self, query: &RootQuery, directives: &[LoadDirective]) -> OrmResult<Selection> {
        let mut requested: BTreeMap<RelationPath, Requested> = BTreeMap::new();
        let mut order: Vec<RelationPath> = Vec::new();
        let mut policy = AccessPolicy::new(self.config.default_lazy_policy);

        for directive in directives {
            directive.validate()?;
            match &directive.scope {
                DirectiveScope::Wildcard(_) | DirectiveScope::Level(_) => {
                    let level = directive.scope.wildcard_level().unwrap_or_default();
                    self.resolver.resolve(&query.entity, &level)?;
                    let same_level = [policy.wildcards.get(&level), policy.levels.get(&level)];
                    for existing in same_level.into_iter().flatten() {
                        if *existing != directive.strategy {
                            return Err(OrmError::ConflictingDirectives {
                                path: directive.scope.to_string(),
                                other: directive.scope.to_string(),
                                reason: format!(
                                    "wildcard requested as both {} and {}",
                                    existing, directive.strategy
                                ),
                            });
                        }
                    }
                    if matches!(directive.scope, DirectiveScope::Level(_)) {
                        policy.levels.insert(level, directive.strategy);
                    } else {
                        policy.wildcards.insert(level, directive.strategy);
                    }
                }
                DirectiveScope::Path(path) => {
                    self.resolver.resolve(&query.entity, path)?;
                    Self::merge(&mut requested, &mut order, path, directive)?;
                }
            }
        }

        Self::check_ancestors(&requested)?;
        Self::imply_intermediates(&mut requested, &mut order);

        let mut fetches = Vec::new();
        for path in &order {
            let request = &requested[path];
            let spec = self
                .resolver
                .resolve(&query.entity, path)?
                .pop()
                .ok_or_else(|| OrmError::InvalidDirective("empty relationship path".to_string()))?;
            let class = classify(&spec, request.strategy, request.allow_multiplication, self.config)?;

            match class {
                LoadClass::Forbidden | LoadClass::ImplicitLazy => {
                    policy.explicit.insert(path.clone(), request.strategy);
                }
                _ => {
                    if request.strategy == LoadStrategy::ContainsEager {
                        Self::check_routing(query, path, &requested)?;
                    }
                    fetches.push(ClassifiedFetch {
                        path: path.clone(),
                        spec,
                        class,
                        load_only: request.load_only.clone(),
                        implied: request.implied,
                    });
                }
            }
        }

        // Parents before children, otherwise in request order
        fetches.sort_by_key(|f| f.path.depth());

        tracing::debug!(
            "Classified {} fetch(es) for {} ({} explicit guard(s), {} wildcard(s))",
            fetches.len(),
            query.entity,
            policy.explicit.len(),
            policy.wildcards.len() + policy.levels.len()
        );

        Ok(Selection { fetches, policy })
    }

    fn merge(
        requested: &mut BTreeMap<RelationPath, Requested>,
        order: &mut Vec<RelationPath>,
        path: &RelationPath,
        directive: &LoadDirective,
    ) -> OrmResult<()> {
        match requested.get_mut(path) {
            Some(existing) if existing.strategy != directive.strategy => {
                Err(OrmError::ConflictingDirectives {
                    path: path.to_string(),
                    other: path.to_string(),
                    reason: format!(
                        "requested as both {} and {}",
                        existing.strategy, directive.strategy
                    ),
                })
            }
            Some(existing) => {
                existing.allow_multiplication |= directive.allow_multiplication;
                if let Some(columns) = &directive.load_only {
                    let merged = existing.load_only.get_or_insert_with(Vec::new);
                    for column in columns {
                        if !merged.contains(column) {
                            merged.push(column.clone());
                        }
                    }
                }
                Ok(())
            }
            None => {
                requested.insert(
                    path.clone(),
                    Requested {
                        strategy: directive.strategy,
                        allow_multiplication: directive.allow_multiplication,
                        load_only: directive.load_only.clone(),
                        implied: false,
                    },
                );
                order.push(path.clone());
                Ok(())
            }
        }
    }

    /// A guarded path cannot have fetched descendants
    fn check_ancestors(requested: &BTreeMap<RelationPath, Requested>) -> OrmResult<()> {
        for (path, request) in requested {
            if !request.strategy.is_fetch() {
                continue;
            }
            for ancestor in path.ancestors() {
                if let Some(guard) = requested.get(&ancestor) {
                    if !guard.strategy.is_fetch() {
                        return Err(OrmError::ConflictingDirectives {
                            path: ancestor.to_string(),
                            other: path.to_string(),
                            reason: format!(
                                "{} on '{}' prevents {} of '{}'",
                                guard.strategy, ancestor, request.strategy, path
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch intermediate segments nobody named with the strategy of the
    /// descendant that needs them; implied paths precede that descendant
    fn imply_intermediates(
        requested: &mut BTreeMap<RelationPath, Requested>,
        order: &mut Vec<RelationPath>,
    ) {
        let mut expanded: Vec<RelationPath> = Vec::with_capacity(order.len());
        for path in order.iter() {
            let request = requested.get(path).cloned();
            if let Some(request) = request.filter(|r| r.strategy.is_fetch()) {
                for ancestor in path.ancestors() {
                    if requested.contains_key(&ancestor) {
                        continue;
                    }
                    tracing::debug!(
                        "Implying {} for intermediate path '{}'",
                        request.strategy,
                        ancestor
                    );
                    requested.insert(
                        ancestor.clone(),
                        Requested {
                            strategy: request.strategy,
                            allow_multiplication: request.allow_multiplication,
                            load_only: None,
                            implied: true,
                        },
                    );
                    expanded.push(ancestor);
                }
            }
            expanded.push(path.clone());
        }
        *order = expanded;
    }

    /// Contains-eager needs the caller's join and a parent whose rows are
    /// in the root statement
    fn check_routing(
        query: &RootQuery,
        path: &RelationPath,
        requested: &BTreeMap<RelationPath, Requested>,
    ) -> OrmResult<()> {
        if !query.joins.iter().any(|j| j.path.starts_with(path)) {
            return Err(OrmError::InvalidDirective(format!(
                "contains-eager on '{}' needs a matching join in the root query",
                path
            )));
        }

        if let Some(parent) = path.parent().filter(|p| !p.is_root()) {
            let routed_parent = requested
                .get(&parent)
                .map(|r| r.strategy == LoadStrategy::ContainsEager)
                .unwrap_or(false);
            if !routed_parent {
                return Err(OrmError::InvalidDirective(format!(
                    "contains-eager on '{}' requires '{}' to be contains-eager as well",
                    path, parent
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::school;

    fn selector_fixture() -> (RelationshipResolver, PlannerConfig) {
        (
            RelationshipResolver::new(school::registry().unwrap()),
            PlannerConfig::default(),
        )
    }

    #[test]
    fn test_classify_rules() {
        let registry = school::registry().unwrap();
        let config = PlannerConfig::default();
        let emails = registry.relationship("Student", "emails").unwrap();
        let student = registry.relationship("Email", "student").unwrap();

        assert_eq!(
            classify(emails, LoadStrategy::JoinFetch, false, &config).unwrap_err(),
            OrmError::AmbiguousCardinality {
                entity: "Student".into(),
                relationship: "emails".into(),
            }
        );
        assert_eq!(
            classify(emails, LoadStrategy::JoinFetch, true, &config).unwrap(),
            LoadClass::JoinFetch {
                join_type: JoinType::Left,
                multiplies: true,
                routed: false,
            }
        );
        assert_eq!(
            classify(emails, LoadStrategy::BatchedFetch, false, &config).unwrap(),
            LoadClass::BatchedFetch { composite: false }
        );

        let strict = PlannerConfig::default().with_prefer_outer_join(false);
        assert_eq!(
            classify(student, LoadStrategy::JoinFetch, false, &strict).unwrap(),
            LoadClass::JoinFetch {
                join_type: JoinType::Inner,
                multiplies: false,
                routed: false,
            }
        );
        assert_eq!(
            classify(student, LoadStrategy::ForbidLazy, false, &config).unwrap(),
            LoadClass::Forbidden
        );
    }

    #[test]
    fn test_classify_is_pure() {
        let registry = school::registry().unwrap();
        let config = PlannerConfig::default();
        let clazz = registry.relationship("Student", "clazz").unwrap();
        let first = classify(clazz, LoadStrategy::JoinFetch, false, &config);
        let second = classify(clazz, LoadStrategy::JoinFetch, false, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn test_composite_batch_needs_capability() {
        let registry = school::registry().unwrap();
        let verifications = registry.relationship("Email", "verifications").unwrap();
        let config = PlannerConfig::default().with_composite_in(false);
        assert!(matches!(
            classify(verifications, LoadStrategy::BatchedFetch, false, &config),
            Err(OrmError::CompositeKeyUnsupportedForBatch { .. })
        ));
        assert_eq!(
            classify(verifications, LoadStrategy::BatchedFetch, false, &PlannerConfig::default()).unwrap(),
            LoadClass::BatchedFetch { composite: true }
        );
    }

    #[test]
    fn test_conflicting_directives() {
        let (resolver, config) = selector_fixture();
        let selector = LoadStrategySelector::new(&resolver, &config);
        let query = RootQuery::new("Student");

        let err = selector
            .select(
                &query,
                &[
                    LoadDirective::forbid("clazz"),
                    LoadDirective::join_fetch("clazz.clazzTeacher").allow_multiplication(),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, OrmError::ConflictingDirectives { ref path, .. } if path == "clazz"));

        let err = selector
            .select(
                &query,
                &[LoadDirective::batched("emails"), LoadDirective::forbid("emails")],
            )
            .unwrap_err();
        assert!(matches!(err, OrmError::ConflictingDirectives { .. }));

        let err = selector
            .select(&query, &[LoadDirective::forbid_all(), LoadDirective::lazy_all()])
            .unwrap_err();
        assert!(matches!(err, OrmError::ConflictingDirectives { .. }));
    }

    #[test]
    fn test_wildcard_never_conflicts_with_fetch() {
        let (resolver, config) = selector_fixture();
        let selector = LoadStrategySelector::new(&resolver, &config);
        let selection = selector
            .select(
                &RootQuery::new("Student"),
                &[LoadDirective::forbid_all(), LoadDirective::batched("emails")],
            )
            .unwrap();
        assert_eq!(selection.fetches.len(), 1);
        assert_eq!(
            selection.policy.rule_for(&RelationPath::root(), "clazz"),
            AccessRule::Forbidden
        );
    }

    #[test]
    fn test_intermediate_segments_are_implied() {
        let (resolver, config) = selector_fixture();
        let selector = LoadStrategySelector::new(&resolver, &config);
        let selection = selector
            .select(
                &RootQuery::new("Student"),
                &[LoadDirective::batched("clazz.clazzTeacher.teacher")],
            )
            .unwrap();

        let paths: Vec<String> = selection.fetches.iter().map(|f| f.path.to_string()).collect();
        assert_eq!(paths, vec!["clazz", "clazz.clazzTeacher", "clazz.clazzTeacher.teacher"]);
        assert!(selection.fetches[0].implied);
        assert!(!selection.fetches[2].implied);
    }

    #[test]
    fn test_most_specific_policy_wins() {
        let (resolver, config) = selector_fixture();
        let selector = LoadStrategySelector::new(&resolver, &config);
        let selection = selector
            .select(
                &RootQuery::new("Student"),
                &[
                    LoadDirective::lazy_all(),
                    LoadDirective::join_fetch("clazz"),
                    LoadDirective::forbid_all_under("clazz"),
                    LoadDirective::lazy("clazz.clazzTeacher"),
                ],
            )
            .unwrap();
        let policy = &selection.policy;
        let clazz = RelationPath::parse("clazz");

        assert_eq!(policy.rule_for(&RelationPath::root(), "emails"), AccessRule::Guarded);
        assert_eq!(policy.rule_for(&clazz, "clazz"), AccessRule::Forbidden);
        assert_eq!(policy.rule_for(&clazz, "clazzTeacher"), AccessRule::Guarded);
        assert_eq!(
            policy.rule_for(&RelationPath::parse("clazz.clazz"), "clazzTeacher"),
            AccessRule::Forbidden
        );

        let default = AccessPolicy::new(LazyPolicy::Raise);
        assert_eq!(default.rule_for(&clazz, "student"), AccessRule::NotRequested);
    }

    #[test]
    fn test_level_wildcard_is_not_inherited() {
        let (resolver, config) = selector_fixture();
        let selector = LoadStrategySelector::new(&resolver, &config);
        let clazz = RelationPath::parse("clazz");

        let selection = selector
            .select(
                &RootQuery::new("Student"),
                &[LoadDirective::join_fetch("clazz"), LoadDirective::forbid_root_level()],
            )
            .unwrap();
        let policy = &selection.policy;
        assert_eq!(policy.rule_for(&RelationPath::root(), "emails"), AccessRule::Forbidden);
        assert_eq!(policy.rule_for(&clazz, "clazzTeacher"), AccessRule::NotRequested);

        // A level-only wildcard overrides an inherited one on its own level
        let selection = selector
            .select(
                &RootQuery::new("Student"),
                &[
                    LoadDirective::lazy_all(),
                    LoadDirective::join_fetch("clazz"),
                    LoadDirective::forbid_level("clazz"),
                ],
            )
            .unwrap();
        let policy = &selection.policy;
        assert_eq!(policy.rule_for(&RelationPath::root(), "emails"), AccessRule::Guarded);
        assert_eq!(policy.rule_for(&clazz, "clazzTeacher"), AccessRule::Forbidden);
        assert_eq!(
            policy.rule_for(&RelationPath::parse("clazz.clazz"), "clazzTeacher"),
            AccessRule::Guarded
        );

        let err = selector
            .select(
                &RootQuery::new("Student"),
                &[LoadDirective::lazy_all(), LoadDirective::forbid_root_level()],
            )
            .unwrap_err();
        assert!(matches!(err, OrmError::ConflictingDirectives { .. }));
    }

    #[test]
    fn test_contains_eager_requires_join() {
        let (resolver, config) = selector_fixture();
        let selector = LoadStrategySelector::new(&resolver, &config);

        let err = selector
            .select(&RootQuery::new("Student"), &[LoadDirective::contains_eager("clazz")])
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidDirective(_)));

        let selection = selector
            .select(
                &RootQuery::new("Student").join("clazz"),
                &[LoadDirective::contains_eager("clazz")],
            )
            .unwrap();
        assert!(matches!(
            selection.fetches[0].class,
            LoadClass::JoinFetch { routed: true, .. }
        ));
    }

    #[test]
    fn test_unknown_path_fails_resolution() {
        let (resolver, config) = selector_fixture();
        let selector = LoadStrategySelector::new(&resolver, &config);
        assert!(matches!(
            selector.select(&RootQuery::new("Student"), &[LoadDirective::batched("teachers")]),
            Err(OrmError::UnknownRelationship { .. })
        ));
    }
}
