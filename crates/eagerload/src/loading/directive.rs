//! Load directives - what the caller asks the planner to do per path

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OrmError, OrmResult};
use crate::resolver::RelationPath;

/// Requested loading strategy for a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Merge a join into the parent's statement
    JoinFetch,
    /// One follow-up statement keyed by the owners' columns
    BatchedFetch,
    /// Route the columns of a join the root query already carries
    ContainsEager,
    /// Install an access guard instead of a fetch
    ForbidLazy,
    /// Permit a single explicit fetch on first access
    Lazy,
}

impl LoadStrategy {
    /// Strategies that populate the relationship up front
    pub fn is_fetch(self) -> bool {
        matches!(
            self,
            LoadStrategy::JoinFetch | LoadStrategy::BatchedFetch | LoadStrategy::ContainsEager
        )
    }

    /// Fetches that merge into a parent statement
    pub fn is_joined(self) -> bool {
        matches!(self, LoadStrategy::JoinFetch | LoadStrategy::ContainsEager)
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadStrategy::JoinFetch => "join-fetch",
            LoadStrategy::BatchedFetch => "batched-fetch",
            LoadStrategy::ContainsEager => "contains-eager",
            LoadStrategy::ForbidLazy => "forbid-lazy",
            LoadStrategy::Lazy => "lazy",
        };
        write!(f, "{}", name)
    }
}

/// What a directive applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectiveScope {
    /// One relationship path
    Path(RelationPath),
    /// Every relationship not otherwise requested on the entity reached by
    /// the path and on everything below it; `None` is the root entity
    Wildcard(Option<RelationPath>),
    /// Like `Wildcard`, but only on the entity reached by the path; deeper
    /// levels fall back to the next broader wildcard or the default policy
    Level(RelationPath),
}

impl DirectiveScope {
    /// Entity level a wildcard covers
    pub fn wildcard_level(&self) -> Option<RelationPath> {
        match self {
            DirectiveScope::Wildcard(level) => Some(level.clone().unwrap_or_default()),
            DirectiveScope::Level(level) => Some(level.clone()),
            DirectiveScope::Path(_) => None,
        }
    }
}

impl fmt::Display for DirectiveScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectiveScope::Path(path) => write!(f, "{}", path),
            DirectiveScope::Wildcard(None) => write!(f, "*"),
            DirectiveScope::Wildcard(Some(path)) => write!(f, "{}.*", path),
            DirectiveScope::Level(path) if path.is_root() => write!(f, "*[level]"),
            DirectiveScope::Level(path) => write!(f, "{}.*[level]", path),
        }
    }
}

/// A relationship path plus the strategy requested for it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadDirective {
    pub scope: DirectiveScope,
    pub strategy: LoadStrategy,
    /// Accept row multiplication for a joined collection
    pub allow_multiplication: bool,
    /// Restrict the loaded columns of the target entity
    pub load_only: Option<Vec<String>>,
}

impl LoadDirective {
    pub fn new(path: impl Into<RelationPath>, strategy: LoadStrategy) -> Self {
        Self {
            scope: DirectiveScope::Path(path.into()),
            strategy,
            allow_multiplication: false,
            load_only: None,
        }
    }

    pub fn join_fetch(path: impl Into<RelationPath>) -> Self {
        Self::new(path, LoadStrategy::JoinFetch)
    }

    pub fn batched(path: impl Into<RelationPath>) -> Self {
        Self::new(path, LoadStrategy::BatchedFetch)
    }

    pub fn contains_eager(path: impl Into<RelationPath>) -> Self {
        Self::new(path, LoadStrategy::ContainsEager)
    }

    pub fn forbid(path: impl Into<RelationPath>) -> Self {
        Self::new(path, LoadStrategy::ForbidLazy)
    }

    pub fn lazy(path: impl Into<RelationPath>) -> Self {
        Self::new(path, LoadStrategy::Lazy)
    }

    fn wildcard(level: Option<RelationPath>, strategy: LoadStrategy) -> Self {
        Self {
            scope: DirectiveScope::Wildcard(level),
            strategy,
            allow_multiplication: false,
            load_only: None,
        }
    }

    /// Forbid lazy access to every unrequested relationship of the root and
    /// of every entity loaded below it
    pub fn forbid_all() -> Self {
        Self::wildcard(None, LoadStrategy::ForbidLazy)
    }

    /// Forbid lazy access to every unrequested relationship reached by `path`
    pub fn forbid_all_under(path: impl Into<RelationPath>) -> Self {
        Self::wildcard(Some(path.into()), LoadStrategy::ForbidLazy)
    }

    /// Forbid lazy access to the root's own unrequested relationships
    ///
    /// Entities loaded below the root keep the default policy, unlike
    /// [`forbid_all`](Self::forbid_all) which covers every level.
    pub fn forbid_root_level() -> Self {
        Self::forbid_level(RelationPath::root())
    }

    /// Forbid lazy access on exactly the entity reached by `path`
    pub fn forbid_level(path: impl Into<RelationPath>) -> Self {
        Self {
            scope: DirectiveScope::Level(path.into()),
            ..Self::wildcard(None, LoadStrategy::ForbidLazy)
        }
    }

    pub fn lazy_all() -> Self {
        Self::wildcard(None, LoadStrategy::Lazy)
    }

    pub fn lazy_all_under(path: impl Into<RelationPath>) -> Self {
        Self::wildcard(Some(path.into()), LoadStrategy::Lazy)
    }

    pub fn allow_multiplication(mut self) -> Self {
        self.allow_multiplication = true;
        self
    }

    pub fn load_only(mut self, columns: &[&str]) -> Self {
        self.load_only = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn path(&self) -> Option<&RelationPath> {
        match &self.scope {
            DirectiveScope::Path(path) => Some(path),
            DirectiveScope::Wildcard(_) | DirectiveScope::Level(_) => None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.scope, DirectiveScope::Wildcard(_) | DirectiveScope::Level(_))
    }

    /// Reject directives that are malformed on their own
    pub fn validate(&self) -> OrmResult<()> {
        match &self.scope {
            DirectiveScope::Wildcard(_) | DirectiveScope::Level(_) => {
                if self.strategy.is_fetch() {
                    return Err(OrmError::InvalidDirective(format!(
                        "wildcard '{}' can only forbid or allow lazy access, not {}",
                        self.scope, self.strategy
                    )));
                }
                if self.load_only.is_some() {
                    return Err(OrmError::InvalidDirective(format!(
                        "wildcard '{}' cannot restrict columns",
                        self.scope
                    )));
                }
            }
            DirectiveScope::Path(path) => {
                if path.is_root() {
                    return Err(OrmError::InvalidDirective(
                        "directive path must name at least one relationship".to_string(),
                    ));
                }
                if self.load_only.is_some() && !self.strategy.is_fetch() {
                    return Err(OrmError::InvalidDirective(format!(
                        "'{}' restricts columns but does not fetch",
                        path
                    )));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for LoadDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.strategy, self.scope)?;
        if self.allow_multiplication {
            write!(f, "[multiply]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_constructors() {
        let directive = LoadDirective::join_fetch("emails").allow_multiplication();
        assert_eq!(directive.path(), Some(&RelationPath::parse("emails")));
        assert!(directive.allow_multiplication);
        assert_eq!(directive.to_string(), "join-fetch(emails)[multiply]");

        let wildcard = LoadDirective::forbid_all_under("clazz");
        assert!(wildcard.is_wildcard());
        assert_eq!(wildcard.scope.wildcard_level(), Some(RelationPath::parse("clazz")));
        assert_eq!(wildcard.to_string(), "forbid-lazy(clazz.*)");
        assert_eq!(LoadDirective::forbid_all().scope.wildcard_level(), Some(RelationPath::root()));

        let level = LoadDirective::forbid_root_level();
        assert!(level.is_wildcard());
        assert_eq!(level.path(), None);
        assert_eq!(level.to_string(), "forbid-lazy(*[level])");
        assert_eq!(LoadDirective::forbid_level("clazz").to_string(), "forbid-lazy(clazz.*[level])");
    }

    #[test]
    fn test_directive_validation() {
        assert!(LoadDirective::batched("emails").load_only(&["email"]).validate().is_ok());
        assert!(LoadDirective::forbid_all().validate().is_ok());

        let fetch_wildcard = LoadDirective {
            strategy: LoadStrategy::JoinFetch,
            ..LoadDirective::forbid_all()
        };
        assert!(matches!(fetch_wildcard.validate(), Err(OrmError::InvalidDirective(_))));
        assert!(LoadDirective::batched("").validate().is_err());
        assert!(LoadDirective::forbid("emails").load_only(&["email"]).validate().is_err());
    }
}
