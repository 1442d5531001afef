//! Relationship Resolver
//!
//! Walks a dotted relationship path from a root entity, one segment at a
//! time, against the sealed registry.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OrmError, OrmResult};
use crate::schema::{RelationshipSpec, SchemaRegistry};

/// Root-relative sequence of relationship names
///
/// The empty path denotes the root entity itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RelationPath(Vec<String>);

impl RelationPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse `"a.b.c"`; empty segments are dropped
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Last segment
    pub fn leaf(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<RelationPath> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn child(&self, segment: &str) -> RelationPath {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    /// True when `prefix` is this path or one of its ancestors
    pub fn starts_with(&self, prefix: &RelationPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Proper ancestors, shortest first, excluding the root
    pub fn ancestors(&self) -> impl Iterator<Item = RelationPath> + '_ {
        (1..self.0.len()).map(move |len| Self(self.0[..len].to_vec()))
    }
}

impl fmt::Display for RelationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0.join("."))
        }
    }
}

impl From<&str> for RelationPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

/// Resolves relationship paths against a sealed registry
#[derive(Debug, Clone)]
pub struct RelationshipResolver {
    registry: SchemaRegistry,
}

impl RelationshipResolver {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Resolve every segment of `path`, starting at `root`
    ///
    /// Fails with `UnknownRelationship` naming the first undeclared segment
    /// and carrying the full path. Composite bindings come back with
    /// `composite_key` set.
    pub fn resolve(&self, root: &str, path: &RelationPath) -> OrmResult<Vec<RelationshipSpec>> {
        let mut current = self.registry.lookup(root)?;
        let mut resolved = Vec::with_capacity(path.depth());

        for segment in path.segments() {
            let spec = current
                .relationship(segment)
                .ok_or_else(|| OrmError::UnknownRelationship {
                    entity: current.name.clone(),
                    relationship: segment.clone(),
                    path: path.to_string(),
                })?;
            current = self.registry.lookup(&spec.target)?;
            resolved.push(spec.clone());
        }

        Ok(resolved)
    }

    /// Entity type reached at the end of `path`
    pub fn target_of(&self, root: &str, path: &RelationPath) -> OrmResult<String> {
        Ok(self
            .resolve(root, path)?
            .last()
            .map(|spec| spec.target.clone())
            .unwrap_or_else(|| root.to_string()))
    }
}
