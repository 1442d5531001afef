//! Planner configuration
//!
//! Resolved once at process start (defaults, then an optional YAML file,
//! then `EAGERLOAD_*` environment variables) and shared immutably after
//! that.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backends::DatabaseBackendType;
use crate::error::{OrmError, OrmResult};

pub const ENV_BACKEND: &str = "EAGERLOAD_BACKEND";
pub const ENV_MAX_BATCH_SIZE: &str = "EAGERLOAD_MAX_BATCH_SIZE";
pub const ENV_COMPOSITE_IN: &str = "EAGERLOAD_COMPOSITE_IN";
pub const ENV_PREFER_OUTER_JOIN: &str = "EAGERLOAD_PREFER_OUTER_JOIN";
pub const ENV_LAZY_POLICY: &str = "EAGERLOAD_LAZY_POLICY";
pub const ENV_PARALLEL_BATCHES: &str = "EAGERLOAD_PARALLEL_BATCHES";

/// What happens on access to a relationship no directive covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LazyPolicy {
    /// Fail with `LazyAccessViolation`
    Raise,
    /// Allow a single explicit fetch through `load_relation`
    Allow,
}

impl Default for LazyPolicy {
    fn default() -> Self {
        LazyPolicy::Raise
    }
}

impl FromStr for LazyPolicy {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raise" => Ok(LazyPolicy::Raise),
            "allow" => Ok(LazyPolicy::Allow),
            _ => Err(invalid_value("default_lazy_policy", s, "raise or allow")),
        }
    }
}

/// Where a configuration value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    EnvVar(&'static str),
}

/// Process-wide planner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlannerConfig {
    pub backend: DatabaseBackendType,
    /// Tuple `IN` support; derived from `backend` when unset
    pub composite_in_supported: Option<bool>,
    pub max_batch_size: usize,
    pub prefer_outer_join: bool,
    pub default_lazy_policy: LazyPolicy,
    pub parallel_batches: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackendType::PostgreSQL,
            composite_in_supported: None,
            max_batch_size: 1000,
            prefer_outer_join: true,
            default_lazy_policy: LazyPolicy::Raise,
            parallel_batches: false,
        }
    }
}

impl PlannerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a specific backend with its capability defaults
    pub fn for_backend(backend: DatabaseBackendType) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_composite_in(mut self, supported: bool) -> Self {
        self.composite_in_supported = Some(supported);
        self
    }

    pub fn with_prefer_outer_join(mut self, prefer: bool) -> Self {
        self.prefer_outer_join = prefer;
        self
    }

    pub fn with_lazy_policy(mut self, policy: LazyPolicy) -> Self {
        self.default_lazy_policy = policy;
        self
    }

    pub fn with_parallel_batches(mut self, parallel: bool) -> Self {
        self.parallel_batches = parallel;
        self
    }

    /// Effective tuple `IN` capability
    pub fn supports_composite_in(&self) -> bool {
        self.composite_in_supported
            .unwrap_or_else(|| self.backend.supports_tuple_in())
    }

    /// Parse a YAML document; absent keys keep their defaults
    pub fn from_yaml_str(yaml: &str) -> OrmResult<Self> {
        let config: PlannerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file and apply environment overrides on top
    pub fn load(path: impl AsRef<Path>) -> OrmResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            OrmError::Configuration(format!("Cannot read '{}': {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&contents)?.with_env_overrides()?;
        tracing::debug!("Loaded planner configuration from {}", path.display());
        Ok(config)
    }

    /// Defaults with environment overrides
    pub fn from_env() -> OrmResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `EAGERLOAD_*` environment variables on top of `self`
    pub fn with_env_overrides(mut self) -> OrmResult<Self> {
        if let Ok(value) = env::var(ENV_BACKEND) {
            self.backend = value.parse().map_err(|_| {
                invalid_value("backend", &value, "postgresql, mysql, or sqlite")
            })?;
        }

        if let Ok(value) = env::var(ENV_MAX_BATCH_SIZE) {
            self.max_batch_size = value
                .parse()
                .map_err(|_| invalid_value("max_batch_size", &value, "positive integer"))?;
        }

        if let Ok(value) = env::var(ENV_COMPOSITE_IN) {
            self.composite_in_supported = Some(parse_bool("composite_in_supported", &value)?);
        }

        if let Ok(value) = env::var(ENV_PREFER_OUTER_JOIN) {
            self.prefer_outer_join = parse_bool("prefer_outer_join", &value)?;
        }

        if let Ok(value) = env::var(ENV_LAZY_POLICY) {
            self.default_lazy_policy = value.parse()?;
        }

        if let Ok(value) = env::var(ENV_PARALLEL_BATCHES) {
            self.parallel_batches = parse_bool("parallel_batches", &value)?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> OrmResult<()> {
        if self.max_batch_size == 0 {
            return Err(invalid_value(
                "max_batch_size",
                &self.max_batch_size.to_string(),
                "positive integer",
            ));
        }

        Ok(())
    }

    /// Which fields are currently overridden by the environment
    pub fn config_sources(&self) -> HashMap<&'static str, ConfigSource> {
        [
            ("backend", ENV_BACKEND),
            ("max_batch_size", ENV_MAX_BATCH_SIZE),
            ("composite_in_supported", ENV_COMPOSITE_IN),
            ("prefer_outer_join", ENV_PREFER_OUTER_JOIN),
            ("default_lazy_policy", ENV_LAZY_POLICY),
            ("parallel_batches", ENV_PARALLEL_BATCHES),
        ]
        .into_iter()
        .map(|(field, var)| {
            let source = if env::var(var).is_ok() {
                ConfigSource::EnvVar(var)
            } else {
                ConfigSource::Default
            };
            (field, source)
        })
        .collect()
    }
}

fn parse_bool(field: &str, value: &str) -> OrmResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid_value(field, value, "true or false")),
    }
}

fn invalid_value(field: &str, value: &str, expected: &str) -> OrmError {
    OrmError::Configuration(format!(
        "invalid value '{}' for '{}', expected {}",
        value, field, expected
    ))
}
