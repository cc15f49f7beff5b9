// Named schedule policies and group → policy bindings

use crate::config::{GroupBinding, PolicyDefinition, ScheduleConfig};
use crate::errors::ValidationError;
use crate::schedule::parse_crontab;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Built-in alias that always resolves, regardless of configuration
pub const DAILY: &str = "daily";
pub const DAILY_CRON: &str = "0 */23 * * *";
pub const HOURLY: &str = "hourly";
pub const HOURLY_CRON: &str = "0 * * * *";

/// Lower-case a policy name and treat `_` and `-` as the same separator
pub fn normalize_policy_name(name: &str) -> String {
    name.trim().to_lowercase().replace('_', "-")
}

fn builtin(normalized: &str) -> Option<&'static str> {
    match normalized {
        DAILY => Some(DAILY_CRON),
        HOURLY => Some(HOURLY_CRON),
        _ => None,
    }
}

/// Validated mapping of policy name → crontab expression
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, String>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured definitions, logging and dropping bad ones
    pub fn from_definitions(definitions: &[PolicyDefinition]) -> Self {
        let mut registry = Self::new();
        for def in definitions {
            if let Err(e) = registry.register(&def.name, &def.cron) {
                error!(policy = %def.name, error = %e, "Skipping policy definition");
            }
        }
        registry
    }

    /// Register a policy. The first registration of a normalized name wins.
    pub fn register(&mut self, name: &str, cron: &str) -> Result<(), ValidationError> {
        let normalized = normalize_policy_name(name);
        if normalized.is_empty() {
            return Err(ValidationError::MissingField("policy name".to_string()));
        }

        parse_crontab(cron)?;

        if builtin(&normalized).is_some() || self.policies.contains_key(&normalized) {
            return Err(ValidationError::DuplicatePolicy(normalized));
        }

        debug!(policy = %normalized, cron = %cron, "Registered policy");
        self.policies.insert(normalized, cron.trim().to_string());
        Ok(())
    }

    /// Crontab expression for a policy token; built-in aliases resolve first
    pub fn lookup(&self, token: &str) -> Option<&str> {
        let normalized = normalize_policy_name(token);
        builtin(&normalized).or_else(|| self.policies.get(&normalized).map(String::as_str))
    }

    pub fn contains(&self, token: &str) -> bool {
        self.lookup(token).is_some()
    }

    /// Number of configured policies, excluding the built-in aliases
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Group path → crontab expression, used for projects without an override tag
#[derive(Debug, Clone, Default)]
pub struct GroupScheduleRegistry {
    bindings: BTreeMap<String, String>,
}

impl GroupScheduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bindings(bindings: &[GroupBinding], policies: &PolicyRegistry) -> Self {
        let mut registry = Self::new();
        for binding in bindings {
            if let Err(e) = registry.bind(&binding.group, &binding.policy, policies) {
                error!(group = %binding.group, policy = %binding.policy, error = %e, "Skipping group schedule");
            }
        }
        registry
    }

    pub fn bind(
        &mut self,
        group_path: &str,
        policy: &str,
        policies: &PolicyRegistry,
    ) -> Result<(), ValidationError> {
        let path = normalize_group_path(group_path);
        if path.is_empty() {
            return Err(ValidationError::MissingField("group".to_string()));
        }
        if self.bindings.contains_key(&path) {
            warn!(group = %path, "Duplicate group schedule");
            return Err(ValidationError::DuplicateGroupBinding(path));
        }

        let cron = policies
            .lookup(policy)
            .ok_or_else(|| ValidationError::UnknownPolicy(policy.to_string()))?;

        self.bindings.insert(path, cron.to_string());
        Ok(())
    }

    /// Crontab bound to exactly this path
    pub fn get(&self, group_path: &str) -> Option<&str> {
        self.bindings
            .get(&normalize_group_path(group_path))
            .map(String::as_str)
    }

    /// Every binding that applies to a group path: the path itself, then each
    /// ancestor from nearest to farthest.
    pub fn schedules_for(&self, group_path: &str) -> Vec<&str> {
        ancestor_paths(&normalize_group_path(group_path))
            .iter()
            .filter_map(|p| self.bindings.get(p).map(String::as_str))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Registries materialized once from configuration
#[derive(Debug, Clone, Default)]
pub struct SchedulePolicies {
    pub policies: PolicyRegistry,
    pub groups: GroupScheduleRegistry,
    /// Crontab of the global default policy, when one is configured and valid
    pub default_cron: Option<String>,
}

impl SchedulePolicies {
    pub fn from_config(config: &ScheduleConfig) -> Self {
        let policies = PolicyRegistry::from_definitions(&config.policies);
        let groups = GroupScheduleRegistry::from_bindings(&config.groups, &policies);

        let default_cron = config.default_policy.as_deref().and_then(|name| {
            let cron = policies.lookup(name).map(str::to_string);
            if cron.is_none() {
                error!(policy = %name, "Default schedule names an unknown policy, ignoring");
            }
            cron
        });

        Self {
            policies,
            groups,
            default_cron,
        }
    }

    /// True when untagged projects can receive a schedule at all
    pub fn has_untagged_sources(&self) -> bool {
        !self.groups.is_empty() || self.default_cron.is_some()
    }
}

fn normalize_group_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn ancestor_paths(path: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut current = path;
    while !current.is_empty() {
        paths.push(current.to_string());
        current = match current.rfind('/') {
            Some(idx) => &current[..idx],
            None => "",
        };
    }
    paths
}
