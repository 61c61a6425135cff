//! Rule set configuration.
//!
//! A rule set is pure data: it names which limits are active at the
//! `namespace` scope (one counter family shared by every key) and at the
//! `keyspace` scope (one counter family per key). Any sub-rule that is not
//! present leaves that axis unconstrained.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::identity::{LimitType, Scope};
use crate::error::{JobgateError, Result};

/// The complete set of limits enforced by a limiter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Limits shared by every key in a namespace
    #[serde(default)]
    pub namespace: ScopeRules,
    /// Limits applied to each key independently
    #[serde(default)]
    pub keyspace: ScopeRules,
}

/// Limits configured for one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_jobs_per_timespan: Option<TimespanRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items_per_timespan: Option<TimespanRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<ConcurrencyRules>,
}

/// A global limit and per-kind limits that share a window semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimespanRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<TimespanLimit>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub kinds: HashMap<String, TimespanLimit>,
}

/// At most `count` units within a fixed window of `timespan` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimespanLimit {
    pub count: u64,
    /// Window length in milliseconds
    #[serde(alias = "timespanMs")]
    pub timespan: u64,
}

impl TimespanLimit {
    pub fn new(count: u64, timespan: Duration) -> Self {
        Self {
            count,
            timespan: timespan.as_millis() as u64,
        }
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.timespan)
    }
}

/// Concurrency ceilings. These carry no window; slots are released explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub kinds: HashMap<String, u64>,
}

/// A resolved limit for one (scope, limit type, kind) cell of the rule matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    /// Ceiling for the counter
    pub count: u64,
    /// Window for timespan-bounded limits, `None` for concurrency limits
    pub window: Option<Duration>,
}

impl RuleSet {
    /// Create an empty rule set (everything unconstrained).
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a rule set from a YAML (or JSON) file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rule set");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a rule set from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RuleSet = serde_yaml::from_str(yaml)
            .map_err(|e| JobgateError::Config(format!("Failed to parse rule set: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Get the rules for a scope.
    pub fn scope(&self, scope: Scope) -> &ScopeRules {
        match scope {
            Scope::Namespace => &self.namespace,
            Scope::Key => &self.keyspace,
        }
    }

    /// Check that every configured window has a non-zero length.
    pub fn validate(&self) -> Result<()> {
        for (scope, rules) in [(Scope::Namespace, &self.namespace), (Scope::Key, &self.keyspace)] {
            for (limit_type, timespan) in [
                (LimitType::MaxJobsPerTimespan, &rules.max_jobs_per_timespan),
                (LimitType::MaxItemsPerTimespan, &rules.max_items_per_timespan),
            ] {
                let Some(timespan) = timespan else { continue };
                let limits = timespan
                    .global
                    .iter()
                    .map(|l| ("global", l))
                    .chain(timespan.kinds.iter().map(|(k, l)| (k.as_str(), l)));
                for (label, limit) in limits {
                    if limit.timespan == 0 {
                        return Err(JobgateError::Config(format!(
                            "{} {} rule '{}' must have a timespan greater than 0",
                            scope, limit_type, label
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve the threshold for one cell of the rule matrix.
    ///
    /// `kind = None` selects the global limit; `Some(kind)` selects the
    /// kind-specific one. Returns `None` when the cell is unconstrained.
    pub fn threshold(&self, scope: Scope, limit_type: LimitType, kind: Option<&str>) -> Option<Threshold> {
        let rules = self.scope(scope);
        match limit_type {
            LimitType::MaxJobsPerTimespan => {
                Self::timespan_threshold(rules.max_jobs_per_timespan.as_ref()?, kind)
            }
            LimitType::MaxItemsPerTimespan => {
                Self::timespan_threshold(rules.max_items_per_timespan.as_ref()?, kind)
            }
            LimitType::MaxConcurrentJobs => {
                let concurrency = rules.max_concurrent_jobs.as_ref()?;
                let count = match kind {
                    None => concurrency.global?,
                    Some(kind) => *concurrency.kinds.get(kind)?,
                };
                Some(Threshold { count, window: None })
            }
        }
    }

    fn timespan_threshold(rules: &TimespanRules, kind: Option<&str>) -> Option<Threshold> {
        let limit = match kind {
            None => rules.global.as_ref()?,
            Some(kind) => rules.kinds.get(kind)?,
        };
        Some(Threshold {
            count: limit.count,
            window: Some(limit.window()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_namespace_jobs_rule() {
        let yaml = r#"
namespace:
  maxJobsPerTimespan:
    global:
      count: 10
      timespan: 15000
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();
        let global = rules.namespace.max_jobs_per_timespan.as_ref().unwrap().global.unwrap();
        assert_eq!(global.count, 10);
        assert_eq!(global.window(), Duration::from_secs(15));
        assert_eq!(rules.keyspace, ScopeRules::default());
    }

    #[test]
    fn test_parse_full_matrix() {
        let yaml = r#"
namespace:
  maxConcurrentJobs:
    global: 4
    kinds:
      email: 1
  maxItemsPerTimespan:
    kinds:
      upload:
        count: 100
        timespanMs: 60000
keyspace:
  maxJobsPerTimespan:
    global: { count: 5, timespan: 1000 }
    kinds:
      email: { count: 2, timespan: 1000 }
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();

        let concurrency = rules.namespace.max_concurrent_jobs.as_ref().unwrap();
        assert_eq!(concurrency.global, Some(4));
        assert_eq!(concurrency.kinds["email"], 1);

        let items = rules.namespace.max_items_per_timespan.as_ref().unwrap();
        assert!(items.global.is_none());
        assert_eq!(items.kinds["upload"].timespan, 60000);

        let jobs = rules.keyspace.max_jobs_per_timespan.as_ref().unwrap();
        assert_eq!(jobs.kinds["email"].count, 2);
    }

    #[test]
    fn test_threshold_lookup() {
        let yaml = r#"
namespace:
  maxConcurrentJobs:
    global: 3
keyspace:
  maxJobsPerTimespan:
    kinds:
      sms: { count: 7, timespan: 2000 }
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();

        assert_eq!(
            rules.threshold(Scope::Namespace, LimitType::MaxConcurrentJobs, None),
            Some(Threshold { count: 3, window: None })
        );
        assert_eq!(
            rules.threshold(Scope::Key, LimitType::MaxJobsPerTimespan, Some("sms")),
            Some(Threshold { count: 7, window: Some(Duration::from_secs(2)) })
        );
    }

    #[test]
    fn test_absent_rules_are_unconstrained() {
        let rules = RuleSet::from_yaml("namespace: {}").unwrap();

        for limit_type in LimitType::ALL {
            for scope in [Scope::Namespace, Scope::Key] {
                assert!(rules.threshold(scope, limit_type, None).is_none());
                assert!(rules.threshold(scope, limit_type, Some("any")).is_none());
            }
        }
    }

    #[test]
    fn test_global_and_kind_are_independent() {
        let yaml = r#"
keyspace:
  maxConcurrentJobs:
    kinds:
      email: 2
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();
        assert!(rules.threshold(Scope::Key, LimitType::MaxConcurrentJobs, None).is_none());
        assert!(rules.threshold(Scope::Key, LimitType::MaxConcurrentJobs, Some("sms")).is_none());
        assert_eq!(
            rules
                .threshold(Scope::Key, LimitType::MaxConcurrentJobs, Some("email"))
                .map(|t| t.count),
            Some(2)
        );
    }

    #[test]
    fn test_zero_timespan_rejected() {
        let yaml = r#"
keyspace:
  maxItemsPerTimespan:
    kinds:
      upload: { count: 10, timespan: 0 }
"#;
        let err = RuleSet::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, JobgateError::Config(ref msg) if msg.contains("upload")));
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let err = RuleSet::from_yaml("namespace: [not, a, map]").unwrap_err();
        assert!(matches!(err, JobgateError::Config(_)));
    }

    #[test]
    fn test_serialize_uses_camel_case() {
        let mut rules = RuleSet::new();
        rules.namespace.max_concurrent_jobs = Some(ConcurrencyRules {
            global: Some(1),
            kinds: HashMap::new(),
        });

        let json = serde_json::to_value(&rules).unwrap();
        assert_eq!(json["namespace"]["maxConcurrentJobs"]["global"], 1);
    }
}
