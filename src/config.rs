//! Configuration management for Jobgate.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{JobgateError, Result};
use crate::ratelimit::RuleSet;
use crate::store::LockConfig;

/// Environment variable prefix for overrides, e.g. `JOBGATE__LIMITER__ID`.
const ENV_PREFIX: &str = "JOBGATE";

/// Main configuration for a Jobgate process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobgateConfig {
    /// Limiter identity and lock settings
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// In-process lock behaviour
    #[serde(default)]
    pub lock: LockConfig,

    /// Optional path to a separate rule set file
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Rules declared inline in the configuration file
    #[serde(default)]
    pub rules: RuleSet,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Identity shared by every process enforcing the same limits
    #[serde(default = "default_limiter_id")]
    pub id: String,

    /// Lease of the cross-process lock in milliseconds
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            id: default_limiter_id(),
            lock_lease_ms: default_lock_lease_ms(),
        }
    }
}

impl LimiterConfig {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }
}

fn default_limiter_id() -> String {
    "default".to_string()
}

fn default_lock_lease_ms() -> u64 {
    5000
}

/// Shape used to pull the rule set out of a configuration file verbatim.
#[derive(Deserialize)]
struct RulesSection {
    #[serde(default)]
    rules: RuleSet,
}

impl JobgateConfig {
    /// Load configuration from a file, applying `JOBGATE__*` environment
    /// overrides to the limiter and lock sections.
    ///
    /// Rules are read straight from YAML so their camelCase keys survive;
    /// `rules_path`, when set, replaces any inline rules.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let limiter: LimiterConfig = section(&settings, "limiter")?;
        let lock: LockConfig = section(&settings, "lock")?;
        let rules_path: Option<String> = section(&settings, "rules_path")?;

        let contents = std::fs::read_to_string(path)?;
        let section: RulesSection = serde_yaml::from_str(&contents)?;

        let mut config = Self {
            limiter,
            lock,
            rules_path,
            rules: section.rules,
        };
        config.load_rules_file()?;
        config.rules.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: JobgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| JobgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.load_rules_file()?;
        config.rules.validate()?;
        Ok(config)
    }

    fn load_rules_file(&mut self) -> Result<()> {
        if let Some(path) = &self.rules_path {
            self.rules = RuleSet::from_file(path)?;
        }
        Ok(())
    }
}

/// Read one section, falling back to its defaults when it is absent.
fn section<T>(settings: &config::Config, key: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match settings.get::<T>(key) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}
