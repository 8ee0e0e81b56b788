//! Fleet configuration stored in `fleet.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::BudgetConfig;
use crate::core::complexity::ComplexityConfig;
use crate::core::model_selector::ModelTiers;
use crate::core::stuck::StuckConfig;

pub const DEFAULT_CONFIG_PATH: &str = "fleet.toml";

/// Fleet configuration (TOML).
///
/// Edited by humans; every section and field is optional and falls back to
/// the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    pub daemon: DaemonConfig,
    pub budget: BudgetConfig,
    pub complexity: ComplexityConfig,
    pub models: ModelTiers,
    pub stuck: StuckConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Upper bound on concurrently executing runs.
    pub max_concurrent_runs: usize,
    /// Sleep between cycles.
    pub polling_interval_ms: u64,
    /// Only dispatch ready items of this goal.
    pub goal_scope: Option<String>,
    /// `max_retries` for planned items that do not set their own.
    pub default_max_retries: u32,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
    /// Block items whose estimated spend would exceed the goal budget.
    pub enforce_budget: bool,
    /// Recorded as `agent_type` on every run.
    pub agent_type: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 3,
            polling_interval_ms: 5_000,
            goal_scope: None,
            default_max_retries: 3,
            event_buffer: 256,
            enforce_budget: true,
            agent_type: "worker".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_runs == 0 {
            return Err(anyhow!("daemon.max_concurrent_runs must be > 0"));
        }
        if self.polling_interval_ms == 0 {
            return Err(anyhow!("daemon.polling_interval_ms must be > 0"));
        }
        if self.default_max_retries == 0 {
            return Err(anyhow!("daemon.default_max_retries must be > 0"));
        }
        if self.event_buffer == 0 {
            return Err(anyhow!("daemon.event_buffer must be > 0"));
        }
        if self.agent_type.trim().is_empty() {
            return Err(anyhow!("daemon.agent_type must not be empty"));
        }
        if self.goal_scope.as_deref().is_some_and(|g| g.trim().is_empty()) {
            return Err(anyhow!("daemon.goal_scope must not be empty when set"));
        }
        Ok(())
    }
}

impl FleetConfig {
    pub fn validate(&self) -> Result<()> {
        self.daemon.validate()?;
        self.budget.validate()?;
        self.complexity.validate()?;
        self.models.validate()?;
        self.stuck.validate()?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FleetConfig::default()`.
pub fn load_config(path: &Path) -> Result<FleetConfig> {
    if !path.exists() {
        let cfg = FleetConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FleetConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FleetConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, FleetConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("fleet.toml");
        let mut cfg = FleetConfig::default();
        cfg.daemon.goal_scope = Some("goal-1".to_string());
        cfg.models.simple.fallback = None;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fleet.toml");
        fs::write(
            &path,
            "[daemon]\nmax_concurrent_runs = 8\n\n[stuck]\nmax_same_error_retries = 2\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.daemon.max_concurrent_runs, 8);
        assert_eq!(cfg.daemon.polling_interval_ms, 5_000);
        assert_eq!(cfg.stuck.max_same_error_retries, 2);
        assert_eq!(cfg.models, ModelTiers::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fleet.toml");
        fs::write(&path, "[daemon]\nmax_concurrent_runs = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("max_concurrent_runs must be > 0"));
    }
}
