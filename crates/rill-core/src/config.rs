//! Engine configuration.
//!
//! Loaded from JSON (typically a section of the host's settings file) and
//! overridable through `RILL_*` environment variables.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::execute::{Concurrent, Direct, ExecutionStrategy, Isolated};
use crate::state::{DEFAULT_MAX_DEPTH, DuplicationRegistry};

/// What the controller does with the descendants of changed cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnCellChange {
    /// Run them immediately.
    #[default]
    Eager,
    /// Mark them stale until the host asks for them.
    Lazy,
}

/// Which execution strategy runs cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Direct,
    Isolated,
    Concurrent,
}

impl FromStr for OnCellChange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "eager" | "autorun" => Ok(OnCellChange::Eager),
            "lazy" => Ok(OnCellChange::Lazy),
            other => Err(Error::Config(format!("unknown on_cell_change mode '{other}'"))),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExecutionMode::Direct),
            "isolated" | "strict" => Ok(ExecutionMode::Isolated),
            "concurrent" | "parallel" => Ok(ExecutionMode::Concurrent),
            other => Err(Error::Config(format!("unknown execution mode '{other}'"))),
        }
    }
}

/// Runtime configuration for the reactive engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub on_cell_change: OnCellChange,
    pub execution: ExecutionMode,
    /// Worker threads for concurrent execution (defaults to available parallelism).
    pub workers: Option<usize>,
    /// Run each cell in isolation under concurrent execution.
    pub isolate_concurrent: bool,
    /// Re-run cells that failed on a missing reference once their definers ran.
    pub self_heal: bool,
    /// Nesting limit for isolated copies.
    pub max_copy_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            on_cell_change: OnCellChange::Eager,
            execution: ExecutionMode::Direct,
            workers: None,
            isolate_concurrent: false,
            self_heal: true,
            max_copy_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults with `RILL_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (`RILL_ON_CELL_CHANGE`, `RILL_EXECUTION`,
    /// `RILL_WORKERS`, `RILL_ISOLATE_CONCURRENT`, `RILL_SELF_HEAL`).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("RILL_ON_CELL_CHANGE") {
            self.on_cell_change = v.parse()?;
        }
        if let Some(v) = lookup("RILL_EXECUTION") {
            self.execution = v.parse()?;
        }
        if let Some(v) = lookup("RILL_WORKERS") {
            let workers = v
                .parse::<usize>()
                .map_err(|e| Error::Config(format!("RILL_WORKERS='{v}': {e}")))?;
            self.workers = Some(workers);
        }
        if let Some(v) = lookup("RILL_ISOLATE_CONCURRENT") {
            self.isolate_concurrent = parse_flag("RILL_ISOLATE_CONCURRENT", &v)?;
        }
        if let Some(v) = lookup("RILL_SELF_HEAL") {
            self.self_heal = parse_flag("RILL_SELF_HEAL", &v)?;
        }
        Ok(self)
    }

    /// Number of workers concurrent execution would use.
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    /// Build the configured execution strategy.
    pub fn build_strategy(&self) -> Result<Box<dyn ExecutionStrategy>> {
        self.build_strategy_with(DuplicationRegistry::new())
    }

    /// Build the configured strategy, copying host objects with `registry`
    /// when execution is isolated.
    pub fn build_strategy_with(&self, registry: DuplicationRegistry) -> Result<Box<dyn ExecutionStrategy>> {
        let isolated = || Isolated::with_registry(registry.clone().with_max_depth(self.max_copy_depth));
        let strategy: Box<dyn ExecutionStrategy> = match self.execution {
            ExecutionMode::Direct => Box::new(Direct),
            ExecutionMode::Isolated => Box::new(isolated()),
            ExecutionMode::Concurrent if self.isolate_concurrent => {
                Box::new(Concurrent::new(isolated(), self.effective_workers())?)
            }
            ExecutionMode::Concurrent => Box::new(Concurrent::new(Direct, self.effective_workers())?),
        };
        tracing::debug!("using {} execution", strategy.name());
        Ok(strategy)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key}='{value}' is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.on_cell_change, OnCellChange::Eager);
        assert_eq!(config.execution, ExecutionMode::Direct);
        assert!(config.self_heal);
    }

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(r#"{"on_cell_change": "lazy", "workers": 3}"#).unwrap();
        assert_eq!(config.on_cell_change, OnCellChange::Lazy);
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.execution, ExecutionMode::Direct);
    }

    #[test]
    fn test_from_json_invalid() {
        let err = EngineConfig::from_json(r#"{"execution": "warp"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::default()
            .with_overrides(|key| match key {
                "RILL_EXECUTION" => Some("Concurrent".into()),
                "RILL_WORKERS" => Some("2".into()),
                "RILL_ISOLATE_CONCURRENT" => Some("yes".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.execution, ExecutionMode::Concurrent);
        assert_eq!(config.effective_workers(), 2);
        assert!(config.isolate_concurrent);

        let strategy = config.build_strategy().unwrap();
        assert_eq!(strategy.name(), "concurrent");
    }

    #[test]
    fn test_bad_override() {
        let result = EngineConfig::default().with_overrides(|key| {
            (key == "RILL_WORKERS").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
