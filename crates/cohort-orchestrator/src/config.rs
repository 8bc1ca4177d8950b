use cohort_core::{CohortError, CohortResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How agents coordinate. Reported in status snapshots; assignment itself is
/// always driven by the central cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationStrategy {
    #[default]
    Centralized,
    Distributed,
    Hierarchical,
    Adaptive,
}

impl std::fmt::Display for CoordinationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinationStrategy::Centralized => write!(f, "centralized"),
            CoordinationStrategy::Distributed => write!(f, "distributed"),
            CoordinationStrategy::Hierarchical => write!(f, "hierarchical"),
            CoordinationStrategy::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// Tunables for an [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum number of registered agents.
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// Sleep between orchestration cycles.
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    /// Sleep after a cycle that returned an error.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// How long `stop` waits for the worker before giving up on it.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Ready tasks considered per cycle.
    #[serde(default = "default_max_tasks_per_cycle")]
    pub max_tasks_per_cycle: usize,
    /// Finished tasks kept in the scheduler history.
    #[serde(default = "default_history_capacity")]
    pub task_history_capacity: usize,
    /// Assignment records kept by the assignment engine.
    #[serde(default = "default_history_capacity")]
    pub assignment_history_capacity: usize,
    #[serde(default)]
    pub strategy: CoordinationStrategy,
}

fn default_max_agents() -> usize {
    100
}
fn default_cycle_interval_ms() -> u64 {
    1000
}
fn default_error_backoff_ms() -> u64 {
    5000
}
fn default_stop_timeout_ms() -> u64 {
    2000
}
fn default_max_tasks_per_cycle() -> usize {
    5
}
fn default_history_capacity() -> usize {
    1000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            cycle_interval_ms: default_cycle_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            max_tasks_per_cycle: default_max_tasks_per_cycle(),
            task_history_capacity: default_history_capacity(),
            assignment_history_capacity: default_history_capacity(),
            strategy: CoordinationStrategy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> CohortResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| CohortError::Config(format!("Invalid orchestrator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML config file.
    pub async fn load(path: impl AsRef<Path>) -> CohortResult<Self> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            CohortError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> CohortResult<()> {
        if self.max_agents == 0 {
            return Err(CohortError::Config("max_agents must be at least 1".into()));
        }
        if self.cycle_interval_ms == 0 {
            return Err(CohortError::Config(
                "cycle_interval_ms must be greater than zero".into(),
            ));
        }
        if self.max_tasks_per_cycle == 0 {
            return Err(CohortError::Config(
                "max_tasks_per_cycle must be at least 1".into(),
            ));
        }
        if self.task_history_capacity == 0 || self.assignment_history_capacity == 0 {
            return Err(CohortError::Config(
                "history capacities must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_tasks_per_cycle, 5);
        assert_eq!(config.cycle_interval(), Duration::from_secs(1));
        assert_eq!(config.error_backoff(), Duration::from_secs(5));
        assert_eq!(config.stop_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            max_agents = 8
            strategy = "hierarchical"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_agents, 8);
        assert_eq!(config.strategy, CoordinationStrategy::Hierarchical);
        assert_eq!(config.cycle_interval_ms, 1000);
        assert_eq!(config.task_history_capacity, 1000);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = OrchestratorConfig::from_toml_str("max_agents = 0").unwrap_err();
        assert!(matches!(err, CohortError::Config(_)));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let err = OrchestratorConfig::from_toml_str("max_agents = \"many\"").unwrap_err();
        assert!(err.to_string().contains("Invalid orchestrator config"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cohort.toml");
        tokio::fs::write(&path, "cycle_interval_ms = 250\nmax_tasks_per_cycle = 2\n")
            .await
            .unwrap();

        let config = OrchestratorConfig::load(&path).await.unwrap();
        assert_eq!(config.cycle_interval(), Duration::from_millis(250));
        assert_eq!(config.max_tasks_per_cycle, 2);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = OrchestratorConfig::load("/nonexistent/cohort.toml")
            .await
            .unwrap_err();
        assert!(matches!(err, CohortError::Config(_)));
    }
}
