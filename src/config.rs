//! Engine configuration.
//!
//! Loaded once per invocation from TOML and threaded explicitly; nothing in
//! the engine consults ambient configuration after startup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::policy::RawPolicy;

/// Whether a passing gate may merge without a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Eligible steps merge automatically.
    Auto,
    /// Every step halts for approval, whatever the gate says.
    #[default]
    Manual,
}

/// Whether the review service is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewToggle {
    /// Review runs after the gate passes.
    #[default]
    On,
    /// Review is skipped; the gate alone decides.
    Off,
}

impl ReviewToggle {
    /// True when review is enabled.
    pub fn is_enabled(&self) -> bool {
        matches!(self, ReviewToggle::On)
    }
}

/// Timeouts for collaborator calls. A timeout is an execution failure for
/// the step, never a gate outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Planning call timeout in seconds.
    #[serde(default = "default_planning_timeout")]
    pub planning_secs: u64,
    /// Per-step execution timeout in seconds.
    #[serde(default = "default_execution_timeout")]
    pub execution_secs: u64,
    /// Review call timeout in seconds.
    #[serde(default = "default_review_timeout")]
    pub review_secs: u64,
}

fn default_planning_timeout() -> u64 {
    600
}

fn default_execution_timeout() -> u64 {
    1800
}

fn default_review_timeout() -> u64 {
    600
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            planning_secs: default_planning_timeout(),
            execution_secs: default_execution_timeout(),
            review_secs: default_review_timeout(),
        }
    }
}

impl TimeoutsConfig {
    /// Planning timeout as a Duration.
    pub fn planning(&self) -> Duration {
        Duration::from_secs(self.planning_secs)
    }

    /// Execution timeout as a Duration.
    pub fn execution(&self) -> Duration {
        Duration::from_secs(self.execution_secs)
    }

    /// Review timeout as a Duration.
    pub fn review(&self) -> Duration {
        Duration::from_secs(self.review_secs)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Approval mode, read once per run.
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    /// Review toggle.
    #[serde(default)]
    pub review: ReviewToggle,
    /// Ceiling on repair passes.
    #[serde(default = "default_max_repair_attempts")]
    pub max_repair_attempts: u32,
    /// Retries for a failing execution call before the step is marked failed.
    #[serde(default = "default_max_execution_retries")]
    pub max_execution_retries: u32,
    /// Collaborator call timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Merge policy, normalized at run start.
    #[serde(default)]
    pub policy: RawPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::default(),
            review: ReviewToggle::default(),
            max_repair_attempts: default_max_repair_attempts(),
            max_execution_retries: default_max_execution_retries(),
            timeouts: TimeoutsConfig::default(),
            policy: RawPolicy::default(),
        }
    }
}

fn default_max_repair_attempts() -> u32 {
    2
}

fn default_max_execution_retries() -> u32 {
    2
}

impl EngineConfig {
    /// Parses configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid engine config: {}", e)))
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Severity;
    use crate::services::IssueSeverity;

    #[test]
    fn engine_config_has_safe_defaults() {
        let config = EngineConfig::default();
        // Manual approval and enabled review are the fail-closed defaults.
        assert_eq!(config.approval_mode, ApprovalMode::Manual);
        assert_eq!(config.review, ReviewToggle::On);
        assert_eq!(config.max_repair_attempts, 2);
        assert_eq!(config.max_execution_retries, 2);
    }

    #[test]
    fn engine_config_deserializes_from_toml() {
        let toml = r#"
            approval_mode = "auto"
            review = "off"
            max_repair_attempts = 3

            [timeouts]
            execution_secs = 120

            [policy]
            allow_paths = ["projects/demo/**"]
            hard_stop_paths = ["agents/**"]
            max_files_changed = 10
            warnings_force_manual = true
            repair_trigger_severity = "high"

            [[policy.content_rules]]
            pattern = "AKIA[0-9A-Z]{16}"
            severity = "block"
        "#;

        let config = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.approval_mode, ApprovalMode::Auto);
        assert_eq!(config.review, ReviewToggle::Off);
        assert_eq!(config.max_repair_attempts, 3);
        assert_eq!(config.timeouts.execution(), Duration::from_secs(120));
        assert_eq!(config.policy.allow_paths, vec!["projects/demo/**"]);
        assert_eq!(config.policy.max_files_changed, 10);
        assert!(config.policy.warnings_force_manual);
        assert_eq!(config.policy.repair_trigger_severity, IssueSeverity::High);
        assert_eq!(config.policy.content_rules[0].severity, Severity::Block);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.timeouts, TimeoutsConfig::default());
        assert_eq!(config.policy.max_lines_added, 500);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = EngineConfig::from_toml_str("approval_mode = ").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn approval_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ApprovalMode::Auto).unwrap(), "\"auto\"");
        assert_eq!(
            serde_json::to_string(&ApprovalMode::Manual).unwrap(),
            "\"manual\""
        );
    }
}
