//! Run configuration loaded from YAML, with validation.
//!
//! Validation catches configuration nonsense before any backend call is
//! made; errors are fatal, warnings are logged and tolerated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::KNOWN_BACKENDS;
use crate::error::{Error, Result};
use crate::retry::{Budget, RetryPolicy};

/// Model selection for generation and fallback judging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Model used for routing classification calls.
    pub generation_model: String,
    /// Fast model used for yes/no fallback detection.
    pub judge_model: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            generation_model: "claude-haiku-4-20250514".to_string(),
            judge_model: "claude-haiku-4-20250514".to_string(),
        }
    }
}

/// Per-run spend limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Maximum USD spend per run.
    pub max_cost_per_run: f64,
    /// Maximum backend calls per run.
    pub max_calls_per_run: u32,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            max_cost_per_run: 5.0,
            max_calls_per_run: 500,
        }
    }
}

/// Fail-fast behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FailFastConfig {
    /// Whether fail-fast aborting is enabled.
    pub enabled: bool,
    /// Identical consecutive failures required to abort.
    pub consecutive_threshold: u32,
}

impl Default for FailFastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consecutive_threshold: 3,
        }
    }
}

/// Filesystem layout for datasets and results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where envelopes are written.
    pub results_dir: PathBuf,
    /// Where JSONL case files live.
    pub datasets_dir: PathBuf,
    /// Where baseline envelopes live.
    pub baselines_dir: PathBuf,
    /// Declared domain groups file.
    pub groups_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            datasets_dir: PathBuf::from("datasets"),
            baselines_dir: PathBuf::from("baselines"),
            groups_file: PathBuf::from("groups.yaml"),
        }
    }
}

/// RNG settings recorded into run metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RngConfig {
    /// Seed used when the CLI does not override it.
    pub default_seed: u64,
}

impl Default for RngConfig {
    fn default() -> Self {
        Self { default_seed: 42 }
    }
}

/// Full evaluation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Backend name; one of [`KNOWN_BACKENDS`].
    pub backend: BackendName,
    /// Model selection.
    pub models: ModelsConfig,
    /// Sampling temperature forwarded to invocations.
    pub temperature: f64,
    /// Output-token ceiling per call.
    pub max_output_tokens: MaxOutputTokens,
    /// Wall-clock timeout per invocation, in seconds.
    pub invocation_timeout_secs: InvocationTimeoutSecs,
    /// Retry behavior.
    pub retry: RetryPolicy,
    /// Budget limits.
    pub cost: CostConfig,
    /// Fail-fast behavior.
    pub fail_fast: FailFastConfig,
    /// Filesystem layout.
    pub paths: PathsConfig,
    /// RNG settings.
    pub rng: RngConfig,
}

// Newtype defaults keep the YAML flat while giving serde field defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendName(pub String);

impl Default for BackendName {
    fn default() -> Self {
        Self("claude".to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaxOutputTokens(pub u32);

impl Default for MaxOutputTokens {
    fn default() -> Self {
        Self(512)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationTimeoutSecs(pub u64);

impl Default for InvocationTimeoutSecs {
    fn default() -> Self {
        Self(120)
    }
}

impl EvalConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Loads configuration, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// The per-invocation wall-clock timeout.
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs.0)
    }

    /// A fresh budget for one run.
    pub fn budget(&self) -> Budget {
        Budget::new(self.cost.max_cost_per_run, self.cost.max_calls_per_run)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for EvalConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !KNOWN_BACKENDS.contains(&self.backend.0.as_str()) {
            result.add_error(format!(
                "unknown backend '{}', expected one of: {}",
                self.backend.0,
                KNOWN_BACKENDS.join(", ")
            ));
        }

        if self.invocation_timeout_secs.0 == 0 {
            result.add_error("invocation_timeout_secs must be at least 1");
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            result.add_warning(format!(
                "temperature {} outside the usual 0.0..=2.0 range",
                self.temperature
            ));
        }

        if self.retry.backoff_jitter < 0.0 {
            result.add_error("backoff_jitter cannot be negative");
        }

        if self.retry.backoff_base < 1.0 {
            result.add_warning("backoff_base below 1.0 makes retries faster than first attempts");
        }

        if self.retry.max_retries > 10 {
            result.add_warning("max_retries > 10 may burn the call budget on one broken case");
        }

        if self.cost.max_cost_per_run <= 0.0 {
            result.add_error("max_cost_per_run must be positive");
        }

        if self.cost.max_calls_per_run == 0 {
            result.add_error("max_calls_per_run must be at least 1");
        }

        if self.fail_fast.enabled && self.fail_fast.consecutive_threshold == 0 {
            result.add_error("fail_fast.consecutive_threshold must be at least 1 when enabled");
        }

        if self.max_output_tokens.0 == 0 {
            result.add_error("max_output_tokens must be at least 1");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EvalConfig::default();
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn unknown_backend_fails_validation() {
        let mut config = EvalConfig::default();
        config.backend = BackendName("gpt-cli".to_string());
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("gpt-cli")));
    }

    #[test]
    fn zero_timeout_fails_validation() {
        let mut config = EvalConfig::default();
        config.invocation_timeout_secs = InvocationTimeoutSecs(0);
        let result = config.validate();
        assert!(!result.is_valid());
    }

    #[test]
    fn zero_fail_fast_threshold_fails_when_enabled() {
        let mut config = EvalConfig::default();
        config.fail_fast.consecutive_threshold = 0;
        let result = config.validate();
        assert!(!result.is_valid());

        config.fail_fast.enabled = false;
        let result = config.validate();
        assert!(result.is_valid());
    }

    #[test]
    fn exhausted_budget_limits_fail_validation() {
        let mut config = EvalConfig::default();
        config.cost.max_calls_per_run = 0;
        assert!(!config.validate().is_valid());

        let mut config = EvalConfig::default();
        config.cost.max_cost_per_run = 0.0;
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn high_retry_count_warns() {
        let mut config = EvalConfig::default();
        config.retry.max_retries = 20;
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("10")));
    }

    #[test]
    fn into_result_surfaces_errors() {
        let mut result = ValidationResult::default();
        result.add_warning("minor");
        assert!(result.clone().into_result().is_ok());
        result.add_error("fatal");
        assert!(result.into_result().is_err());
    }

    #[test]
    fn config_parses_partial_yaml_with_defaults() {
        let yaml = r#"
backend: codex
cost:
  max_cost_per_run: 2.5
  max_calls_per_run: 100
"#;
        let config: EvalConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.backend.0, "codex");
        assert_eq!(config.cost.max_calls_per_run, 100);
        // Untouched sections keep their defaults.
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.invocation_timeout_secs.0, 120);
        assert_eq!(config.models.judge_model, "claude-haiku-4-20250514");
    }

    #[test]
    fn budget_reflects_cost_config() {
        let config = EvalConfig::default();
        let budget = config.budget();
        assert_eq!(budget.max_calls, 500);
        assert!((budget.max_cost - 5.0).abs() < 1e-12);
        assert_eq!(budget.spent_calls, 0);
    }
}
