//! taskpilot configuration loading and parsing

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use taskpilot_memory::{CacheConfig, LearningConfig};
use taskpilot_tools::PermissionMode;

const DEFAULT_CONFIG_PATH: &str = "taskpilot.toml";
const CONFIG_ENV: &str = "TASKPILOT_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: LoopConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub learning: LearningSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub memory: MemorySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: usize,
    #[serde(default = "default_tool_result_max_chars")]
    pub tool_result_max_chars: usize,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_duration_ms: default_max_duration_ms(),
            context_window_tokens: default_context_window_tokens(),
            tool_result_max_chars: default_tool_result_max_chars(),
            plan_mode: false,
            workspace_root: default_workspace_root(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_min_budget")]
    pub min_iterations: u32,
    #[serde(default = "default_max_budget")]
    pub max_iterations: u32,
    #[serde(default = "default_bonus_threshold")]
    pub bonus_threshold: f64,
    #[serde(default = "default_compression_factor")]
    pub compression_factor: f64,
    #[serde(default = "default_continuation_slack")]
    pub min_continuation_slack: u32,
    #[serde(default = "default_max_bonus_total")]
    pub max_bonus_total: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            min_iterations: default_min_budget(),
            max_iterations: default_max_budget(),
            bonus_threshold: default_bonus_threshold(),
            compression_factor: default_compression_factor(),
            min_continuation_slack: default_continuation_slack(),
            max_bonus_total: default_max_bonus_total(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub mode: PermissionMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfidenceConfig {
    #[serde(default = "default_auto_approve_threshold")]
    pub auto_approve_threshold: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            auto_approve_threshold: default_auto_approve_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LearningSection {
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_min_similar")]
    pub min_similar_corrections: usize,
    #[serde(default = "default_min_alternative_rate")]
    pub min_alternative_success_rate: f64,
}

impl Default for LearningSection {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            similarity_threshold: default_similarity_threshold(),
            min_similar_corrections: default_min_similar(),
            min_alternative_success_rate: default_min_alternative_rate(),
        }
    }
}

impl LearningSection {
    pub fn to_learning_config(&self) -> LearningConfig {
        LearningConfig {
            max_history: self.max_history,
            similarity_threshold: self.similarity_threshold,
            min_similar_corrections: self.min_similar_corrections,
            min_alternative_success_rate: self.min_alternative_success_rate,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl CacheSection {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.capacity,
            ttl: std::time::Duration::from_secs(self.ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub stream: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_inference_timeout(),
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemorySection {
    /// When set, scorer and learning state persist here between runs
    #[serde(default)]
    pub db_path: Option<String>,
}

// Default value functions
fn default_max_iterations() -> u32 { 25 }
fn default_max_duration_ms() -> u64 { 600_000 }
fn default_context_window_tokens() -> usize { 16_000 }
fn default_tool_result_max_chars() -> usize { 4000 }
fn default_workspace_root() -> PathBuf { PathBuf::from(".") }
fn default_min_budget() -> u32 { 3 }
fn default_max_budget() -> u32 { 50 }
fn default_bonus_threshold() -> f64 { 0.8 }
fn default_compression_factor() -> f64 { 0.8 }
fn default_continuation_slack() -> u32 { 3 }
fn default_max_bonus_total() -> u32 { 15 }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_base_ms() -> u64 { 1000 }
fn default_auto_approve_threshold() -> f64 { 0.8 }
fn default_max_history() -> usize { 500 }
fn default_similarity_threshold() -> f64 { 0.7 }
fn default_min_similar() -> usize { 3 }
fn default_min_alternative_rate() -> f64 { 0.6 }
fn default_cache_capacity() -> usize { 256 }
fn default_cache_ttl() -> u64 { 300 }
fn default_base_url() -> String { "http://127.0.0.1:8080/v1".into() }
fn default_model() -> String { "default".into() }
fn default_api_key_env() -> String { "TASKPILOT_API_KEY".into() }
fn default_temperature() -> f32 { 0.2 }
fn default_max_tokens() -> u32 { 2048 }
fn default_inference_timeout() -> u64 { 120 }
fn default_true() -> bool { true }

impl AgentConfig {
    /// Reject values the loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            bail!("agent.max_iterations must be at least 1");
        }
        if self.budget.min_iterations > self.budget.max_iterations {
            bail!(
                "budget.min_iterations ({}) exceeds budget.max_iterations ({})",
                self.budget.min_iterations,
                self.budget.max_iterations
            );
        }
        if !(0.0..=1.0).contains(&self.budget.compression_factor) {
            bail!("budget.compression_factor must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&self.confidence.auto_approve_threshold) {
            bail!("confidence.auto_approve_threshold must be within 0..=1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.agent.tool_result_max_chars == 0 {
            bail!("agent.tool_result_max_chars must be positive");
        }
        Ok(())
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }
}

/// Load configuration: explicit path, then `$TASKPILOT_CONFIG`, then `./taskpilot.toml`, then defaults
pub fn load_config(explicit: Option<&Path>) -> Result<AgentConfig> {
    let config_path = match explicit {
        Some(p) => p.to_path_buf(),
        None => std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
    };

    if config_path.exists() {
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {}", config_path.display()))?;
        AgentConfig::from_toml(&content)
            .with_context(|| format!("Invalid config in {}", config_path.display()))
    } else if explicit.is_some() {
        bail!("Config file not found at {}", config_path.display())
    } else {
        tracing::debug!("Config file not found at {}, using defaults", config_path.display());
        Ok(AgentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.agent.max_iterations, 25);
        assert_eq!(config.agent.tool_result_max_chars, 4000);
        assert_eq!(config.budget.min_continuation_slack, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.permissions.mode, PermissionMode::ReadOnly);
        assert!(config.memory.db_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let config = AgentConfig::from_toml(
            r#"
[agent]
max_iterations = 10
plan_mode = true

[permissions]
mode = "trusted"

[cache]
ttl_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(config.agent.max_iterations, 10);
        assert!(config.agent.plan_mode);
        assert_eq!(config.agent.max_duration_ms, 600_000);
        assert_eq!(config.permissions.mode, PermissionMode::Trusted);
        assert_eq!(config.cache.to_cache_config().ttl.as_secs(), 5);
        assert_eq!(config.cache.capacity, 256);
    }

    #[test]
    fn test_validate_rejects_inverted_budget() {
        let err = AgentConfig::from_toml("[budget]\nmin_iterations = 60\n").unwrap_err();
        assert!(format!("{err:#}").contains("exceeds"));
    }

    #[test]
    fn test_explicit_missing_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskpilot.toml");
        fs::write(&path, "[confidence]\nauto_approve_threshold = 0.9\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.confidence.auto_approve_threshold, 0.9);
    }
}
