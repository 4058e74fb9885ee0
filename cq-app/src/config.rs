use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodequillConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub coding: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub vision: Option<String>,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> cq_llm::RetryPolicy {
        cq_llm::RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..cq_llm::RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_file_bytes_max")]
    pub file_bytes_max: usize,
    #[serde(default = "default_fetch_bytes_max")]
    pub fetch_bytes_max: usize,
    #[serde(default = "default_search_results_max")]
    pub search_results_max: usize,
    #[serde(default = "default_max_tool_turns")]
    pub max_tool_turns: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            file_bytes_max: default_file_bytes_max(),
            fetch_bytes_max: default_fetch_bytes_max(),
            search_results_max: default_search_results_max(),
            max_tool_turns: default_max_tool_turns(),
        }
    }
}

impl LimitsConfig {
    pub fn to_executor_limits(&self) -> cq_tools::ExecutorLimits {
        cq_tools::ExecutorLimits {
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            file_bytes_max: self.file_bytes_max,
            fetch_bytes_max: self.fetch_bytes_max,
            search_results_max: self.search_results_max,
            ..cq_tools::ExecutorLimits::default()
        }
    }
}

impl CodequillConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Config key, falling back to the environment (`.env` honoured).
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.keys.api_key {
            if !key.trim().is_empty() {
                return Some(key.clone());
            }
        }
        std::env::var("CODEQUILL_API_KEY").ok().filter(|k| !k.is_empty())
    }
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_system_prompt() -> String {
    "You are Codequill, a developer assistant that can run local tools when asked.".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_file_bytes_max() -> usize {
    1_000_000
}

fn default_fetch_bytes_max() -> usize {
    500_000
}

fn default_search_results_max() -> usize {
    5
}

fn default_max_tool_turns() -> usize {
    25
}

pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Codequill configuration

[general]
model = "gpt-4o"
system_prompt = "You are Codequill, a developer assistant that can run local tools when asked."

[models]
# coding = "gpt-4o"
# reasoning = "o3-mini"
# vision = "gpt-4o"
fallbacks = ["gpt-4o-mini"]

[keys]
# api_key = "sk-..."          # or set CODEQUILL_API_KEY
base_url = "https://api.openai.com/v1"

[safety]
enabled = true

[retry]
max_attempts = 3
base_delay_ms = 500
max_delay_ms = 30000

[limits]
command_timeout_secs = 30
file_bytes_max = 1000000
fetch_bytes_max = 500000
search_results_max = 5
max_tool_turns = 25
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: CodequillConfig = toml::from_str("").expect("empty config parses");
        assert_eq!(config.general.model, "gpt-4o");
        assert!(config.safety.enabled);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.limits.max_tool_turns, 25);
        // structural Default must agree with the serde defaults
        assert_eq!(
            CodequillConfig::default().keys.base_url,
            config.keys.base_url
        );
    }

    #[test]
    fn template_parses_cleanly() {
        let config: CodequillConfig =
            toml::from_str(DEFAULT_CONFIG_TEMPLATE).expect("template parses");
        assert_eq!(config.models.fallbacks, vec!["gpt-4o-mini".to_string()]);
        assert_eq!(config.keys.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn partial_sections_override_only_their_keys() {
        let config: CodequillConfig = toml::from_str(
            r#"
[safety]
enabled = false

[limits]
command_timeout_secs = 10
"#,
        )
        .expect("parse");
        assert!(!config.safety.enabled);
        assert_eq!(config.limits.command_timeout_secs, 10);
        assert_eq!(config.limits.file_bytes_max, 1_000_000);
    }

    #[test]
    fn retry_config_converts_to_policy() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        };
        let policy = config.to_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
    }
}
