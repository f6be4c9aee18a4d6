// Engine configuration, constructed once and injected into the engine and node registry

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on a whole run, in seconds
    #[serde(default = "default_max_workflow_execution_time")]
    pub max_workflow_execution_time: f64,

    /// Upper bound on traversal loop iterations
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Per-attempt timeout for nodes that do not configure `timeout`
    #[serde(default = "default_node_timeout")]
    pub default_node_timeout: f64,

    /// Delay between attempts for nodes that do not configure `retry_delay`
    #[serde(default = "default_retry_delay")]
    pub default_retry_delay: f64,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub script: ScriptConfig,
}

fn default_max_workflow_execution_time() -> f64 {
    3600.0
}

fn default_max_iterations() -> usize {
    1000
}

fn default_node_timeout() -> f64 {
    60.0
}

fn default_retry_delay() -> f64 {
    1.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workflow_execution_time: default_max_workflow_execution_time(),
            max_iterations: default_max_iterations(),
            default_node_timeout: default_node_timeout(),
            default_retry_delay: default_retry_delay(),
            llm: LlmConfig::default(),
            script: ScriptConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn workflow_timeout(&self) -> Duration {
        secs(self.max_workflow_execution_time)
    }

    pub fn node_timeout(&self) -> Duration {
        secs(self.default_node_timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        secs(self.default_retry_delay)
    }
}

/// Which generative-text backend serves `llm` nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    #[serde(alias = "open_ai")]
    OpenAi,
    #[serde(alias = "vertexai", alias = "google")]
    Gemini,
    None,
}

impl std::str::FromStr for LlmProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "gemini" | "vertexai" | "google" => Ok(Self::Gemini),
            "none" | "disabled" => Ok(Self::None),
            other => Err(format!(
                "Unknown LLM provider: {}. Use 'openai', 'gemini' or 'none'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: LlmProviderKind,

    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Override for the provider's API root
    #[serde(default)]
    pub base_url: Option<String>,

    /// Model used when a node does not name one
    #[serde(default)]
    pub model: Option<String>,

    /// Seconds before a provider request is abandoned
    #[serde(default = "default_llm_request_timeout")]
    pub request_timeout: f64,
}

fn default_provider() -> LlmProviderKind {
    LlmProviderKind::OpenAi
}

fn default_llm_request_timeout() -> f64 {
    120.0
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            base_url: None,
            model: None,
            request_timeout: default_llm_request_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn default_model(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match self.provider {
            LlmProviderKind::OpenAi => "gpt-4".to_string(),
            LlmProviderKind::Gemini => "gemini-pro".to_string(),
            LlmProviderKind::None => "none".to_string(),
        }
    }
}

/// Resource limits for the sandboxed script engine. Zero disables a limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    #[serde(default)]
    pub max_operations: u64,

    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,

    #[serde(default = "default_max_collection_size")]
    pub max_array_size: usize,

    #[serde(default = "default_max_collection_size")]
    pub max_map_size: usize,

    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,

    #[serde(default = "default_max_expr_depth")]
    pub max_expr_depth: usize,
}

fn default_max_string_size() -> usize {
    1024 * 1024
}

fn default_max_collection_size() -> usize {
    100_000
}

fn default_max_call_levels() -> usize {
    64
}

fn default_max_expr_depth() -> usize {
    64
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_string_size: default_max_string_size(),
            max_array_size: default_max_collection_size(),
            max_map_size: default_max_collection_size(),
            max_call_levels: default_max_call_levels(),
            max_expr_depth: default_max_expr_depth(),
        }
    }
}

/// Seconds as a `Duration`, clamping negative or NaN values to zero
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_iterations, 1000);
        assert_eq!(config.workflow_timeout(), Duration::from_secs(3600));
        assert_eq!(config.node_timeout(), Duration::from_secs(60));
        assert_eq!(config.llm.provider, LlmProviderKind::OpenAi);
        assert_eq!(config.llm.default_model(), "gpt-4");
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: EngineConfig = toml::from_str(
            r#"
            max_iterations = 10
            max_workflow_execution_time = 1.5

            [llm]
            provider = "vertexai"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.workflow_timeout(), Duration::from_millis(1500));
        assert_eq!(config.llm.provider, LlmProviderKind::Gemini);
        assert_eq!(config.llm.default_model(), "gemini-pro");
    }

    #[test]
    fn test_secs_clamps() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(f64::INFINITY), Duration::MAX);
        assert_eq!(secs(0.25), Duration::from_millis(250));
    }
}
