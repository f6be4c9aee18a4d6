use super::{Node, NodeContext, NodeInit, NodeOutput, LLM};
use crate::error::{LlmError, NodeError};
use crate::llm::{GenerateRequest, TextGenerator};
use crate::template::{lookup, placeholders, render};
use crate::types::Payload;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Added to the provider's request timeout so a slow provider degrades the output
/// instead of failing the attempt
const ATTEMPT_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct LlmNodeConfig {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(default)]
    system_message: Option<String>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

/// Renders a prompt against the input and asks the configured provider for text.
///
/// Provider failures degrade the output (`llm_response: null`, `llm_error`)
/// instead of failing the node.
pub struct LlmNode {
    id: String,
    generator: Arc<dyn TextGenerator>,
    config: LlmNodeConfig,
}

impl LlmNode {
    pub fn construct(init: NodeInit<'_>) -> Result<Box<dyn Node>, NodeError> {
        let config: LlmNodeConfig = init.parse_config()?;

        if config.prompt.trim().is_empty() {
            return Err(init.invalid("'prompt' is required for LLM node"));
        }
        if !(0.0..=2.0).contains(&config.temperature) {
            return Err(init.invalid("'temperature' must be between 0.0 and 2.0"));
        }
        if config.max_tokens == 0 {
            return Err(init.invalid("'max_tokens' must be greater than 0"));
        }

        Ok(Box::new(Self {
            id: init.id.to_string(),
            generator: init.services.generator.clone(),
            config,
        }))
    }

    fn format_prompt(&self, input: &Payload) -> String {
        let missing: Vec<String> = placeholders(&self.config.prompt)
            .into_iter()
            .filter(|name| lookup(input, name).is_none())
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                node_id = %self.id,
                "Prompt placeholders not found in input: {}",
                missing.join(", ")
            );
        }
        render(&self.config.prompt, input)
    }
}

#[async_trait::async_trait]
impl Node for LlmNode {
    fn node_type(&self) -> &str {
        LLM
    }

    async fn execute(&self, input: &Payload, ctx: &mut NodeContext) -> Result<NodeOutput, NodeError> {
        let prompt = self.format_prompt(input);
        let model = self
            .config
            .model
            .clone()
            .unwrap_or_else(|| self.generator.default_model().to_string());

        tracing::info!(
            workflow_id = %ctx.workflow_id,
            node_id = %self.id,
            model = %model,
            "Generating text"
        );

        let request = GenerateRequest {
            prompt: prompt.clone(),
            model: Some(model.clone()),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            system_message: self.config.system_message.clone(),
        };

        let mut data = input.clone();
        data.insert("llm_prompt".into(), json!(prompt));
        data.insert("llm_model".into(), json!(model));

        let generated = match self.generator.request_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.generator.generate(request))
                .await
                .unwrap_or_else(|_| {
                    Err(LlmError::Timeout {
                        secs: limit.as_secs_f64(),
                    })
                }),
            None => self.generator.generate(request).await,
        };

        match generated {
            Ok(text) => {
                data.insert("llm_response".into(), Value::String(text));
            }
            Err(e) => {
                tracing::error!(node_id = %self.id, "Error calling LLM: {}", e);
                data.insert("llm_response".into(), Value::Null);
                data.insert("llm_error".into(), json!(e.to_string()));
            }
        }

        Ok(NodeOutput::new(data))
    }

    fn attempt_timeout(&self) -> Option<Duration> {
        self.generator
            .request_timeout()
            .map(|limit| limit.saturating_add(ATTEMPT_SLACK))
    }
}
