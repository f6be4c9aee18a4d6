use super::{merge, Node, NodeContext, NodeInit, NodeOutput, CODE};
use crate::config::secs;
use crate::error::{NodeError, ScriptError};
use crate::script::{Script, ScriptRunner};
use crate::types::Payload;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Added to the script deadline so the node's own marker path finishes first
const ATTEMPT_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct CodeConfig {
    code: String,
    #[serde(default = "default_timeout")]
    timeout: f64,
}

fn default_timeout() -> f64 {
    30.0
}

/// Runs a user script in the sandbox.
///
/// Script failures and timeouts do not fail the node. The input comes back with
/// `_script_error` and `_script_error_kind` set, so the run can carry on.
pub struct CodeNode {
    id: String,
    runner: Arc<ScriptRunner>,
    script: Script,
    timeout: Duration,
}

impl CodeNode {
    pub fn construct(init: NodeInit<'_>) -> Result<Box<dyn Node>, NodeError> {
        let config: CodeConfig = init.parse_config()?;

        if config.code.trim().is_empty() {
            return Err(init.invalid("'code' is required for Code node"));
        }
        if !(config.timeout.is_finite() && config.timeout > 0.0) {
            return Err(init.invalid("'timeout' must be a positive number of seconds"));
        }

        let runner = init.services.scripts.clone();
        let script = runner.compile(&config.code).map_err(|e| init.invalid(e))?;

        Ok(Box::new(Self {
            id: init.id.to_string(),
            runner,
            script,
            timeout: secs(config.timeout),
        }))
    }

    fn script_context(ctx: &NodeContext) -> Payload {
        let node_outputs: Payload = ctx
            .node_outputs
            .iter()
            .map(|(id, output)| (id.clone(), Value::Object(output.clone())))
            .collect();

        let mut context = Payload::new();
        context.insert("workflow_id".into(), json!(ctx.workflow_id));
        context.insert("execution_id".into(), json!(ctx.execution_id.to_string()));
        context.insert("global_state".into(), Value::Object(ctx.global_state.clone()));
        context.insert("node_outputs".into(), Value::Object(node_outputs));
        context
    }
}

#[async_trait::async_trait]
impl Node for CodeNode {
    fn node_type(&self) -> &str {
        CODE
    }

    async fn execute(&self, input: &Payload, ctx: &mut NodeContext) -> Result<NodeOutput, NodeError> {
        let context = Self::script_context(ctx);

        let outcome = self
            .runner
            .run(&self.script, input, &context, self.timeout)
            .await;

        match outcome {
            Ok(outcome) => {
                if let Some(Value::Object(state)) = outcome.context.get("global_state") {
                    ctx.global_state = state.clone();
                }
                Ok(NodeOutput::new(outcome.output.unwrap_or_else(|| input.clone())))
            }
            Err(ScriptError::Timeout { secs }) => {
                tracing::error!(node_id = %self.id, "Code execution timed out after {} seconds", secs);
                Ok(NodeOutput::new(error_marker(
                    input,
                    format!("Code execution timed out after {} seconds", secs),
                    "timeout",
                )))
            }
            Err(ScriptError::Cancelled) => Err(NodeError::Execution(ScriptError::Cancelled.to_string())),
            Err(e) => {
                tracing::error!(node_id = %self.id, "Error executing code: {}", e);
                Ok(NodeOutput::new(error_marker(input, e.to_string(), "exception")))
            }
        }
    }

    fn attempt_timeout(&self) -> Option<Duration> {
        Some(self.timeout + ATTEMPT_SLACK)
    }
}

fn error_marker(input: &Payload, message: String, kind: &str) -> Payload {
    let mut data = merge(input, "_script_error", Value::String(message));
    data.insert("_script_error_kind".into(), json!(kind));
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::registry::test_services;
    use crate::types::RunId;

    fn build(config: Value) -> Result<Box<dyn Node>, NodeError> {
        let services = test_services();
        let config = config.as_object().cloned().unwrap();
        CodeNode::construct(NodeInit {
            id: "transform",
            name: "Transform",
            config: &config,
            services: &services,
        })
    }

    fn input(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_script_output_replaces_input() {
        let node = build(json!({"code": "output.doubled = input_data.n * 2;"})).unwrap();
        let mut ctx = NodeContext::new("wf", RunId::new());

        let output = node.execute(&input(json!({"n": 21})), &mut ctx).await.unwrap();
        assert_eq!(output.data, input(json!({"doubled": 42})));
    }

    #[tokio::test]
    async fn test_empty_output_passes_input_through() {
        let node = build(json!({"code": "let unused = 1;"})).unwrap();
        let mut ctx = NodeContext::new("wf", RunId::new());

        let data = input(json!({"keep": "me"}));
        let output = node.execute(&data, &mut ctx).await.unwrap();
        assert_eq!(output.data, data);
    }

    #[tokio::test]
    async fn test_global_state_written_back() {
        let node = build(json!({
            "code": "context.global_state.visits = 1; output.prev = context.node_outputs.fetch.value;"
        }))
        .unwrap();
        let mut ctx = NodeContext::new("wf", RunId::new());
        ctx.node_outputs
            .insert("fetch".to_string(), input(json!({"value": "cached"})));

        let output = node.execute(&Payload::new(), &mut ctx).await.unwrap();
        assert_eq!(output.data["prev"], json!("cached"));
        assert_eq!(ctx.global_state["visits"], json!(1));
    }

    #[tokio::test]
    async fn test_exception_becomes_marker() {
        let node = build(json!({"code": "throw \"boom\";"})).unwrap();
        let mut ctx = NodeContext::new("wf", RunId::new());

        let output = node.execute(&input(json!({"a": 1})), &mut ctx).await.unwrap();
        assert_eq!(output.data["a"], json!(1));
        assert_eq!(output.data["_script_error_kind"], json!("exception"));
        assert!(output.data["_script_error"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_marker() {
        let node = build(json!({"code": "loop {}", "timeout": 0.1})).unwrap();
        let mut ctx = NodeContext::new("wf", RunId::new());

        let output = node.execute(&Payload::new(), &mut ctx).await.unwrap();
        assert_eq!(output.data["_script_error_kind"], json!("timeout"));
        assert_eq!(
            node.attempt_timeout(),
            Some(Duration::from_millis(100) + ATTEMPT_SLACK)
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(build(json!({})), Err(NodeError::InvalidConfig { .. })));
        assert!(matches!(build(json!({"code": "  "})), Err(NodeError::InvalidConfig { .. })));
        assert!(matches!(
            build(json!({"code": "let x = ;"})),
            Err(NodeError::InvalidConfig { .. })
        ));
        assert!(matches!(
            build(json!({"code": "1", "timeout": 0})),
            Err(NodeError::InvalidConfig { .. })
        ));
    }
}
