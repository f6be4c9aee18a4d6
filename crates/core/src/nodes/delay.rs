use super::{merge, Node, NodeContext, NodeInit, NodeOutput, DELAY};
use crate::config::secs;
use crate::error::NodeError;
use crate::template::{lookup, parse_reference};
use crate::types::Payload;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Slack allowed beyond the requested delay before the sleep is abandoned
const DELAY_CEILING_SLACK_SECS: f64 = 5.0;

#[derive(Debug, Deserialize)]
struct DelayConfig {
    seconds: Value,
}

#[derive(Debug, Clone, PartialEq)]
enum Seconds {
    Fixed(f64),
    /// `{{name}}` resolved against the node input at run time
    FromInput(String),
}

/// Suspends the run for a configured duration, then passes input through
pub struct DelayNode {
    id: String,
    seconds: Seconds,
}

impl DelayNode {
    pub fn construct(init: NodeInit<'_>) -> Result<Box<dyn Node>, NodeError> {
        let config: DelayConfig = init.parse_config()?;

        let seconds = match &config.seconds {
            Value::String(s) => match parse_reference(s) {
                Some(name) => Seconds::FromInput(name.to_string()),
                None => Seconds::Fixed(s.trim().parse::<f64>().map_err(|_| {
                    init.invalid(format!(
                        "Invalid 'seconds' value: {}. Must be a numeric value or variable reference.",
                        s
                    ))
                })?),
            },
            Value::Number(n) => Seconds::Fixed(n.as_f64().unwrap_or(f64::NAN)),
            other => {
                return Err(init.invalid(format!(
                    "Invalid 'seconds' value: {}. Must be a numeric value or variable reference.",
                    other
                )))
            }
        };

        if let Seconds::Fixed(value) = seconds {
            check_seconds(value).map_err(|message| init.invalid(message))?;
        }
        if init.config.contains_key("timeout") {
            tracing::warn!(
                node_id = %init.id,
                "Delay nodes bound themselves at 'seconds' + {}; 'timeout' is ignored",
                DELAY_CEILING_SLACK_SECS
            );
        }

        Ok(Box::new(Self {
            id: init.id.to_string(),
            seconds,
        }))
    }

    fn resolve_seconds(&self, input: &Payload) -> Result<f64, NodeError> {
        let value = match &self.seconds {
            Seconds::Fixed(value) => *value,
            Seconds::FromInput(name) => {
                let resolved = match lookup(input, name) {
                    None | Some(Value::Null) => 0.0,
                    Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
                    Some(Value::String(s)) => s.trim().parse::<f64>().map_err(|_| {
                        NodeError::Execution(format!(
                            "Invalid 'seconds' value from '{}': {}. Must be numeric.",
                            name, s
                        ))
                    })?,
                    Some(other) => {
                        return Err(NodeError::Execution(format!(
                            "Invalid 'seconds' value from '{}': {}. Must be numeric.",
                            name, other
                        )))
                    }
                };
                tracing::info!(node_id = %self.id, seconds = resolved, "Using dynamic delay from input");
                resolved
            }
        };

        check_seconds(value).map_err(NodeError::Execution)?;
        Ok(value)
    }
}

fn check_seconds(value: f64) -> Result<(), String> {
    if !value.is_finite() {
        return Err(format!("'seconds' must be a finite number, got {}", value));
    }
    if value < 0.0 {
        return Err("'seconds' must be non-negative".to_string());
    }
    Ok(())
}

#[async_trait::async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        DELAY
    }

    async fn execute(&self, input: &Payload, ctx: &mut NodeContext) -> Result<NodeOutput, NodeError> {
        let seconds = self.resolve_seconds(input)?;

        tracing::info!(
            workflow_id = %ctx.workflow_id,
            node_id = %self.id,
            "Delaying execution for {} seconds",
            seconds
        );

        let started = Instant::now();
        let ceiling = secs(seconds + DELAY_CEILING_SLACK_SECS);
        tokio::time::timeout(ceiling, tokio::time::sleep(secs(seconds)))
            .await
            .map_err(|_| {
                tracing::error!(node_id = %self.id, "Delay exceeded maximum safe timeout");
                NodeError::Timeout {
                    node_id: self.id.clone(),
                    secs: seconds + DELAY_CEILING_SLACK_SECS,
                }
            })?;

        let actual = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
        tracing::info!(node_id = %self.id, "Completed delay of {} seconds", actual);

        Ok(NodeOutput::new(merge(
            input,
            "_delay_info",
            json!({
                "requested_seconds": seconds,
                "actual_waited_seconds": actual,
                "node_id": self.id,
                "status": "completed",
            }),
        )))
    }

    /// A delay always bounds itself at the requested time plus slack, so the
    /// executor's node timeout never cuts it short
    fn attempt_timeout(&self) -> Option<Duration> {
        match self.seconds {
            Seconds::Fixed(seconds) => Some(secs(seconds + DELAY_CEILING_SLACK_SECS)),
            // the duration is only known once the input arrives; `execute` enforces it
            Seconds::FromInput(_) => Some(Duration::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::registry::test_services;
    use crate::types::RunId;

    fn build(config: Value) -> Result<Box<dyn Node>, NodeError> {
        let services = test_services();
        let config = config.as_object().cloned().unwrap();
        DelayNode::construct(NodeInit {
            id: "wait",
            name: "Wait",
            config: &config,
            services: &services,
        })
    }

    fn ctx() -> NodeContext {
        NodeContext::new("wf", RunId::new())
    }

    #[tokio::test]
    async fn test_fixed_delay_waits_and_annotates() {
        let node = build(json!({"seconds": 0.05})).unwrap();
        let input = json!({"keep": true}).as_object().cloned().unwrap();

        let started = Instant::now();
        let output = node.execute(&input, &mut ctx()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(output.data["keep"], json!(true));
        assert_eq!(output.data["_delay_info"]["requested_seconds"], json!(0.05));
        assert_eq!(output.data["_delay_info"]["status"], json!("completed"));
        assert!(output.next_nodes.is_none());
    }

    #[tokio::test]
    async fn test_delay_from_input_reference() {
        let node = build(json!({"seconds": "{{wait_for}}"})).unwrap();
        let input = json!({"wait_for": "0.01"}).as_object().cloned().unwrap();

        let output = node.execute(&input, &mut ctx()).await.unwrap();
        assert_eq!(output.data["_delay_info"]["requested_seconds"], json!(0.01));
        assert_eq!(node.attempt_timeout(), Some(Duration::MAX));
    }

    #[tokio::test]
    async fn test_missing_reference_means_no_delay() {
        let node = build(json!({"seconds": "{{absent}}"})).unwrap();
        let output = node.execute(&Payload::new(), &mut ctx()).await.unwrap();
        assert_eq!(output.data["_delay_info"]["requested_seconds"], json!(0.0));
    }

    #[tokio::test]
    async fn test_negative_reference_fails_at_execution() {
        let node = build(json!({"seconds": "{{wait_for}}"})).unwrap();
        let input = json!({"wait_for": -2}).as_object().cloned().unwrap();

        let err = node.execute(&input, &mut ctx()).await.unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn test_invalid_configs_fail_construction() {
        assert!(matches!(
            build(json!({"seconds": -1})),
            Err(NodeError::InvalidConfig { .. })
        ));
        assert!(matches!(
            build(json!({"seconds": "soon"})),
            Err(NodeError::InvalidConfig { .. })
        ));
        assert!(matches!(
            build(json!({"seconds": [1]})),
            Err(NodeError::InvalidConfig { .. })
        ));
        assert!(matches!(build(json!({})), Err(NodeError::InvalidConfig { .. })));
    }

    #[test]
    fn test_fixed_delay_declares_attempt_bound() {
        let node = build(json!({"seconds": "2"})).unwrap();
        assert_eq!(node.attempt_timeout(), Some(Duration::from_secs(7)));
    }
}
