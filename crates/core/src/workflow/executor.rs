use super::state::ExecutionState;
use crate::config::{secs, EngineConfig};
use crate::error::NodeError;
use crate::nodes::Node;
use crate::types::{NodeDefinition, NodeResult, NodeStatus, Payload};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::Instrument;

/// Retry and timeout settings read from a node's config
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionPolicy {
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl ExecutionPolicy {
    /// Read `retries`, `retry_delay` and `timeout`, falling back to engine defaults
    pub fn from_config(node_id: &str, config: &Payload, defaults: &EngineConfig) -> Result<Self, NodeError> {
        let retries = match config.get("retries") {
            None | Some(Value::Null) => 0,
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    NodeError::invalid_config(node_id, "'retries' must be a non-negative integer")
                })?,
        };

        let seconds = |key: &str, default: Duration| -> Result<Duration, NodeError> {
            match config.get(key) {
                None | Some(Value::Null) => Ok(default),
                Some(value) => match value.as_f64() {
                    Some(s) if s.is_finite() && s >= 0.0 => Ok(secs(s)),
                    _ => Err(NodeError::invalid_config(
                        node_id,
                        format!("'{}' must be a non-negative number of seconds", key),
                    )),
                },
            }
        };

        Ok(Self {
            retries,
            retry_delay: seconds("retry_delay", defaults.retry_delay())?,
            timeout: seconds("timeout", defaults.node_timeout())?,
        })
    }
}

/// A node definition paired with its constructed behavior
pub struct PreparedNode {
    pub definition: NodeDefinition,
    pub behavior: Box<dyn Node>,
    pub policy: ExecutionPolicy,
}

impl PreparedNode {
    /// Bound on a single attempt. Nodes with their own deadline take precedence.
    pub fn attempt_timeout(&self) -> Duration {
        self.behavior.attempt_timeout().unwrap_or(self.policy.timeout)
    }
}

/// Runs one node with retries, timeouts and error routing, recording the result
pub struct NodeExecutor<'s> {
    state: &'s mut ExecutionState,
}

impl<'s> NodeExecutor<'s> {
    pub fn new(state: &'s mut ExecutionState) -> Self {
        Self { state }
    }

    pub async fn execute(mut self, node: &PreparedNode, input: &Payload) -> NodeResult {
        let definition = &node.definition;
        let span = tracing::info_span!(
            "node",
            workflow_id = %self.state.workflow_id,
            execution_id = %self.state.execution_id,
            node_id = %definition.id,
            node_type = %definition.node_type,
        );

        let result = self.run_attempts(node, input).instrument(span).await;
        self.state.record_result(result.clone());
        result
    }

    async fn run_attempts(&mut self, node: &PreparedNode, input: &Payload) -> NodeResult {
        let definition = &node.definition;
        let policy = node.policy;
        let attempt_timeout = node.attempt_timeout();
        let max_attempts = policy.retries.saturating_add(1);
        let started = Instant::now();

        let mut attempts = 0;
        let last_error = loop {
            attempts += 1;
            tracing::info!(
                "Executing node {} ({}) attempt {}/{}",
                definition.id,
                definition.name,
                attempts,
                max_attempts
            );

            let mut ctx = self.state.context();
            let outcome = match timeout(attempt_timeout, node.behavior.execute(input, &mut ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(NodeError::Timeout {
                    node_id: definition.id.clone(),
                    secs: attempt_timeout.as_secs_f64(),
                }),
            };

            match outcome {
                Ok(output) => {
                    self.state.global_state = ctx.global_state;
                    let next_nodes = output
                        .next_nodes
                        .unwrap_or_else(|| definition.next_nodes.clone());
                    let elapsed = started.elapsed().as_secs_f64();

                    tracing::info!("Node {} completed in {:.3}s", definition.id, elapsed);
                    return NodeResult {
                        node_id: definition.id.clone(),
                        node_name: definition.name.clone(),
                        status: NodeStatus::Success,
                        output: Some(output.data),
                        error: None,
                        execution_time: elapsed,
                        next_nodes,
                        attempts,
                    };
                }
                Err(e) => {
                    if attempts < max_attempts && e.is_retryable() {
                        tracing::warn!(
                            "Node {} failed (attempt {}/{}): {}; retrying in {:?}",
                            definition.id,
                            attempts,
                            max_attempts,
                            e,
                            policy.retry_delay
                        );
                        tokio::time::sleep(policy.retry_delay).await;
                        continue;
                    }
                    break e;
                }
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        tracing::error!(
            "Node {} failed after {} attempt(s): {}",
            definition.id,
            attempts,
            last_error
        );

        NodeResult {
            node_id: definition.id.clone(),
            node_name: definition.name.clone(),
            status: NodeStatus::Error,
            output: None,
            error: Some(last_error.to_string()),
            execution_time: elapsed,
            next_nodes: definition.on_error.iter().cloned().collect(),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{NodeContext, NodeOutput};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails until it has been called `succeed_on` times
    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    #[async_trait::async_trait]
    impl Node for Flaky {
        fn node_type(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, input: &Payload, ctx: &mut NodeContext) -> Result<NodeOutput, NodeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.global_state.insert("last_call".into(), json!(call));
            if call >= self.succeed_on {
                Ok(NodeOutput::new(input.clone()))
            } else {
                Err(NodeError::Execution(format!("call {} failed", call)))
            }
        }
    }

    struct Sleepy;

    #[async_trait::async_trait]
    impl Node for Sleepy {
        fn node_type(&self) -> &str {
            "sleepy"
        }

        async fn execute(&self, _input: &Payload, _ctx: &mut NodeContext) -> Result<NodeOutput, NodeError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(NodeOutput::new(Payload::new()))
        }
    }

    fn prepared(behavior: Box<dyn Node>, config: serde_json::Value, on_error: Option<&str>) -> PreparedNode {
        let mut definition = NodeDefinition::new("n", "Node", behavior.node_type()).with_config(config);
        definition.next_nodes = vec!["next".to_string()];
        definition.on_error = on_error.map(str::to_string);
        let policy = ExecutionPolicy::from_config("n", &definition.config, &EngineConfig::default()).unwrap();
        PreparedNode {
            definition,
            behavior,
            policy,
        }
    }

    #[test]
    fn test_policy_defaults_and_overrides() {
        let defaults = EngineConfig::default();
        let policy = ExecutionPolicy::from_config("n", &Payload::new(), &defaults).unwrap();
        assert_eq!(policy.retries, 0);
        assert_eq!(policy.retry_delay, Duration::from_secs(1));
        assert_eq!(policy.timeout, Duration::from_secs(60));

        let config = json!({"retries": 3, "retry_delay": 0.5, "timeout": 2})
            .as_object()
            .cloned()
            .unwrap();
        let policy = ExecutionPolicy::from_config("n", &config, &defaults).unwrap();
        assert_eq!(policy.retries, 3);
        assert_eq!(policy.retry_delay, Duration::from_millis(500));
        assert_eq!(policy.timeout, Duration::from_secs(2));

        let bad = json!({"retries": -1}).as_object().cloned().unwrap();
        assert!(ExecutionPolicy::from_config("n", &bad, &defaults).is_err());
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = prepared(
            Box::new(Flaky { calls: calls.clone(), succeed_on: 3 }),
            json!({"retries": 2, "retry_delay": 0.01}),
            None,
        );
        let mut state = ExecutionState::new("wf", Payload::new());

        let result = NodeExecutor::new(&mut state).execute(&node, &Payload::new()).await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.next_nodes, vec!["next"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.executed_nodes, vec!["n"]);
        assert_eq!(state.global_state["last_call"], json!(3));
    }

    #[tokio::test]
    async fn test_exhausted_retries_route_to_error_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = prepared(
            Box::new(Flaky { calls: calls.clone(), succeed_on: u32::MAX }),
            json!({"retries": 2, "retry_delay": 0.05}),
            Some("handler"),
        );
        let mut state = ExecutionState::new("wf", Payload::new());

        let started = Instant::now();
        let result = NodeExecutor::new(&mut state).execute(&node, &Payload::new()).await;

        assert_eq!(result.status, NodeStatus::Error);
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.error.as_deref(), Some("call 3 failed"));
        assert_eq!(result.next_nodes, vec!["handler"]);
        assert!(started.elapsed() >= Duration::from_millis(100));
        // failed attempts never touch the shared store
        assert!(!state.global_state.contains_key("last_call"));
        assert_eq!(state.node_results.len(), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let node = prepared(Box::new(Sleepy), json!({"timeout": 0.05}), None);
        let mut state = ExecutionState::new("wf", Payload::new());

        let result = NodeExecutor::new(&mut state).execute(&node, &Payload::new()).await;

        assert_eq!(result.status, NodeStatus::Error);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(result.next_nodes.is_empty());
    }
}
