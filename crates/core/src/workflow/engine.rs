use super::executor::{ExecutionPolicy, NodeExecutor, PreparedNode};
use super::graph::{lint_definition, validate_definition};
use super::state::ExecutionState;
use crate::config::EngineConfig;
use crate::error::{DefinitionError, RunError, StateError};
use crate::nodes::NodeRegistry;
use crate::storage::ResultSink;
use crate::types::{Payload, WorkflowDefinition};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Validates workflow definitions and drives their execution
pub struct WorkflowEngine {
    config: EngineConfig,
    registry: NodeRegistry,
    sink: Option<Arc<dyn ResultSink>>,
}

enum LoopExit {
    Finished(Result<(), RunError>),
    TimedOut,
    Cancelled,
}

impl WorkflowEngine {
    /// Engine with the built-in node types wired from `config`
    pub fn new(config: EngineConfig) -> Self {
        let registry = NodeRegistry::from_config(&config);
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: EngineConfig, registry: NodeRegistry) -> Self {
        Self {
            config,
            registry,
            sink: None,
        }
    }

    /// Record finished runs in `sink` when using [`execute_and_record`](Self::execute_and_record)
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut NodeRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check the definition's structure. Reachability findings are logged, not returned.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
        validate_definition(definition)?;
        for warning in lint_definition(definition) {
            tracing::warn!(workflow_id = %definition.id, "{}", warning);
        }
        Ok(())
    }

    /// Run a workflow to a terminal state
    pub async fn execute(&self, definition: &WorkflowDefinition, input: Payload) -> ExecutionState {
        self.execute_with_cancel(definition, input, CancellationToken::new())
            .await
    }

    /// Run a workflow, stopping early with CANCELLED when `cancel` fires
    pub async fn execute_with_cancel(
        &self,
        definition: &WorkflowDefinition,
        input: Payload,
        cancel: CancellationToken,
    ) -> ExecutionState {
        let mut state = ExecutionState::new(definition.id.clone(), input);
        log_transition(state.start());

        tracing::info!(
            workflow_id = %definition.id,
            execution_id = %state.execution_id,
            "Starting workflow execution"
        );

        let nodes = match self.prepare(definition) {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!(workflow_id = %definition.id, "Workflow execution failed: {}", e);
                log_transition(state.fail(e.to_string()));
                return state;
            }
        };

        state.add_pending([definition.start_node.as_str()]);

        let limit = self.config.workflow_timeout();
        let exit = tokio::select! {
            biased;
            _ = cancel.cancelled() => LoopExit::Cancelled,
            outcome = tokio::time::timeout(limit, self.drive(&mut state, &nodes)) => match outcome {
                Ok(result) => LoopExit::Finished(result),
                Err(_) => LoopExit::TimedOut,
            },
        };

        match exit {
            LoopExit::Finished(Ok(())) => {
                let output = state.latest_output();
                log_transition(state.complete(output));
                tracing::info!(
                    workflow_id = %definition.id,
                    execution_id = %state.execution_id,
                    "Workflow execution completed"
                );
            }
            LoopExit::Finished(Err(e)) => self.fail(&mut state, e),
            LoopExit::TimedOut => {
                self.fail(&mut state, RunError::Timeout(self.config.max_workflow_execution_time))
            }
            LoopExit::Cancelled => {
                tracing::warn!(
                    workflow_id = %definition.id,
                    execution_id = %state.execution_id,
                    "Workflow execution cancelled"
                );
                log_transition(state.cancel());
            }
        }

        state
    }

    /// Run a workflow and hand the terminal state to the configured sink.
    /// Sink failures are logged and do not change the returned state.
    pub async fn execute_and_record(
        &self,
        definition: &WorkflowDefinition,
        input: Payload,
    ) -> ExecutionState {
        let state = self.execute(definition, input).await;
        self.record(&state).await;
        state
    }

    /// Hand a finished run to the configured sink, if any
    pub async fn record(&self, state: &ExecutionState) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Err(e) = sink.record(state).await {
            tracing::warn!(
                execution_id = %state.execution_id,
                "Failed to record execution result: {:#}",
                e
            );
        }
    }

    fn prepare(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<HashMap<String, PreparedNode>, RunError> {
        self.validate(definition)?;

        let mut nodes = HashMap::with_capacity(definition.nodes.len());
        for node in &definition.nodes {
            let behavior = self
                .registry
                .create(&node.id, &node.name, &node.node_type, &node.config)?;
            let policy = ExecutionPolicy::from_config(&node.id, &node.config, &self.config)?;
            nodes.insert(
                node.id.clone(),
                PreparedNode {
                    definition: node.clone(),
                    behavior,
                    policy,
                },
            );
        }
        Ok(nodes)
    }

    async fn drive(
        &self,
        state: &mut ExecutionState,
        nodes: &HashMap<String, PreparedNode>,
    ) -> Result<(), RunError> {
        let max_iterations = self.config.max_iterations;
        let mut iterations = 0;

        while iterations < max_iterations {
            let Some(node_id) = state.next_pending() else {
                return Ok(());
            };
            iterations += 1;

            let Some(node) = nodes.get(&node_id) else {
                tracing::warn!("Node {} not found in workflow, skipping", node_id);
                continue;
            };

            let input = state.latest_output();
            let result = NodeExecutor::new(state).execute(node, &input).await;

            if result.is_success() {
                state.add_pending(&result.next_nodes);
            } else if !result.next_nodes.is_empty() {
                tracing::info!(
                    "Routing failure of node {} to error handler {}",
                    result.node_id,
                    result.next_nodes.join(", ")
                );
                state.add_pending(&result.next_nodes);
            } else {
                return Err(RunError::NodeFailed {
                    node_id: result.node_id,
                    message: result.error.unwrap_or_default(),
                });
            }
        }

        if state.has_pending() {
            return Err(RunError::IterationLimit(max_iterations));
        }
        Ok(())
    }

    fn fail(&self, state: &mut ExecutionState, error: RunError) {
        tracing::error!(
            workflow_id = %state.workflow_id,
            execution_id = %state.execution_id,
            "Workflow execution failed: {}",
            error
        );
        log_transition(state.fail(error.to_string()));
    }
}

fn log_transition(result: Result<(), StateError>) {
    if let Err(e) = result {
        tracing::warn!("{}", e);
    }
}
