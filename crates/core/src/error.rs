//! Error types for the orchestration engine.

use crate::types::RunStatus;

/// Structural problems in a workflow definition. Surfaced before any node runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    /// The workflow has no nodes at all.
    #[error("Workflow '{0}' has no nodes")]
    EmptyWorkflow(String),

    /// The start node id does not name a node.
    #[error("Start node '{0}' not found in workflow")]
    MissingStartNode(String),

    /// A `next_nodes` or `on_error` entry does not name a node.
    #[error("Node '{node_id}' references non-existent {kind} '{target}'")]
    UnknownReference {
        node_id: String,
        target: String,
        kind: ReferenceKind,
    },

    /// A conditional branch target does not name a node.
    #[error("Condition node '{node_id}' branches to non-existent node '{target}'")]
    UnknownBranch { node_id: String, target: String },

    /// Two nodes share an id.
    #[error("Duplicate node ID '{0}' found in workflow")]
    DuplicateNodeId(String),
}

/// Which field a dangling reference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    NextNode,
    ErrorHandler,
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NextNode => f.write_str("node"),
            Self::ErrorHandler => f.write_str("error handler"),
        }
    }
}

/// Errors raised while constructing or executing a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// No constructor is registered for the type tag.
    #[error("Unknown node type '{node_type}'. Must be one of: {}", .valid.join(", "))]
    UnknownType {
        node_type: String,
        valid: Vec<String>,
    },

    /// The node's configuration failed validation.
    #[error("Invalid configuration for node '{node_id}': {message}")]
    InvalidConfig { node_id: String, message: String },

    /// Runtime failure inside `execute`.
    #[error("{0}")]
    Execution(String),

    /// An attempt exceeded its time bound.
    #[error("Node '{node_id}' timed out after {secs} seconds")]
    Timeout { node_id: String, secs: f64 },

    /// Transport-level failure of an outbound HTTP call.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl NodeError {
    pub fn invalid_config(node_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::InvalidConfig {
            node_id: node_id.into(),
            message: message.to_string(),
        }
    }

    /// Configuration errors are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnknownType { .. } | Self::InvalidConfig { .. })
    }
}

/// Errors from a generative-text provider.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("LLM API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("LLM request exceeded timeout of {secs} seconds")]
    Timeout { secs: f64 },

    #[error("LLM response contained no text")]
    EmptyResponse,

    #[error("No LLM provider configured")]
    NotConfigured,
}

/// Errors from the sandboxed script runner.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("Script compilation failed: {0}")]
    Compile(String),

    #[error("Script execution error: {0}")]
    Runtime(String),

    #[error("Script execution exceeded timeout of {secs} seconds")]
    Timeout { secs: f64 },

    #[error("Script execution was cancelled")]
    Cancelled,
}

/// Illegal execution-state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Cannot transition run from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
}

/// Reasons a run terminates as failed.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Invalid workflow definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Failed to build node graph: {0}")]
    Build(#[from] NodeError),

    #[error("Node {node_id} failed: {message}")]
    NodeFailed { node_id: String, message: String },

    #[error("Workflow execution exceeded maximum iterations ({0}); possible infinite loop")]
    IterationLimit(usize),

    #[error("Workflow execution exceeded maximum time of {0} seconds")]
    Timeout(f64),
}
