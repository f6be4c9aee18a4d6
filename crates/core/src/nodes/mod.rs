// Node behaviors: the polymorphic unit of work in a workflow

pub mod condition;
pub mod delay;
pub mod http;
pub mod llm;
pub mod registry;
pub mod script;

pub use condition::{ConditionNode, Operator};
pub use delay::DelayNode;
pub use http::{HttpMethod, HttpNode};
pub use llm::LlmNode;
pub use registry::{NodeConstructor, NodeRegistry};
pub use script::CodeNode;

use crate::error::NodeError;
use crate::llm::TextGenerator;
use crate::script::ScriptRunner;
use crate::types::{Payload, RunId};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Built-in type tags
pub const HTTP_REQUEST: &str = "http_request";
pub const DELAY: &str = "delay";
pub const CONDITION: &str = "condition";
pub const CODE: &str = "code";
pub const LLM: &str = "llm";

/// Per-invocation view of the run, rebuilt from the execution state before each attempt
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub workflow_id: String,
    pub execution_id: RunId,
    /// Shared key-value store; changes are written back when the node succeeds
    pub global_state: Payload,
    /// Outputs of nodes that already ran
    pub node_outputs: HashMap<String, Payload>,
}

impl NodeContext {
    pub fn new(workflow_id: impl Into<String>, execution_id: RunId) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id,
            global_state: Payload::new(),
            node_outputs: HashMap::new(),
        }
    }
}

/// What a node hands back from a successful `execute`
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub data: Payload,
    /// Successors decided at run time; `None` keeps the statically configured list
    pub next_nodes: Option<Vec<String>>,
}

impl NodeOutput {
    pub fn new(data: Payload) -> Self {
        Self {
            data,
            next_nodes: None,
        }
    }

    pub fn with_next_nodes(mut self, next_nodes: Vec<String>) -> Self {
        self.next_nodes = Some(next_nodes);
        self
    }
}

/// Shared collaborators handed to node constructors
#[derive(Clone)]
pub struct NodeServices {
    pub http: reqwest::Client,
    pub generator: Arc<dyn TextGenerator>,
    pub scripts: Arc<ScriptRunner>,
}

/// Arguments to a node constructor
#[derive(Clone, Copy)]
pub struct NodeInit<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub config: &'a Payload,
    pub services: &'a NodeServices,
}

impl NodeInit<'_> {
    /// Deserialize the config into a typed schema, mapping failures to `InvalidConfig`
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T, NodeError> {
        serde_json::from_value(serde_json::Value::Object(self.config.clone()))
            .map_err(|e| NodeError::invalid_config(self.id, e))
    }

    pub fn invalid(&self, message: impl std::fmt::Display) -> NodeError {
        NodeError::invalid_config(self.id, message)
    }
}

/// A node behavior. Instances hold only their validated configuration, so one
/// instance can serve every retry of an attempt sequence.
#[async_trait::async_trait]
pub trait Node: Send + Sync {
    /// Registry tag of this behavior
    fn node_type(&self) -> &str;

    async fn execute(&self, input: &Payload, ctx: &mut NodeContext) -> Result<NodeOutput, NodeError>;

    /// Per-attempt bound for nodes that enforce their own internal deadline
    fn attempt_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Copy of `input` with one extra key
pub(crate) fn merge(input: &Payload, key: &str, value: serde_json::Value) -> Payload {
    let mut data = input.clone();
    data.insert(key.to_string(), value);
    data
}
