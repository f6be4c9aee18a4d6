use super::{
    CodeNode, ConditionNode, DelayNode, HttpNode, LlmNode, Node, NodeInit, NodeServices, CODE,
    CONDITION, DELAY, HTTP_REQUEST, LLM,
};
use crate::config::EngineConfig;
use crate::error::NodeError;
use crate::llm::provider_from_config;
use crate::script::ScriptRunner;
use crate::types::Payload;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a node behavior from its definition
pub type NodeConstructor =
    Arc<dyn Fn(NodeInit<'_>) -> Result<Box<dyn Node>, NodeError> + Send + Sync>;

/// Maps type tags to node constructors
pub struct NodeRegistry {
    constructors: HashMap<String, NodeConstructor>,
    services: NodeServices,
}

impl NodeRegistry {
    /// Empty registry; nothing can be built until types are registered
    pub fn new(services: NodeServices) -> Self {
        Self {
            constructors: HashMap::new(),
            services,
        }
    }

    /// Registry with the five built-in node types
    pub fn with_builtins(services: NodeServices) -> Self {
        let mut registry = Self::new(services);
        registry.register(HTTP_REQUEST, Arc::new(HttpNode::construct));
        registry.register(DELAY, Arc::new(DelayNode::construct));
        registry.register(CONDITION, Arc::new(ConditionNode::construct));
        registry.register(CODE, Arc::new(CodeNode::construct));
        registry.register(LLM, Arc::new(LlmNode::construct));
        registry
    }

    /// Built-ins wired to the services described by `config`
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::with_builtins(NodeServices::from_config(config))
    }

    /// Add or replace the constructor for `node_type`
    pub fn register(&mut self, node_type: impl Into<String>, constructor: NodeConstructor) {
        let node_type = node_type.into();
        if self.constructors.contains_key(&node_type) {
            tracing::warn!("Overwriting existing node type: {}", node_type);
        }
        tracing::debug!("Registered node type: {}", node_type);
        self.constructors.insert(node_type, constructor);
    }

    pub fn is_registered(&self, node_type: &str) -> bool {
        self.constructors.contains_key(node_type)
    }

    /// Registered type tags, sorted
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.constructors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn services(&self) -> &NodeServices {
        &self.services
    }

    pub fn create(
        &self,
        id: &str,
        name: &str,
        node_type: &str,
        config: &Payload,
    ) -> Result<Box<dyn Node>, NodeError> {
        let constructor = self
            .constructors
            .get(node_type)
            .ok_or_else(|| NodeError::UnknownType {
                node_type: node_type.to_string(),
                valid: self.list_types(),
            })?;

        constructor(NodeInit {
            id,
            name,
            config,
            services: &self.services,
        })
    }
}

impl NodeServices {
    pub fn from_config(config: &EngineConfig) -> Self {
        let http = reqwest::Client::new();
        Self {
            generator: provider_from_config(&config.llm, http.clone()),
            scripts: Arc::new(ScriptRunner::new(config.script.clone())),
            http,
        }
    }
}

/// Services with generation disabled, for unit tests
#[cfg(test)]
pub(crate) fn test_services() -> NodeServices {
    NodeServices {
        http: reqwest::Client::new(),
        generator: Arc::new(crate::llm::DisabledGenerator),
        scripts: Arc::new(ScriptRunner::default()),
    }
}
