use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON object passed between nodes
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a single node's attempt sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    Error,
}

/// Static description of a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<NodeDefinition>,
    pub start_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_config: Option<serde_json::Value>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, start_node: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            nodes: Vec::new(),
            start_node: start_node.into(),
            trigger_config: None,
        }
    }

    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    /// Look up a node definition by id
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Specification for a single node in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: Payload,
    #[serde(default)]
    pub next_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            node_type: node_type.into(),
            config: Payload::new(),
            next_nodes: Vec::new(),
            on_error: None,
        }
    }

    /// Replace the config with the entries of a JSON object; other values are ignored
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = config {
            self.config = map;
        }
        self
    }

    pub fn with_next(mut self, next: &[&str]) -> Self {
        self.next_nodes = next.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_on_error(mut self, node_id: impl Into<String>) -> Self {
        self.on_error = Some(node_id.into());
        self
    }
}

/// Recorded outcome of one node's execution attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub node_name: String,
    pub status: NodeStatus,
    pub output: Option<Payload>,
    pub error: Option<String>,
    /// Wall-clock seconds spent across all attempts, retry delays included
    pub execution_time: f64,
    pub next_nodes: Vec<String>,
    pub attempts: u32,
}

impl NodeResult {
    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Success
    }
}
