// Core engine for nodeflow: typed node graphs with branching, retries and timeouts

pub mod config;
pub mod error;
pub mod llm;
pub mod nodes;
pub mod script;
pub mod storage;
pub mod template;
pub mod types;
pub mod workflow;

pub use config::EngineConfig;
pub use error::{DefinitionError, NodeError, RunError, StateError};
pub use nodes::{Node, NodeContext, NodeOutput, NodeRegistry};
pub use types::*;
pub use workflow::{ExecutionState, WorkflowEngine};
