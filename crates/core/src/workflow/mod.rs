// Graph traversal, per-node execution and run state

pub mod engine;
pub mod executor;
pub mod graph;
pub mod state;

pub use engine::WorkflowEngine;
pub use executor::{ExecutionPolicy, NodeExecutor, PreparedNode};
pub use graph::{lint_definition, validate_definition, WorkflowGraph};
pub use state::ExecutionState;
