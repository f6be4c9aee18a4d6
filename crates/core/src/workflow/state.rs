use crate::error::StateError;
use crate::nodes::NodeContext;
use crate::types::{NodeResult, Payload, RunId, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};

/// Progress and results of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: RunId,
    pub workflow_id: String,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub input_data: Payload,
    pub output_data: Option<Payload>,
    pub error: Option<String>,
    pub node_results: Vec<NodeResult>,
    /// Node ids in the order they ran
    pub executed_nodes: Vec<String>,
    pub pending_nodes: VecDeque<String>,
    pub global_state: Payload,
}

impl ExecutionState {
    pub fn new(workflow_id: impl Into<String>, input_data: Payload) -> Self {
        let workflow_id = workflow_id.into();
        let execution_id = RunId::new();

        let mut global_state = Payload::new();
        global_state.insert("workflow_id".into(), json!(workflow_id));
        global_state.insert("execution_id".into(), json!(execution_id.to_string()));

        Self {
            execution_id,
            workflow_id,
            status: RunStatus::Pending,
            start_time: None,
            end_time: None,
            input_data,
            output_data: None,
            error: None,
            node_results: Vec::new(),
            executed_nodes: Vec::new(),
            pending_nodes: VecDeque::new(),
            global_state,
        }
    }

    /// PENDING -> RUNNING
    pub fn start(&mut self) -> Result<(), StateError> {
        self.transition(&[RunStatus::Pending], RunStatus::Running)?;
        let now = Utc::now();
        self.start_time = Some(now);
        self.global_state
            .insert("start_time".into(), json!(now.to_rfc3339()));
        Ok(())
    }

    /// RUNNING -> COMPLETED
    pub fn complete(&mut self, output: Payload) -> Result<(), StateError> {
        self.transition(&[RunStatus::Running], RunStatus::Completed)?;
        self.output_data = Some(output);
        self.end_time = Some(Utc::now());
        Ok(())
    }

    /// RUNNING -> FAILED
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), StateError> {
        self.transition(&[RunStatus::Running], RunStatus::Failed)?;
        self.error = Some(message.into());
        self.end_time = Some(Utc::now());
        Ok(())
    }

    /// PENDING or RUNNING -> CANCELLED
    pub fn cancel(&mut self) -> Result<(), StateError> {
        self.transition(&[RunStatus::Pending, RunStatus::Running], RunStatus::Cancelled)?;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, allowed: &[RunStatus], to: RunStatus) -> Result<(), StateError> {
        if !allowed.contains(&self.status) {
            return Err(StateError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Append a result and mark its node executed
    pub fn record_result(&mut self, result: NodeResult) {
        if !self.executed_nodes.contains(&result.node_id) {
            self.executed_nodes.push(result.node_id.clone());
        }
        self.pending_nodes.retain(|id| id != &result.node_id);
        self.node_results.push(result);
    }

    /// Queue node ids, skipping any already executed or already queued
    pub fn add_pending<I, S>(&mut self, node_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for node_id in node_ids {
            let node_id = node_id.as_ref();
            if self.is_executed(node_id) || self.pending_nodes.iter().any(|p| p == node_id) {
                continue;
            }
            self.pending_nodes.push_back(node_id.to_string());
        }
    }

    pub fn next_pending(&mut self) -> Option<String> {
        self.pending_nodes.pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_nodes.is_empty()
    }

    pub fn is_executed(&self, node_id: &str) -> bool {
        self.executed_nodes.iter().any(|id| id == node_id)
    }

    /// First recorded output of a node
    pub fn node_output(&self, node_id: &str) -> Option<&Payload> {
        self.node_results
            .iter()
            .find(|r| r.node_id == node_id)
            .and_then(|r| r.output.as_ref())
    }

    /// Output of the most recent result, or the run input before any node ran.
    /// A failed most-recent node yields an empty map.
    pub fn latest_output(&self) -> Payload {
        match self.node_results.last() {
            Some(result) => result.output.clone().unwrap_or_default(),
            None => self.input_data.clone(),
        }
    }

    /// Fresh context for one node invocation
    pub fn context(&self) -> NodeContext {
        let node_outputs: HashMap<String, Payload> = self
            .node_results
            .iter()
            .rev()
            .filter_map(|r| r.output.as_ref().map(|o| (r.node_id.clone(), o.clone())))
            .collect();

        NodeContext {
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id,
            global_state: self.global_state.clone(),
            node_outputs,
        }
    }

    /// Wall-clock seconds between start and end, if both are set
    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.start_time?;
        let end = self.end_time?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}
