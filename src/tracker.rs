//! ExecutionTracker: immutable execution history plus mutable runtime
//! flow state per node, supporting loop resets that preserve history.

use crate::diagram::TokenUsage;
use crate::envelope::Envelope;
use crate::error::{Result, RuntimeError};
use crate::ids::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Completion status for an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Success,
    Failed,
    Skipped,
    MaxIter,
}

/// Runtime flow status, independent of execution history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    Waiting,
    Ready,
    Running,
    Blocked,
}

/// Mutable, tracker-owned runtime state. Separated from
/// `NodeExecutionRecord` so loop re-entry doesn't lose history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRuntimeState {
    pub flow_status: FlowStatus,
    pub dependencies_met: bool,
    pub is_active: bool,
}

impl Default for NodeRuntimeState {
    fn default() -> Self {
        Self {
            flow_status: FlowStatus::Waiting,
            dependencies_met: false,
            is_active: true,
        }
    }
}

/// Immutable (once completed) record of a single node invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_id: NodeId,
    /// 1-based execution count for this node.
    pub execution_number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: CompletionStatus,
    pub output: Option<Envelope>,
    pub error: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

impl NodeExecutionRecord {
    pub fn is_complete(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

/// Aggregate summary across all tracked nodes.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub total_tokens: TokenUsage,
    pub execution_order: Vec<NodeId>,
}

/// Separate tracking of execution history vs runtime state.
///
/// Grounded on the original's `ExecutionTracker`: `start_execution`
/// increments the count before creating the open record, so the first
/// call for a node returns 1; `reset_for_iteration` only touches runtime
/// state, never the record list or last output.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    records: HashMap<NodeId, Vec<NodeExecutionRecord>>,
    runtime_states: HashMap<NodeId, NodeRuntimeState>,
    last_outputs: HashMap<NodeId, Envelope>,
    execution_order: Vec<NodeId>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new execution for `node_id`, returning the 1-based
    /// execution number.
    pub fn start_execution(&mut self, node_id: &NodeId) -> u32 {
        let records = self.records.entry(node_id.clone()).or_default();
        let execution_number = records.len() as u32 + 1;
        records.push(NodeExecutionRecord {
            node_id: node_id.clone(),
            execution_number,
            started_at: Utc::now(),
            ended_at: None,
            status: CompletionStatus::Success,
            output: None,
            error: None,
            token_usage: None,
        });

        self.runtime_states
            .entry(node_id.clone())
            .or_default()
            .flow_status = FlowStatus::Running;
        self.execution_order.push(node_id.clone());
        execution_number
    }

    /// Close the currently open record for `node_id`.
    pub fn complete_execution(
        &mut self,
        node_id: &NodeId,
        status: CompletionStatus,
        output: Option<Envelope>,
        error: Option<String>,
        token_usage: Option<TokenUsage>,
    ) -> Result<()> {
        let record = self
            .records
            .get_mut(node_id)
            .and_then(|records| records.last_mut())
            .ok_or_else(|| RuntimeError::InvalidTransition {
                node_id: node_id.clone(),
                message: "complete_execution called with no open record".to_string(),
            })?;

        if record.is_complete() {
            return Err(RuntimeError::InvalidTransition {
                node_id: node_id.clone(),
                message: "execution already completed".to_string(),
            });
        }

        record.ended_at = Some(Utc::now());
        record.status = status;
        record.error = error;
        record.token_usage = token_usage;
        if let Some(output) = output {
            record.output = Some(output.clone());
            self.last_outputs.insert(node_id.clone(), output);
        }

        let next_flow = match status {
            CompletionStatus::Success | CompletionStatus::Skipped | CompletionStatus::MaxIter => {
                FlowStatus::Waiting
            }
            CompletionStatus::Failed => FlowStatus::Blocked,
        };
        self.runtime_states.entry(node_id.clone()).or_default().flow_status = next_flow;

        Ok(())
    }

    /// Number of executions started (completed or still open) for a node.
    pub fn get_execution_count(&self, node_id: &NodeId) -> u32 {
        self.records.get(node_id).map(|r| r.len() as u32).unwrap_or(0)
    }

    pub fn has_executed(&self, node_id: &NodeId) -> bool {
        self.get_execution_count(node_id) > 0
    }

    /// Whether `node_id` has a started-but-not-yet-completed record.
    pub fn has_open_record(&self, node_id: &NodeId) -> bool {
        self.records
            .get(node_id)
            .and_then(|records| records.last())
            .map(|record| !record.is_complete())
            .unwrap_or(false)
    }

    /// Last output for a node, preserved across resets.
    pub fn get_last_output(&self, node_id: &NodeId) -> Option<&Envelope> {
        self.last_outputs.get(node_id)
    }

    pub fn runtime_state(&self, node_id: &NodeId) -> NodeRuntimeState {
        self.runtime_states.get(node_id).copied().unwrap_or_default()
    }

    /// Reset a node's runtime state for the next loop iteration. Does not
    /// touch execution history or the last output. No-op on a node that
    /// has never executed.
    pub fn reset_for_iteration(&mut self, node_id: &NodeId) {
        if !self.has_executed(node_id) {
            return;
        }
        let state = self.runtime_states.entry(node_id.clone()).or_default();
        state.flow_status = FlowStatus::Ready;
        state.dependencies_met = true;
        state.is_active = true;
    }

    pub fn get_node_execution_history(&self, node_id: &NodeId) -> &[NodeExecutionRecord] {
        self.records.get(node_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn get_execution_summary(&self) -> ExecutionSummary {
        let mut summary = ExecutionSummary {
            execution_order: self.execution_order.clone(),
            ..Default::default()
        };
        for records in self.records.values() {
            for record in records {
                if !record.is_complete() {
                    continue;
                }
                summary.total_executions += 1;
                match record.status {
                    CompletionStatus::Success => summary.successful_executions += 1,
                    CompletionStatus::Failed => summary.failed_executions += 1,
                    _ => {}
                }
                if let Some(tokens) = record.token_usage {
                    summary.total_tokens.add(&tokens);
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ExecutionId;

    fn env(node: &NodeId) -> Envelope {
        Envelope::text("ok", node.clone(), ExecutionId::new("e1"))
    }

    #[test]
    fn execution_count_is_monotonic_across_iterations() {
        let mut tracker = ExecutionTracker::new();
        let node = NodeId::new("p");

        assert_eq!(tracker.start_execution(&node), 1);
        tracker
            .complete_execution(&node, CompletionStatus::Success, Some(env(&node)), None, None)
            .unwrap();
        assert_eq!(tracker.get_execution_count(&node), 1);

        tracker.reset_for_iteration(&node);
        assert_eq!(tracker.get_execution_count(&node), 1);
        assert!(tracker.get_last_output(&node).is_some());

        assert_eq!(tracker.start_execution(&node), 2);
        assert_eq!(tracker.get_execution_count(&node), 2);
    }

    #[test]
    fn complete_without_start_is_invalid_transition() {
        let mut tracker = ExecutionTracker::new();
        let node = NodeId::new("p");
        let result = tracker.complete_execution(&node, CompletionStatus::Success, None, None, None);
        assert!(matches!(result, Err(RuntimeError::InvalidTransition { .. })));
    }

    #[test]
    fn reset_on_never_executed_node_is_noop() {
        let mut tracker = ExecutionTracker::new();
        let node = NodeId::new("p");
        tracker.reset_for_iteration(&node);
        assert_eq!(tracker.get_execution_count(&node), 0);
        assert_eq!(tracker.runtime_state(&node).flow_status, FlowStatus::Waiting);
    }

    #[test]
    fn reset_idempotence() {
        let mut tracker = ExecutionTracker::new();
        let node = NodeId::new("p");
        tracker.start_execution(&node);
        tracker
            .complete_execution(&node, CompletionStatus::Success, Some(env(&node)), None, None)
            .unwrap();

        tracker.reset_for_iteration(&node);
        let after_first = tracker.runtime_state(&node);
        tracker.reset_for_iteration(&node);
        let after_second = tracker.runtime_state(&node);
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn history_preserved_after_reset() {
        let mut tracker = ExecutionTracker::new();
        let node = NodeId::new("p");
        tracker.start_execution(&node);
        tracker
            .complete_execution(&node, CompletionStatus::Success, Some(env(&node)), None, None)
            .unwrap();
        let count_before = tracker.get_execution_count(&node);
        let output_before = tracker.get_last_output(&node).cloned();

        tracker.reset_for_iteration(&node);

        assert_eq!(tracker.get_execution_count(&node), count_before);
        assert_eq!(
            tracker.get_last_output(&node).map(|e| e.as_text().unwrap().to_string()),
            output_before.map(|e| e.as_text().unwrap().to_string())
        );
    }
}
