//! StateTransitionLogic: guarded node state transitions and the
//! downstream reset cascade that drives loop re-entry.

use crate::diagram::{Diagram, NodeState, NodeStatus, TokenUsage};
use crate::envelope::Envelope;
use crate::error::Result;
use crate::ids::NodeId;
use crate::tracker::{CompletionStatus, ExecutionTracker};
use chrono::Utc;
use std::collections::HashMap;

/// Applies the five transition primitives from spec.md §4.7 plus the
/// downstream reset cascade. Callers are expected to hold the
/// per-execution mutex for the duration of each call (the scheduler is
/// the only caller).
pub struct StateTransitionLogic<'d> {
    diagram: &'d Diagram,
}

impl<'d> StateTransitionLogic<'d> {
    pub fn new(diagram: &'d Diagram) -> Self {
        Self { diagram }
    }

    pub fn to_running(
        &self,
        node_id: &NodeId,
        tracker: &mut ExecutionTracker,
        node_states: &mut HashMap<NodeId, NodeState>,
        current_node_id: &mut Option<NodeId>,
    ) -> u32 {
        let execution_number = tracker.start_execution(node_id);
        let state = node_states.entry(node_id.clone()).or_insert_with(NodeState::pending);
        state.status = NodeStatus::Running;
        state.started_at = Some(Utc::now());
        *current_node_id = Some(node_id.clone());
        execution_number
    }

    pub fn to_completed(
        &self,
        node_id: &NodeId,
        output: Envelope,
        token_usage: Option<TokenUsage>,
        tracker: &mut ExecutionTracker,
        node_states: &mut HashMap<NodeId, NodeState>,
        current_node_id: &mut Option<NodeId>,
    ) -> Result<()> {
        tracker.complete_execution(
            node_id,
            CompletionStatus::Success,
            Some(output),
            None,
            token_usage,
        )?;

        let state = node_states.entry(node_id.clone()).or_insert_with(NodeState::pending);
        state.status = NodeStatus::Completed;
        state.ended_at = Some(Utc::now());
        state.error = None;
        state.token_usage = token_usage;

        if current_node_id.as_ref() == Some(node_id) {
            *current_node_id = None;
        }

        self.reset_downstream_if_needed(node_id, tracker, node_states);
        Ok(())
    }

    pub fn to_failed(
        &self,
        node_id: &NodeId,
        error: String,
        tracker: &mut ExecutionTracker,
        node_states: &mut HashMap<NodeId, NodeState>,
        current_node_id: &mut Option<NodeId>,
    ) -> Result<()> {
        let error_envelope = Envelope::error(
            error.clone(),
            "HandlerError",
            node_id.clone(),
            crate::ids::ExecutionId::new(""),
        );
        tracker.complete_execution(
            node_id,
            CompletionStatus::Failed,
            Some(error_envelope),
            Some(error.clone()),
            None,
        )?;

        let state = node_states.entry(node_id.clone()).or_insert_with(NodeState::pending);
        state.status = NodeStatus::Failed;
        state.ended_at = Some(Utc::now());
        state.error = Some(error);

        if current_node_id.as_ref() == Some(node_id) {
            *current_node_id = None;
        }
        Ok(())
    }

    pub fn to_maxiter(
        &self,
        node_id: &NodeId,
        output: Envelope,
        tracker: &mut ExecutionTracker,
        node_states: &mut HashMap<NodeId, NodeState>,
        current_node_id: &mut Option<NodeId>,
    ) -> Result<()> {
        if tracker.has_open_record(node_id) {
            tracker.complete_execution(node_id, CompletionStatus::MaxIter, Some(output), None, None)?;
        }
        let state = node_states.entry(node_id.clone()).or_insert_with(NodeState::pending);
        state.status = NodeStatus::MaxIterReached;
        state.ended_at = Some(Utc::now());
        if current_node_id.as_ref() == Some(node_id) {
            *current_node_id = None;
        }
        Ok(())
    }

    /// Mark a node SKIPPED: it never became reachable this execution (a
    /// branch not taken, or downstream of a fail-fast failure). Unlike
    /// the other terminal transitions this never requires an open
    /// tracker record — a skipped node typically never started at all,
    /// so no `NodeExecutionRecord` is fabricated for it and
    /// `tracker.exec_count` stays at whatever it already was (usually
    /// zero).
    pub fn to_skipped(
        &self,
        node_id: &NodeId,
        tracker: &mut ExecutionTracker,
        node_states: &mut HashMap<NodeId, NodeState>,
    ) -> Result<()> {
        if tracker.has_open_record(node_id) {
            let skipped = Envelope::text("skipped", node_id.clone(), crate::ids::ExecutionId::new(""))
                .with_meta([("reason".to_string(), serde_json::json!("branch_not_taken"))]);
            tracker.complete_execution(node_id, CompletionStatus::Skipped, Some(skipped), None, None)?;
        }
        let state = node_states.entry(node_id.clone()).or_insert_with(NodeState::pending);
        state.status = NodeStatus::Skipped;
        state.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn reset(
        &self,
        node_id: &NodeId,
        tracker: &mut ExecutionTracker,
        node_states: &mut HashMap<NodeId, NodeState>,
    ) {
        tracker.reset_for_iteration(node_id);
        let state = node_states.entry(node_id.clone()).or_insert_with(NodeState::pending);
        state.status = NodeStatus::Pending;
        state.started_at = None;
        state.ended_at = None;
        state.error = None;
    }

    /// Recursively reset downstream nodes after a successful completion,
    /// per spec.md §4.7's cascade rules. Bounded: a node is only a
    /// candidate while its state is COMPLETED, and resetting flips it to
    /// PENDING, so it cannot be revisited within the same pass.
    fn reset_downstream_if_needed(
        &self,
        node_id: &NodeId,
        tracker: &mut ExecutionTracker,
        node_states: &mut HashMap<NodeId, NodeState>,
    ) {
        let targets: Vec<NodeId> = self
            .diagram
            .outgoing_edges(node_id)
            .map(|e| e.target_node_id.clone())
            .collect();

        let mut to_reset = Vec::new();
        for target_id in targets {
            let Some(target_node) = self.diagram.get_node(&target_id) else {
                continue;
            };

            let is_completed = node_states
                .get(&target_id)
                .map(|s| s.status == NodeStatus::Completed)
                .unwrap_or(false);
            if !is_completed {
                continue;
            }

            if target_node.node_type.is_start() || target_node.node_type.is_endpoint() {
                continue;
            }
            if target_node.node_type.is_condition() {
                continue;
            }
            if let Some(max_iter) = target_node.node_type.max_iteration() {
                if tracker.get_execution_count(&target_id) > max_iter {
                    continue;
                }
            }

            to_reset.push(target_id);
        }

        for target_id in to_reset {
            self.reset(&target_id, tracker, node_states);
            self.reset_downstream_if_needed(&target_id, tracker, node_states);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{Edge, Node, NodeType, Port};
    use crate::ids::{EdgeId, ExecutionId};

    fn node(id: &str, ty: NodeType) -> Node {
        Node {
            id: NodeId::new(id),
            node_type: ty,
            config: serde_json::json!(null),
            metadata: None,
        }
    }

    #[test]
    fn cascade_resets_completed_downstream_within_max_iteration() {
        let s = node("s", NodeType::Start);
        let p = node(
            "p",
            NodeType::PersonJob {
                max_iteration: 3,
                default_prompt: None,
                first_only_prompt: None,
            },
        );
        let diagram = Diagram::new(
            vec![s.clone(), p.clone()],
            vec![Edge {
                id: EdgeId::new("e1"),
                source_node_id: NodeId::new("s"),
                source_port: Port::Default,
                target_node_id: NodeId::new("p"),
                target_port: Port::Default,
                transform: None,
            }],
        )
        .unwrap();

        let mut tracker = ExecutionTracker::new();
        let mut states = HashMap::new();
        let mut current = None;
        let logic = StateTransitionLogic::new(&diagram);

        // p completes once.
        logic.to_running(&NodeId::new("p"), &mut tracker, &mut states, &mut current);
        states.get_mut(&NodeId::new("p")).unwrap().status = NodeStatus::Completed;

        // s completes, should NOT reset p (p is not downstream of s's cascade call here,
        // but demonstrate p resets itself downstream of s).
        logic.to_running(&NodeId::new("s"), &mut tracker, &mut states, &mut current);
        logic
            .to_completed(
                &NodeId::new("s"),
                Envelope::text("x", NodeId::new("s"), ExecutionId::new("e")),
                None,
                &mut tracker,
                &mut states,
                &mut current,
            )
            .unwrap();

        assert_eq!(states[&NodeId::new("p")].status, NodeStatus::Pending);
    }

    #[test]
    fn condition_nodes_are_never_cascade_reset() {
        let s = node("s", NodeType::Start);
        let c = node(
            "c",
            NodeType::Condition {
                kind: crate::diagram::ConditionKind::DetectMaxIterations,
            },
        );
        let diagram = Diagram::new(
            vec![s.clone(), c.clone()],
            vec![Edge {
                id: EdgeId::new("e1"),
                source_node_id: NodeId::new("s"),
                source_port: Port::Default,
                target_node_id: NodeId::new("c"),
                target_port: Port::Default,
                transform: None,
            }],
        )
        .unwrap();

        let mut tracker = ExecutionTracker::new();
        let mut states = HashMap::new();
        states.insert(NodeId::new("c"), NodeState { status: NodeStatus::Completed, started_at: None, ended_at: None, error: None, token_usage: None });
        let mut current = None;
        let logic = StateTransitionLogic::new(&diagram);

        logic.to_running(&NodeId::new("s"), &mut tracker, &mut states, &mut current);
        logic
            .to_completed(
                &NodeId::new("s"),
                Envelope::text("x", NodeId::new("s"), ExecutionId::new("e")),
                None,
                &mut tracker,
                &mut states,
                &mut current,
            )
            .unwrap();

        assert_eq!(states[&NodeId::new("c")].status, NodeStatus::Completed);
    }
}
