//! ReadinessChecker: decides which nodes may execute now.

use crate::diagram::{Diagram, Node, NodeStatus, NodeType};
use crate::ids::NodeId;
use crate::resolver::{relevant_edges, ACTIVE_BRANCH_META_KEY};
use crate::tracker::ExecutionTracker;
use serde_json::Value;
use std::collections::HashMap;

/// Extracts `{{variable}}` style placeholders from a template string.
/// Grounded on the original's `TemplateProcessor.extract_variables`.
pub fn extract_template_variables(template: &str) -> Vec<String> {
    let re = regex::Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*\}\}").unwrap();
    re.captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Decides node readiness per spec.md §4.6.
pub struct ReadinessChecker;

impl ReadinessChecker {
    pub fn new() -> Self {
        Self
    }

    /// Return all nodes in `diagram` that are ready to dispatch right now.
    pub fn get_ready<'a>(
        &self,
        diagram: &'a Diagram,
        tracker: &ExecutionTracker,
        node_states: &HashMap<NodeId, NodeStatus>,
    ) -> Vec<&'a Node> {
        diagram
            .nodes
            .iter()
            .filter(|node| self.is_ready(node, diagram, tracker, node_states))
            .collect()
    }

    /// Whether a single node is ready, per spec.md §4.6 rules 1-4.
    pub fn is_ready(
        &self,
        node: &Node,
        diagram: &Diagram,
        tracker: &ExecutionTracker,
        node_states: &HashMap<NodeId, NodeStatus>,
    ) -> bool {
        // Rule 1: must be PENDING. Condition nodes are the one exception:
        // the reset cascade deliberately never reclaims them (spec.md
        // §4.7), so a condition re-enters readiness on its own once an
        // upstream source has produced a newer output than the one it
        // last consumed — "they re-execute when their inputs re-arrive".
        match node_states.get(&node.id) {
            Some(NodeStatus::Pending) => {}
            Some(NodeStatus::Completed) | Some(NodeStatus::MaxIterReached)
                if node.node_type.is_condition() && has_fresher_upstream(node, diagram, tracker) => {}
            _ => return false,
        }

        // StartNodes are always ready when pending.
        if node.node_type.is_start() {
            return true;
        }

        let edges = relevant_edges(node, diagram, tracker);

        // Rule 2 + 3: dependency satisfaction, including condition branch gating.
        for edge in &edges {
            if !dependency_satisfied(edge.source_node_id.clone(), diagram, tracker, node_states) {
                return false;
            }

            if let Some(source) = diagram.get_node(&edge.source_node_id) {
                if source.node_type.is_condition()
                    && !condition_branch_active(tracker, &edge.source_node_id, &edge.source_port.to_string())
                {
                    return false;
                }
            }
        }

        // Rule 4: template variable dependencies.
        if !has_required_template_inputs(node, &edges, diagram, tracker, node_states) {
            return false;
        }

        true
    }
}

impl Default for ReadinessChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn dependency_satisfied(
    source_id: NodeId,
    diagram: &Diagram,
    tracker: &ExecutionTracker,
    node_states: &HashMap<NodeId, NodeStatus>,
) -> bool {
    let Some(dep_state) = node_states.get(&source_id) else {
        return false;
    };

    let dep_node = diagram.get_node(&source_id);
    let dep_exec_count = tracker.get_execution_count(&source_id);

    if let Some(dep_node) = dep_node {
        if dep_node.node_type.is_person_job()
            && *dep_state == NodeStatus::Pending
            && dep_exec_count > 0
        {
            return true;
        }
    }

    matches!(dep_state, NodeStatus::Completed | NodeStatus::MaxIterReached)
}

/// Whether any of `node`'s incoming sources has executed more times than
/// `node` itself — i.e. produced an output `node` hasn't consumed yet.
fn has_fresher_upstream(node: &Node, diagram: &Diagram, tracker: &ExecutionTracker) -> bool {
    let own_count = tracker.get_execution_count(&node.id);
    diagram
        .incoming_edges(&node.id)
        .any(|edge| tracker.get_execution_count(&edge.source_node_id) > own_count)
}

fn condition_branch_active(tracker: &ExecutionTracker, condition_id: &NodeId, branch: &str) -> bool {
    let Some(output) = tracker.get_last_output(condition_id) else {
        return false;
    };
    output
        .meta
        .get(ACTIVE_BRANCH_META_KEY)
        .and_then(Value::as_str)
        .map(|active| active == branch)
        .unwrap_or(false)
}

fn has_required_template_inputs(
    node: &Node,
    edges: &[&crate::diagram::Edge],
    _diagram: &Diagram,
    tracker: &ExecutionTracker,
    node_states: &HashMap<NodeId, NodeStatus>,
) -> bool {
    let NodeType::PersonJob {
        default_prompt,
        first_only_prompt,
        ..
    } = &node.node_type
    else {
        return true;
    };

    let mut vars = Vec::new();
    if let Some(p) = default_prompt {
        vars.extend(extract_template_variables(p));
    }
    if let Some(p) = first_only_prompt {
        vars.extend(extract_template_variables(p));
    }
    if vars.is_empty() {
        return true;
    }

    let exec_count = tracker.get_execution_count(&node.id);
    if exec_count != 0 {
        return true;
    }

    for edge in edges {
        if let Some(dep_state) = node_states.get(&edge.source_node_id) {
            if !matches!(dep_state, NodeStatus::Completed | NodeStatus::MaxIterReached) {
                let dep_exec_count = tracker.get_execution_count(&edge.source_node_id);
                if dep_exec_count == 0 {
                    return false;
                }
            }
        } else {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{ConditionKind, Edge, NodeType, Port};
    use crate::envelope::Envelope;
    use crate::ids::{EdgeId, ExecutionId};
    use crate::tracker::CompletionStatus;
    use serde_json::json;

    fn node(id: &str, ty: NodeType) -> crate::diagram::Node {
        crate::diagram::Node {
            id: NodeId::new(id),
            node_type: ty,
            config: json!(null),
            metadata: None,
        }
    }

    #[test]
    fn start_node_always_ready_when_pending() {
        let s = node("s", NodeType::Start);
        let diagram = Diagram::new(vec![s.clone()], vec![]).unwrap();
        let tracker = ExecutionTracker::new();
        let mut states = HashMap::new();
        states.insert(NodeId::new("s"), NodeStatus::Pending);

        let checker = ReadinessChecker::new();
        assert!(checker.is_ready(&s, &diagram, &tracker, &states));
    }

    #[test]
    fn downstream_of_incomplete_source_is_not_ready() {
        let s = node("s", NodeType::Start);
        let a = node("a", NodeType::CodeJob { code_path: None });
        let diagram = Diagram::new(
            vec![s, a.clone()],
            vec![Edge {
                id: EdgeId::new("e1"),
                source_node_id: NodeId::new("s"),
                source_port: Port::Default,
                target_node_id: NodeId::new("a"),
                target_port: Port::Default,
                transform: None,
            }],
        )
        .unwrap();
        let tracker = ExecutionTracker::new();
        let mut states = HashMap::new();
        states.insert(NodeId::new("s"), NodeStatus::Pending);
        states.insert(NodeId::new("a"), NodeStatus::Pending);

        let checker = ReadinessChecker::new();
        assert!(!checker.is_ready(&a, &diagram, &tracker, &states));
    }

    #[test]
    fn condition_gates_sibling_on_branch() {
        let c = node(
            "c",
            NodeType::Condition {
                kind: ConditionKind::DetectMaxIterations,
            },
        );
        let a = node("a", NodeType::CodeJob { code_path: None });
        let b = node("b", NodeType::CodeJob { code_path: None });
        let diagram = Diagram::new(
            vec![c, a.clone(), b.clone()],
            vec![
                Edge {
                    id: EdgeId::new("ea"),
                    source_node_id: NodeId::new("c"),
                    source_port: Port::CondTrue,
                    target_node_id: NodeId::new("a"),
                    target_port: Port::Default,
                    transform: None,
                },
                Edge {
                    id: EdgeId::new("eb"),
                    source_node_id: NodeId::new("c"),
                    source_port: Port::CondFalse,
                    target_node_id: NodeId::new("b"),
                    target_port: Port::Default,
                    transform: None,
                },
            ],
        )
        .unwrap();

        let mut tracker = ExecutionTracker::new();
        tracker.start_execution(&NodeId::new("c"));
        let output = Envelope::json(json!(true), NodeId::new("c"), ExecutionId::new("e"))
            .with_meta([(ACTIVE_BRANCH_META_KEY.to_string(), json!("condtrue"))]);
        tracker
            .complete_execution(&NodeId::new("c"), CompletionStatus::Success, Some(output), None, None)
            .unwrap();

        let mut states = HashMap::new();
        states.insert(NodeId::new("c"), NodeStatus::Completed);
        states.insert(NodeId::new("a"), NodeStatus::Pending);
        states.insert(NodeId::new("b"), NodeStatus::Pending);

        let checker = ReadinessChecker::new();
        assert!(checker.is_ready(&a, &diagram, &tracker, &states));
        assert!(!checker.is_ready(&b, &diagram, &tracker, &states));
    }

    #[test]
    fn extract_template_variables_finds_mustache_placeholders() {
        let vars = extract_template_variables("hello {{name}}, you are {{ age }}");
        assert_eq!(vars, vec!["name".to_string(), "age".to_string()]);
    }
}
