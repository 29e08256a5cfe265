//! InputResolver: collects envelopes from incoming edges for a target
//! node, applying transforms and the first/default port rules.

use crate::diagram::{Diagram, Edge, Node, NodeType, Port};
use crate::envelope::Envelope;
use crate::error::Result;
use crate::tracker::ExecutionTracker;
use serde_json::Value;
use std::collections::HashMap;

/// Meta key a condition handler's envelope carries to record which branch
/// it selected. Read generically by both the resolver and the readiness
/// checker.
pub const ACTIVE_BRANCH_META_KEY: &str = "active_branch";

/// Resolves per-target-node inputs from the diagram's incoming edges.
pub struct InputResolver;

impl InputResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `map[port -> Envelope]` for `node`, per spec.md §4.5.
    pub fn resolve(
        &self,
        node: &Node,
        diagram: &Diagram,
        tracker: &ExecutionTracker,
    ) -> Result<HashMap<Port, Envelope>> {
        let mut result: HashMap<Port, Envelope> = HashMap::new();
        let mut warnings = Vec::new();

        for edge in relevant_edges(node, diagram, tracker) {
            let Some(source_output) = tracker.get_last_output(&edge.source_node_id) else {
                continue;
            };

            let source_node = diagram.get_node(&edge.source_node_id);
            if let Some(source_node) = source_node {
                if source_node.node_type.is_condition() {
                    let active_branch = source_output
                        .meta
                        .get(ACTIVE_BRANCH_META_KEY)
                        .and_then(Value::as_str);
                    if active_branch != Some(edge.source_port.to_string().as_str()) {
                        continue;
                    }
                }
            }

            let resolved = apply_transform(edge, source_output);

            if result
                .insert(edge.target_port.clone(), resolved)
                .is_some()
            {
                warnings.push(format!(
                    "multiple edges wrote target port {:?}; last writer wins",
                    edge.target_port
                ));
            }
        }

        if !warnings.is_empty() {
            for envelope in result.values_mut() {
                envelope.meta.insert(
                    "input_resolution_warnings".to_string(),
                    serde_json::json!(warnings),
                );
            }
        }

        Ok(result)
    }
}

impl Default for InputResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Determine which incoming edges are relevant for readiness/resolution,
/// applying the PersonJob first/subsequent-execution special case and the
/// conversation_state bypass.
pub fn relevant_edges<'a>(
    node: &Node,
    diagram: &'a Diagram,
    tracker: &ExecutionTracker,
) -> Vec<&'a Edge> {
    let all: Vec<&Edge> = diagram.incoming_edges(&node.id).collect();

    let conversation_bypass: Vec<&Edge> = all
        .iter()
        .copied()
        .filter(|e| {
            e.transform
                .as_ref()
                .and_then(|t| t.content_type)
                .map(|ct| ct == crate::envelope::ContentType::ConversationState)
                .unwrap_or(false)
        })
        .collect();

    if !node.node_type.is_person_job() {
        return all;
    }

    let exec_count = tracker.get_execution_count(&node.id);
    let mut base: Vec<&Edge> = if exec_count == 0 {
        let first_edges: Vec<&Edge> = all
            .iter()
            .copied()
            .filter(|e| e.target_port == Port::First)
            .collect();
        if !first_edges.is_empty() {
            first_edges
        } else {
            let non_loop: Vec<&Edge> = all
                .iter()
                .copied()
                .filter(|e| {
                    diagram
                        .get_node(&e.source_node_id)
                        .map(|n| !n.node_type.is_condition())
                        .unwrap_or(true)
                })
                .collect();
            if non_loop.is_empty() {
                all.clone()
            } else {
                non_loop
            }
        }
    } else {
        all.iter()
            .copied()
            .filter(|e| e.target_port != Port::First)
            .collect()
    };

    for edge in conversation_bypass {
        if !base.iter().any(|e| e.id == edge.id) {
            base.push(edge);
        }
    }
    base
}

fn apply_transform(edge: &Edge, source_output: &Envelope) -> Envelope {
    match edge.transform.as_ref().and_then(|t| t.content_type) {
        Some(crate::envelope::ContentType::Object)
            if source_output.content_type == crate::envelope::ContentType::RawText =>
        {
            match source_output.as_json() {
                Ok(value) => crate::envelope::Envelope::json(
                    value,
                    source_output.produced_by.clone(),
                    source_output.trace_id.clone(),
                ),
                Err(_) => source_output.clone(),
            }
        }
        _ => source_output.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{Node, NodeType, TokenUsage};
    use crate::ids::{EdgeId, ExecutionId, NodeId};
    use crate::tracker::CompletionStatus;
    use serde_json::json;

    fn node(id: &str, ty: NodeType) -> Node {
        Node {
            id: NodeId::new(id),
            node_type: ty,
            config: json!(null),
            metadata: None,
        }
    }

    fn mk_edge(id: &str, from: &str, to: &str, target_port: Port) -> Edge {
        Edge {
            id: EdgeId::new(id),
            source_node_id: NodeId::new(from),
            source_port: Port::Default,
            target_node_id: NodeId::new(to),
            target_port,
            transform: None,
        }
    }

    #[test]
    fn person_job_prefers_first_edges_on_first_execution() {
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
            vec![s, p.clone()],
            vec![
                mk_edge("e1", "s", "p", Port::First),
                mk_edge("e2", "s", "p", Port::Default),
            ],
        )
        .unwrap();
        let tracker = ExecutionTracker::new();

        let edges = relevant_edges(&p, &diagram, &tracker);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_port, Port::First);
    }

    #[test]
    fn person_job_excludes_first_edges_on_subsequent_execution() {
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
            vec![s, p.clone()],
            vec![
                mk_edge("e1", "s", "p", Port::First),
                mk_edge("e2", "s", "p", Port::Default),
            ],
        )
        .unwrap();
        let mut tracker = ExecutionTracker::new();
        tracker.start_execution(&NodeId::new("p"));
        tracker
            .complete_execution(
                &NodeId::new("p"),
                CompletionStatus::Success,
                Some(Envelope::text("x", NodeId::new("p"), ExecutionId::new("e"))),
                None,
                None::<TokenUsage>,
            )
            .unwrap();

        let edges = relevant_edges(&p, &diagram, &tracker);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_port, Port::Default);
    }

    #[test]
    fn condition_branch_filters_unselected_port() {
        let c = node(
            "c",
            NodeType::Condition {
                kind: crate::diagram::ConditionKind::DetectMaxIterations,
            },
        );
        let a = node("a", NodeType::CodeJob { code_path: None });
        let diagram = Diagram::new(
            vec![c, a.clone()],
            vec![Edge {
                id: EdgeId::new("e1"),
                source_node_id: NodeId::new("c"),
                source_port: Port::CondTrue,
                target_node_id: NodeId::new("a"),
                target_port: Port::Default,
                transform: None,
            }],
        )
        .unwrap();

        let mut tracker = ExecutionTracker::new();
        tracker.start_execution(&NodeId::new("c"));
        let output = Envelope::json(json!(false), NodeId::new("c"), ExecutionId::new("e"))
            .with_meta([(ACTIVE_BRANCH_META_KEY.to_string(), json!("condfalse"))]);
        tracker
            .complete_execution(&NodeId::new("c"), CompletionStatus::Success, Some(output), None, None)
            .unwrap();

        let resolver = InputResolver::new();
        let resolved = resolver.resolve(&a, &diagram, &tracker).unwrap();
        assert!(resolved.is_empty(), "condfalse branch active, condtrue edge must not resolve");
    }

    #[test]
    fn object_transform_parses_raw_text_source() {
        let a = node("a", NodeType::CodeJob { code_path: None });
        let b = node("b", NodeType::CodeJob { code_path: None });
        let diagram = Diagram::new(
            vec![a.clone(), b.clone()],
            vec![Edge {
                id: EdgeId::new("e1"),
                source_node_id: NodeId::new("a"),
                source_port: Port::Default,
                target_node_id: NodeId::new("b"),
                target_port: Port::Default,
                transform: Some(crate::diagram::Transform {
                    content_type: Some(crate::envelope::ContentType::Object),
                }),
            }],
        )
        .unwrap();

        let mut tracker = ExecutionTracker::new();
        tracker.start_execution(&NodeId::new("a"));
        tracker
            .complete_execution(
                &NodeId::new("a"),
                CompletionStatus::Success,
                Some(Envelope::text(r#"{"x":1}"#, NodeId::new("a"), ExecutionId::new("e"))),
                None,
                None,
            )
            .unwrap();

        let resolver = InputResolver::new();
        let resolved = resolver.resolve(&b, &diagram, &tracker).unwrap();
        let env = resolved.get(&Port::Default).unwrap();
        assert_eq!(env.as_json().unwrap(), json!({"x": 1}));
    }
}
