//! Diagram data model: the immutable input to an execution.

use crate::envelope::ContentType;
use crate::error::{Result, RuntimeError};
use crate::ids::{EdgeId, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// A named input or output channel on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Port {
    Default,
    First,
    CondTrue,
    CondFalse,
    Custom(String),
}

impl Default for Port {
    fn default() -> Self {
        Port::Default
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Default => write!(f, "default"),
            Port::First => write!(f, "first"),
            Port::CondTrue => write!(f, "condtrue"),
            Port::CondFalse => write!(f, "condfalse"),
            Port::Custom(name) => write!(f, "{name}"),
        }
    }
}

impl From<&str> for Port {
    fn from(value: &str) -> Self {
        match value {
            "default" => Port::Default,
            "first" => Port::First,
            "condtrue" => Port::CondTrue,
            "condfalse" => Port::CondFalse,
            other => Port::Custom(other.to_string()),
        }
    }
}

/// Closed set of node type tags the runtime understands structurally.
/// Concrete handler *behavior* lives behind the `NodeHandler` trait;
/// this enum only carries the static configuration the scheduler and
/// readiness checker need to reason about a node without invoking it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Endpoint {
        save_to_file: bool,
    },
    PersonJob {
        max_iteration: u32,
        default_prompt: Option<String>,
        first_only_prompt: Option<String>,
    },
    Condition {
        kind: ConditionKind,
    },
    CodeJob {
        code_path: Option<String>,
    },
    /// Any other handler-defined node type, identified by its tag.
    Custom(String),
}

impl NodeType {
    /// The dispatch tag used to look the handler up in the registry.
    pub fn tag(&self) -> &str {
        match self {
            NodeType::Start => "start",
            NodeType::Endpoint { .. } => "endpoint",
            NodeType::PersonJob { .. } => "person_job",
            NodeType::Condition { .. } => "condition",
            NodeType::CodeJob { .. } => "code_job",
            NodeType::Custom(tag) => tag,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, NodeType::Start)
    }

    pub fn is_endpoint(&self) -> bool {
        matches!(self, NodeType::Endpoint { .. })
    }

    pub fn is_condition(&self) -> bool {
        matches!(self, NodeType::Condition { .. })
    }

    pub fn is_person_job(&self) -> bool {
        matches!(self, NodeType::PersonJob { .. })
    }

    pub fn max_iteration(&self) -> Option<u32> {
        match self {
            NodeType::PersonJob { max_iteration, .. } => Some(*max_iteration),
            _ => None,
        }
    }
}

/// The two condition-node flavors spec.md names explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionKind {
    Custom { expression: String },
    DetectMaxIterations,
}

/// A transform rule attached to an edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transform {
    /// Forces interpretation as a given content type (e.g. `object` to
    /// parse a raw_text source as JSON).
    pub content_type: Option<ContentType>,
}

/// A node in the diagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    /// Type-specific static configuration not already captured by
    /// `NodeType`'s variant fields (handler-private knobs).
    pub config: Value,
    pub metadata: Option<Value>,
}

/// An edge wiring a source node's output port to a target node's input
/// port, with an optional transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source_node_id: NodeId,
    pub source_port: Port,
    pub target_node_id: NodeId,
    pub target_port: Port,
    pub transform: Option<Transform>,
}

/// Immutable, ordered set of nodes and edges plus the adjacency indices
/// the scheduler/resolver/readiness-checker need for O(1) lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagram {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    #[serde(skip)]
    node_index: HashMap<NodeId, usize>,
    #[serde(skip)]
    incoming: HashMap<NodeId, Vec<usize>>,
    #[serde(skip)]
    outgoing: HashMap<NodeId, Vec<usize>>,
}

impl Diagram {
    /// Build a diagram from a node/edge list, validating structural
    /// invariants (unique ids, no dangling edges) and building adjacency
    /// indices.
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self> {
        let mut node_index = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if node_index.insert(node.id.clone(), i).is_some() {
                return Err(RuntimeError::Diagram(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
        }

        let mut incoming: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            if !node_index.contains_key(&edge.source_node_id) {
                return Err(RuntimeError::Diagram(format!(
                    "edge {} references unknown source node {}",
                    edge.id, edge.source_node_id
                )));
            }
            if !node_index.contains_key(&edge.target_node_id) {
                return Err(RuntimeError::Diagram(format!(
                    "edge {} references unknown target node {}",
                    edge.id, edge.target_node_id
                )));
            }
            outgoing
                .entry(edge.source_node_id.clone())
                .or_default()
                .push(i);
            incoming
                .entry(edge.target_node_id.clone())
                .or_default()
                .push(i);
        }

        Ok(Self {
            nodes,
            edges,
            node_index,
            incoming,
            outgoing,
        })
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Node> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn incoming_edges(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    pub fn outgoing_edges(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }
}

/// Lifecycle status of a node within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    MaxIterReached,
}

/// Token usage for a single execution record or aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cached: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cached += other.cached;
    }
}

/// Scheduler-owned per-node state for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

impl NodeState {
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            token_usage: None,
        }
    }
}
