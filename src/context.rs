//! ExecutionContext: the read/write facade handlers and orchestrator
//! nodes (e.g. sub-diagram calls) see, per spec.md §4.10.
//!
//! Grounded on the teacher's `engine/context.rs` (`SharedContext`, an
//! `Arc<RwLock<...>>`-backed facade over shared execution state),
//! narrowed here to the read ops plus the current-node-only write ops
//! spec.md names, with mutations routed through
//! [`crate::transition::StateTransitionLogic`] rather than raw map
//! writes.

use crate::diagram::{Diagram, Node, NodeState, NodeStatus, TokenUsage};
use crate::envelope::Envelope;
use crate::error::{Result, RuntimeError};
use crate::ids::{DiagramId, ExecutionId, NodeId};
use crate::readiness::ReadinessChecker;
use crate::resolver::InputResolver;
use crate::tracker::ExecutionTracker;
use crate::transition::StateTransitionLogic;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Minimal DI surface mirroring the original's string-keyed service
/// registry (e.g. a diagram loader or message router a handler looks up
/// by name). This runtime has no services of its own to register, so
/// [`ExecutionContext::new`] always starts with an empty registry;
/// embedders wire their own in via [`ExecutionContext::with_services`].
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceRegistry {
    pub fn new(services: HashMap<String, Arc<dyn Any + Send + Sync>>) -> Self {
        Self { services: Arc::new(services) }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(key).cloned()
    }
}

/// State shared by every `ExecutionContext` instance for one execution,
/// and exclusively mutated by the scheduler's transition calls under
/// `shared`'s lock. Mirrors the per-execution mutex spec.md §5 requires.
pub struct SharedExecutionState {
    pub tracker: ExecutionTracker,
    pub node_states: HashMap<NodeId, NodeState>,
    pub variables: HashMap<String, Value>,
    pub current_node_id: Option<NodeId>,
}

impl SharedExecutionState {
    pub fn new(variables: HashMap<String, Value>) -> Self {
        Self {
            tracker: ExecutionTracker::new(),
            node_states: HashMap::new(),
            variables,
            current_node_id: None,
        }
    }
}

/// Handler-facing facade over one execution's shared state, scoped to a
/// specific node for the duration of its dispatch (`for_node`
/// determines which node the restricted write operations apply to).
///
/// Holds the diagram by `Arc` rather than borrow so a context can be
/// moved into a spawned dispatch task.
#[derive(Clone)]
pub struct ExecutionContext {
    diagram: Arc<Diagram>,
    pub execution_id: ExecutionId,
    pub diagram_id: DiagramId,
    shared: Arc<Mutex<SharedExecutionState>>,
    for_node: Option<NodeId>,
    services: ServiceRegistry,
}

impl ExecutionContext {
    pub fn new(
        diagram: Arc<Diagram>,
        execution_id: ExecutionId,
        diagram_id: DiagramId,
        shared: Arc<Mutex<SharedExecutionState>>,
    ) -> Self {
        Self {
            diagram,
            execution_id,
            diagram_id,
            shared,
            for_node: None,
            services: ServiceRegistry::default(),
        }
    }

    /// Attach a service registry, replacing the empty default. Typically
    /// called once by the embedder before handing the context to the
    /// scheduler.
    pub fn with_services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    /// A context narrowed to a single node's write permissions, handed
    /// to that node's handler for the duration of its dispatch.
    pub fn scoped_to(&self, node_id: NodeId) -> Self {
        Self {
            diagram: self.diagram.clone(),
            execution_id: self.execution_id.clone(),
            diagram_id: self.diagram_id.clone(),
            shared: self.shared.clone(),
            for_node: Some(node_id),
            services: self.services.clone(),
        }
    }

    pub fn diagram(&self) -> &Diagram {
        &self.diagram
    }

    /// Look up a named service (e.g. a diagram loader a sub-diagram
    /// handler needs), per spec.md §4.10. Returns `None` when nothing is
    /// registered under `key`, which is always the case unless the
    /// embedder called [`Self::with_services`].
    pub fn get_service(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(key)
    }

    pub async fn current_node_id(&self) -> Option<NodeId> {
        self.shared.lock().await.current_node_id.clone()
    }

    pub async fn get_node_state(&self, id: &NodeId) -> Option<NodeState> {
        self.shared.lock().await.node_states.get(id).cloned()
    }

    pub async fn get_node_output(&self, id: &NodeId) -> Option<Envelope> {
        self.shared.lock().await.tracker.get_last_output(id).cloned()
    }

    /// Alias for [`Self::get_node_output`]: spec.md names both
    /// `get_node_result` and `get_node_output` as read operations over
    /// the same underlying value.
    pub async fn get_node_result(&self, id: &NodeId) -> Option<Envelope> {
        self.get_node_output(id).await
    }

    pub async fn get_node_execution_count(&self, id: &NodeId) -> u32 {
        self.shared.lock().await.tracker.get_execution_count(id)
    }

    pub async fn get_variables(&self) -> HashMap<String, Value> {
        self.shared.lock().await.variables.clone()
    }

    pub async fn get_completed_nodes(&self) -> Vec<NodeId> {
        self.shared
            .lock()
            .await
            .node_states
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn has_running_nodes(&self) -> bool {
        self.shared
            .lock()
            .await
            .node_states
            .values()
            .any(|s| s.status == NodeStatus::Running)
    }

    pub async fn is_complete(&self) -> bool {
        let guard = self.shared.lock().await;
        let checker = ReadinessChecker::new();
        let statuses: HashMap<NodeId, NodeStatus> = guard
            .node_states
            .iter()
            .map(|(id, s)| (id.clone(), s.status))
            .collect();
        !guard.node_states.values().any(|s| s.status == NodeStatus::Running)
            && checker.get_ready(&self.diagram, &guard.tracker, &statuses).is_empty()
    }

    pub async fn get_ready_nodes(&self) -> Vec<&Node> {
        let guard = self.shared.lock().await;
        let statuses: HashMap<NodeId, NodeStatus> = guard
            .node_states
            .iter()
            .map(|(id, s)| (id.clone(), s.status))
            .collect();
        ReadinessChecker::new().get_ready(&self.diagram, &guard.tracker, &statuses)
    }

    pub async fn resolve_inputs(&self, node: &Node) -> Result<HashMap<crate::diagram::Port, Envelope>> {
        let guard = self.shared.lock().await;
        InputResolver::new().resolve(node, &self.diagram, &guard.tracker)
    }

    /// Complete the context's bound node with `output`. Fails if this
    /// context isn't scoped to a node, or is scoped to a different one
    /// than `node_id`.
    pub async fn transition_to_completed(
        &self,
        node_id: &NodeId,
        output: Envelope,
        token_usage: Option<TokenUsage>,
    ) -> Result<()> {
        self.require_scope(node_id)?;
        let mut guard = self.shared.lock().await;
        let logic = StateTransitionLogic::new(&self.diagram);
        let mut current = guard.current_node_id.clone();
        logic.to_completed(
            node_id,
            output,
            token_usage,
            &mut guard.tracker,
            &mut guard.node_states,
            &mut current,
        )?;
        guard.current_node_id = current;
        Ok(())
    }

    pub async fn transition_to_maxiter(&self, node_id: &NodeId, output: Envelope) -> Result<()> {
        self.require_scope(node_id)?;
        let mut guard = self.shared.lock().await;
        let logic = StateTransitionLogic::new(&self.diagram);
        let mut current = guard.current_node_id.clone();
        logic.to_maxiter(node_id, output, &mut guard.tracker, &mut guard.node_states, &mut current)?;
        guard.current_node_id = current;
        Ok(())
    }

    /// Reset `node_id`'s runtime state for loop re-entry. Reserved for
    /// orchestrator handlers (e.g. sub-diagram) acting on a node other
    /// than themselves, so this one isn't scope-restricted the way the
    /// completion transitions are.
    pub async fn reset(&self, node_id: &NodeId) {
        let mut guard = self.shared.lock().await;
        let logic = StateTransitionLogic::new(&self.diagram);
        logic.reset(node_id, &mut guard.tracker, &mut guard.node_states);
    }

    fn require_scope(&self, node_id: &NodeId) -> Result<()> {
        match &self.for_node {
            Some(scoped) if scoped == node_id => Ok(()),
            _ => Err(RuntimeError::InvalidTransition {
                node_id: node_id.clone(),
                message: "write operation attempted outside the node's own execution scope".to_string(),
            }),
        }
    }

    /// Delegates to a parent DI container to fabricate an isolated child
    /// execution context for a sub-diagram call. This crate carries no
    /// DI container of its own, so it always degrades to `None`;
    /// callers fall back to a lightweight in-process executor as
    /// spec.md §4.10 prescribes.
    pub fn create_sub_container(&self, _sub_id: &DiagramId) -> Option<ExecutionContext> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{Edge, NodeType, Port};
    use crate::ids::EdgeId;

    fn node(id: &str, ty: NodeType) -> Node {
        Node {
            id: NodeId::new(id),
            node_type: ty,
            config: Value::Null,
            metadata: None,
        }
    }

    fn diagram() -> Arc<Diagram> {
        Arc::new(
            Diagram::new(
                vec![
                    node("s", NodeType::Start),
                    node("e", NodeType::Endpoint { save_to_file: false }),
                ],
                vec![Edge {
                    id: EdgeId::new("e1"),
                    source_node_id: NodeId::new("s"),
                    source_port: Port::Default,
                    target_node_id: NodeId::new("e"),
                    target_port: Port::Default,
                    transform: None,
                }],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn write_outside_scope_is_rejected() {
        let d = diagram();
        let shared = Arc::new(Mutex::new(SharedExecutionState::new(HashMap::new())));
        let ctx = ExecutionContext::new(d, ExecutionId::new("e1"), DiagramId::new("d1"), shared);
        let scoped = ctx.scoped_to(NodeId::new("s"));

        let result = scoped
            .transition_to_completed(
                &NodeId::new("e"),
                Envelope::text("x", NodeId::new("e"), ExecutionId::new("e1")),
                None,
            )
            .await;
        assert!(matches!(result, Err(RuntimeError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn write_within_scope_succeeds() {
        let d = diagram();
        let shared = Arc::new(Mutex::new(SharedExecutionState::new(HashMap::new())));
        let ctx = ExecutionContext::new(d, ExecutionId::new("e1"), DiagramId::new("d1"), shared);
        {
            let mut guard = ctx.shared.lock().await;
            guard.tracker.start_execution(&NodeId::new("s"));
        }
        let scoped = ctx.scoped_to(NodeId::new("s"));

        scoped
            .transition_to_completed(
                &NodeId::new("s"),
                Envelope::text("x", NodeId::new("s"), ExecutionId::new("e1")),
                None,
            )
            .await
            .unwrap();

        let state = ctx.get_node_state(&NodeId::new("s")).await.unwrap();
        assert_eq!(state.status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn sub_container_always_degrades_to_none() {
        let d = diagram();
        let shared = Arc::new(Mutex::new(SharedExecutionState::new(HashMap::new())));
        let ctx = ExecutionContext::new(d, ExecutionId::new("e1"), DiagramId::new("d1"), shared);
        assert!(ctx.create_sub_container(&DiagramId::new("sub")).is_none());
    }

    #[tokio::test]
    async fn get_service_is_none_by_default_and_found_after_with_services() {
        let d = diagram();
        let shared = Arc::new(Mutex::new(SharedExecutionState::new(HashMap::new())));
        let ctx = ExecutionContext::new(d, ExecutionId::new("e1"), DiagramId::new("d1"), shared);
        assert!(ctx.get_service("diagram_loader").is_none());

        let mut services: HashMap<String, Arc<dyn Any + Send + Sync>> = HashMap::new();
        services.insert("answer".to_string(), Arc::new(42_i32));
        let ctx = ctx.with_services(ServiceRegistry::new(services));

        let found = ctx.get_service("answer").unwrap();
        assert_eq!(*found.downcast_ref::<i32>().unwrap(), 42);
        assert!(ctx.get_service("missing").is_none());
    }
}
