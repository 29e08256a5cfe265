use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use diagram_runtime::diagram::{Diagram, Edge, Node, NodeType, Port};
use diagram_runtime::readiness::ReadinessChecker;
use diagram_runtime::store::InMemoryDurableStore;
use diagram_runtime::tracker::ExecutionTracker;
use diagram_runtime::{
    CancelToken, DiagramId, EventBus, ExecutionId, ExecutionRequest, HandlerOutcome,
    HandlerRegistry, NodeHandler, NodeId, NodeStatus, Result, RuntimeConfig, Scheduler, StateStore,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn node(id: &str, ty: NodeType) -> Node {
    Node {
        id: NodeId::new(id),
        node_type: ty,
        config: Value::Null,
        metadata: None,
    }
}

fn edge(id: &str, from: &str, to: &str) -> Edge {
    Edge {
        id: diagram_runtime::EdgeId::new(id),
        source_node_id: NodeId::new(from),
        source_port: Port::Default,
        target_node_id: NodeId::new(to),
        target_port: Port::Default,
        transform: None,
    }
}

/// A ten-node linear chain: `start -> node_0 -> ... -> node_8 -> end`.
fn create_chain_diagram() -> Arc<Diagram> {
    let mut nodes = vec![node("start", NodeType::Start)];
    let mut edges = Vec::new();
    let mut prev = "start".to_string();

    for i in 0..9 {
        let id = format!("node_{i}");
        nodes.push(node(&id, NodeType::CodeJob { code_path: None }));
        edges.push(edge(&format!("e_{i}"), &prev, &id));
        prev = id;
    }

    nodes.push(node("end", NodeType::Endpoint { save_to_file: false }));
    edges.push(edge("e_end", &prev, "end"));

    Arc::new(Diagram::new(nodes, edges).unwrap())
}

struct EchoHandler(&'static str);

#[async_trait]
impl NodeHandler for EchoHandler {
    fn node_type_tag(&self) -> &str {
        self.0
    }

    async fn run(&self, inputs: HashMap<String, Value>, _request: &ExecutionRequest<'_>) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::Json(json!(inputs)))
    }
}

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(EchoHandler("start"))).unwrap();
    registry.register(Arc::new(EchoHandler("code_job"))).unwrap();
    registry.register(Arc::new(EchoHandler("endpoint"))).unwrap();
    registry
}

fn benchmark_scheduler_run(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let diagram = create_chain_diagram();

    c.bench_function("scheduler_run_ten_node_chain", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = Arc::new(StateStore::new(Arc::new(InMemoryDurableStore::new()), Duration::from_secs(60)));
                let events = Arc::new(EventBus::new(64));
                let scheduler = Scheduler::new(diagram.clone(), Arc::new(registry()), store, events, RuntimeConfig::default());
                let state = scheduler
                    .run(ExecutionId::new("bench"), DiagramId::new("d1"), HashMap::new(), CancelToken::new())
                    .await
                    .unwrap();
                black_box(state)
            })
        })
    });
}

fn benchmark_readiness_get_ready(c: &mut Criterion) {
    let diagram = create_chain_diagram();
    let tracker = ExecutionTracker::new();
    let node_states = HashMap::new();
    let checker = ReadinessChecker::new();

    c.bench_function("readiness_get_ready_ten_node_chain", |b| {
        b.iter(|| black_box(checker.get_ready(&diagram, &tracker, &node_states)))
    });
}

fn benchmark_readiness_get_ready_mid_execution(c: &mut Criterion) {
    let diagram = create_chain_diagram();
    let tracker = ExecutionTracker::new();
    let mut node_states = HashMap::new();
    node_states.insert(NodeId::new("start"), NodeStatus::Completed);
    for i in 0..5 {
        node_states.insert(NodeId::new(format!("node_{i}")), NodeStatus::Completed);
    }
    let checker = ReadinessChecker::new();

    c.bench_function("readiness_get_ready_mid_chain", |b| {
        b.iter(|| black_box(checker.get_ready(&diagram, &tracker, &node_states)))
    });
}

criterion_group!(
    benches,
    benchmark_scheduler_run,
    benchmark_readiness_get_ready,
    benchmark_readiness_get_ready_mid_execution
);
criterion_main!(benches);
