//! Prometheus metrics surface for the scheduler and event bus.
//!
//! Follows the `prometheus` + `lazy_static` registry pattern used
//! throughout the teacher's metrics modules.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};

lazy_static! {
    /// Global registry for runtime metrics.
    pub static ref RUNTIME_REGISTRY: Registry = Registry::new();
    /// Count of node dispatches started.
    pub static ref NODES_DISPATCHED: IntCounter = register_counter(
        "diagram_runtime_nodes_dispatched_total",
        "Total number of node handler dispatches started"
    );
    /// Count of node completions (success).
    pub static ref NODES_COMPLETED: IntCounter = register_counter(
        "diagram_runtime_nodes_completed_total",
        "Total number of node handlers that completed successfully"
    );
    /// Count of node failures.
    pub static ref NODES_FAILED: IntCounter = register_counter(
        "diagram_runtime_nodes_failed_total",
        "Total number of node handlers that failed"
    );
    /// Gauge of handlers currently in flight across all executions.
    pub static ref HANDLERS_IN_FLIGHT: IntGauge = register_gauge(
        "diagram_runtime_handlers_in_flight",
        "Number of node handlers currently executing"
    );
    /// Count of events dropped by a slow event-bus subscriber.
    pub static ref EVENT_BUS_OVERFLOW: IntCounter = register_counter(
        "diagram_runtime_event_bus_overflow_total",
        "Total number of events dropped under the drop_oldest overflow policy"
    );
    /// Count of durable-persistence retry exhaustion.
    pub static ref PERSISTENCE_DEGRADED: IntCounter = register_counter(
        "diagram_runtime_persistence_degraded_total",
        "Total number of executions that fell back to in-memory-only persistence"
    );
}

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid metric descriptor");
    RUNTIME_REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric name is unique");
    counter
}

fn register_gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid metric descriptor");
    RUNTIME_REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric name is unique");
    gauge
}
