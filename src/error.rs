//! Typed error taxonomy for the execution runtime.
//!
//! Mirrors the kind-not-type taxonomy from the error handling design: each
//! variant is isolated to the failing node unless marked scheduler-fatal.

use crate::ids::{ExecutionId, NodeId};
use thiserror::Error;

/// Result type used throughout the runtime.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors a handler or the scheduler can produce.
///
/// `InvalidTransition` and `HandlerMissing` are scheduler-fatal: they abort
/// the whole execution rather than isolating to one node.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    /// Static misconfiguration caught in `validate`.
    #[error("validation error on node {node_id}: {message}")]
    Validation { node_id: NodeId, message: String },

    /// `pre_execute` failed (missing file, bad config, ...).
    #[error("runtime setup error on node {node_id}: {message}")]
    RuntimeSetup { node_id: NodeId, message: String },

    /// Exception raised inside `run`.
    #[error("handler error on node {node_id}: {message}")]
    Handler { node_id: NodeId, message: String },

    /// Handler exceeded its configured timeout.
    #[error("node {node_id} timed out after {elapsed_ms}ms")]
    Timeout { node_id: NodeId, elapsed_ms: u64 },

    /// Transform/parse failure while resolving an incoming edge.
    #[error("input resolution error on node {node_id}: {message}")]
    InputResolution { node_id: NodeId, message: String },

    /// Internal invariant violation. Fatal for the whole execution.
    #[error("invalid transition for node {node_id}: {message}")]
    InvalidTransition { node_id: NodeId, message: String },

    /// Durable layer unavailable after bounded retry.
    #[error("persistence error for execution {execution_id}: {message}")]
    Persistence {
        execution_id: ExecutionId,
        message: String,
    },

    /// Produced by cooperative cancellation.
    #[error("node {node_id} cancelled")]
    Cancellation { node_id: NodeId },

    /// Unknown node type tag at dispatch. Fatal.
    #[error("no handler registered for node type {node_type}")]
    HandlerMissing { node_type: String },

    /// A typed envelope accessor was used against the wrong content kind.
    #[error("wrong content kind: expected {expected}, got {actual}")]
    WrongContentKind { expected: String, actual: String },

    /// Diagram structure problem (duplicate ids, dangling edges, ...).
    #[error("diagram error: {0}")]
    Diagram(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] SerdeJsonErrorWrapper),
}

/// Wraps `serde_json::Error` so it implements `Clone`, which `thiserror`'s
/// `#[from]` needs `RuntimeError` to stay `Clone` (required since execution
/// records store a cloneable error string, not the original error object).
#[derive(Debug, Clone)]
pub struct SerdeJsonErrorWrapper(pub String);

impl std::fmt::Display for SerdeJsonErrorWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SerdeJsonErrorWrapper {}

impl From<serde_json::Error> for SerdeJsonErrorWrapper {
    fn from(value: serde_json::Error) -> Self {
        Self(value.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(value: serde_json::Error) -> Self {
        RuntimeError::Serialization(SerdeJsonErrorWrapper::from(value))
    }
}

impl RuntimeError {
    /// Whether this error kind is scheduler-fatal (aborts the whole
    /// execution) rather than isolated to the failing node.
    pub fn is_scheduler_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::InvalidTransition { .. } | RuntimeError::HandlerMissing { .. }
        )
    }
}
