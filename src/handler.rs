//! NodeHandler: the per-node-type execution contract, plus the
//! `execute_with_envelopes` template method that orchestrates it.
//!
//! Grounded on the teacher's `NodeFunction` trait (`src/graph/node.rs`)
//! for the async-trait shape, and on
//! `original_source/dipeo/application/execution/handler_base.py`'s
//! `TypedNodeHandler` for the orchestration steps and default
//! serialization rules.

use crate::context::ExecutionContext;
use crate::diagram::{Node, Port};
use crate::envelope::{Envelope, EnvelopeBody};
use crate::error::{Result, RuntimeError};
use crate::ids::ExecutionId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Everything a handler needs about the dispatch it's been invoked for.
/// Deliberately narrow: handlers see their own node, the current
/// execution id, and a context scoped to their own node — not the whole
/// scheduler. Orchestrator handlers (e.g. a sub-diagram call) use
/// `context` to create a child execution; ordinary handlers ignore it.
pub struct ExecutionRequest<'a> {
    pub node: &'a Node,
    pub execution_id: ExecutionId,
    /// 1-based execution number for this node, from `ExecutionTracker`.
    pub exec_count: u32,
    pub context: ExecutionContext,
}

/// What `run` hands back before serialization. Handlers that already
/// have an `Envelope` (e.g. a sub-diagram call) can skip the default
/// serialization rules entirely.
pub enum HandlerOutcome {
    Envelope(Envelope),
    Json(Value),
    Text(String),
    /// A list result: wrapped in a JSON envelope with `wrapped_list=true`
    /// meta, per spec.md §4.4's serialize_output default rule.
    List(Vec<Value>),
}

/// Per-node-type execution contract.
///
/// The template method [`execute_with_envelopes`] drives these in order:
/// `pre_execute → prepare_inputs → run → serialize_output → post_execute`.
/// `validate` is invoked separately, once, at registration/dispatch time
/// rather than on every execution.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The node type tag this handler serves, used as the registry key.
    fn node_type_tag(&self) -> &str;

    /// Static structural validation. Default: always valid.
    fn validate(&self, _request: &ExecutionRequest<'_>) -> Result<()> {
        Ok(())
    }

    /// Runtime validation/setup. Returning `Some(envelope)` short-circuits
    /// the rest of the template with that result.
    async fn pre_execute(&self, _request: &ExecutionRequest<'_>) -> Result<Option<Envelope>> {
        Ok(None)
    }

    /// Project resolved envelopes into the handler's native input shape.
    /// Default: JSON-decode each envelope, falling back to raw text.
    async fn prepare_inputs(
        &self,
        _request: &ExecutionRequest<'_>,
        inputs: HashMap<Port, Envelope>,
    ) -> Result<HashMap<String, Value>> {
        Ok(inputs
            .into_iter()
            .map(|(port, envelope)| {
                let value = envelope
                    .as_json()
                    .unwrap_or_else(|_| Value::String(envelope.as_text().unwrap_or_default().to_string()));
                (port.to_string(), value)
            })
            .collect())
    }

    /// Core handler logic.
    async fn run(
        &self,
        inputs: HashMap<String, Value>,
        request: &ExecutionRequest<'_>,
    ) -> Result<HandlerOutcome>;

    /// Wrap a successful `run` result into an envelope. Default rules
    /// mirror spec.md §4.4: object → json, list → json with
    /// `wrapped_list=true` meta, text → raw_text.
    fn serialize_output(&self, result: HandlerOutcome, request: &ExecutionRequest<'_>) -> Envelope {
        match result {
            HandlerOutcome::Envelope(envelope) => envelope,
            HandlerOutcome::Json(value) => {
                Envelope::json(value, request.node.id.clone(), request.execution_id.clone())
            }
            HandlerOutcome::List(items) => Envelope::json(
                Value::Array(items),
                request.node.id.clone(),
                request.execution_id.clone(),
            )
            .with_meta([("wrapped_list".to_string(), Value::Bool(true))]),
            HandlerOutcome::Text(text) => {
                Envelope::text(text, request.node.id.clone(), request.execution_id.clone())
            }
        }
    }

    /// Optional post-processing hook; also where token-mode handlers
    /// would emit on outgoing edges. Default: pass through unchanged.
    fn post_execute(&self, _request: &ExecutionRequest<'_>, output: Envelope) -> Envelope {
        output
    }

    /// Custom error-to-envelope mapping. Default: no override, falls back
    /// to the template's generic error envelope.
    async fn on_error(
        &self,
        _request: &ExecutionRequest<'_>,
        _error: &RuntimeError,
    ) -> Option<Envelope> {
        None
    }

    /// Prompt/config fields this node type's readiness depends on, for the
    /// readiness checker's template-variable-dependency rule. Only
    /// `PersonJob` declares any today; other handlers have none.
    fn template_fields(&self, _node: &Node) -> Vec<&str> {
        Vec::new()
    }
}

/// Orchestrates one dispatch per spec.md §4.4's template method. Never
/// propagates a handler error as `Err` — failures become error
/// envelopes, matching the python original's `try/except` wrapper, so
/// callers always get something to record as the node's output.
pub async fn execute_with_envelopes(
    handler: &dyn NodeHandler,
    request: &ExecutionRequest<'_>,
    inputs: HashMap<Port, Envelope>,
) -> Envelope {
    if let Ok(Some(envelope)) = handler.pre_execute(request).await {
        return handler.post_execute(request, envelope);
    }

    let run_result = async {
        let prepared = handler.prepare_inputs(request, inputs).await?;
        handler.run(prepared, request).await
    }
    .await;

    let output = match run_result {
        Ok(outcome) => handler.serialize_output(outcome, request),
        Err(error) => {
            if let Some(custom) = handler.on_error(request, &error).await {
                custom
            } else {
                error_envelope(&error, request)
            }
        }
    };

    handler.post_execute(request, output)
}

fn error_envelope(error: &RuntimeError, request: &ExecutionRequest<'_>) -> Envelope {
    let error_type = match error {
        RuntimeError::Validation { .. } => "ValidationError",
        RuntimeError::RuntimeSetup { .. } => "RuntimeSetupError",
        RuntimeError::Handler { .. } => "HandlerError",
        RuntimeError::Timeout { .. } => "TimeoutError",
        RuntimeError::InputResolution { .. } => "InputResolutionError",
        RuntimeError::InvalidTransition { .. } => "InvalidTransition",
        RuntimeError::Persistence { .. } => "PersistenceError",
        RuntimeError::Cancellation { .. } => "CancellationError",
        RuntimeError::HandlerMissing { .. } => "HandlerMissing",
        RuntimeError::WrongContentKind { .. } => "WrongContentKind",
        RuntimeError::Diagram(_) => "DiagramError",
        RuntimeError::Serialization(_) => "SerializationError",
    };
    Envelope::error(
        error.to_string(),
        error_type,
        request.node.id.clone(),
        request.execution_id.clone(),
    )
}

/// Convenience accessor mirroring the original's `get_optional_input`.
pub fn optional_input<'a>(inputs: &'a HashMap<String, Value>, key: &str) -> Option<&'a Value> {
    inputs.get(key)
}

/// Mirrors the original's `get_required_input`: fails with a descriptive
/// `Handler` error rather than panicking on a missing key.
pub fn required_input<'a>(
    inputs: &'a HashMap<String, Value>,
    key: &str,
    node_id: &crate::ids::NodeId,
) -> Result<&'a Value> {
    inputs.get(key).ok_or_else(|| RuntimeError::Handler {
        node_id: node_id.clone(),
        message: format!("required input '{key}' not provided"),
    })
}
