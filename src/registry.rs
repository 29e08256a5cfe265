//! HandlerRegistry: node_type tag → handler lookup.
//!
//! Grounded on the teacher's `src/graph/builder.rs` registration
//! pattern, and on
//! `original_source/dipeo/application/execution/handler_factory.py`'s
//! duplicate-tag rejection and `HandlerMissing`-at-dispatch behavior.

use crate::error::{Result, RuntimeError};
use crate::handler::NodeHandler;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps a node type tag to its handler. Registration is explicit; there
/// is no implicit fallback handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own `node_type_tag`. Rejects a
    /// duplicate tag rather than silently overwriting it.
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) -> Result<()> {
        let tag = handler.node_type_tag().to_string();
        if self.handlers.contains_key(&tag) {
            return Err(RuntimeError::Diagram(format!(
                "duplicate handler registration for node type '{tag}'"
            )));
        }
        self.handlers.insert(tag, handler);
        Ok(())
    }

    /// Look up the handler for `node_type_tag`, or fail with the
    /// scheduler-fatal `HandlerMissing` error.
    pub fn dispatch(&self, node_type_tag: &str) -> Result<Arc<dyn NodeHandler>> {
        self.handlers
            .get(node_type_tag)
            .cloned()
            .ok_or_else(|| RuntimeError::HandlerMissing {
                node_type: node_type_tag.to_string(),
            })
    }

    pub fn is_registered(&self, node_type_tag: &str) -> bool {
        self.handlers.contains_key(node_type_tag)
    }
}
