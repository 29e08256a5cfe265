//! Envelope: the immutable typed data packet passed between nodes.

use crate::error::{Result, RuntimeError};
use crate::ids::{ExecutionId, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A single message in a conversation-state envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// The content-type tag of an envelope. Drives which `EnvelopeBody`
/// variant is populated and which typed accessor is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    RawText,
    Object,
    Binary,
    ConversationState,
    Error,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContentType::RawText => "raw_text",
            ContentType::Object => "object",
            ContentType::Binary => "binary",
            ContentType::ConversationState => "conversation_state",
            ContentType::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Closed set of typed payloads, one variant per `ContentType`.
///
/// Kept as a tagged variant rather than a single untyped field so accessors
/// can fail explicitly on a kind mismatch instead of silently coercing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_kind")]
pub enum EnvelopeBody {
    TextEnvelope { body: String },
    JsonEnvelope { body: Value },
    BinaryEnvelope { body: Vec<u8> },
    ConversationEnvelope { body: Vec<Message> },
    ErrorEnvelope { message: String, error_type: String },
}

/// Immutable typed data packet passed along an edge.
///
/// Construction goes through the factory functions below; `with_meta` and
/// `with_representations` return a new envelope rather than mutating in
/// place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub produced_by: NodeId,
    pub trace_id: ExecutionId,
    pub content_type: ContentType,
    pub body: EnvelopeBody,
    pub meta: HashMap<String, Value>,
    pub representations: HashMap<String, Value>,
}

impl Envelope {
    /// Build a raw-text envelope. A JSON-looking string is NOT auto-parsed;
    /// callers must request the typed view via [`Envelope::as_json`].
    pub fn text(body: impl Into<String>, produced_by: NodeId, trace_id: ExecutionId) -> Self {
        Self {
            produced_by,
            trace_id,
            content_type: ContentType::RawText,
            body: EnvelopeBody::TextEnvelope { body: body.into() },
            meta: HashMap::new(),
            representations: HashMap::new(),
        }
    }

    /// Build a structured-object envelope.
    pub fn json(body: Value, produced_by: NodeId, trace_id: ExecutionId) -> Self {
        Self {
            produced_by,
            trace_id,
            content_type: ContentType::Object,
            body: EnvelopeBody::JsonEnvelope { body },
            meta: HashMap::new(),
            representations: HashMap::new(),
        }
    }

    /// Build a binary envelope.
    pub fn binary(body: Vec<u8>, produced_by: NodeId, trace_id: ExecutionId) -> Self {
        Self {
            produced_by,
            trace_id,
            content_type: ContentType::Binary,
            body: EnvelopeBody::BinaryEnvelope { body },
            meta: HashMap::new(),
            representations: HashMap::new(),
        }
    }

    /// Build a conversation-state envelope.
    pub fn conversation(
        messages: Vec<Message>,
        produced_by: NodeId,
        trace_id: ExecutionId,
    ) -> Self {
        Self {
            produced_by,
            trace_id,
            content_type: ContentType::ConversationState,
            body: EnvelopeBody::ConversationEnvelope { body: messages },
            meta: HashMap::new(),
            representations: HashMap::new(),
        }
    }

    /// Build an error envelope.
    pub fn error(
        message: impl Into<String>,
        error_type: impl Into<String>,
        produced_by: NodeId,
        trace_id: ExecutionId,
    ) -> Self {
        Self {
            produced_by,
            trace_id,
            content_type: ContentType::Error,
            body: EnvelopeBody::ErrorEnvelope {
                message: message.into(),
                error_type: error_type.into(),
            },
            meta: HashMap::new(),
            representations: HashMap::new(),
        }
    }

    /// Return a new envelope with the given meta keys merged in.
    pub fn with_meta(&self, kv: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut copy = self.clone();
        copy.meta.extend(kv);
        copy
    }

    /// Return a new envelope with the given representations merged in.
    pub fn with_representations(&self, reps: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut copy = self.clone();
        copy.representations.extend(reps);
        copy
    }

    /// Read as plain text. Fails if the envelope is not `raw_text`.
    pub fn as_text(&self) -> Result<&str> {
        match &self.body {
            EnvelopeBody::TextEnvelope { body } => Ok(body),
            other => Err(wrong_kind("raw_text", other)),
        }
    }

    /// Read as a decoded JSON value.
    ///
    /// For a `raw_text` envelope this parses the text as JSON (and fails if
    /// it doesn't parse); for an `object` envelope it returns the value
    /// directly.
    pub fn as_json(&self) -> Result<Value> {
        match &self.body {
            EnvelopeBody::JsonEnvelope { body } => Ok(body.clone()),
            EnvelopeBody::TextEnvelope { body } => {
                serde_json::from_str(body).map_err(|e| RuntimeError::WrongContentKind {
                    expected: "object".to_string(),
                    actual: format!("raw_text (unparseable as JSON: {e})"),
                })
            }
            other => Err(wrong_kind("object", other)),
        }
    }

    /// Read as raw bytes. Fails if the envelope is not `binary`.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match &self.body {
            EnvelopeBody::BinaryEnvelope { body } => Ok(body),
            other => Err(wrong_kind("binary", other)),
        }
    }

    /// Read as a conversation message list.
    pub fn as_conversation(&self) -> Result<&[Message]> {
        match &self.body {
            EnvelopeBody::ConversationEnvelope { body } => Ok(body),
            other => Err(wrong_kind("conversation_state", other)),
        }
    }

    /// Whether this envelope represents an error outcome.
    pub fn has_error(&self) -> bool {
        self.content_type == ContentType::Error
    }
}

fn wrong_kind(expected: &str, actual: &EnvelopeBody) -> RuntimeError {
    let actual_tag = match actual {
        EnvelopeBody::TextEnvelope { .. } => "raw_text",
        EnvelopeBody::JsonEnvelope { .. } => "object",
        EnvelopeBody::BinaryEnvelope { .. } => "binary",
        EnvelopeBody::ConversationEnvelope { .. } => "conversation_state",
        EnvelopeBody::ErrorEnvelope { .. } => "error",
    };
    RuntimeError::WrongContentKind {
        expected: expected.to_string(),
        actual: actual_tag.to_string(),
    }
}
