//! EventBus: pub/sub progress notifications, per spec.md §4.9.
//!
//! Grounded on the teacher's `engine/tracing.rs` span-emission pattern
//! and `stream/channels.rs`'s bounded-channel subscriber shape, adapted
//! from a single tracing sink to a typed multi-subscriber bus.

use crate::diagram::NodeStatus;
use crate::ids::{DiagramId, ExecutionId, NodeId};
use crate::metrics::EVENT_BUS_OVERFLOW;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Typed events the scheduler emits over the lifetime of one execution.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        diagram_id: DiagramId,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: NodeId,
        node_type: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: NodeId,
        status: NodeStatus,
        output_summary: String,
        duration_ms: i64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: NodeId,
        error: String,
        error_type: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        total_steps: u64,
        execution_path: Vec<NodeId>,
        timestamp: DateTime<Utc>,
    },
}

/// A bounded per-subscriber queue over `ExecutionEvent`. Built on
/// `tokio::sync::broadcast`, which already drops the oldest buffered
/// message for a subscriber that falls behind (`RecvError::Lagged`) —
/// exactly the `drop_oldest` policy spec.md §4.9 requires. A bus with
/// zero subscribers is valid and cheap: `send` on an empty broadcast
/// channel is a no-op, not an error.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

/// A subscription handle. Call [`EventSubscription::recv`] in a loop;
/// a `Lagged` gap increments the overflow metric and is treated as
/// "skip ahead", not a subscription failure.
pub struct EventSubscription {
    receiver: broadcast::Receiver<ExecutionEvent>,
}

impl EventBus {
    /// `capacity` bounds the number of buffered-but-unread events per
    /// subscriber before the oldest is dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish an event. Never blocks; with no subscribers this is a
    /// cheap no-op.
    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    EVENT_BUS_OVERFLOW.inc_by(skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(node_id: &str) -> ExecutionEvent {
        ExecutionEvent::NodeStarted {
            execution_id: ExecutionId::new("e1"),
            node_id: NodeId::new(node_id),
            node_type: "code_job".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe();
        bus.publish(event("a"));

        let received = sub.recv().await.unwrap();
        assert!(matches!(received, ExecutionEvent::NodeStarted { node_id, .. } if node_id == NodeId::new("a")));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.publish(event("a"));
    }

    #[tokio::test]
    async fn slow_subscriber_skips_ahead_on_overflow_instead_of_blocking_publisher() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..10 {
            bus.publish(event(&format!("n{i}")));
        }

        // The subscriber can still make progress; it just doesn't see
        // every event it missed while behind.
        let received = sub.recv().await;
        assert!(received.is_some());
    }
}
