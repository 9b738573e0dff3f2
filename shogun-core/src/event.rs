//! Transport event contract.
//!
//! The coordinator core never depends on a concrete transport: it
//! emits [`CoordinatorEvent`]s through an [`EventSink`], and the
//! transport layer (HTTP/WebSocket, tests, or nothing at all) decides
//! what to do with them. Per subscriber, events arrive in emission
//! order; no ordering is promised between subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{AgentSnapshot, Message, Thread};

/// Capacity of the broadcast hub's ring buffer. Slow subscribers that
/// fall further behind than this lose the oldest events.
pub const EVENT_HUB_CAPACITY: usize = 256;

/// Thread summary surfaced to subscribers; session bindings stay
/// internal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadInfo {
    pub id: String,
    pub title: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Thread> for ThreadInfo {
    fn from(thread: &Thread) -> Self {
        Self {
            id: thread.id.clone(),
            title: thread.title.clone(),
            created_at: thread.created_at,
            updated_at: thread.updated_at,
        }
    }
}

/// Phase marker bracketing a fleet stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPhase {
    Requested,
    Completed,
}

/// Events emitted to external subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    /// Thread list changed (create/delete/update).
    Threads { threads: Vec<ThreadInfo> },
    /// A mailbox file was parsed and is about to be routed.
    Message { message: Message },
    /// Any agent's status changed (queue size, busy, activity).
    AgentStatus { agents: Vec<AgentSnapshot> },
    /// Brackets a fleet stop.
    Stop { status: StopPhase },
}

/// Sink interface the core emits through.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoordinatorEvent);
}

/// Sink that drops every event. Useful for tests and headless runs.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: CoordinatorEvent) {}
}

/// Broadcast-backed hub: each subscriber gets an independent receiver
/// observing events in emission order.
pub struct EventHub {
    tx: broadcast::Sender<CoordinatorEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_HUB_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventHub {
    fn emit(&self, event: CoordinatorEvent) {
        // A send error only means no subscriber is listening.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentId;
    use chrono::Utc;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = CoordinatorEvent::Stop {
            status: StopPhase::Requested,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stop");
        assert_eq!(json["status"], "requested");
    }

    #[test]
    fn test_thread_info_from_thread() {
        let thread = Thread::new("demo");
        let info = ThreadInfo::from(&thread);
        assert_eq!(info.id, thread.id);
        assert_eq!(info.title, "demo");
    }

    #[tokio::test]
    async fn test_hub_delivers_in_emission_order() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        hub.emit(CoordinatorEvent::Stop {
            status: StopPhase::Requested,
        });
        hub.emit(CoordinatorEvent::Stop {
            status: StopPhase::Completed,
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            CoordinatorEvent::Stop {
                status: StopPhase::Requested
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CoordinatorEvent::Stop {
                status: StopPhase::Completed
            }
        );
    }

    #[tokio::test]
    async fn test_hub_without_subscribers_does_not_error() {
        let hub = EventHub::new();
        hub.emit(CoordinatorEvent::Message {
            message: Message {
                id: "m".to_string(),
                thread_id: "t".to_string(),
                from: AgentId::King,
                to: AgentId::Shogun,
                title: "x".to_string(),
                body: String::new(),
                created_at: Utc::now(),
            },
        });
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_each_subscriber_sees_every_event() {
        let hub = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.emit(CoordinatorEvent::Stop {
            status: StopPhase::Completed,
        });

        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
