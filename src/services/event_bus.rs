//! Typed event bus for control-plane notifications.
//!
//! Broadcast-based with sequence numbering. Topics are the enumerated
//! categories below; subscribers pull from their own receiver, which
//! preserves per-topic ordering without reentrant locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::models::{AgentStatus, MetricsSample, ScalingKind, TaskStatus};

/// Monotonically increasing sequence number assigned by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event category used for filtering and console subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Agent,
    Task,
    Swarm,
    Scaling,
    Metrics,
    Gateway,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Task => "task",
            Self::Swarm => "swarm",
            Self::Scaling => "scaling",
            Self::Metrics => "metrics",
            Self::Gateway => "gateway",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "agent" => Some(Self::Agent),
            "task" => Some(Self::Task),
            "swarm" => Some(Self::Swarm),
            "scaling" => Some(Self::Scaling),
            "metrics" => Some(Self::Metrics),
            "gateway" => Some(Self::Gateway),
            _ => None,
        }
    }
}

/// Enumerated event payloads. Receivers handle exhaustively; anything a
/// receiver does not care about falls through a catch-all arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    AgentRegistered {
        agent_id: Uuid,
        name: String,
        agent_type: String,
    },
    AgentStatusChanged {
        agent_id: Uuid,
        from: AgentStatus,
        to: AgentStatus,
    },
    AgentRemoved {
        agent_id: Uuid,
    },
    TaskSubmitted {
        task_id: Uuid,
        task_type: String,
        priority: u8,
    },
    TaskStatusChanged {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskRequeued {
        task_id: Uuid,
        attempt: u32,
    },
    SwarmCreated {
        swarm_id: Uuid,
        name: String,
        agent_count: usize,
    },
    SwarmScaled {
        swarm_id: Uuid,
        from_count: usize,
        to_count: usize,
    },
    ScalingTriggered {
        action_id: Uuid,
        kind: ScalingKind,
        reason: String,
        from_count: u32,
        to_count: u32,
    },
    MetricsSampled(MetricsSample),
    ConnectionOpened {
        connection_id: Uuid,
    },
    ConnectionClosed {
        connection_id: Uuid,
    },
}

impl EventPayload {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::AgentRegistered { .. }
            | Self::AgentStatusChanged { .. }
            | Self::AgentRemoved { .. } => EventCategory::Agent,
            Self::TaskSubmitted { .. }
            | Self::TaskStatusChanged { .. }
            | Self::TaskRequeued { .. } => EventCategory::Task,
            Self::SwarmCreated { .. } | Self::SwarmScaled { .. } => EventCategory::Swarm,
            Self::ScalingTriggered { .. } => EventCategory::Scaling,
            Self::MetricsSampled(_) => EventCategory::Metrics,
            Self::ConnectionOpened { .. } | Self::ConnectionClosed { .. } => {
                EventCategory::Gateway
            }
        }
    }
}

/// Event envelope carrying bus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
    pub category: EventCategory,
    pub payload: EventPayload,
}

/// Broadcast bus shared by every loop in the process.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event; lagging subscribers miss events rather than
    /// blocking the publisher.
    pub fn publish(&self, payload: EventPayload, now: DateTime<Utc>) -> Event {
        let event = Event {
            id: Uuid::new_v4(),
            sequence: SequenceNumber(self.sequence.fetch_add(1, Ordering::SeqCst)),
            timestamp: now,
            category: payload.category(),
            payload,
        };
        // Send fails only when there are no subscribers; that is fine.
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(
            EventPayload::AgentRemoved { agent_id: Uuid::new_v4() },
            Utc::now(),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.category, EventCategory::Agent);
        assert_eq!(event.sequence, SequenceNumber(0));
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        for _ in 0..3 {
            bus.publish(
                EventPayload::ConnectionOpened { connection_id: Uuid::new_v4() },
                Utc::now(),
            );
        }

        let mut last = None;
        for _ in 0..3 {
            let e = rx.recv().await.unwrap();
            if let Some(prev) = last {
                assert!(e.sequence > prev);
            }
            last = Some(e.sequence);
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        bus.publish(
            EventPayload::TaskRequeued { task_id: Uuid::new_v4(), attempt: 2 },
            Utc::now(),
        );
    }

    #[test]
    fn test_category_mapping() {
        let p = EventPayload::ScalingTriggered {
            action_id: Uuid::new_v4(),
            kind: ScalingKind::Up,
            reason: "cpu".into(),
            from_count: 1,
            to_count: 2,
        };
        assert_eq!(p.category(), EventCategory::Scaling);
        assert_eq!(EventCategory::parse_str("scaling"), Some(EventCategory::Scaling));
        assert_eq!(EventCategory::parse_str("nope"), None);
    }
}
