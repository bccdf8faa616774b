//! In-process pub/sub for session events, feeding the SSE adapter.
//!
//! One broadcast channel per session; events are ordered per session and
//! delivery is best-effort. A lagging subscriber skips over what it missed
//! (activity chatter) but always sees later phase and opinion events,
//! because the channel never blocks the publisher.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{AgentStatus, OpinionAction, TaskKind};
use crate::phase::SessionPhase;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Typed event kinds broadcast per session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReviewEvent {
    PhaseChange {
        session_id: String,
        phase: SessionPhase,
        turn: u32,
        verification_round: u32,
    },
    ReviewSubmitted {
        session_id: String,
        model_id: String,
        issue_count: usize,
    },
    OpinionSubmitted {
        session_id: String,
        issue_id: String,
        model_id: String,
        action: OpinionAction,
        turn: u32,
    },
    IssueCreated {
        session_id: String,
        issue_id: String,
        title: String,
    },
    IssueStatusChanged {
        session_id: String,
        issue_id: String,
        status: String,
    },
    AgentStatus {
        session_id: String,
        model_id: String,
        status: AgentStatus,
        task_kind: TaskKind,
        reason: Option<String>,
    },
    AgentActivity {
        session_id: String,
        model_id: String,
        action: String,
        target: String,
    },
    AgentConfigChanged {
        session_id: String,
        model_id: String,
    },
}

impl ReviewEvent {
    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PhaseChange { .. } => "phase_change",
            Self::ReviewSubmitted { .. } => "review_submitted",
            Self::OpinionSubmitted { .. } => "opinion_submitted",
            Self::IssueCreated { .. } => "issue_created",
            Self::IssueStatusChanged { .. } => "issue_status_changed",
            Self::AgentStatus { .. } => "agent_status",
            Self::AgentActivity { .. } => "agent_activity",
            Self::AgentConfigChanged { .. } => "agent_config_changed",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::PhaseChange { session_id, .. }
            | Self::ReviewSubmitted { session_id, .. }
            | Self::OpinionSubmitted { session_id, .. }
            | Self::IssueCreated { session_id, .. }
            | Self::IssueStatusChanged { session_id, .. }
            | Self::AgentStatus { session_id, .. }
            | Self::AgentActivity { session_id, .. }
            | Self::AgentConfigChanged { session_id, .. } => session_id,
        }
    }
}

pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<ReviewEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    fn sender(&self, session_id: &str) -> broadcast::Sender<ReviewEvent> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event to the session's subscribers. A send with no
    /// receivers is not an error; internal code must not depend on
    /// subscriber presence.
    pub fn publish(&self, event: ReviewEvent) {
        let sender = self.sender(event.session_id());
        let kind = event.kind();
        if let Err(e) = sender.send(event) {
            debug!(kind, error = %e, "no subscribers for event");
        }
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<ReviewEvent> {
        self.sender(session_id).subscribe()
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .get(session_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Drop the channel when its session is deleted.
    pub fn remove_session(&self, session_id: &str) {
        self.channels.remove(session_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe("s1");

        bus.publish(ReviewEvent::PhaseChange {
            session_id: "s1".into(),
            phase: SessionPhase::Reviewing,
            turn: 0,
            verification_round: 0,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "phase_change");
        assert_eq!(event.session_id(), "s1");
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let bus = EventBus::default();
        let mut rx_other = bus.subscribe("s2");

        bus.publish(ReviewEvent::IssueCreated {
            session_id: "s1".into(),
            issue_id: "i1".into(),
            title: "t".into(),
        });

        assert!(matches!(
            rx_other.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(ReviewEvent::AgentActivity {
            session_id: "s1".into(),
            model_id: "m".into(),
            action: "read".into(),
            target: "a.rs".into(),
        });
        assert_eq!(bus.subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn test_ordering_per_session() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe("s1");

        for turn in 0..5 {
            bus.publish(ReviewEvent::PhaseChange {
                session_id: "s1".into(),
                phase: SessionPhase::Deliberating,
                turn,
                verification_round: 0,
            });
        }
        for expected in 0..5 {
            match rx.recv().await.unwrap() {
                ReviewEvent::PhaseChange { turn, .. } => assert_eq!(turn, expected),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_event_json_shape() {
        let event = ReviewEvent::OpinionSubmitted {
            session_id: "s1".into(),
            issue_id: "i1".into(),
            model_id: "m1".into(),
            action: OpinionAction::FixRequired,
            turn: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "opinion_submitted");
        assert_eq!(json["action"], "fix_required");
    }
}
