use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::amas::types::{Action, DecisionSource};
use crate::services::decision_recorder::{DecisionEvent, DecisionEventSink};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum LearningEvent {
    #[serde(rename = "DECISION_RECORDED")]
    DecisionRecorded(DecisionRecordedPayload),

    #[serde(rename = "REWARD_DISTRIBUTED")]
    RewardDistributed(RewardDistributedPayload),
}

impl LearningEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LearningEvent::DecisionRecorded(_) => "DECISION_RECORDED",
            LearningEvent::RewardDistributed(_) => "REWARD_DISTRIBUTED",
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            LearningEvent::DecisionRecorded(p) => p.user_id.as_deref(),
            LearningEvent::RewardDistributed(p) => Some(&p.user_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecordedPayload {
    pub decision_id: String,
    pub user_id: Option<String>,
    pub action: Action,
    pub confidence: f64,
    pub source: DecisionSource,
    pub reward: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl From<DecisionEvent> for DecisionRecordedPayload {
    fn from(event: DecisionEvent) -> Self {
        Self {
            decision_id: event.decision_id,
            user_id: event.user_id,
            action: event.action,
            confidence: event.confidence,
            source: event.source,
            reward: event.reward,
            timestamp: DateTime::from_timestamp_millis(event.timestamp).unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardDistributedPayload {
    pub user_id: String,
    pub reward_value: f64,
    pub contributions: usize,
    pub action_index: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub id: String,
    pub event: LearningEvent,
    pub created_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event: LearningEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event,
            created_at: Utc::now(),
        }
    }
}

type SubscriberId = String;

struct Subscriber {
    user_id: Option<String>,
    event_types: Option<Vec<String>>,
    sender: broadcast::Sender<EventEnvelope>,
}

impl Subscriber {
    fn matches(&self, envelope: &EventEnvelope) -> bool {
        if let Some(ref user_id) = self.user_id {
            if envelope.event.user_id() != Some(user_id.as_str()) {
                return false;
            }
        }

        if let Some(ref event_types) = self.event_types {
            if !event_types.iter().any(|t| t == envelope.event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// In-process fan-out of learning events. Publishing never blocks; events for
/// lagging or absent receivers are dropped.
pub struct EventBus {
    global_sender: broadcast::Sender<EventEnvelope>,
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    event_count: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (global_sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            global_sender,
            subscribers: RwLock::new(HashMap::new()),
            event_count: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: LearningEvent) {
        let envelope = EventEnvelope::new(event);
        let event_type = envelope.event.event_type();
        self.event_count.fetch_add(1, Ordering::Relaxed);

        let mut sent_count = 0usize;
        for subscriber in self.subscribers.read().values() {
            if subscriber.matches(&envelope) && subscriber.sender.send(envelope.clone()).is_ok() {
                sent_count += 1;
            }
        }

        if self.global_sender.send(envelope.clone()).is_err() {
            debug!("No global subscribers for event");
        }

        debug!(
            event_type = event_type,
            user_id = envelope.event.user_id().unwrap_or("-"),
            sent_to = sent_count,
            "Event published"
        );
    }

    pub fn subscribe_global(&self) -> broadcast::Receiver<EventEnvelope> {
        self.global_sender.subscribe()
    }

    pub fn subscribe_filtered(
        &self,
        user_id: Option<String>,
        event_types: Option<Vec<String>>,
    ) -> (SubscriberId, broadcast::Receiver<EventEnvelope>) {
        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        let subscriber_id = uuid::Uuid::new_v4().to_string();

        self.subscribers.write().insert(
            subscriber_id.clone(),
            Subscriber {
                user_id,
                event_types,
                sender,
            },
        );

        debug!(subscriber_id = %subscriber_id, "New filtered subscription created");
        (subscriber_id, receiver)
    }

    pub fn unsubscribe(&self, subscriber_id: &str) {
        if self.subscribers.write().remove(subscriber_id).is_some() {
            debug!(subscriber_id = %subscriber_id, "Subscription removed");
        }
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EventBusStats {
        let filtered = self.subscribers.read().len();
        let global = self.global_sender.receiver_count();
        EventBusStats {
            total_events: self.event_count(),
            subscriber_count: filtered + global,
            global_subscribers: global,
            filtered_subscribers: filtered,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionEventSink for EventBus {
    fn emit_decision(&self, event: DecisionEvent) {
        self.publish(LearningEvent::DecisionRecorded(event.into()));
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBusStats {
    pub total_events: u64,
    pub subscriber_count: usize,
    pub global_subscribers: usize,
    pub filtered_subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(user: &str) -> DecisionEvent {
        DecisionEvent {
            decision_id: format!("d-{user}"),
            user_id: Some(user.to_string()),
            action: Action::default(),
            confidence: 0.8,
            source: DecisionSource::Online,
            reward: Some(0.3),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn decision_sink_reaches_global_subscribers() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe_global();

        bus.emit_decision(decision("user1"));

        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.event.event_type(), "DECISION_RECORDED");
        assert_eq!(envelope.event.user_id(), Some("user1"));
        assert_eq!(bus.event_count(), 1);
    }

    #[tokio::test]
    async fn filtered_subscription_skips_other_users() {
        let bus = EventBus::new();
        let (sub_id, mut receiver) =
            bus.subscribe_filtered(Some("user1".to_string()), Some(vec!["DECISION_RECORDED".to_string()]));

        bus.emit_decision(decision("user2"));
        bus.emit_decision(decision("user1"));
        bus.publish(LearningEvent::RewardDistributed(RewardDistributedPayload {
            user_id: "user1".to_string(),
            reward_value: 0.5,
            contributions: 1,
            action_index: None,
            timestamp: Utc::now(),
        }));

        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.event.user_id(), Some("user1"));
        assert!(receiver.try_recv().is_err());

        bus.unsubscribe(&sub_id);
        assert_eq!(bus.stats().filtered_subscribers, 0);
    }
}
