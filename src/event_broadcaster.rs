//! `EventBroadcaster`: best-effort publish of lifecycle events to campaign
//! subscribers (spec §6.3). No teacher module broadcasts anything; this is
//! enriched from the wider pack's event/notification fan-out idiom
//! (`codegraph-orchestration`), kept here as a narrow trait plus an
//! in-memory capture used by tests.

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::LifecycleEvent;

#[async_trait]
pub trait EventBroadcaster: Send + Sync {
    /// Publishes `event` to whatever transport fans it out to subscribers
    /// of `campaign_id`. Best-effort: the orchestrator never blocks on or
    /// retries a failed publish, so implementations should swallow
    /// transport errors internally rather than propagate them.
    async fn broadcast_to_campaign(&self, campaign_id: Uuid, event: LifecycleEvent);
}

/// Discards every event. Used where a caller has no subscriber transport
/// wired up yet but still wants a valid `EventBroadcaster`.
#[derive(Debug, Default)]
pub struct NoopEventBroadcaster;

#[async_trait]
impl EventBroadcaster for NoopEventBroadcaster {
    async fn broadcast_to_campaign(&self, _campaign_id: Uuid, _event: LifecycleEvent) {}
}

/// Captures every published event in order, for test assertions.
#[derive(Default)]
pub struct InMemoryEventBroadcaster {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl InMemoryEventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_for(&self, campaign_id: Uuid) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|event| event.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    pub async fn count_of_type(
        &self,
        campaign_id: Uuid,
        event_type: crate::model::LifecycleEventType,
    ) -> usize {
        self.events_for(campaign_id)
            .await
            .iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventBroadcaster for InMemoryEventBroadcaster {
    async fn broadcast_to_campaign(&self, _campaign_id: Uuid, event: LifecycleEvent) {
        self.events.lock().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LifecycleEventType, PhaseStatus, PhaseType};
    use chrono::Utc;
    use serde_json::Value;

    fn sample_event(campaign_id: Uuid, event_type: LifecycleEventType) -> LifecycleEvent {
        LifecycleEvent {
            campaign_id,
            event_type,
            phase: Some(PhaseType::DomainGeneration),
            from_status: Some(PhaseStatus::NotStarted),
            to_status: Some(PhaseStatus::InProgress),
            sequence_number: 1,
            payload: Value::Null,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn captures_events_in_order() {
        let broadcaster = InMemoryEventBroadcaster::new();
        let campaign_id = Uuid::new_v4();
        broadcaster
            .broadcast_to_campaign(campaign_id, sample_event(campaign_id, LifecycleEventType::PhaseStarted))
            .await;
        broadcaster
            .broadcast_to_campaign(campaign_id, sample_event(campaign_id, LifecycleEventType::PhaseCompleted))
            .await;

        let events = broadcaster.events_for(campaign_id).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, LifecycleEventType::PhaseStarted);
        assert_eq!(events[1].event_type, LifecycleEventType::PhaseCompleted);
    }

    #[tokio::test]
    async fn noop_broadcaster_discards_everything() {
        let broadcaster = NoopEventBroadcaster;
        broadcaster
            .broadcast_to_campaign(Uuid::new_v4(), sample_event(Uuid::new_v4(), LifecycleEventType::PhaseStarted))
            .await;
    }
}
