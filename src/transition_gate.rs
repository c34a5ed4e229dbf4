//! `TransitionGate`: the sole authorized mutator of phase status (spec
//! §4.2). Grounded on `coordinator.rs`'s pattern of a single function being
//! the only path that persists a state change and triggers its derived
//! side effect atomically — there a git commit, here a lifecycle event.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::event_broadcaster::EventBroadcaster;
use crate::metrics::Metrics;
use crate::model::{LifecycleEvent, LifecycleEventType, PhaseStatus, PhaseType};
use crate::state_machine;
use crate::store::{CampaignStore, TransitionOutcome};

pub struct TransitionGate {
    store: Arc<dyn CampaignStore>,
    broadcaster: Arc<dyn EventBroadcaster>,
    metrics: Arc<dyn Metrics>,
}

impl TransitionGate {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        broadcaster: Arc<dyn EventBroadcaster>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        TransitionGate {
            store,
            broadcaster,
            metrics,
        }
    }

    /// Applies `from -> to` for `(campaign_id, phase)`: checks the optional
    /// expected-state precondition, validates against the state machine,
    /// persists the status change and its lifecycle event atomically via
    /// the store, then best-effort publishes the event.
    #[allow(clippy::too_many_arguments)]
    pub async fn transition(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        from: PhaseStatus,
        to: PhaseStatus,
        event_type: LifecycleEventType,
        expected_state: Option<PhaseStatus>,
        payload: Value,
    ) -> Result<TransitionOutcome> {
        if let Some(expected) = expected_state {
            if from != expected {
                self.metrics.transition_blocked();
                return Err(OrchestratorError::ExpectedStateMismatch {
                    current: from,
                    expected,
                    action: event_type_label(event_type),
                });
            }
        }

        if from == to {
            return Ok(TransitionOutcome {
                sequence: 0,
                idempotent: true,
            });
        }

        if let Err(err) = state_machine::validate(from, to, phase) {
            self.metrics.transition_blocked();
            return Err(err);
        }

        let outcome = self
            .store
            .transition(campaign_id, phase, from, to, event_type, payload.clone())
            .await?;

        if !outcome.idempotent {
            self.broadcaster
                .broadcast_to_campaign(
                    campaign_id,
                    LifecycleEvent {
                        campaign_id,
                        event_type,
                        phase: Some(phase),
                        from_status: Some(from),
                        to_status: Some(to),
                        sequence_number: outcome.sequence,
                        payload,
                        created_at: chrono::Utc::now(),
                    },
                )
                .await;
        }

        Ok(outcome)
    }
}

fn event_type_label(event_type: LifecycleEventType) -> &'static str {
    match event_type {
        LifecycleEventType::PhaseStarted => "start",
        LifecycleEventType::PhasePaused => "pause",
        LifecycleEventType::PhaseResumed => "resume",
        LifecycleEventType::PhaseCompleted => "complete",
        LifecycleEventType::PhaseFailed => "fail",
        LifecycleEventType::PhaseAutoStarted => "auto_start",
        LifecycleEventType::CampaignProgress => "progress",
        LifecycleEventType::CampaignCompleted => "campaign_complete",
    }
}

/// Logs and counts a status mutation that could not route through
/// `TransitionGate::transition` (spec §4.2 bypass audit, §9 design note on
/// auditing bypass paths). Every such caller in this crate is documented at
/// its call site; none currently exist in the happy-path orchestrator flow.
pub fn audit_transition_bypass(
    metrics: &dyn Metrics,
    caller: &str,
    reason: &str,
    from: PhaseStatus,
    to: PhaseStatus,
) {
    warn!(caller, reason, ?from, ?to, "transition bypassed TransitionGate");
    metrics.transition_bypass();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_broadcaster::InMemoryEventBroadcaster;
    use crate::metrics::CountingMetrics;
    use crate::model::{Campaign, CampaignMode};
    use crate::store::InMemoryCampaignStore;

    async fn fixture() -> (TransitionGate, Arc<InMemoryEventBroadcaster>, Uuid) {
        let store = Arc::new(InMemoryCampaignStore::spawn());
        let campaign = Campaign::new(Uuid::new_v4(), CampaignMode::FullSequence);
        let id = campaign.id;
        store.seed_campaign(campaign).await.unwrap();
        let broadcaster = Arc::new(InMemoryEventBroadcaster::new());
        let metrics = Arc::new(CountingMetrics::default());
        let gate = TransitionGate::new(store, broadcaster.clone(), metrics);
        (gate, broadcaster, id)
    }

    #[tokio::test]
    async fn valid_transition_persists_and_broadcasts() {
        let (gate, broadcaster, id) = fixture().await;
        let outcome = gate
            .transition(
                id,
                PhaseType::DomainGeneration,
                PhaseStatus::NotStarted,
                PhaseStatus::InProgress,
                LifecycleEventType::PhaseStarted,
                None,
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(outcome.sequence, 1);
        assert_eq!(broadcaster.events_for(id).await.len(), 1);
    }

    #[tokio::test]
    async fn self_transition_is_silent_no_op() {
        let (gate, broadcaster, id) = fixture().await;
        let outcome = gate
            .transition(
                id,
                PhaseType::DomainGeneration,
                PhaseStatus::NotStarted,
                PhaseStatus::NotStarted,
                LifecycleEventType::PhaseStarted,
                None,
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(outcome.sequence, 0);
        assert!(broadcaster.events_for(id).await.is_empty());
    }

    #[tokio::test]
    async fn expected_state_mismatch_blocks_before_any_write() {
        let (gate, broadcaster, id) = fixture().await;
        let err = gate
            .transition(
                id,
                PhaseType::DomainGeneration,
                PhaseStatus::NotStarted,
                PhaseStatus::InProgress,
                LifecycleEventType::PhaseStarted,
                Some(PhaseStatus::Paused),
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ExpectedStateMismatch { .. }));
        assert!(broadcaster.events_for(id).await.is_empty());
    }

    #[tokio::test]
    async fn invalid_transition_is_blocked() {
        let (gate, _broadcaster, id) = fixture().await;
        let err = gate
            .transition(
                id,
                PhaseType::DomainGeneration,
                PhaseStatus::NotStarted,
                PhaseStatus::Paused,
                LifecycleEventType::PhasePaused,
                None,
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TransitionInvalid { .. }));
    }
}
