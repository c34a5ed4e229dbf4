//! `CampaignStore`: the durable-state collaborator (spec §6.2). Out of
//! scope to implement for real — this crate ships the trait plus an
//! in-memory reference implementation used by tests and the demo binary.
//!
//! `InMemoryCampaignStore`'s internals are grounded on `coordinator.rs`'s
//! single-writer actor: one task owns all mutable state and every mutation
//! is serialized through a command channel. That gives the "sequence
//! allocation is atomic with the status write" guarantee spec §6.2 demands
//! for free, without needing a real transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{
    Campaign, CampaignMode, CampaignPhase, CampaignState, CampaignStateStatus, LifecycleEvent,
    LifecycleEventType, PhaseStatus, PhaseType,
};

pub type StoreResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub sequence: u64,
    pub idempotent: bool,
}

/// The durable-state surface the orchestrator consumes. Method names track
/// spec §6.2's indicative list, collapsed to what the orchestrator actually
/// calls.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn get_campaign(&self, campaign_id: Uuid) -> StoreResult<Campaign>;
    async fn list_in_flight_campaigns(&self) -> StoreResult<Vec<Campaign>>;
    async fn get_campaign_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
    ) -> StoreResult<CampaignPhase>;
    async fn get_campaign_phases(&self, campaign_id: Uuid) -> StoreResult<Vec<CampaignPhase>>;
    async fn get_phase_config(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
    ) -> StoreResult<Option<Value>>;
    async fn upsert_phase_config(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        config: Value,
    ) -> StoreResult<()>;
    async fn set_current_phase(
        &self,
        campaign_id: Uuid,
        phase: Option<PhaseType>,
    ) -> StoreResult<()>;
    async fn set_overall_status(
        &self,
        campaign_id: Uuid,
        status: PhaseStatus,
        error_message: Option<String>,
    ) -> StoreResult<()>;
    async fn update_progress(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        items_processed: u64,
        items_total: u64,
        progress_pct: u8,
    ) -> StoreResult<()>;
    /// The sole atomic write+sequence-allocation entry point; everything
    /// that mutates a phase's persisted status goes through here.
    #[allow(clippy::too_many_arguments)]
    async fn transition(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        from: PhaseStatus,
        to: PhaseStatus,
        event_type: LifecycleEventType,
        payload: Value,
    ) -> StoreResult<TransitionOutcome>;
    async fn complete_phase(&self, campaign_id: Uuid, phase: PhaseType) -> StoreResult<()>;
    async fn lifecycle_events(&self, campaign_id: Uuid) -> StoreResult<Vec<LifecycleEvent>>;
    /// The campaign-state record, separate from `Campaign.overall_status` —
    /// `None` if nothing has ever needed to record one (spec §6.2).
    async fn get_campaign_state(&self, campaign_id: Uuid) -> StoreResult<Option<CampaignState>>;
    async fn create_campaign_state(
        &self,
        campaign_id: Uuid,
        mode: CampaignMode,
    ) -> StoreResult<CampaignState>;
    async fn update_campaign_state(
        &self,
        campaign_id: Uuid,
        status: CampaignStateStatus,
    ) -> StoreResult<CampaignState>;
    /// Test/demo seeding hook — not part of the spec's minimal surface but
    /// needed to construct fixtures without a real campaign-creation API.
    async fn seed_campaign(&self, campaign: Campaign) -> StoreResult<()>;
}

struct CampaignRecord {
    campaign: Campaign,
    phases: HashMap<PhaseType, CampaignPhase>,
    last_sequence: u64,
    events: Vec<LifecycleEvent>,
    state: Option<CampaignState>,
}

impl CampaignRecord {
    fn new(campaign: Campaign) -> Self {
        let mut phases = HashMap::new();
        for phase in PhaseType::ORDER {
            phases.insert(phase, CampaignPhase::new(campaign.id, phase));
        }
        CampaignRecord {
            campaign,
            phases,
            last_sequence: 0,
            events: Vec::new(),
            state: None,
        }
    }

    fn phase_mut(&mut self, phase: PhaseType) -> &mut CampaignPhase {
        self.phases
            .entry(phase)
            .or_insert_with(|| CampaignPhase::new(self.campaign.id, phase))
    }
}

enum Command {
    GetCampaign {
        id: Uuid,
        reply: oneshot::Sender<StoreResult<Campaign>>,
    },
    ListInFlight {
        reply: oneshot::Sender<StoreResult<Vec<Campaign>>>,
    },
    GetPhase {
        id: Uuid,
        phase: PhaseType,
        reply: oneshot::Sender<StoreResult<CampaignPhase>>,
    },
    GetPhases {
        id: Uuid,
        reply: oneshot::Sender<StoreResult<Vec<CampaignPhase>>>,
    },
    GetPhaseConfig {
        id: Uuid,
        phase: PhaseType,
        reply: oneshot::Sender<StoreResult<Option<Value>>>,
    },
    UpsertPhaseConfig {
        id: Uuid,
        phase: PhaseType,
        config: Value,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    SetCurrentPhase {
        id: Uuid,
        phase: Option<PhaseType>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    SetOverallStatus {
        id: Uuid,
        status: PhaseStatus,
        error_message: Option<String>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    UpdateProgress {
        id: Uuid,
        phase: PhaseType,
        items_processed: u64,
        items_total: u64,
        progress_pct: u8,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Transition {
        id: Uuid,
        phase: PhaseType,
        from: PhaseStatus,
        to: PhaseStatus,
        event_type: LifecycleEventType,
        payload: Value,
        reply: oneshot::Sender<StoreResult<TransitionOutcome>>,
    },
    CompletePhase {
        id: Uuid,
        phase: PhaseType,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    LifecycleEvents {
        id: Uuid,
        reply: oneshot::Sender<StoreResult<Vec<LifecycleEvent>>>,
    },
    GetCampaignState {
        id: Uuid,
        reply: oneshot::Sender<StoreResult<Option<CampaignState>>>,
    },
    CreateCampaignState {
        id: Uuid,
        mode: CampaignMode,
        reply: oneshot::Sender<StoreResult<CampaignState>>,
    },
    UpdateCampaignState {
        id: Uuid,
        status: CampaignStateStatus,
        reply: oneshot::Sender<StoreResult<CampaignState>>,
    },
    SeedCampaign {
        campaign: Campaign,
        reply: oneshot::Sender<StoreResult<()>>,
    },
}

fn not_found(id: Uuid) -> OrchestratorError {
    OrchestratorError::CampaignNotFound(id)
}

async fn run_store(mut rx: mpsc::Receiver<Command>) {
    let mut campaigns: HashMap<Uuid, CampaignRecord> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::GetCampaign { id, reply } => {
                let result = campaigns
                    .get(&id)
                    .map(|record| record.campaign.clone())
                    .ok_or_else(|| not_found(id));
                let _ = reply.send(result);
            }
            Command::ListInFlight { reply } => {
                let mut in_flight: Vec<Campaign> = campaigns
                    .values()
                    .filter(|record| {
                        matches!(
                            record.campaign.overall_status,
                            PhaseStatus::InProgress | PhaseStatus::Paused
                        )
                    })
                    .map(|record| record.campaign.clone())
                    .collect();
                in_flight.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                let _ = reply.send(Ok(in_flight));
            }
            Command::GetPhase { id, phase, reply } => {
                let result = campaigns
                    .get(&id)
                    .ok_or_else(|| not_found(id))
                    .map(|record| {
                        record
                            .phases
                            .get(&phase)
                            .cloned()
                            .unwrap_or_else(|| CampaignPhase::new(id, phase))
                    });
                let _ = reply.send(result);
            }
            Command::GetPhases { id, reply } => {
                let result = campaigns.get(&id).ok_or_else(|| not_found(id)).map(|record| {
                    let mut phases: Vec<CampaignPhase> = record.phases.values().cloned().collect();
                    phases.sort_by_key(|p| p.phase_order);
                    phases
                });
                let _ = reply.send(result);
            }
            Command::GetPhaseConfig { id, phase, reply } => {
                let result = campaigns
                    .get(&id)
                    .ok_or_else(|| not_found(id))
                    .map(|record| record.phases.get(&phase).and_then(|p| p.configuration.clone()));
                let _ = reply.send(result);
            }
            Command::UpsertPhaseConfig {
                id,
                phase,
                config,
                reply,
            } => {
                let result = campaigns.get_mut(&id).ok_or_else(|| not_found(id)).map(|record| {
                    record.phase_mut(phase).configuration = Some(config);
                });
                let _ = reply.send(result);
            }
            Command::SetCurrentPhase { id, phase, reply } => {
                let result = campaigns.get_mut(&id).ok_or_else(|| not_found(id)).map(|record| {
                    record.campaign.current_phase = phase;
                    record.campaign.updated_at = Utc::now();
                });
                let _ = reply.send(result);
            }
            Command::SetOverallStatus {
                id,
                status,
                error_message,
                reply,
            } => {
                let result = campaigns.get_mut(&id).ok_or_else(|| not_found(id)).map(|record| {
                    record.campaign.overall_status = status;
                    record.campaign.error_message = error_message;
                    record.campaign.updated_at = Utc::now();
                    if status == PhaseStatus::Completed {
                        record.campaign.completed_at = Some(Utc::now());
                        record.campaign.current_phase = None;
                    }
                    if record.campaign.started_at.is_none()
                        && matches!(status, PhaseStatus::InProgress | PhaseStatus::Paused)
                    {
                        record.campaign.started_at = Some(Utc::now());
                    }
                });
                let _ = reply.send(result);
            }
            Command::UpdateProgress {
                id,
                phase,
                items_processed,
                items_total,
                progress_pct,
                reply,
            } => {
                let result = campaigns.get_mut(&id).ok_or_else(|| not_found(id)).map(|record| {
                    let entry = record.phase_mut(phase);
                    entry.items_processed = items_processed;
                    entry.items_total = items_total;
                    entry.progress_pct = progress_pct.min(100);
                });
                let _ = reply.send(result);
            }
            Command::Transition {
                id,
                phase,
                from,
                to,
                event_type,
                payload,
                reply,
            } => {
                let result = (|| -> StoreResult<TransitionOutcome> {
                    let record = campaigns.get_mut(&id).ok_or_else(|| not_found(id))?;

                    if from == to {
                        return Ok(TransitionOutcome {
                            sequence: 0,
                            idempotent: true,
                        });
                    }

                    crate::state_machine::validate(from, to, phase)?;

                    let now = Utc::now();
                    {
                        let entry = record.phase_mut(phase);
                        entry.status = to;
                        if to == PhaseStatus::InProgress && entry.started_at.is_none() {
                            entry.started_at = Some(now);
                        }
                        if matches!(to, PhaseStatus::Completed | PhaseStatus::Failed) {
                            entry.completed_at = Some(now);
                        }
                    }

                    record.last_sequence += 1;
                    let sequence = record.last_sequence;
                    record.events.push(LifecycleEvent {
                        campaign_id: id,
                        event_type,
                        phase: Some(phase),
                        from_status: Some(from),
                        to_status: Some(to),
                        sequence_number: sequence,
                        payload,
                        created_at: now,
                    });

                    Ok(TransitionOutcome {
                        sequence,
                        idempotent: false,
                    })
                })();
                let _ = reply.send(result);
            }
            Command::CompletePhase { id, phase, reply } => {
                let result = campaigns.get_mut(&id).ok_or_else(|| not_found(id)).map(|record| {
                    let now = Utc::now();
                    {
                        let entry = record.phase_mut(phase);
                        entry.progress_pct = 100;
                        entry.completed_at = Some(now);
                    }
                    record.campaign.completed_phases += 1;
                });
                let _ = reply.send(result);
            }
            Command::LifecycleEvents { id, reply } => {
                let result = campaigns
                    .get(&id)
                    .ok_or_else(|| not_found(id))
                    .map(|record| record.events.clone());
                let _ = reply.send(result);
            }
            Command::GetCampaignState { id, reply } => {
                let result = campaigns
                    .get(&id)
                    .ok_or_else(|| not_found(id))
                    .map(|record| record.state.clone());
                let _ = reply.send(result);
            }
            Command::CreateCampaignState { id, mode, reply } => {
                let result = campaigns.get_mut(&id).ok_or_else(|| not_found(id)).map(|record| {
                    let state = CampaignState::new(id, mode);
                    record.state = Some(state.clone());
                    state
                });
                let _ = reply.send(result);
            }
            Command::UpdateCampaignState { id, status, reply } => {
                let result = campaigns.get_mut(&id).ok_or_else(|| not_found(id)).map(|record| {
                    let mode = record.campaign.mode;
                    let state = record
                        .state
                        .get_or_insert_with(|| CampaignState::new(id, mode));
                    state.status = status;
                    state.updated_at = Utc::now();
                    state.clone()
                });
                let _ = reply.send(result);
            }
            Command::SeedCampaign { campaign, reply } => {
                campaigns.insert(campaign.id, CampaignRecord::new(campaign));
                let _ = reply.send(Ok(()));
            }
        }
    }
}

/// Handle to the single-writer in-memory store actor. Cheaply clonable —
/// every clone shares the same backing task.
#[derive(Clone)]
pub struct InMemoryCampaignStore {
    tx: mpsc::Sender<Command>,
}

impl InMemoryCampaignStore {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_store(rx));
        InMemoryCampaignStore { tx }
    }

    async fn call<T>(
        &self,
        make_cmd: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> Command,
    ) -> StoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| OrchestratorError::Store("store actor stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| OrchestratorError::Store("store actor dropped reply".into()))?
    }
}

#[async_trait]
impl CampaignStore for InMemoryCampaignStore {
    async fn get_campaign(&self, campaign_id: Uuid) -> StoreResult<Campaign> {
        self.call(|reply| Command::GetCampaign {
            id: campaign_id,
            reply,
        })
        .await
    }

    async fn list_in_flight_campaigns(&self) -> StoreResult<Vec<Campaign>> {
        self.call(|reply| Command::ListInFlight { reply }).await
    }

    async fn get_campaign_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
    ) -> StoreResult<CampaignPhase> {
        self.call(|reply| Command::GetPhase {
            id: campaign_id,
            phase,
            reply,
        })
        .await
    }

    async fn get_campaign_phases(&self, campaign_id: Uuid) -> StoreResult<Vec<CampaignPhase>> {
        self.call(|reply| Command::GetPhases {
            id: campaign_id,
            reply,
        })
        .await
    }

    async fn get_phase_config(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
    ) -> StoreResult<Option<Value>> {
        self.call(|reply| Command::GetPhaseConfig {
            id: campaign_id,
            phase,
            reply,
        })
        .await
    }

    async fn upsert_phase_config(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        config: Value,
    ) -> StoreResult<()> {
        self.call(|reply| Command::UpsertPhaseConfig {
            id: campaign_id,
            phase,
            config,
            reply,
        })
        .await
    }

    async fn set_current_phase(
        &self,
        campaign_id: Uuid,
        phase: Option<PhaseType>,
    ) -> StoreResult<()> {
        self.call(|reply| Command::SetCurrentPhase {
            id: campaign_id,
            phase,
            reply,
        })
        .await
    }

    async fn set_overall_status(
        &self,
        campaign_id: Uuid,
        status: PhaseStatus,
        error_message: Option<String>,
    ) -> StoreResult<()> {
        self.call(|reply| Command::SetOverallStatus {
            id: campaign_id,
            status,
            error_message,
            reply,
        })
        .await
    }

    async fn update_progress(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        items_processed: u64,
        items_total: u64,
        progress_pct: u8,
    ) -> StoreResult<()> {
        self.call(|reply| Command::UpdateProgress {
            id: campaign_id,
            phase,
            items_processed,
            items_total,
            progress_pct,
            reply,
        })
        .await
    }

    async fn transition(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        from: PhaseStatus,
        to: PhaseStatus,
        event_type: LifecycleEventType,
        payload: Value,
    ) -> StoreResult<TransitionOutcome> {
        self.call(|reply| Command::Transition {
            id: campaign_id,
            phase,
            from,
            to,
            event_type,
            payload,
            reply,
        })
        .await
    }

    async fn complete_phase(&self, campaign_id: Uuid, phase: PhaseType) -> StoreResult<()> {
        self.call(|reply| Command::CompletePhase {
            id: campaign_id,
            phase,
            reply,
        })
        .await
    }

    async fn lifecycle_events(&self, campaign_id: Uuid) -> StoreResult<Vec<LifecycleEvent>> {
        self.call(|reply| Command::LifecycleEvents {
            id: campaign_id,
            reply,
        })
        .await
    }

    async fn get_campaign_state(&self, campaign_id: Uuid) -> StoreResult<Option<CampaignState>> {
        self.call(|reply| Command::GetCampaignState {
            id: campaign_id,
            reply,
        })
        .await
    }

    async fn create_campaign_state(
        &self,
        campaign_id: Uuid,
        mode: CampaignMode,
    ) -> StoreResult<CampaignState> {
        self.call(|reply| Command::CreateCampaignState {
            id: campaign_id,
            mode,
            reply,
        })
        .await
    }

    async fn update_campaign_state(
        &self,
        campaign_id: Uuid,
        status: CampaignStateStatus,
    ) -> StoreResult<CampaignState> {
        self.call(|reply| Command::UpdateCampaignState {
            id: campaign_id,
            status,
            reply,
        })
        .await
    }

    async fn seed_campaign(&self, campaign: Campaign) -> StoreResult<()> {
        self.call(|reply| Command::SeedCampaign { campaign, reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CampaignMode;

    fn new_campaign() -> Campaign {
        Campaign::new(Uuid::new_v4(), CampaignMode::FullSequence)
    }

    #[tokio::test]
    async fn transition_allocates_monotonic_sequence() {
        let store = InMemoryCampaignStore::spawn();
        let campaign = new_campaign();
        let id = campaign.id;
        store.seed_campaign(campaign).await.unwrap();

        let first = store
            .transition(
                id,
                PhaseType::DomainGeneration,
                PhaseStatus::NotStarted,
                PhaseStatus::InProgress,
                LifecycleEventType::PhaseStarted,
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(first.sequence, 1);

        let second = store
            .transition(
                id,
                PhaseType::DomainGeneration,
                PhaseStatus::InProgress,
                PhaseStatus::Completed,
                LifecycleEventType::PhaseCompleted,
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(second.sequence, 2);

        let events = store.lifecycle_events(id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn self_transition_is_idempotent_and_unsequenced() {
        let store = InMemoryCampaignStore::spawn();
        let campaign = new_campaign();
        let id = campaign.id;
        store.seed_campaign(campaign).await.unwrap();

        let outcome = store
            .transition(
                id,
                PhaseType::DomainGeneration,
                PhaseStatus::NotStarted,
                PhaseStatus::NotStarted,
                LifecycleEventType::PhaseStarted,
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(outcome.sequence, 0);
        assert!(outcome.idempotent);
        assert!(store.lifecycle_events(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let store = InMemoryCampaignStore::spawn();
        let campaign = new_campaign();
        let id = campaign.id;
        store.seed_campaign(campaign).await.unwrap();

        let err = store
            .transition(
                id,
                PhaseType::DomainGeneration,
                PhaseStatus::NotStarted,
                PhaseStatus::Paused,
                LifecycleEventType::PhaseStarted,
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TransitionInvalid { .. }));
    }

    #[tokio::test]
    async fn unknown_campaign_is_not_found() {
        let store = InMemoryCampaignStore::spawn();
        let err = store.get_campaign(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_campaign_fatal());
    }

    #[tokio::test]
    async fn campaign_state_is_created_lazily_and_updated() {
        let store = InMemoryCampaignStore::spawn();
        let campaign = new_campaign();
        let id = campaign.id;
        store.seed_campaign(campaign).await.unwrap();

        assert!(store.get_campaign_state(id).await.unwrap().is_none());

        let updated = store
            .update_campaign_state(id, crate::model::CampaignStateStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(updated.status, crate::model::CampaignStateStatus::Cancelled);

        let fetched = store.get_campaign_state(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, crate::model::CampaignStateStatus::Cancelled);
    }
}
