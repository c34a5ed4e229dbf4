//! `PhaseService`: the per-phase worker collaborator (spec §6.1). Real
//! workers (DNS resolver, HTTP prober, etc.) are out of scope; this module
//! ships the trait plus `MockPhaseService`, a scriptable test double
//! grounded on `agent.rs`'s `AgentRunner`/`MockAgentRunner` pair — a
//! sequence of scripted outcomes consumed in call order, stored alongside
//! the trait it implements rather than behind a test-only feature.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::control_bus::ControlCommand;
use crate::error::{OrchestratorError, Result};
use crate::model::{
    clamp_pct, LifecycleEventType, PhaseCapabilities, PhaseStatus, PhaseStatusSnapshot,
    PhaseType, ProgressItem,
};
use crate::store::CampaignStore;

#[async_trait]
pub trait PhaseService: Send + Sync {
    async fn configure(&self, campaign_id: Uuid, config: Value) -> Result<()>;

    /// Starts async work and returns a channel the caller drains as a
    /// progress stream; the worker closes its sender on terminal state.
    async fn execute(&self, campaign_id: Uuid) -> Result<mpsc::Receiver<ProgressItem>>;

    async fn get_status(&self, campaign_id: Uuid) -> Result<PhaseStatusSnapshot>;

    async fn cancel(&self, campaign_id: Uuid) -> Result<()>;

    async fn validate(&self, config: &Value) -> Result<()>;

    fn capabilities(&self) -> PhaseCapabilities {
        PhaseCapabilities::default()
    }

    /// Optional capability: the worker receives pause/resume/stop commands
    /// and acks each one. Returns `false` when unsupported, in which case
    /// the orchestrator must not rely on cooperative pause/resume.
    async fn attach_control_channel(
        &self,
        _campaign_id: Uuid,
        _rx: mpsc::Receiver<ControlCommand>,
    ) -> bool {
        false
    }
}

/// One scripted behavior for a single `execute()` call.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Emits `progress_steps` progress items then completes normally.
    CompleteAfter { progress_steps: u32 },
    /// Emits `progress_steps` progress items then fails with `message`.
    FailAfter { progress_steps: u32, message: String },
    /// Simulates a worker that marks the phase `completed` directly in the
    /// store (bypassing the orchestrator's gate, as an external system
    /// would) and closes its progress stream immediately, before
    /// `get_status` has caught up — the fast-zero race in spec S6.
    FastZeroComplete,
    /// `execute()` itself returns an error without streaming anything.
    ExecuteError(String),
}

struct MockState {
    scripts: HashMap<(Uuid, PhaseType), VecDeque<ScriptedOutcome>>,
    statuses: HashMap<(Uuid, PhaseType), PhaseStatusSnapshot>,
    configs: HashMap<(Uuid, PhaseType), Value>,
    execute_calls: HashMap<(Uuid, PhaseType), u32>,
}

/// A scriptable `PhaseService` double bound to one phase type. The
/// orchestrator holds one `MockPhaseService` per `PhaseType` in its
/// service map, same as a real deployment would route per-phase calls to
/// distinct worker processes.
pub struct MockPhaseService {
    phase: PhaseType,
    store: Arc<dyn CampaignStore>,
    state: Arc<Mutex<MockState>>,
}

impl MockPhaseService {
    pub fn new(phase: PhaseType, store: Arc<dyn CampaignStore>) -> Self {
        MockPhaseService {
            phase,
            store,
            state: Arc::new(Mutex::new(MockState {
                scripts: HashMap::new(),
                statuses: HashMap::new(),
                configs: HashMap::new(),
                execute_calls: HashMap::new(),
            })),
        }
    }

    /// Queues the next `execute()` outcome for `campaign_id`. Multiple
    /// calls queue multiple consecutive outcomes (retry scenarios).
    pub async fn script(&self, campaign_id: Uuid, outcome: ScriptedOutcome) {
        let mut state = self.state.lock().await;
        state
            .scripts
            .entry((campaign_id, self.phase))
            .or_default()
            .push_back(outcome);
    }

    pub async fn execute_call_count(&self, campaign_id: Uuid) -> u32 {
        let state = self.state.lock().await;
        *state
            .execute_calls
            .get(&(campaign_id, self.phase))
            .unwrap_or(&0)
    }
}

#[async_trait]
impl PhaseService for MockPhaseService {
    async fn configure(&self, campaign_id: Uuid, config: Value) -> Result<()> {
        let mut state = self.state.lock().await;
        state.configs.insert((campaign_id, self.phase), config);
        Ok(())
    }

    async fn execute(&self, campaign_id: Uuid) -> Result<mpsc::Receiver<ProgressItem>> {
        let outcome = {
            let mut state = self.state.lock().await;
            *state
                .execute_calls
                .entry((campaign_id, self.phase))
                .or_insert(0) += 1;
            state
                .scripts
                .get_mut(&(campaign_id, self.phase))
                .and_then(|q| q.pop_front())
                .unwrap_or(ScriptedOutcome::CompleteAfter { progress_steps: 1 })
        };

        match outcome {
            ScriptedOutcome::ExecuteError(message) => {
                Err(OrchestratorError::PhaseService(message))
            }
            ScriptedOutcome::FastZeroComplete => {
                self.store
                    .transition(
                        campaign_id,
                        self.phase,
                        PhaseStatus::InProgress,
                        PhaseStatus::Completed,
                        LifecycleEventType::PhaseCompleted,
                        Value::Null,
                    )
                    .await?;
                self.store.complete_phase(campaign_id, self.phase).await?;
                {
                    let mut state = self.state.lock().await;
                    state.statuses.insert(
                        (campaign_id, self.phase),
                        PhaseStatusSnapshot {
                            status: PhaseStatus::NotStarted,
                            items_total: 0,
                            items_processed: 0,
                            progress_pct: 0,
                            started_at: None,
                            completed_at: None,
                            last_error: None,
                            configuration: None,
                        },
                    );
                }
                let (_tx, rx) = mpsc::channel(1);
                Ok(rx)
            }
            ScriptedOutcome::CompleteAfter { progress_steps } => {
                Ok(self.spawn_feed_channel(campaign_id, progress_steps, None))
            }
            ScriptedOutcome::FailAfter {
                progress_steps,
                message,
            } => {
                let rx = self.spawn_feed_channel(campaign_id, progress_steps, Some(message));
                Ok(rx)
            }
        }
    }

    async fn get_status(&self, campaign_id: Uuid) -> Result<PhaseStatusSnapshot> {
        let state = self.state.lock().await;
        Ok(state
            .statuses
            .get(&(campaign_id, self.phase))
            .cloned()
            .unwrap_or(PhaseStatusSnapshot {
                status: PhaseStatus::NotStarted,
                items_total: 0,
                items_processed: 0,
                progress_pct: 0,
                started_at: None,
                completed_at: None,
                last_error: None,
                configuration: None,
            }))
    }

    async fn cancel(&self, _campaign_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn validate(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    fn capabilities(&self) -> PhaseCapabilities {
        PhaseCapabilities {
            can_pause: true,
            can_resume: true,
        }
    }

    async fn attach_control_channel(
        &self,
        _campaign_id: Uuid,
        mut rx: mpsc::Receiver<ControlCommand>,
    ) -> bool {
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let Some(ack) = cmd.ack {
                    let _ = ack.send(Ok(()));
                }
            }
        });
        true
    }
}
impl MockPhaseService {
    fn spawn_feed_channel(
        &self,
        campaign_id: Uuid,
        progress_steps: u32,
        failure_message: Option<String>,
    ) -> mpsc::Receiver<ProgressItem> {
        let (tx, rx) = mpsc::channel(progress_steps as usize + 2);
        let phase = self.phase;
        let state = self.state.clone();
        tokio::spawn(async move {
            for step in 1..=progress_steps {
                let item = ProgressItem {
                    campaign_id,
                    phase,
                    status: PhaseStatus::InProgress,
                    items_processed: step as u64,
                    items_total: progress_steps as u64,
                    progress_pct: clamp_pct(step as u64, progress_steps as u64),
                    message: None,
                    error: None,
                    timestamp: Utc::now(),
                };
                if tx.send(item).await.is_err() {
                    return;
                }
            }

            let final_status = match &failure_message {
                Some(message) => {
                    let _ = tx
                        .send(ProgressItem {
                            campaign_id,
                            phase,
                            status: PhaseStatus::Failed,
                            items_processed: progress_steps as u64,
                            items_total: progress_steps as u64,
                            progress_pct: 100,
                            message: None,
                            error: Some(message.clone()),
                            timestamp: Utc::now(),
                        })
                        .await;
                    PhaseStatusSnapshot {
                        status: PhaseStatus::Failed,
                        items_total: progress_steps as u64,
                        items_processed: progress_steps as u64,
                        progress_pct: 100,
                        started_at: None,
                        completed_at: Some(Utc::now()),
                        last_error: Some(message.clone()),
                        configuration: None,
                    }
                }
                None => PhaseStatusSnapshot {
                    status: PhaseStatus::Completed,
                    items_total: progress_steps as u64,
                    items_processed: progress_steps as u64,
                    progress_pct: 100,
                    started_at: None,
                    completed_at: Some(Utc::now()),
                    last_error: None,
                    configuration: None,
                },
            };

            let mut locked = state.lock().await;
            locked.statuses.insert((campaign_id, phase), final_status);
        });
        rx
    }
}
