//! `Orchestrator`: the public operations wiring every other component
//! together (spec §4.5). Grounded on `scheduler.rs::run_scheduler` as the
//! top-level owner of the registry and cancellation tokens, generalized
//! from a polling loop into a request-driven API.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use dashmap::DashSet;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::control_bus::PhaseControlBus;
use crate::error::{OrchestratorError, Result};
use crate::event_broadcaster::EventBroadcaster;
use crate::idempotency::IdempotencyCache;
use crate::metrics::Metrics;
use crate::model::{
    Campaign, CampaignExecution, CampaignMode, CampaignStateStatus, ControlOptions, ControlSignal,
    LifecycleEventType, PhaseStatus, PhaseType,
};
use crate::phase_service::PhaseService;
use crate::registry::ExecutionRegistry;
use crate::state_machine;
use crate::store::CampaignStore;
use crate::transition_gate::TransitionGate;

pub type Hook = Arc<dyn Fn(Uuid) + Send + Sync>;

#[derive(Debug, Default)]
pub struct RestartOutcome {
    pub restarted_phases: Vec<PhaseType>,
    pub failed_phases: Vec<(PhaseType, OrchestratorError)>,
}

struct StartGuard {
    guards: Arc<DashSet<(Uuid, PhaseType)>>,
    key: (Uuid, PhaseType),
}

impl StartGuard {
    fn try_acquire(
        guards: Arc<DashSet<(Uuid, PhaseType)>>,
        campaign_id: Uuid,
        phase: PhaseType,
    ) -> Option<Self> {
        let key = (campaign_id, phase);
        if guards.insert(key) {
            Some(StartGuard { guards, key })
        } else {
            None
        }
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        self.guards.remove(&self.key);
    }
}

struct Inner {
    store: Arc<dyn CampaignStore>,
    services: HashMap<PhaseType, Arc<dyn PhaseService>>,
    broadcaster: Arc<dyn EventBroadcaster>,
    metrics: Arc<dyn Metrics>,
    gate: TransitionGate,
    control_bus: PhaseControlBus,
    registry: ExecutionRegistry,
    idempotency: IdempotencyCache,
    config: OrchestratorConfig,
    executions: RwLock<HashMap<Uuid, CampaignExecution>>,
    start_guards: Arc<DashSet<(Uuid, PhaseType)>>,
    hooks: RwLock<Vec<Hook>>,
}

/// Cheaply clonable handle to the orchestrator. Every clone shares the same
/// in-memory state (executions, registry, control bus, idempotency cache)
/// — this is what lets `ProgressMonitor` tasks call back into
/// `StartPhase` for auto-advance without owning a separate copy of the
/// world.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        services: HashMap<PhaseType, Arc<dyn PhaseService>>,
        broadcaster: Arc<dyn EventBroadcaster>,
        metrics: Arc<dyn Metrics>,
        config: OrchestratorConfig,
    ) -> Self {
        let gate = TransitionGate::new(store.clone(), broadcaster.clone(), metrics.clone());
        let control_bus = PhaseControlBus::new(config.control_bus_buffer);
        let idempotency = IdempotencyCache::new(config.idempotency_ttl());

        Orchestrator {
            inner: Arc::new(Inner {
                store,
                services,
                broadcaster,
                metrics,
                gate,
                control_bus,
                registry: ExecutionRegistry::new(),
                idempotency,
                config,
                executions: RwLock::new(HashMap::new()),
                start_guards: Arc::new(DashSet::new()),
                hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn add_post_completion_hook(&self, hook: Hook) {
        self.inner.hooks.write().unwrap().push(hook);
    }

    pub(crate) fn store(&self) -> &Arc<dyn CampaignStore> {
        &self.inner.store
    }

    pub(crate) fn broadcaster(&self) -> &Arc<dyn EventBroadcaster> {
        &self.inner.broadcaster
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.inner.metrics
    }

    pub(crate) fn gate(&self) -> &TransitionGate {
        &self.inner.gate
    }

    pub(crate) fn registry(&self) -> &ExecutionRegistry {
        &self.inner.registry
    }

    pub(crate) fn control_bus(&self) -> &PhaseControlBus {
        &self.inner.control_bus
    }

    pub(crate) fn with_execution_mut<R>(
        &self,
        campaign_id: Uuid,
        f: impl FnOnce(&mut CampaignExecution) -> R,
    ) -> R {
        let mut executions = self.inner.executions.write().unwrap();
        let exec = executions
            .entry(campaign_id)
            .or_insert_with(|| CampaignExecution::new(campaign_id));
        f(exec)
    }

    pub(crate) fn read_execution<R>(
        &self,
        campaign_id: Uuid,
        f: impl FnOnce(Option<&CampaignExecution>) -> R,
    ) -> R {
        let executions = self.inner.executions.read().unwrap();
        f(executions.get(&campaign_id))
    }

    pub(crate) fn run_hooks(&self, campaign_id: Uuid) {
        let hooks = self.inner.hooks.read().unwrap().clone();
        for hook in hooks {
            hook(campaign_id);
        }
    }

    pub(crate) fn service_for(&self, phase: PhaseType) -> Result<Arc<dyn PhaseService>> {
        self.inner
            .services
            .get(&phase)
            .cloned()
            .ok_or_else(|| OrchestratorError::Other(format!("no service registered for {phase:?}")))
    }

    async fn should_auto_advance(&self, campaign_id: Uuid, phase: PhaseType) -> Result<Option<PhaseType>> {
        let campaign = self.inner.store.get_campaign(campaign_id).await?;
        if campaign.mode != CampaignMode::FullSequence {
            return Ok(None);
        }
        Ok(phase.next())
    }

    async fn best_effort_broadcast_failed(&self, campaign_id: Uuid, phase: PhaseType, message: String) {
        self.inner
            .broadcaster
            .broadcast_to_campaign(
                campaign_id,
                crate::model::LifecycleEvent {
                    campaign_id,
                    event_type: LifecycleEventType::PhaseFailed,
                    phase: Some(phase),
                    from_status: None,
                    to_status: Some(PhaseStatus::Failed),
                    sequence_number: 0,
                    payload: json!({ "error": message }),
                    created_at: Utc::now(),
                },
            )
            .await;
    }

    #[instrument(skip(self, config), fields(campaign_id = %campaign_id, phase = ?phase))]
    pub async fn configure_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        config: serde_json::Value,
    ) -> Result<()> {
        let service = self.service_for(phase)?;
        service.validate(&config).await?;
        service.configure(campaign_id, config.clone()).await?;
        self.inner
            .store
            .upsert_phase_config(campaign_id, phase, config)
            .await?;

        self.with_execution_mut(campaign_id, |_| {});
        Ok(())
    }

    #[instrument(skip(self, opts), fields(campaign_id = %campaign_id, phase = ?phase))]
    pub async fn start_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        opts: ControlOptions,
    ) -> Result<()> {
        if let Some(key) = &opts.idempotency_key {
            if let Some(cached) = self.inner.idempotency.get(key) {
                return cached;
            }
        }

        let phase_row = self.inner.store.get_campaign_phase(campaign_id, phase).await?;

        // 1. Idempotent completion.
        if phase_row.status == PhaseStatus::Completed {
            if let Some(next) = self.should_auto_advance(campaign_id, phase).await? {
                let this = self.clone();
                tokio::spawn(async move {
                    this.inner.metrics.phase_auto_starts();
                    if let Err(err) = this.start_phase(campaign_id, next, ControlOptions::default()).await {
                        error!(campaign_id = %campaign_id, phase = ?next, error = %err, marker = "pipeline_stall_risk", "auto-advance failed");
                        this.inner.metrics.phase_failures();
                    }
                });
            }
            return Ok(());
        }

        // 2. Phase-start guard.
        let _guard = match StartGuard::try_acquire(self.inner.start_guards.clone(), campaign_id, phase) {
            Some(guard) => guard,
            None => return Ok(()),
        };

        // 3. In-memory idempotency.
        let already_running = self.read_execution(campaign_id, |exec| {
            exec.map(|e| e.phase_status(phase) == PhaseStatus::InProgress)
                .unwrap_or(false)
        });
        if already_running {
            return Ok(());
        }

        let campaign = self.inner.store.get_campaign(campaign_id).await?;

        // 4. Exclusivity.
        let blocked_by_other = self.read_execution(campaign_id, |exec| {
            exec.and_then(|e| e.running_phase())
                .map(|running| running != phase)
                .unwrap_or(false)
        });
        if blocked_by_other {
            return Err(OrchestratorError::AnotherPhaseRunning);
        }

        // 5. Full-sequence readiness (checked at the literal pipeline entry point).
        if phase == PhaseType::DomainGeneration && campaign.mode == CampaignMode::FullSequence {
            let mut missing = Vec::new();
            for required in [PhaseType::DnsValidation, PhaseType::HttpKeywordValidation] {
                if self
                    .inner
                    .store
                    .get_phase_config(campaign_id, required)
                    .await?
                    .is_none()
                {
                    missing.push(required);
                }
            }
            if !missing.is_empty() {
                return Err(OrchestratorError::MissingPhaseConfigs { missing });
            }
        }

        // 6. Dependency gate.
        if let Some(upstream) = phase.upstream() {
            let upstream_row = self
                .inner
                .store
                .get_campaign_phase(campaign_id, upstream)
                .await?;
            if !upstream_row.status.satisfies_dependency() {
                return Err(OrchestratorError::PhaseDependenciesNotMet {
                    phase,
                    blocking: upstream,
                    blocking_status: upstream_row.status,
                });
            }
        }

        // 7. Default configs for auto-defaultable phases.
        let mut config = self.inner.store.get_phase_config(campaign_id, phase).await?;
        if config.is_none() && phase.auto_defaults_allowed() {
            let default_config = json!({});
            self.inner
                .store
                .upsert_phase_config(campaign_id, phase, default_config.clone())
                .await?;
            config = Some(default_config);
        }

        // 8. Configuration hydration.
        let service = self.service_for(phase)?;
        match &config {
            Some(cfg) => {
                service
                    .validate(cfg)
                    .await
                    .map_err(|err| OrchestratorError::PhaseConfigInvalid {
                        phase,
                        reason: err.to_string(),
                    })?;
                service.configure(campaign_id, cfg.clone()).await?;
            }
            None => {
                if !phase.auto_defaults_allowed() {
                    return Err(OrchestratorError::PhaseConfigMissing(phase));
                }
            }
        }

        // Execution: detached from this call's lifetime.
        let from_status = phase_row.status;
        let (run_id, cancel) = self.inner.registry.register(campaign_id, phase);
        let control_rx = self.inner.control_bus.subscribe(campaign_id, phase);
        service.attach_control_channel(campaign_id, control_rx).await;

        let progress_rx = match service.execute(campaign_id).await {
            Err(err) => {
                self.inner.registry.cancel(campaign_id);
                self.inner.control_bus.close(campaign_id, phase);
                self.inner.metrics.phase_failures();
                self.best_effort_broadcast_failed(campaign_id, phase, err.to_string())
                    .await;
                return Err(err);
            }
            Ok(rx) => rx,
        };

        self.inner
            .gate
            .transition(
                campaign_id,
                phase,
                from_status,
                PhaseStatus::InProgress,
                LifecycleEventType::PhaseStarted,
                opts.expected_state,
                json!({ "trigger": "start" }),
            )
            .await?;

        self.inner.store.set_current_phase(campaign_id, Some(phase)).await?;
        self.inner
            .store
            .set_overall_status(campaign_id, PhaseStatus::InProgress, None)
            .await?;

        self.with_execution_mut(campaign_id, |exec| {
            exec.current_phase = Some(phase);
            exec.overall_status = PhaseStatus::InProgress;
            exec.phase_run_id = Some(run_id);
            exec.phase_statuses.insert(phase, PhaseStatus::InProgress);
            if exec.started_at.is_none() {
                exec.started_at = Some(Utc::now());
            }
        });

        self.inner.metrics.phase_starts();

        let monitor_handle = self.clone();
        tokio::spawn(crate::monitor::run_progress_monitor(
            monitor_handle,
            campaign_id,
            phase,
            run_id,
            progress_rx,
            cancel,
        ));

        if let Some(key) = opts.idempotency_key {
            self.inner.idempotency.set(key, Ok(()));
        }

        Ok(())
    }

    #[instrument(skip(self, opts), fields(campaign_id = %campaign_id, phase = ?phase))]
    pub async fn pause_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        opts: ControlOptions,
    ) -> Result<()> {
        let phase_row = self.inner.store.get_campaign_phase(campaign_id, phase).await?;

        if let Some(expected) = opts.expected_state {
            if phase_row.status != expected {
                return Err(OrchestratorError::ExpectedStateMismatch {
                    current: phase_row.status,
                    expected,
                    action: "pause",
                });
            }
        }

        if phase_row.status == PhaseStatus::Paused {
            return Ok(());
        }

        state_machine::validate(phase_row.status, PhaseStatus::Paused, phase)?;

        if !self.inner.control_bus.is_subscribed(campaign_id, phase) {
            let rx = self.inner.control_bus.subscribe(campaign_id, phase);
            self.service_for(phase)?
                .attach_control_channel(campaign_id, rx)
                .await;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        match self
            .inner
            .control_bus
            .broadcast(campaign_id, phase, ControlSignal::Pause, Some(ack_tx))
        {
            Err(OrchestratorError::ControlChannelFull) => {
                return Err(OrchestratorError::ControlChannelFull)
            }
            Err(OrchestratorError::PhaseNotRunning) => {
                // Runtime gone but store says in_progress: persist the
                // pause anyway, preserving user intent.
            }
            Err(other) => return Err(other),
            Ok(()) => {
                match tokio::time::timeout(self.inner.config.control_ack_timeout(), ack_rx).await {
                    Ok(Ok(Err(reason))) => return Err(OrchestratorError::Other(reason)),
                    Err(_) => return Err(OrchestratorError::PauseTimeout),
                    _ => {}
                }
            }
        }

        self.inner
            .gate
            .transition(
                campaign_id,
                phase,
                phase_row.status,
                PhaseStatus::Paused,
                LifecycleEventType::PhasePaused,
                None,
                json!({ "trigger": "pause" }),
            )
            .await?;

        self.inner.store.set_current_phase(campaign_id, Some(phase)).await?;
        self.inner
            .store
            .set_overall_status(campaign_id, PhaseStatus::Paused, None)
            .await?;

        self.with_execution_mut(campaign_id, |exec| {
            exec.overall_status = PhaseStatus::Paused;
            exec.phase_statuses.insert(phase, PhaseStatus::Paused);
        });

        if let Some(key) = opts.idempotency_key {
            self.inner.idempotency.set(key, Ok(()));
        }
        Ok(())
    }

    #[instrument(skip(self, opts), fields(campaign_id = %campaign_id, phase = ?phase))]
    pub async fn resume_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        opts: ControlOptions,
    ) -> Result<()> {
        self.inner.metrics.resume_attempts();
        let result = self.resume_phase_inner(campaign_id, phase, opts).await;
        match &result {
            Ok(()) => self.inner.metrics.resume_successes(),
            Err(_) => self.inner.metrics.resume_failures(),
        }
        result
    }

    async fn resume_phase_inner(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        opts: ControlOptions,
    ) -> Result<()> {
        let phase_row = self.inner.store.get_campaign_phase(campaign_id, phase).await?;

        if let Some(expected) = opts.expected_state {
            if phase_row.status != expected {
                return Err(OrchestratorError::ExpectedStateMismatch {
                    current: phase_row.status,
                    expected,
                    action: "resume",
                });
            }
        }

        if phase_row.status == PhaseStatus::InProgress {
            return Ok(());
        }

        let blocked_by_other = self.read_execution(campaign_id, |exec| {
            exec.and_then(|e| e.running_phase())
                .map(|running| running != phase)
                .unwrap_or(false)
        });
        if blocked_by_other {
            return Err(OrchestratorError::AnotherPhaseRunning);
        }

        state_machine::validate(phase_row.status, PhaseStatus::InProgress, phase)?;

        if !self.inner.control_bus.is_subscribed(campaign_id, phase) {
            // Runtime is gone but the store says paused: best-effort
            // resume by re-executing the worker from scratch.
            return self.start_phase(campaign_id, phase, opts).await;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        match self
            .inner
            .control_bus
            .broadcast(campaign_id, phase, ControlSignal::Resume, Some(ack_tx))
        {
            Err(OrchestratorError::PhaseNotRunning) => {
                return self.start_phase(campaign_id, phase, opts).await
            }
            Err(other) => return Err(other),
            Ok(()) => {
                match tokio::time::timeout(self.inner.config.control_ack_timeout(), ack_rx).await {
                    Ok(Ok(Err(reason))) => return Err(OrchestratorError::Other(reason)),
                    Err(_) => return Err(OrchestratorError::ResumeTimeout),
                    _ => {}
                }
            }
        }

        self.inner
            .gate
            .transition(
                campaign_id,
                phase,
                phase_row.status,
                PhaseStatus::InProgress,
                LifecycleEventType::PhaseResumed,
                None,
                json!({ "trigger": "resume" }),
            )
            .await?;

        self.inner.store.set_current_phase(campaign_id, Some(phase)).await?;
        self.inner
            .store
            .set_overall_status(campaign_id, PhaseStatus::InProgress, None)
            .await?;

        self.with_execution_mut(campaign_id, |exec| {
            exec.overall_status = PhaseStatus::InProgress;
            exec.phase_statuses.insert(phase, PhaseStatus::InProgress);
        });

        if let Some(key) = opts.idempotency_key {
            self.inner.idempotency.set(key, Ok(()));
        }
        Ok(())
    }

    #[instrument(skip(self, _opts), fields(campaign_id = %campaign_id, phase = ?phase))]
    pub async fn cancel_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        _opts: ControlOptions,
    ) -> Result<()> {
        if !self.inner.control_bus.is_subscribed(campaign_id, phase) {
            let rx = self.inner.control_bus.subscribe(campaign_id, phase);
            self.service_for(phase)?
                .attach_control_channel(campaign_id, rx)
                .await;
        }

        self.inner
            .control_bus
            .broadcast(campaign_id, phase, ControlSignal::Stop, None)?;

        self.service_for(phase)?.cancel(campaign_id).await?;
        self.inner.registry.cancel(campaign_id);
        Ok(())
    }

    #[instrument(skip(self, _opts), fields(campaign_id = %campaign_id))]
    pub async fn stop_campaign(
        &self,
        campaign_id: Uuid,
        _opts: ControlOptions,
    ) -> Result<(PhaseType, PhaseStatus)> {
        let phases = self.inner.store.get_campaign_phases(campaign_id).await?;
        let campaign = self.inner.store.get_campaign(campaign_id).await?;

        let target = phases
            .iter()
            .find(|p| p.status == PhaseStatus::InProgress)
            .or_else(|| phases.iter().find(|p| p.status == PhaseStatus::Paused))
            .map(|p| p.phase_type)
            .or(campaign.current_phase)
            .ok_or(OrchestratorError::NoActivePhase)?;

        self.inner.registry.cancel(campaign_id);
        let _ = self
            .inner
            .control_bus
            .broadcast(campaign_id, target, ControlSignal::Stop, None);
        self.inner.control_bus.close(campaign_id, target);

        let from_status = self
            .inner
            .store
            .get_campaign_phase(campaign_id, target)
            .await?
            .status;

        const STOP_REASON: &str = "Campaign stop requested by user";

        self.inner
            .gate
            .transition(
                campaign_id,
                target,
                from_status,
                PhaseStatus::Failed,
                LifecycleEventType::PhaseFailed,
                None,
                json!({ "trigger": "fail", "reason": STOP_REASON }),
            )
            .await?;

        self.inner
            .store
            .set_overall_status(campaign_id, PhaseStatus::Failed, Some(STOP_REASON.to_string()))
            .await?;

        // Record the stop distinctly from an ordinary worker failure: the
        // campaign-state record, not `overall_status`, is what tells a
        // user-initiated stop apart from a crash (spec §4.5/§6.2).
        if self.inner.store.get_campaign_state(campaign_id).await?.is_none() {
            self.inner
                .store
                .create_campaign_state(campaign_id, CampaignMode::StepByStep)
                .await?;
        }
        self.inner
            .store
            .update_campaign_state(campaign_id, CampaignStateStatus::Cancelled)
            .await?;

        self.with_execution_mut(campaign_id, |exec| {
            exec.overall_status = PhaseStatus::Failed;
            exec.last_error = Some(STOP_REASON.to_string());
            exec.phase_statuses.insert(target, PhaseStatus::Failed);
        });

        Ok((target, PhaseStatus::Failed))
    }

    #[instrument(skip(self), fields(campaign_id = %campaign_id))]
    pub async fn restart_campaign(&self, campaign_id: Uuid) -> Result<RestartOutcome> {
        let campaign = self.inner.store.get_campaign(campaign_id).await?;

        if campaign.mode == CampaignMode::FullSequence {
            return match self
                .start_phase(campaign_id, PhaseType::DnsValidation, ControlOptions::default())
                .await
            {
                Ok(()) => Ok(RestartOutcome {
                    restarted_phases: vec![PhaseType::DnsValidation],
                    failed_phases: vec![],
                }),
                Err(err) => Ok(RestartOutcome {
                    restarted_phases: vec![],
                    failed_phases: vec![(PhaseType::DnsValidation, err)],
                }),
            };
        }

        let restartable = [
            PhaseType::DnsValidation,
            PhaseType::HttpKeywordValidation,
            PhaseType::Extraction,
            PhaseType::Analysis,
            PhaseType::Enrichment,
        ];

        let mut restarted = Vec::new();
        let mut failed = Vec::new();
        for phase in restartable {
            match self.start_phase(campaign_id, phase, ControlOptions::default()).await {
                Ok(()) => restarted.push(phase),
                Err(err) => failed.push((phase, err)),
            }
        }

        if restarted.is_empty() && !failed.is_empty() {
            let (_, first_error) = failed.into_iter().next().unwrap();
            return Err(first_error);
        }

        Ok(RestartOutcome {
            restarted_phases: restarted,
            failed_phases: failed,
        })
    }

    /// Restart-time reconciliation (spec §4.5). For every campaign whose
    /// durable status is still `in_progress`/`paused`, reclaims any stale
    /// process-local handle, then either defers (parks `paused`) or
    /// auto-resumes per `auto_resume_on_restart`.
    #[instrument(skip(self))]
    pub async fn rehydrate_in_flight(&self) -> Result<()> {
        let candidates = self.inner.store.list_in_flight_campaigns().await?;
        let mut seen = HashSet::new();

        for campaign in candidates {
            if !seen.insert(campaign.id) {
                continue;
            }
            if let Err(err) = self.rehydrate_one(&campaign).await {
                warn!(campaign_id = %campaign.id, error = %err, "rehydration skipped");
            }
            tokio::time::sleep(self.inner.config.rehydration.sleep_between_campaigns()).await;
        }

        Ok(())
    }

    async fn rehydrate_one(&self, campaign: &Campaign) -> Result<()> {
        let phase = match campaign.current_phase {
            Some(phase) => phase,
            None => {
                let phases = self.inner.store.get_campaign_phases(campaign.id).await?;
                match phases
                    .iter()
                    .find(|p| matches!(p.status, PhaseStatus::InProgress | PhaseStatus::Paused))
                {
                    Some(p) => p.phase_type,
                    None => return Ok(()),
                }
            }
        };

        let already_owned = self.read_execution(campaign.id, |exec| {
            exec.map(|e| {
                e.phase_run_id
                    .map(|run_id| self.inner.registry.is_active(campaign.id, run_id))
                    .unwrap_or(false)
                    && e.phase_status(phase) != PhaseStatus::NotStarted
            })
            .unwrap_or(false)
        });
        if already_owned {
            return Ok(());
        }

        self.inner.registry.cancel(campaign.id);

        let phase_row = self.inner.store.get_campaign_phase(campaign.id, phase).await?;
        let was_in_progress = phase_row.status == PhaseStatus::InProgress;

        if self.inner.config.auto_resume_on_restart && was_in_progress {
            let needs_config = matches!(
                phase,
                PhaseType::DomainGeneration | PhaseType::DnsValidation | PhaseType::HttpKeywordValidation
            );
            let config_present = self
                .inner
                .store
                .get_phase_config(campaign.id, phase)
                .await?
                .is_some();

            if !needs_config || config_present {
                match self.start_phase(campaign.id, phase, ControlOptions::default()).await {
                    Ok(()) => {
                        self.inner.metrics.resume_successes();
                        return Ok(());
                    }
                    Err(OrchestratorError::PhaseConfigMissing(_))
                    | Err(OrchestratorError::PhaseConfigInvalid { .. }) => {
                        // Config hydration failure during restore is a
                        // skip condition, not a restore failure (spec §9
                        // ambiguity 3).
                    }
                    Err(err) => {
                        self.inner.metrics.resume_failures();
                        return Err(err);
                    }
                }
            }
        }

        if phase_row.status != PhaseStatus::Paused {
            self.inner
                .gate
                .transition(
                    campaign.id,
                    phase,
                    phase_row.status,
                    PhaseStatus::Paused,
                    LifecycleEventType::PhasePaused,
                    None,
                    json!({ "trigger": "rehydrate_defer" }),
                )
                .await?;
        }

        self.inner.store.set_current_phase(campaign.id, Some(phase)).await?;
        self.inner
            .store
            .set_overall_status(campaign.id, PhaseStatus::Paused, None)
            .await?;
        let _rx = self.inner.control_bus.subscribe(campaign.id, phase);

        self.with_execution_mut(campaign.id, |exec| {
            exec.overall_status = PhaseStatus::Paused;
            exec.current_phase = Some(phase);
            exec.phase_statuses.insert(phase, PhaseStatus::Paused);
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_broadcaster::InMemoryEventBroadcaster;
    use crate::metrics::CountingMetrics;
    use crate::phase_service::{MockPhaseService, ScriptedOutcome};
    use crate::store::InMemoryCampaignStore;

    fn build_orchestrator() -> (
        Orchestrator,
        Arc<InMemoryCampaignStore>,
        HashMap<PhaseType, Arc<MockPhaseService>>,
        Arc<InMemoryEventBroadcaster>,
    ) {
        let store = Arc::new(InMemoryCampaignStore::spawn());
        let broadcaster = Arc::new(InMemoryEventBroadcaster::new());
        let metrics = Arc::new(CountingMetrics::default());

        let mut services: HashMap<PhaseType, Arc<dyn PhaseService>> = HashMap::new();
        let mut mocks: HashMap<PhaseType, Arc<MockPhaseService>> = HashMap::new();
        for phase in PhaseType::ORDER {
            let mock = Arc::new(MockPhaseService::new(phase, store.clone() as Arc<dyn CampaignStore>));
            services.insert(phase, mock.clone());
            mocks.insert(phase, mock);
        }

        let orchestrator = Orchestrator::new(
            store.clone() as Arc<dyn CampaignStore>,
            services,
            broadcaster.clone() as Arc<dyn EventBroadcaster>,
            metrics as Arc<dyn Metrics>,
            OrchestratorConfig::default(),
        );

        (orchestrator, store, mocks, broadcaster)
    }

    async fn seed_full_sequence_campaign(store: &InMemoryCampaignStore) -> Uuid {
        let campaign = Campaign::new(Uuid::new_v4(), CampaignMode::FullSequence);
        let id = campaign.id;
        store.seed_campaign(campaign).await.unwrap();
        for phase in [PhaseType::DnsValidation, PhaseType::HttpKeywordValidation] {
            store
                .upsert_phase_config(id, phase, json!({}))
                .await
                .unwrap();
        }
        id
    }

    #[tokio::test]
    async fn s1_full_sequence_happy_path() {
        let (orchestrator, store, mocks, broadcaster) = build_orchestrator();
        let id = seed_full_sequence_campaign(&store).await;

        for phase in PhaseType::ORDER {
            mocks[&phase]
                .script(id, ScriptedOutcome::CompleteAfter { progress_steps: 1 })
                .await;
        }

        orchestrator
            .start_phase(id, PhaseType::DomainGeneration, ControlOptions::default())
            .await
            .unwrap();

        // Allow the chain of spawned progress monitors/auto-advances to settle.
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let campaign = store.get_campaign(id).await.unwrap();
            if campaign.overall_status == PhaseStatus::Completed {
                break;
            }
        }

        let campaign = store.get_campaign(id).await.unwrap();
        assert_eq!(campaign.overall_status, PhaseStatus::Completed);
        assert_eq!(campaign.completed_phases, 6);
        assert_eq!(campaign.current_phase, None);

        let started = broadcaster
            .count_of_type(id, LifecycleEventType::PhaseStarted)
            .await;
        let completed = broadcaster
            .count_of_type(id, LifecycleEventType::PhaseCompleted)
            .await;
        let auto_started = broadcaster
            .count_of_type(id, LifecycleEventType::PhaseAutoStarted)
            .await;
        assert_eq!(started, 6);
        assert_eq!(completed, 6);
        assert_eq!(auto_started, 5);
    }

    #[tokio::test]
    async fn s2_missing_config_gating() {
        let (orchestrator, store, _mocks, _broadcaster) = build_orchestrator();
        let campaign = Campaign::new(Uuid::new_v4(), CampaignMode::FullSequence);
        let id = campaign.id;
        store.seed_campaign(campaign).await.unwrap();
        store
            .upsert_phase_config(id, PhaseType::DnsValidation, json!({}))
            .await
            .unwrap();

        let err = orchestrator
            .start_phase(id, PhaseType::DomainGeneration, ControlOptions::default())
            .await
            .unwrap_err();

        match err {
            OrchestratorError::MissingPhaseConfigs { missing } => {
                assert_eq!(missing, vec![PhaseType::HttpKeywordValidation]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn s4_duplicate_start_is_idempotent() {
        let (orchestrator, store, mocks, _broadcaster) = build_orchestrator();
        let id = seed_full_sequence_campaign(&store).await;
        mocks[&PhaseType::DomainGeneration]
            .script(id, ScriptedOutcome::CompleteAfter { progress_steps: 50 })
            .await;

        for _ in 0..6 {
            orchestrator
                .start_phase(id, PhaseType::DomainGeneration, ControlOptions::default())
                .await
                .unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let calls = mocks[&PhaseType::DomainGeneration]
            .execute_call_count(id)
            .await;
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn s7_expected_state_precondition() {
        let (orchestrator, store, _mocks, broadcaster) = build_orchestrator();
        let campaign = Campaign::new(Uuid::new_v4(), CampaignMode::StepByStep);
        let id = campaign.id;
        store.seed_campaign(campaign).await.unwrap();
        store
            .transition(
                id,
                PhaseType::DomainGeneration,
                PhaseStatus::NotStarted,
                PhaseStatus::InProgress,
                LifecycleEventType::PhaseStarted,
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        store
            .transition(
                id,
                PhaseType::DomainGeneration,
                PhaseStatus::InProgress,
                PhaseStatus::Paused,
                LifecycleEventType::PhasePaused,
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        let err = orchestrator
            .pause_phase(
                id,
                PhaseType::DomainGeneration,
                ControlOptions {
                    expected_state: Some(PhaseStatus::InProgress),
                    idempotency_key: None,
                },
            )
            .await
            .unwrap_err();

        match err {
            OrchestratorError::ExpectedStateMismatch {
                current, expected, ..
            } => {
                assert_eq!(current, PhaseStatus::Paused);
                assert_eq!(expected, PhaseStatus::InProgress);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(broadcaster.events_for(id).await.len() >= 2);
    }

    #[tokio::test]
    async fn dependency_gate_blocks_out_of_order_start() {
        let (orchestrator, store, _mocks, _broadcaster) = build_orchestrator();
        let campaign = Campaign::new(Uuid::new_v4(), CampaignMode::StepByStep);
        let id = campaign.id;
        store.seed_campaign(campaign).await.unwrap();

        let err = orchestrator
            .start_phase(id, PhaseType::DnsValidation, ControlOptions::default())
            .await
            .unwrap_err();

        match err {
            OrchestratorError::PhaseDependenciesNotMet { blocking, .. } => {
                assert_eq!(blocking, PhaseType::DomainGeneration);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
