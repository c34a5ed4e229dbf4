//! `ProgressMonitor`: drains a `PhaseService`'s progress stream and
//! reconciles the terminal outcome against the store (spec §4.6). Grounded
//! on `executor.rs`'s `execute_phase` (a retry/cancellation-race shell
//! around a pure resolution function) and its `StalenessResult`/
//! `check_staleness` pattern, generalized here to "worker-reported status
//! vs. store status, store wins" — the defensive read that resolves the
//! fast-zero-completion race in spec scenario S6.

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::model::{
    clamp_pct, CampaignMode, ControlOptions, LifecycleEvent, LifecycleEventType, PhaseStatus,
    PhaseType, ProgressItem,
};
use crate::orchestrator::Orchestrator;
use crate::store::CampaignStore;

pub(crate) async fn run_progress_monitor(
    orchestrator: Orchestrator,
    campaign_id: Uuid,
    phase: PhaseType,
    run_id: Uuid,
    mut progress_rx: tokio::sync::mpsc::Receiver<ProgressItem>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = progress_rx.recv() => {
                match item {
                    Some(item) => handle_progress_item(&orchestrator, campaign_id, phase, run_id, item).await,
                    None => break,
                }
            }
        }
    }

    handle_phase_completion(&orchestrator, campaign_id, phase, run_id).await;
}

async fn handle_progress_item(
    orchestrator: &Orchestrator,
    campaign_id: Uuid,
    phase: PhaseType,
    run_id: Uuid,
    item: ProgressItem,
) {
    if !orchestrator.registry().is_active(campaign_id, run_id) {
        return;
    }

    // Pausing never clears the registry handle (the run must stay resumable),
    // so a progress item racing in right after a pause ack would otherwise
    // still land here. The store is authoritative: a stale worker must not
    // overwrite paused state.
    let already_paused = orchestrator.read_execution(campaign_id, |exec| {
        exec.map(|e| e.phase_status(phase) == PhaseStatus::Paused)
            .unwrap_or(false)
    });
    if already_paused {
        return;
    }
    match orchestrator.store().get_campaign_phase(campaign_id, phase).await {
        Ok(row) if row.status == PhaseStatus::Paused => return,
        Ok(_) => {}
        Err(err) => {
            warn!(campaign_id = %campaign_id, phase = ?phase, error = %err, "get_campaign_phase failed during progress handling");
            return;
        }
    }

    let pct = clamp_pct(item.items_processed, item.items_total);
    let _ = orchestrator
        .store()
        .update_progress(campaign_id, phase, item.items_processed, item.items_total, pct)
        .await;

    orchestrator
        .broadcaster()
        .broadcast_to_campaign(
            campaign_id,
            LifecycleEvent {
                campaign_id,
                event_type: LifecycleEventType::CampaignProgress,
                phase: Some(phase),
                from_status: None,
                to_status: None,
                sequence_number: 0,
                payload: json!({
                    "items_processed": item.items_processed,
                    "items_total": item.items_total,
                    "progress_pct": pct,
                    "message": item.message,
                }),
                created_at: item.timestamp,
            },
        )
        .await;
}

/// Called once the progress stream closes. Fenced by `run_id` so a
/// superseded run (paused-then-restarted, or reclaimed by rehydration)
/// can't finalize over a newer one.
pub(crate) async fn handle_phase_completion(
    orchestrator: &Orchestrator,
    campaign_id: Uuid,
    phase: PhaseType,
    run_id: Uuid,
) {
    if !orchestrator.registry().is_active(campaign_id, run_id) {
        return;
    }

    let service = match orchestrator.service_for(phase) {
        Ok(service) => service,
        Err(err) => {
            warn!(campaign_id = %campaign_id, phase = ?phase, error = %err, "no service registered at completion time");
            return;
        }
    };

    let snapshot = match service.get_status(campaign_id).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(campaign_id = %campaign_id, phase = ?phase, error = %err, "get_status failed at completion time");
            return;
        }
    };

    let phase_row = match orchestrator.store().get_campaign_phase(campaign_id, phase).await {
        Ok(row) => row,
        Err(err) => {
            warn!(campaign_id = %campaign_id, phase = ?phase, error = %err, "get_campaign_phase failed at completion time");
            return;
        }
    };

    // Defensive read: the store is authoritative. A worker that persisted
    // its own completion directly (the fast-zero race) or a status that a
    // concurrent pause/stop already moved on is trusted over the
    // self-reported snapshot above.
    if phase_row.status == PhaseStatus::Completed || phase_row.status == PhaseStatus::Failed {
        orchestrator.registry().clear(campaign_id, run_id);
        orchestrator.control_bus().close(campaign_id, phase);
        if phase_row.status == PhaseStatus::Completed {
            finish_phase_bookkeeping(orchestrator, campaign_id, phase).await;
        }
        return;
    }

    match snapshot.status {
        PhaseStatus::Completed => {
            let _ = orchestrator
                .gate()
                .transition(
                    campaign_id,
                    phase,
                    PhaseStatus::InProgress,
                    PhaseStatus::Completed,
                    LifecycleEventType::PhaseCompleted,
                    None,
                    json!({ "trigger": "worker_complete" }),
                )
                .await;
            let _ = orchestrator.store().complete_phase(campaign_id, phase).await;
            orchestrator.metrics().phase_completions();
            if let Some(started_at) = phase_row.started_at {
                let millis = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
                orchestrator.metrics().phase_duration(millis);
            }
            orchestrator.registry().clear(campaign_id, run_id);
            orchestrator.control_bus().close(campaign_id, phase);
            finish_phase_bookkeeping(orchestrator, campaign_id, phase).await;
        }
        PhaseStatus::Failed => {
            let _ = orchestrator
                .gate()
                .transition(
                    campaign_id,
                    phase,
                    PhaseStatus::InProgress,
                    PhaseStatus::Failed,
                    LifecycleEventType::PhaseFailed,
                    None,
                    json!({ "trigger": "worker_fail", "reason": snapshot.last_error }),
                )
                .await;
            let _ = orchestrator
                .store()
                .set_overall_status(campaign_id, PhaseStatus::Failed, snapshot.last_error.clone())
                .await;
            orchestrator.metrics().phase_failures();
            orchestrator.registry().clear(campaign_id, run_id);
            orchestrator.control_bus().close(campaign_id, phase);
            orchestrator.with_execution_mut(campaign_id, |exec| {
                exec.overall_status = PhaseStatus::Failed;
                exec.last_error = snapshot.last_error.clone();
                exec.phase_statuses.insert(phase, PhaseStatus::Failed);
            });
            error!(
                campaign_id = %campaign_id, phase = ?phase, marker = "pipeline_stall_risk",
                "phase failed; pipeline stalled pending manual intervention"
            );
        }
        _ => {
            error!(
                campaign_id = %campaign_id, phase = ?phase, marker = "pipeline_stall_detected",
                "progress stream closed without a terminal status"
            );
            orchestrator.registry().clear(campaign_id, run_id);
        }
    }
}

async fn finish_phase_bookkeeping(orchestrator: &Orchestrator, campaign_id: Uuid, phase: PhaseType) {
    orchestrator.with_execution_mut(campaign_id, |exec| {
        exec.phase_statuses.insert(phase, PhaseStatus::Completed);
    });

    orchestrator.run_hooks(campaign_id);

    if phase.is_last() {
        let _ = orchestrator
            .store()
            .set_overall_status(campaign_id, PhaseStatus::Completed, None)
            .await;
        orchestrator.with_execution_mut(campaign_id, |exec| {
            exec.overall_status = PhaseStatus::Completed;
            exec.completed_at = Some(Utc::now());
            exec.current_phase = None;
        });
        orchestrator.metrics().campaign_completions();
        orchestrator
            .broadcaster()
            .broadcast_to_campaign(
                campaign_id,
                LifecycleEvent {
                    campaign_id,
                    event_type: LifecycleEventType::CampaignCompleted,
                    phase: None,
                    from_status: None,
                    to_status: None,
                    sequence_number: 0,
                    payload: json!({}),
                    created_at: Utc::now(),
                },
            )
            .await;
        return;
    }

    let campaign = match orchestrator.store().get_campaign(campaign_id).await {
        Ok(campaign) => campaign,
        Err(err) => {
            warn!(campaign_id = %campaign_id, error = %err, "get_campaign failed during auto-advance check");
            return;
        }
    };

    if campaign.mode != CampaignMode::FullSequence {
        // Step-by-step: the caller must explicitly start the next phase.
        return;
    }

    let Some(next) = phase.next() else { return };

    orchestrator.metrics().phase_auto_starts();
    orchestrator
        .broadcaster()
        .broadcast_to_campaign(
            campaign_id,
            LifecycleEvent {
                campaign_id,
                event_type: LifecycleEventType::PhaseAutoStarted,
                phase: Some(next),
                from_status: None,
                to_status: None,
                sequence_number: 0,
                payload: json!({}),
                created_at: Utc::now(),
            },
        )
        .await;

    if let Err(err) = orchestrator
        .start_phase(campaign_id, next, ControlOptions::default())
        .await
    {
        error!(
            campaign_id = %campaign_id, phase = ?next, error = %err, marker = "pipeline_stall_risk",
            "auto-advance failed"
        );
        orchestrator.metrics().phase_failures();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::event_broadcaster::InMemoryEventBroadcaster;
    use crate::metrics::CountingMetrics;
    use crate::model::{Campaign, ControlOptions};
    use crate::phase_service::{MockPhaseService, PhaseService, ScriptedOutcome};
    use crate::store::InMemoryCampaignStore;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn completion_advances_full_sequence_two_phases() {
        let store = Arc::new(InMemoryCampaignStore::spawn());
        let broadcaster = Arc::new(InMemoryEventBroadcaster::new());
        let metrics = Arc::new(CountingMetrics::default());

        let mut services: HashMap<PhaseType, Arc<dyn PhaseService>> = HashMap::new();
        let mut mocks = HashMap::new();
        for phase in PhaseType::ORDER {
            let mock = Arc::new(MockPhaseService::new(phase, store.clone() as Arc<dyn CampaignStore>));
            services.insert(phase, mock.clone());
            mocks.insert(phase, mock);
        }

        let orchestrator = Orchestrator::new(
            store.clone() as Arc<dyn CampaignStore>,
            services,
            broadcaster.clone() as Arc<dyn crate::event_broadcaster::EventBroadcaster>,
            metrics as Arc<dyn crate::metrics::Metrics>,
            OrchestratorConfig::default(),
        );

        let campaign = Campaign::new(Uuid::new_v4(), CampaignMode::FullSequence);
        let id = campaign.id;
        store.seed_campaign(campaign).await.unwrap();
        for phase in [PhaseType::DnsValidation, PhaseType::HttpKeywordValidation] {
            store.upsert_phase_config(id, phase, json!({})).await.unwrap();
        }

        mocks[&PhaseType::DomainGeneration]
            .script(id, ScriptedOutcome::CompleteAfter { progress_steps: 1 })
            .await;
        mocks[&PhaseType::DnsValidation]
            .script(id, ScriptedOutcome::CompleteAfter { progress_steps: 1 })
            .await;

        orchestrator
            .start_phase(id, PhaseType::DomainGeneration, ControlOptions::default())
            .await
            .unwrap();

        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if mocks[&PhaseType::DnsValidation].execute_call_count(id).await >= 1 {
                break;
            }
        }

        let calls = mocks[&PhaseType::DnsValidation].execute_call_count(id).await;
        assert_eq!(calls, 1);
    }

    fn build_test_orchestrator() -> (Orchestrator, Arc<InMemoryCampaignStore>, Arc<CountingMetrics>) {
        let store = Arc::new(InMemoryCampaignStore::spawn());
        let broadcaster = Arc::new(InMemoryEventBroadcaster::new());
        let metrics = Arc::new(CountingMetrics::default());

        let mut services: HashMap<PhaseType, Arc<dyn PhaseService>> = HashMap::new();
        for phase in PhaseType::ORDER {
            services.insert(
                phase,
                Arc::new(MockPhaseService::new(phase, store.clone() as Arc<dyn CampaignStore>)) as Arc<dyn PhaseService>,
            );
        }

        let orchestrator = Orchestrator::new(
            store.clone() as Arc<dyn CampaignStore>,
            services,
            broadcaster as Arc<dyn crate::event_broadcaster::EventBroadcaster>,
            metrics.clone() as Arc<dyn crate::metrics::Metrics>,
            OrchestratorConfig::default(),
        );

        (orchestrator, store, metrics)
    }

    #[tokio::test]
    async fn paused_phase_ignores_late_progress_item() {
        let (orchestrator, store, _metrics) = build_test_orchestrator();
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

        let (run_id, _cancel) = orchestrator.registry().register(id, PhaseType::DomainGeneration);

        handle_progress_item(
            &orchestrator,
            id,
            PhaseType::DomainGeneration,
            run_id,
            ProgressItem {
                campaign_id: id,
                phase: PhaseType::DomainGeneration,
                status: PhaseStatus::InProgress,
                items_processed: 50,
                items_total: 100,
                progress_pct: 50,
                message: None,
                error: None,
                timestamp: chrono::Utc::now(),
            },
        )
        .await;

        let row = store.get_campaign_phase(id, PhaseType::DomainGeneration).await.unwrap();
        assert_eq!(row.items_processed, 0);
        assert_eq!(row.progress_pct, 0);
    }

    #[tokio::test]
    async fn phase_completion_records_duration_metric() {
        let (orchestrator, store, metrics) = build_test_orchestrator();
        let campaign = Campaign::new(Uuid::new_v4(), CampaignMode::StepByStep);
        let id = campaign.id;
        store.seed_campaign(campaign).await.unwrap();

        orchestrator
            .start_phase(id, PhaseType::DomainGeneration, ControlOptions::default())
            .await
            .unwrap();

        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let row = store.get_campaign_phase(id, PhaseType::DomainGeneration).await.unwrap();
            if row.status == PhaseStatus::Completed {
                break;
            }
        }

        assert_eq!(
            metrics.phase_duration_observations.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
