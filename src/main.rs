use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use campaign_orchestrator::config::{load_config_from, OrchestratorConfig};
use campaign_orchestrator::event_broadcaster::{EventBroadcaster, InMemoryEventBroadcaster};
use campaign_orchestrator::metrics::{CountingMetrics, Metrics};
use campaign_orchestrator::model::{Campaign, CampaignMode, ControlOptions, PhaseType};
use campaign_orchestrator::orchestrator::Orchestrator;
use campaign_orchestrator::phase_service::ScriptedOutcome;
use campaign_orchestrator::store::{CampaignStore, InMemoryCampaignStore};
use campaign_orchestrator::testing::mock_phase_services_with_handles;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "campaign-orchestrator-demo", about = "Drives a scripted campaign through the phase pipeline")]
struct Cli {
    /// Path to an orchestrator config file (defaults to built-in defaults
    /// if absent).
    #[arg(long, default_value = "orchestrator.toml")]
    config: PathBuf,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a full-sequence campaign through all six phases using scripted
    /// in-memory workers, printing each lifecycle event as it is emitted.
    Demo {
        /// Number of progress steps each phase worker emits before
        /// completing.
        #[arg(long, default_value = "3")]
        progress_steps: u32,
    },
    /// Runs a campaign where one phase fails, to show the pipeline
    /// stalling rather than silently continuing.
    DemoFailure {
        /// Phase at which the scripted worker fails.
        #[arg(long, default_value = "extraction")]
        fail_at: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config_from(&cli.config).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "falling back to default orchestrator config");
        OrchestratorConfig::default()
    });

    match cli.command {
        Commands::Demo { progress_steps } => run_demo(config, progress_steps).await,
        Commands::DemoFailure { fail_at } => run_demo_failure(config, &fail_at).await,
    }
}

async fn run_demo(config: OrchestratorConfig, progress_steps: u32) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(InMemoryCampaignStore::spawn());
    let (services, mocks) = mock_phase_services_with_handles(store.clone() as Arc<dyn CampaignStore>);
    let broadcaster = Arc::new(InMemoryEventBroadcaster::new());
    let metrics = Arc::new(CountingMetrics::default());

    let orchestrator = Orchestrator::new(
        store.clone() as Arc<dyn CampaignStore>,
        services,
        broadcaster.clone() as Arc<dyn EventBroadcaster>,
        metrics.clone() as Arc<dyn Metrics>,
        config,
    );

    let campaign = Campaign::new(Uuid::new_v4(), CampaignMode::FullSequence);
    let campaign_id = campaign.id;
    store.seed_campaign(campaign).await?;
    for phase in [PhaseType::DnsValidation, PhaseType::HttpKeywordValidation] {
        store
            .upsert_phase_config(campaign_id, phase, serde_json::json!({}))
            .await?;
    }
    for phase in PhaseType::ORDER {
        mocks[&phase]
            .script(campaign_id, ScriptedOutcome::CompleteAfter { progress_steps })
            .await;
    }

    tracing::info!(%campaign_id, "starting demo campaign");
    orchestrator
        .start_phase(campaign_id, PhaseType::DomainGeneration, ControlOptions::default())
        .await?;

    wait_for_terminal(&store, campaign_id).await?;

    for event in broadcaster.events_for(campaign_id).await {
        println!(
            "seq={} type={:?} phase={:?} {:?}->{:?}",
            event.sequence_number, event.event_type, event.phase, event.from_status, event.to_status
        );
    }

    let campaign = store.get_campaign(campaign_id).await?;
    println!(
        "campaign {} finished: status={:?} completed_phases={}/{}",
        campaign_id, campaign.overall_status, campaign.completed_phases, campaign.total_phases
    );

    Ok(())
}

async fn run_demo_failure(config: OrchestratorConfig, fail_at: &str) -> Result<(), Box<dyn std::error::Error>> {
    let fail_phase = PhaseType::parse(fail_at).ok_or_else(|| format!("unknown phase: {fail_at}"))?;

    let store = Arc::new(InMemoryCampaignStore::spawn());
    let (services, mocks) = mock_phase_services_with_handles(store.clone() as Arc<dyn CampaignStore>);
    let broadcaster = Arc::new(InMemoryEventBroadcaster::new());
    let metrics = Arc::new(CountingMetrics::default());

    let orchestrator = Orchestrator::new(
        store.clone() as Arc<dyn CampaignStore>,
        services,
        broadcaster.clone() as Arc<dyn EventBroadcaster>,
        metrics as Arc<dyn Metrics>,
        config,
    );

    let campaign = Campaign::new(Uuid::new_v4(), CampaignMode::FullSequence);
    let campaign_id = campaign.id;
    store.seed_campaign(campaign).await?;
    for phase in [PhaseType::DnsValidation, PhaseType::HttpKeywordValidation] {
        store
            .upsert_phase_config(campaign_id, phase, serde_json::json!({}))
            .await?;
    }
    for phase in PhaseType::ORDER {
        if phase == fail_phase {
            mocks[&phase]
                .script(
                    campaign_id,
                    ScriptedOutcome::FailAfter {
                        progress_steps: 1,
                        message: "simulated worker failure".to_string(),
                    },
                )
                .await;
        } else {
            mocks[&phase]
                .script(campaign_id, ScriptedOutcome::CompleteAfter { progress_steps: 1 })
                .await;
        }
    }

    tracing::info!(%campaign_id, ?fail_phase, "starting demo campaign with a scripted failure");
    orchestrator
        .start_phase(campaign_id, PhaseType::DomainGeneration, ControlOptions::default())
        .await?;

    wait_for_terminal(&store, campaign_id).await?;

    let campaign = store.get_campaign(campaign_id).await?;
    println!(
        "campaign {} stalled: status={:?} error={:?}",
        campaign_id, campaign.overall_status, campaign.error_message
    );

    Ok(())
}

async fn wait_for_terminal(
    store: &InMemoryCampaignStore,
    campaign_id: Uuid,
) -> Result<(), Box<dyn std::error::Error>> {
    for _ in 0..200 {
        let campaign = store.get_campaign(campaign_id).await?;
        if matches!(
            campaign.overall_status,
            campaign_orchestrator::model::PhaseStatus::Completed
                | campaign_orchestrator::model::PhaseStatus::Failed
        ) {
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    Ok(())
}
