use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the six fixed stages of a campaign pipeline, in their only valid
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    DomainGeneration,
    DnsValidation,
    HttpKeywordValidation,
    Extraction,
    Analysis,
    Enrichment,
}

impl PhaseType {
    pub const ORDER: [PhaseType; 6] = [
        PhaseType::DomainGeneration,
        PhaseType::DnsValidation,
        PhaseType::HttpKeywordValidation,
        PhaseType::Extraction,
        PhaseType::Analysis,
        PhaseType::Enrichment,
    ];

    /// 1-based position in the pipeline.
    pub fn order(self) -> u8 {
        Self::ORDER.iter().position(|p| *p == self).unwrap() as u8 + 1
    }

    pub fn from_order(order: u8) -> Option<PhaseType> {
        if order == 0 {
            return None;
        }
        Self::ORDER.get(order as usize - 1).copied()
    }

    /// The phase that must be `completed` or `skipped` before this phase may
    /// start. `None` for the first phase, which has no upstream dependency.
    pub fn upstream(self) -> Option<PhaseType> {
        let idx = Self::ORDER.iter().position(|p| *p == self).unwrap();
        if idx == 0 {
            None
        } else {
            Some(Self::ORDER[idx - 1])
        }
    }

    pub fn next(self) -> Option<PhaseType> {
        let idx = Self::ORDER.iter().position(|p| *p == self).unwrap();
        Self::ORDER.get(idx + 1).copied()
    }

    pub fn is_last(self) -> bool {
        self.next().is_none()
    }

    /// Phases that are auto-configured with defaults if the caller never
    /// supplied persisted configuration (spec §4.5 step 7).
    pub fn auto_defaults_allowed(self) -> bool {
        matches!(self, PhaseType::Analysis | PhaseType::Enrichment)
    }

    /// Parses a phase type from its wire name. Centralizes enum-string
    /// parsing in one place rather than scattering `match` arms over string
    /// literals at each call site.
    pub fn parse(raw: &str) -> Option<PhaseType> {
        match raw {
            "domain_generation" => Some(PhaseType::DomainGeneration),
            "dns_validation" => Some(PhaseType::DnsValidation),
            "http_keyword_validation" => Some(PhaseType::HttpKeywordValidation),
            "extraction" => Some(PhaseType::Extraction),
            "analysis" => Some(PhaseType::Analysis),
            "enrichment" => Some(PhaseType::Enrichment),
            _ => None,
        }
    }
}

/// Status of a single campaign phase. See the transition table in
/// `state_machine.rs` for which moves are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Configured,
    InProgress,
    Paused,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }

    pub fn satisfies_dependency(self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignMode {
    StepByStep,
    FullSequence,
}

/// Status of the separate campaign-state record (spec §6.2's
/// `GetCampaignState`/`CreateCampaignState`/`UpdateCampaignState`). Distinct
/// from `PhaseStatus`: a phase can land on `failed` because a worker errored,
/// but `cancelled` here only ever means a user explicitly called
/// `StopCampaign`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStateStatus {
    Active,
    Cancelled,
}

/// The campaign-state record itself. One per campaign, created lazily the
/// first time something needs to record cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignState {
    pub campaign_id: Uuid,
    pub status: CampaignStateStatus,
    pub mode: CampaignMode,
    pub updated_at: DateTime<Utc>,
}

impl CampaignState {
    pub fn new(campaign_id: Uuid, mode: CampaignMode) -> Self {
        CampaignState {
            campaign_id,
            status: CampaignStateStatus::Active,
            mode,
            updated_at: Utc::now(),
        }
    }
}

/// Durable campaign row, mirrored in-memory by `CampaignExecution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub mode: CampaignMode,
    pub current_phase: Option<PhaseType>,
    pub overall_status: PhaseStatus,
    pub total_phases: u32,
    pub completed_phases: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(id: Uuid, mode: CampaignMode) -> Self {
        Campaign {
            id,
            user_id: None,
            mode,
            current_phase: None,
            overall_status: PhaseStatus::NotStarted,
            total_phases: PhaseType::ORDER.len() as u32,
            completed_phases: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }
}

/// One row per (campaign, phase).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignPhase {
    pub campaign_id: Uuid,
    pub phase_type: PhaseType,
    pub phase_order: u8,
    pub status: PhaseStatus,
    pub progress_pct: u8,
    pub items_total: u64,
    pub items_processed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub configuration: Option<serde_json::Value>,
}

impl CampaignPhase {
    pub fn new(campaign_id: Uuid, phase_type: PhaseType) -> Self {
        CampaignPhase {
            campaign_id,
            phase_type,
            phase_order: phase_type.order(),
            status: PhaseStatus::NotStarted,
            progress_pct: 0,
            items_total: 0,
            items_processed: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
            configuration: None,
        }
    }
}

/// In-memory runtime mirror of a campaign's execution state. The store is
/// authoritative on disagreement; this exists purely to make hot-path reads
/// (exclusivity checks, idempotent no-ops) lock-free of I/O.
#[derive(Debug, Clone)]
pub struct CampaignExecution {
    pub campaign_id: Uuid,
    pub current_phase: Option<PhaseType>,
    pub phase_statuses: HashMap<PhaseType, PhaseStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub overall_status: PhaseStatus,
    pub last_error: Option<String>,
    pub phase_run_id: Option<Uuid>,
}

impl CampaignExecution {
    pub fn new(campaign_id: Uuid) -> Self {
        CampaignExecution {
            campaign_id,
            current_phase: None,
            phase_statuses: HashMap::new(),
            started_at: None,
            completed_at: None,
            overall_status: PhaseStatus::NotStarted,
            last_error: None,
            phase_run_id: None,
        }
    }

    pub fn phase_status(&self, phase: PhaseType) -> PhaseStatus {
        self.phase_statuses
            .get(&phase)
            .copied()
            .unwrap_or(PhaseStatus::NotStarted)
    }

    pub fn running_phase(&self) -> Option<PhaseType> {
        self.phase_statuses
            .iter()
            .find(|(_, status)| **status == PhaseStatus::InProgress)
            .map(|(phase, _)| *phase)
    }
}

/// Process-wide handle to an active phase run, keyed by campaign. `run_id`
/// fences stale monitors from a superseded run (spec §4.4).
#[derive(Debug, Clone)]
pub struct PhaseExecutionHandle {
    pub run_id: Uuid,
    pub phase: PhaseType,
    pub cancel: tokio_util::sync::CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    PhaseStarted,
    PhasePaused,
    PhaseResumed,
    PhaseCompleted,
    PhaseFailed,
    PhaseAutoStarted,
    CampaignProgress,
    CampaignCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub campaign_id: Uuid,
    pub event_type: LifecycleEventType,
    pub phase: Option<PhaseType>,
    pub from_status: Option<PhaseStatus>,
    pub to_status: Option<PhaseStatus>,
    /// Monotonic per campaign, starting at 1. `0` marks a self-transition
    /// no-op and is never actually persisted.
    pub sequence_number: u64,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Pause,
    Resume,
    Stop,
}

/// Optional preconditions/deduplication a caller may attach to a control
/// operation.
#[derive(Debug, Clone, Default)]
pub struct ControlOptions {
    pub expected_state: Option<PhaseStatus>,
    pub idempotency_key: Option<String>,
}

/// A progress item produced by a `PhaseService` worker while it executes.
#[derive(Debug, Clone)]
pub struct ProgressItem {
    pub campaign_id: Uuid,
    pub phase: PhaseType,
    pub status: PhaseStatus,
    pub items_processed: u64,
    pub items_total: u64,
    pub progress_pct: u8,
    pub message: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot returned by `PhaseService::get_status`.
#[derive(Debug, Clone)]
pub struct PhaseStatusSnapshot {
    pub status: PhaseStatus,
    pub items_total: u64,
    pub items_processed: u64,
    pub progress_pct: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub configuration: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseCapabilities {
    pub can_pause: bool,
    pub can_resume: bool,
}

/// Clamps an arbitrary progress fraction into the `[0, 100]` range required
/// of every persisted progress percentage (spec invariant 5).
pub fn clamp_pct(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (processed as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}
