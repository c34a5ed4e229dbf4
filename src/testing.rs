//! In-memory collaborators, re-exported in one place for integration tests
//! and the demo binary. Grounded on the teacher's practice of keeping
//! `MockAgentRunner` alongside the real `AgentRunner` in `agent.rs` rather
//! than behind a test-only feature flag — these are real, usable
//! implementations, just not durable ones.

pub use crate::event_broadcaster::{InMemoryEventBroadcaster, NoopEventBroadcaster};
pub use crate::metrics::{CountingMetrics, NoopMetrics};
pub use crate::phase_service::{MockPhaseService, ScriptedOutcome};
pub use crate::store::InMemoryCampaignStore;

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::PhaseType;
use crate::phase_service::PhaseService;
use crate::store::CampaignStore;

/// Builds one `MockPhaseService` per pipeline phase, sharing `store`, ready
/// to hand to `Orchestrator::new`.
pub fn mock_phase_services(store: Arc<dyn CampaignStore>) -> HashMap<PhaseType, Arc<dyn PhaseService>> {
    let mut services: HashMap<PhaseType, Arc<dyn PhaseService>> = HashMap::new();
    for phase in PhaseType::ORDER {
        services.insert(phase, Arc::new(MockPhaseService::new(phase, store.clone())));
    }
    services
}

/// Same as [`mock_phase_services`] but also returns the concrete
/// `MockPhaseService` handles, keyed by phase, so callers can `script(...)`
/// them directly.
pub fn mock_phase_services_with_handles(
    store: Arc<dyn CampaignStore>,
) -> (
    HashMap<PhaseType, Arc<dyn PhaseService>>,
    HashMap<PhaseType, Arc<MockPhaseService>>,
) {
    let mut services: HashMap<PhaseType, Arc<dyn PhaseService>> = HashMap::new();
    let mut handles = HashMap::new();
    for phase in PhaseType::ORDER {
        let mock = Arc::new(MockPhaseService::new(phase, store.clone()));
        services.insert(phase, mock.clone());
        handles.insert(phase, mock);
    }
    (services, handles)
}
