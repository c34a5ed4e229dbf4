//! Process-wide map of active phase runs, generalized from the teacher's
//! `RunningTasks` registry in `scheduler.rs`. `run_id` fences a stale
//! monitor from clearing a handle that a newer run has since replaced
//! (spec §4.4).

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::{PhaseExecutionHandle, PhaseType};

#[derive(Default)]
pub struct ExecutionRegistry {
    handles: DashMap<Uuid, PhaseExecutionHandle>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        ExecutionRegistry {
            handles: DashMap::new(),
        }
    }

    /// Registers a new run for `campaign_id`, replacing any existing handle.
    /// Callers that want to preserve an existing handle should check
    /// `is_active` first.
    pub fn register(&self, campaign_id: Uuid, phase: PhaseType) -> (Uuid, CancellationToken) {
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.handles.insert(
            campaign_id,
            PhaseExecutionHandle {
                run_id,
                phase,
                cancel: cancel.clone(),
            },
        );
        (run_id, cancel)
    }

    /// Cancels and removes whatever handle is currently registered for
    /// `campaign_id`, if any. Used both by explicit cancel/stop operations
    /// and by rehydration reclaiming ownership from a prior process
    /// instance.
    pub fn cancel(&self, campaign_id: Uuid) {
        if let Some((_, handle)) = self.handles.remove(&campaign_id) {
            handle.cancel.cancel();
        }
    }

    /// Removes the handle only if `run_id` still matches what's registered —
    /// a no-op otherwise, so a stale monitor can't clobber a newer run's
    /// handle (spec §4.4).
    pub fn clear(&self, campaign_id: Uuid, run_id: Uuid) {
        if let Some(entry) = self.handles.get(&campaign_id) {
            if entry.run_id != run_id {
                return;
            }
        } else {
            return;
        }
        self.handles.remove(&campaign_id);
    }

    pub fn is_active(&self, campaign_id: Uuid, run_id: Uuid) -> bool {
        self.handles
            .get(&campaign_id)
            .map(|h| h.run_id == run_id)
            .unwrap_or(false)
    }

    pub fn current_run_id(&self, campaign_id: Uuid) -> Option<Uuid> {
        self.handles.get(&campaign_id).map(|h| h.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PhaseType;

    #[test]
    fn register_then_is_active() {
        let registry = ExecutionRegistry::new();
        let campaign = Uuid::new_v4();
        let (run_id, _cancel) = registry.register(campaign, PhaseType::DnsValidation);
        assert!(registry.is_active(campaign, run_id));
    }

    #[test]
    fn clear_with_stale_run_id_is_a_no_op() {
        let registry = ExecutionRegistry::new();
        let campaign = Uuid::new_v4();
        let (first_run, _c1) = registry.register(campaign, PhaseType::DnsValidation);
        let (second_run, _c2) = registry.register(campaign, PhaseType::DnsValidation);

        registry.clear(campaign, first_run);
        assert!(registry.is_active(campaign, second_run));
    }

    #[test]
    fn cancel_cancels_token_and_removes_handle() {
        let registry = ExecutionRegistry::new();
        let campaign = Uuid::new_v4();
        let (run_id, cancel) = registry.register(campaign, PhaseType::DnsValidation);
        registry.cancel(campaign);
        assert!(cancel.is_cancelled());
        assert!(!registry.is_active(campaign, run_id));
    }
}
