use crate::model::{PhaseStatus, PhaseType};

/// The three-way classification every orchestrator error collapses into,
/// so callers can decide whether to retry, surface a 409, or give up on the
/// campaign entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Recoverable,
    PhaseFatal,
    CampaignFatal,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("missing phase configs: {missing:?}")]
    MissingPhaseConfigs { missing: Vec<PhaseType> },

    #[error("phase {phase:?} dependencies not met: blocking={blocking:?} status={blocking_status:?}")]
    PhaseDependenciesNotMet {
        phase: PhaseType,
        blocking: PhaseType,
        blocking_status: PhaseStatus,
    },

    #[error("another phase is already running on this campaign")]
    AnotherPhaseRunning,

    #[error("no active phase on this campaign")]
    NoActivePhase,

    #[error("invalid transition for phase {phase:?}: {from:?} -> {to:?}")]
    TransitionInvalid {
        from: PhaseStatus,
        to: PhaseStatus,
        phase: PhaseType,
    },

    #[error("expected state {expected:?} but found {current:?} for action {action}")]
    ExpectedStateMismatch {
        current: PhaseStatus,
        expected: PhaseStatus,
        action: &'static str,
    },

    #[error("phase execution handle missing for this campaign")]
    PhaseExecutionMissing,

    #[error("phase is not running")]
    PhaseNotRunning,

    #[error("worker does not support pause")]
    PauseUnsupported,

    #[error("worker does not support resume")]
    ResumeUnsupported,

    #[error("timed out waiting for pause ack")]
    PauseTimeout,

    #[error("timed out waiting for resume ack")]
    ResumeTimeout,

    #[error("control channel is full")]
    ControlChannelFull,

    #[error("campaign {0} not found")]
    CampaignNotFound(uuid::Uuid),

    #[error("phase config missing for phase {0:?}")]
    PhaseConfigMissing(PhaseType),

    #[error("phase config invalid for phase {phase:?}: {reason}")]
    PhaseConfigInvalid { phase: PhaseType, reason: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("phase service error: {0}")]
    PhaseService(String),

    #[error("broadcast error: {0}")]
    Broadcast(String),

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        use OrchestratorError::*;
        match self {
            MissingPhaseConfigs { .. }
            | PhaseDependenciesNotMet { .. }
            | AnotherPhaseRunning
            | NoActivePhase
            | PhaseConfigMissing(_)
            | PhaseConfigInvalid { .. } => ErrorKind::Recoverable,

            TransitionInvalid { .. } | ExpectedStateMismatch { .. } => ErrorKind::Recoverable,

            CampaignNotFound(_) => ErrorKind::CampaignFatal,

            PhaseExecutionMissing
            | PhaseNotRunning
            | PauseUnsupported
            | ResumeUnsupported
            | PauseTimeout
            | ResumeTimeout
            | ControlChannelFull
            | Store(_)
            | PhaseService(_)
            | Broadcast(_)
            | Other(_) => ErrorKind::PhaseFatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::Recoverable
    }

    pub fn is_campaign_fatal(&self) -> bool {
        self.kind() == ErrorKind::CampaignFatal
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_gating_errors_are_recoverable() {
        let err = OrchestratorError::MissingPhaseConfigs {
            missing: vec![PhaseType::HttpKeywordValidation],
        };
        assert_eq!(err.kind(), ErrorKind::Recoverable);
    }

    #[test]
    fn not_found_is_campaign_fatal() {
        let err = OrchestratorError::CampaignNotFound(uuid::Uuid::nil());
        assert!(err.is_campaign_fatal());
    }

    #[test]
    fn store_errors_are_phase_fatal() {
        let err = OrchestratorError::Store("disconnected".into());
        assert_eq!(err.kind(), ErrorKind::PhaseFatal);
    }
}
